use crate::{
    admission::Admission,
    k8s::{Api, Dast, Service},
    reconciler::{self, Context},
    Settings,
};
use anyhow::{bail, Result};
use clap::Parser;
use futures::prelude::*;
use kube::runtime::{controller::Controller, watcher};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tracing::{info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "dast", about = "A dynamic-scan admission controller")]
pub struct Args {
    #[clap(long, default_value = "dast=info,warn", env = "DAST_CONTROLLER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// Domain prefixing the scan annotations on services and ingresses.
    #[clap(long, default_value = "dast.security.banzaicloud.io")]
    annotation_domain: String,

    #[clap(long, default_value = "cluster.local")]
    cluster_domain: String,

    /// Analyzer image used when a service does not pin one.
    #[clap(long, default_value = "ghcr.io/banzaicloud/dast-analyzer:latest")]
    default_analyzer_image: String,

    /// Scan-proxy image used when a Dast does not pin one.
    #[clap(long, default_value = "owasp/zap2docker-live")]
    default_zap_image: String,

    /// Port the scan-proxy daemon listens on.
    #[clap(long, default_value = "8080")]
    zap_port: u16,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            annotation_domain,
            cluster_domain,
            default_analyzer_image,
            default_zap_image,
            zap_port,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let settings = Arc::new(Settings {
            annotation_domain,
            cluster_domain,
            default_analyzer_image,
            default_zap_image,
            zap_port,
        });

        let mut prom = <Registry>::default();
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        // Reconcile Dast resources cluster-wide, materializing scan
        // infrastructure as it appears.
        let client = runtime.client();
        let ctx = Arc::new(Context {
            client: client.clone(),
            settings: settings.clone(),
        });
        tokio::spawn(
            Controller::new(Api::<Dast>::all(client.clone()), watcher::Config::default())
                .run(
                    reconciler::reconcile_dast,
                    reconciler::error_policy,
                    ctx.clone(),
                )
                .for_each(|reconciled| async move {
                    if let Err(error) = reconciled {
                        warn!(%error, "reconciliation error");
                    }
                })
                .instrument(info_span!("dasts")),
        );

        // Watch services so annotated backends get an analyzer run without a
        // Dast object of their own.
        tokio::spawn(
            Controller::new(
                Api::<Service>::all(client.clone()),
                watcher::Config::default(),
            )
            .run(
                reconciler::reconcile_service,
                reconciler::error_policy,
                ctx,
            )
            .for_each(|reconciled| async move {
                if let Err(error) = reconciled {
                    warn!(%error, "reconciliation error");
                }
            })
            .instrument(info_span!("services")),
        );

        let runtime = runtime.spawn_server(move || Admission::new(client, settings));

        // Block the main thread on the shutdown signal. Once it fires, wait
        // for the background tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
