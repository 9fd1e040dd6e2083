//! Create-if-absent reconciliation of the scanning infrastructure.

use crate::k8s::{Api, Dast, Deployment, Job, PostParams, Resource, ResourceExt, Secret, Service};
use crate::{annotations, ready, resources, Settings};
use kube::runtime::controller::Action;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

const REQUEUE_AFTER: Duration = Duration::from_secs(60);

/// Shared state handed to every reconcile invocation.
pub struct Context {
    pub client: kube::Client,
    pub settings: Arc<Settings>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to get {kind} {name}: {source}")]
    Lookup {
        kind: &'static str,
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("failed to create {kind} {name}: {source}")]
    Create {
        kind: &'static str,
        name: String,
        #[source]
        source: kube::Error,
    },
}

/// The closed set of child objects a Dast materializes.
///
/// Each variant is dispatched explicitly; there is no generic "reconcile
/// any object" path.
pub enum Child {
    Secret(Secret),
    Deployment(Deployment),
    Service(Service),
    Job(Job),
}

/// Materializes a Dast's children: the API-key secret, the scan-proxy
/// deployment and, once the proxy looks available, the analyzer job.
pub async fn reconcile_dast(dast: Arc<Dast>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = dast.namespace().unwrap_or_default();
    let name = dast.name_any();
    debug!(%namespace, %name, "reconciling");

    for child in [
        Child::Secret(resources::api_key_secret(&dast)),
        Child::Deployment(resources::zapproxy_deployment(&ctx.settings, &dast)),
        Child::Service(resources::zapproxy_service(&ctx.settings, &dast)),
    ] {
        create_if_absent(&ctx.client, &namespace, child).await?;
    }

    if let Some(analyzer) = &dast.spec.analyzer {
        await_proxy_available(&ctx, &dast.spec.zapproxy.name, &namespace).await;
        if let Some(backing) = &analyzer.service {
            await_service_ready(&ctx, &backing.name, &backing.namespace).await;
        }
        create_if_absent(
            &ctx.client,
            &namespace,
            Child::Job(resources::analyzer_job(&ctx.settings, &dast, analyzer)),
        )
        .await?;
    }

    debug!(%namespace, %name, "reconciled");
    Ok(Action::await_change())
}

/// Reacts to annotated services by synthesizing a Dast value targeting the
/// service and reconciling its analyzer job. The Dast itself is never
/// persisted; the job is parented to the service.
pub async fn reconcile_service(service: Arc<Service>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = service.namespace().unwrap_or_default();
    let config = match annotations::scan_config(&ctx.settings, service.annotations(), &namespace) {
        Some(config) => config,
        // Not annotated for scanning; nothing to manage.
        None => return Ok(Action::await_change()),
    };

    info!(service = %service.name_any(), proxy = %config.proxy_name, "service opted into scanning");
    let dast = resources::dast_for_service(&ctx.settings, &config, &service);

    await_proxy_available(&ctx, &config.proxy_name, &config.proxy_namespace).await;
    await_service_ready(&ctx, &service.name_any(), &namespace).await;

    if let Some(analyzer) = &dast.spec.analyzer {
        create_if_absent(
            &ctx.client,
            &config.proxy_namespace,
            Child::Job(resources::analyzer_job(&ctx.settings, &dast, analyzer)),
        )
        .await?;
    }

    Ok(Action::await_change())
}

pub fn error_policy<K>(_obj: Arc<K>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(%error, "reconcile failed");
    Action::requeue(REQUEUE_AFTER)
}

/// Looks the child up by name and creates it only when absent.
///
/// An existing child is left untouched, spec drift and all; losing a
/// concurrent create race is success.
pub(crate) async fn create_if_absent(
    client: &kube::Client,
    namespace: &str,
    child: Child,
) -> Result<(), Error> {
    match child {
        Child::Secret(secret) => {
            create_one(Api::namespaced(client.clone(), namespace), "Secret", secret).await
        }
        Child::Deployment(deployment) => {
            create_one(
                Api::namespaced(client.clone(), namespace),
                "Deployment",
                deployment,
            )
            .await
        }
        Child::Service(service) => {
            create_one(Api::namespaced(client.clone(), namespace), "Service", service).await
        }
        Child::Job(job) => create_one(Api::namespaced(client.clone(), namespace), "Job", job).await,
    }
}

async fn create_one<K>(api: Api<K>, kind: &'static str, desired: K) -> Result<(), Error>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned,
{
    let name = desired.name_any();
    match api.get(&name).await {
        Ok(_) => {
            debug!(%kind, %name, "child already present");
            Ok(())
        }
        Err(kube::Error::Api(response)) if response.code == 404 => {
            match api.create(&PostParams::default(), &desired).await {
                Ok(_) => {
                    info!(%kind, %name, "created");
                    Ok(())
                }
                // A concurrent pass won the race; the child exists, which
                // is all that was wanted.
                Err(kube::Error::Api(response)) if response.code == 409 => {
                    debug!(%kind, %name, "already exists");
                    Ok(())
                }
                Err(source) => Err(Error::Create { kind, name, source }),
            }
        }
        Err(source) => Err(Error::Lookup { kind, name, source }),
    }
}

/// Advisory wait for the scan-proxy deployment. A timeout is logged, not
/// raised: the job is created regardless and retries on its own.
async fn await_proxy_available(ctx: &Context, name: &str, namespace: &str) {
    let api: Api<Deployment> = Api::namespaced(ctx.client.clone(), namespace);
    let fetch = || {
        let api = api.clone();
        let name = name.to_string();
        async move { api.get(&name).await }
    };
    if ready::poll_until_ready(
        fetch,
        deployment_available,
        ready::POLL_INTERVAL,
        Instant::now() + ready::POLL_DEADLINE,
    )
    .await
    {
        debug!(%name, %namespace, "scan-proxy deployment is available");
    } else {
        warn!(%name, %namespace, "scan-proxy deployment is not available yet, proceeding anyway");
    }
}

/// Advisory wait for the scanned service, same contract as the proxy wait.
async fn await_service_ready(ctx: &Context, name: &str, namespace: &str) {
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);
    let fetch = || {
        let api = api.clone();
        let name = name.to_string();
        async move { api.get(&name).await }
    };
    if ready::poll_until_ready(
        fetch,
        service_ready,
        ready::POLL_INTERVAL,
        Instant::now() + ready::POLL_DEADLINE,
    )
    .await
    {
        debug!(%name, %namespace, "service is available");
    } else {
        warn!(%name, %namespace, "service is not available yet, proceeding anyway");
    }
}

fn deployment_available(deployment: &Deployment) -> bool {
    let status = match &deployment.status {
        Some(status) => status,
        None => return false,
    };
    if status.available_replicas.unwrap_or(0) > 0 {
        return true;
    }
    status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Available" && c.status == "True")
}

fn service_ready(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.cluster_ip.as_deref())
        .is_some_and(|ip| !ip.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::{DastSpec, ZapProxy};
    use futures::FutureExt;
    use http::{Request, Response, StatusCode};
    use kube::client::Body;
    use serde_json::json;

    fn test_dast() -> Dast {
        let mut dast = Dast::new(
            "scan",
            DastSpec {
                zapproxy: ZapProxy {
                    name: "zap".to_string(),
                    apikey: Some("s3cret".to_string()),
                    ..Default::default()
                },
                analyzer: None,
            },
        );
        dast.metadata.namespace = Some("scanning".to_string());
        dast.metadata.uid = Some("1234".to_string());
        dast
    }

    fn not_found() -> Response<Body> {
        let status = json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": "secrets \"zap\" not found",
            "reason": "NotFound",
            "code": 404
        });
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from(serde_json::to_vec(&status).unwrap()))
            .unwrap()
    }

    fn conflict() -> Response<Body> {
        let status = json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": "secrets \"zap\" already exists",
            "reason": "AlreadyExists",
            "code": 409
        });
        Response::builder()
            .status(StatusCode::CONFLICT)
            .body(Body::from(serde_json::to_vec(&status).unwrap()))
            .unwrap()
    }

    fn ok<T: serde::Serialize>(obj: &T) -> Response<Body> {
        Response::builder()
            .status(StatusCode::OK)
            .body(Body::from(serde_json::to_vec(obj).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn a_present_child_triggers_no_write() {
        let (svc, mut handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = kube::Client::new(svc, "default");

        let secret = resources::api_key_secret(&test_dast());
        let existing = secret.clone();
        let server = async move {
            let (request, send) = handle.next_request().await.expect("lookup");
            assert_eq!(request.method(), http::Method::GET);
            send.send_response(ok(&existing));
            handle
        };

        let reconcile = create_if_absent(&client, "scanning", Child::Secret(secret));
        let (result, mut handle) = tokio::join!(reconcile, server);
        result.expect("reconcile");

        // Idempotence: the pass was a pure lookup.
        assert!(handle.next_request().now_or_never().is_none());
    }

    #[tokio::test]
    async fn reconciliation_materializes_the_proxy_service_with_its_siblings() {
        let (svc, mut handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = kube::Client::new(svc, "default");
        let settings = Arc::new(crate::test_settings());
        let ctx = Arc::new(Context {
            client,
            settings: settings.clone(),
        });

        let dast = test_dast();
        let bodies = [
            serde_json::to_value(resources::api_key_secret(&dast)).unwrap(),
            serde_json::to_value(resources::zapproxy_deployment(&settings, &dast)).unwrap(),
            serde_json::to_value(resources::zapproxy_service(&settings, &dast)).unwrap(),
        ];
        let server = async move {
            let mut created = Vec::new();
            for body in bodies {
                let (request, send) = handle.next_request().await.expect("lookup");
                assert_eq!(request.method(), http::Method::GET);
                send.send_response(not_found());

                let (request, send) = handle.next_request().await.expect("create");
                assert_eq!(request.method(), http::Method::POST);
                created.push(request.uri().path().to_string());
                send.send_response(ok(&body));
            }
            created
        };

        let reconcile = reconcile_dast(Arc::new(dast), ctx);
        let (result, created) = tokio::join!(reconcile, server);
        result.expect("reconcile");

        assert_eq!(created.len(), 3);
        assert!(created[0].ends_with("/namespaces/scanning/secrets"));
        assert!(created[1].ends_with("/namespaces/scanning/deployments"));
        assert!(created[2].ends_with("/namespaces/scanning/services"));
    }

    #[tokio::test]
    async fn an_absent_child_is_created() {
        let (svc, mut handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = kube::Client::new(svc, "default");

        let secret = resources::api_key_secret(&test_dast());
        let created = secret.clone();
        let server = async move {
            let (request, send) = handle.next_request().await.expect("lookup");
            assert_eq!(request.method(), http::Method::GET);
            send.send_response(not_found());

            let (request, send) = handle.next_request().await.expect("create");
            assert_eq!(request.method(), http::Method::POST);
            send.send_response(ok(&created));
        };

        let reconcile = create_if_absent(&client, "scanning", Child::Secret(secret));
        let (result, ()) = tokio::join!(reconcile, server);
        result.expect("reconcile");
    }

    #[tokio::test]
    async fn losing_a_create_race_is_success() {
        let (svc, mut handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = kube::Client::new(svc, "default");

        let secret = resources::api_key_secret(&test_dast());
        let server = async move {
            let (_, send) = handle.next_request().await.expect("lookup");
            send.send_response(not_found());

            let (_, send) = handle.next_request().await.expect("create");
            send.send_response(conflict());
        };

        let reconcile = create_if_absent(&client, "scanning", Child::Secret(secret));
        let (result, ()) = tokio::join!(reconcile, server);
        result.expect("a lost create race must not surface as an error");
    }

    #[tokio::test]
    async fn lookup_failures_are_wrapped_with_the_child_identity() {
        let (svc, mut handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = kube::Client::new(svc, "default");

        let secret = resources::api_key_secret(&test_dast());
        let server = async move {
            let (_, send) = handle.next_request().await.expect("lookup");
            let status = json!({
                "kind": "Status",
                "apiVersion": "v1",
                "status": "Failure",
                "message": "internal error",
                "reason": "InternalError",
                "code": 500
            });
            send.send_response(
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::from(serde_json::to_vec(&status).unwrap()))
                    .unwrap(),
            );
        };

        let reconcile = create_if_absent(&client, "scanning", Child::Secret(secret));
        let (result, ()) = tokio::join!(reconcile, server);
        match result {
            Err(Error::Lookup { kind, name, .. }) => {
                assert_eq!(kind, "Secret");
                assert_eq!(name, "zap");
            }
            other => panic!("expected a lookup error, got {other:?}"),
        }
    }

    #[test]
    fn deployment_availability_tracks_status() {
        use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentStatus};

        let mut deployment = Deployment::default();
        assert!(!deployment_available(&deployment));

        deployment.status = Some(DeploymentStatus {
            available_replicas: Some(1),
            ..Default::default()
        });
        assert!(deployment_available(&deployment));

        deployment.status = Some(DeploymentStatus {
            conditions: Some(vec![DeploymentCondition {
                type_: "Available".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(deployment_available(&deployment));
    }

    #[test]
    fn service_readiness_requires_a_cluster_ip() {
        use k8s_openapi::api::core::v1::ServiceSpec;

        let mut service = Service::default();
        assert!(!service_ready(&service));

        service.spec = Some(ServiceSpec {
            cluster_ip: Some("10.0.0.1".to_string()),
            ..Default::default()
        });
        assert!(service_ready(&service));
    }
}
