//! Desired forms of the child objects a Dast materializes.
//!
//! These are fixed templates: the reconciler only ever creates them, it
//! never diffs or updates an existing child.

use crate::annotations::ScanConfig;
use crate::k8s::{
    Analyzer, BackingService, Dast, DastSpec, Deployment, Job, ObjectMeta, OwnerReference,
    Resource, ResourceExt, Secret, Service, ZapProxy,
};
use crate::Settings;
use k8s_openapi::api::apps::v1::DeploymentSpec;
use k8s_openapi::api::batch::v1::JobSpec;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, HTTPHeader, PodSpec,
    PodTemplateSpec, Probe, SecretKeySelector, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use std::collections::BTreeMap;

const API_KEY_SECRET_KEY: &str = "zap_api_key";
const API_KEY_HEADER: &str = "X-ZAP-API-Key";

/// The secret holding the scan-proxy API key.
pub fn api_key_secret(dast: &Dast) -> Secret {
    let api_key = dast.spec.zapproxy.apikey.clone().unwrap_or_default();
    Secret {
        metadata: child_meta(dast, dast.spec.zapproxy.name.clone()),
        data: Some(BTreeMap::from([(
            API_KEY_SECRET_KEY.to_string(),
            ByteString(api_key.into_bytes()),
        )])),
        ..Default::default()
    }
}

/// The scan-proxy daemon, running in API mode behind a readiness probe that
/// must present the API key.
pub fn zapproxy_deployment(settings: &Settings, dast: &Dast) -> Deployment {
    let api_key = dast.spec.zapproxy.apikey.clone().unwrap_or_default();
    let image = dast
        .spec
        .zapproxy
        .image
        .clone()
        .unwrap_or_else(|| settings.default_zap_image.clone());
    let labels = proxy_labels(dast);
    let port = settings.zap_port;

    Deployment {
        metadata: child_meta(dast, dast.spec.zapproxy.name.clone()),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "zap-proxy".to_string(),
                        image: Some(image),
                        command: Some(vec!["zap.sh".to_string()]),
                        args: Some(vec![
                            "-daemon".to_string(),
                            "-host".to_string(),
                            "0.0.0.0".to_string(),
                            "-port".to_string(),
                            port.to_string(),
                            "-config".to_string(),
                            format!("api.key={api_key}"),
                            "-config".to_string(),
                            "api.addrs.addr.name=.*".to_string(),
                            "-config".to_string(),
                            "api.addrs.addr.regex=true".to_string(),
                        ]),
                        ports: Some(vec![ContainerPort {
                            name: Some("http".to_string()),
                            container_port: i32::from(port),
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        readiness_probe: Some(Probe {
                            http_get: Some(HTTPGetAction {
                                path: Some("/".to_string()),
                                port: IntOrString::Int(i32::from(port)),
                                http_headers: Some(vec![HTTPHeader {
                                    name: API_KEY_HEADER.to_string(),
                                    value: api_key,
                                }]),
                                ..Default::default()
                            }),
                            initial_delay_seconds: Some(10),
                            period_seconds: Some(5),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The service exposing the scan-proxy daemon inside the cluster.
///
/// Both the admission client and the analyzer job address the proxy
/// through this service's DNS name.
pub fn zapproxy_service(settings: &Settings, dast: &Dast) -> Service {
    let port = i32::from(settings.zap_port);
    Service {
        metadata: child_meta(dast, dast.spec.zapproxy.name.clone()),
        spec: Some(ServiceSpec {
            selector: Some(proxy_labels(dast)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                protocol: Some("TCP".to_string()),
                port,
                target_port: Some(IntOrString::Int(port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The one-shot job driving the proxy through a scan of the analyzer's
/// target.
pub fn analyzer_job(settings: &Settings, dast: &Dast, analyzer: &Analyzer) -> Job {
    let mut metadata = child_meta(dast, analyzer.name.clone());
    // A scan generated for a service is garbage-collected with that
    // service, not with the Dast.
    if let Some(backing) = &analyzer.service {
        metadata.owner_references = Some(vec![OwnerReference {
            api_version: "v1".to_string(),
            kind: "Service".to_string(),
            name: backing.name.clone(),
            uid: backing.uid.clone(),
            controller: Some(true),
            ..Default::default()
        }]);
    }

    Job {
        metadata,
        spec: Some(JobSpec {
            backoff_limit: Some(5),
            completions: Some(1),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: analyzer.name.clone(),
                        image: Some(analyzer.image.clone()),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        command: Some(vec![
                            "/dynamic-analyzer".to_string(),
                            "scanner".to_string(),
                            "-t".to_string(),
                            analyzer.target.clone().unwrap_or_default(),
                            "-p".to_string(),
                            format!(
                                "http://{}:{}",
                                dast.spec.zapproxy.name, settings.zap_port
                            ),
                        ]),
                        env: Some(vec![EnvVar {
                            name: "ZAPAPIKEY".to_string(),
                            value_from: Some(EnvVarSource {
                                secret_key_ref: Some(SecretKeySelector {
                                    name: dast.spec.zapproxy.name.clone(),
                                    key: API_KEY_SECRET_KEY.to_string(),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Synthesizes the Dast an annotated service implies.
///
/// The resulting value only drives analyzer reconciliation; it is never
/// persisted as a resource.
pub fn dast_for_service(settings: &Settings, config: &ScanConfig, service: &Service) -> Dast {
    let name = service.name_any();
    let namespace = service.namespace().unwrap_or_default();
    let port = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| ports.first())
        .map(|port| port.port)
        .unwrap_or(80);

    let mut dast = Dast::new(
        &name,
        DastSpec {
            zapproxy: ZapProxy {
                name: config.proxy_name.clone(),
                ..Default::default()
            },
            analyzer: Some(Analyzer {
                image: config.analyzer_image.clone(),
                name: name.clone(),
                target: Some(settings.service_url(&name, &namespace, port)),
                service: Some(BackingService {
                    name: name.clone(),
                    namespace,
                    uid: service.uid().unwrap_or_default(),
                }),
            }),
        },
    );
    dast.metadata.namespace = Some(config.proxy_namespace.clone());
    dast
}

fn child_meta(dast: &Dast, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: dast.namespace(),
        owner_references: dast.controller_owner_ref(&()).map(|o| vec![o]),
        ..Default::default()
    }
}

fn proxy_labels(dast: &Dast) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "zapproxy".to_string()),
        ("controller".to_string(), dast.name_any()),
    ])
}
