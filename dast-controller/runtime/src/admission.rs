//! The validating admission service gating ingress creation.

use crate::core::{decide, Severity, Verdict};
use crate::k8s::ingress::{Backend, IngressSpec};
use crate::k8s::{Api, ResourceExt, Secret, Service};
use crate::{annotations, zap, Settings};
use anyhow::{anyhow, Context as _, Result};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::core::{DynamicObject, Status};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Clone)]
pub struct Admission {
    client: kube::Client,
    settings: Arc<Settings>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

type Body = http_body_util::Full<bytes::Bytes>;

/// Per-backend outcome of the gating chain.
enum Gate {
    /// Counts are at or under every ceiling.
    Pass,
    /// The service never opted into scanning; it is exempt from gating.
    Exempt,
    /// A ceiling was exceeded.
    Deny {
        service: String,
        severity: Severity,
        count: u32,
        limit: u32,
    },
}

// === impl Admission ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if req.method() != http::Method::POST || req.uri().path() != "/" {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: AdmissionReview = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => {
                    debug!(?req);
                    admission.admit(req).await
                }
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl Admission {
    pub fn new(client: kube::Client, settings: Arc<Settings>) -> Self {
        Self { client, settings }
    }

    async fn admit(self, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);

        // Only ingress creation is gated; everything else passes untouched.
        if !req.kind.kind.eq_ignore_ascii_case("Ingress") {
            return rsp;
        }

        let obj = match req.object {
            Some(obj) => obj,
            None => return error_response(rsp, &anyhow!("admission request missing 'object'")),
        };

        let ingress: IngressSpec = match parse_spec(&obj) {
            Ok(spec) => spec,
            Err(error) => {
                info!(%error, "Failed to parse ingress spec");
                return error_response(rsp, &error);
            }
        };

        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let thresholds = annotations::thresholds(&self.settings, obj.annotations());

        for backend in ingress.backends() {
            match self.gate_backend(&namespace, &backend, &thresholds).await {
                Ok(Gate::Pass) => {
                    debug!(service = %backend.service_name, "scan results are under every threshold");
                }
                Ok(Gate::Exempt) => {
                    info!(service = %backend.service_name, "service is not annotated for scanning, exempt from gating");
                }
                Ok(Gate::Deny {
                    service,
                    severity,
                    count,
                    limit,
                }) => {
                    info!(%namespace, %name, %service, %severity, count, limit, "Denied");
                    return deny_response(
                        rsp,
                        format!(
                            "scan results for service {service} exceed the configured {severity} threshold: {count} > {limit}"
                        ),
                    );
                }
                Err(error) => {
                    warn!(%namespace, %name, service = %backend.service_name, error = %format!("{error:#}"), "Failed to gate backend");
                    return error_response(rsp, &error);
                }
            }
        }

        rsp
    }

    /// Runs the full chain for one backend: service lookup, annotation
    /// resolution, API-key secret lookup, live summary fetch, verdict.
    async fn gate_backend(
        &self,
        namespace: &str,
        backend: &Backend,
        thresholds: &crate::core::SeverityThresholds,
    ) -> Result<Gate> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let service = services
            .get(&backend.service_name)
            .await
            .with_context(|| format!("failed to get service {}", backend.service_name))?;

        let config = match annotations::scan_config(&self.settings, service.annotations(), namespace)
        {
            Some(config) => config,
            None => return Ok(Gate::Exempt),
        };

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &config.proxy_namespace);
        let secret = secrets.get(&config.proxy_name).await.with_context(|| {
            format!(
                "failed to get scan-proxy secret {}/{}",
                config.proxy_namespace, config.proxy_name
            )
        })?;
        let api_key = secret
            .data
            .as_ref()
            .and_then(|data| data.get("zap_api_key"))
            .ok_or_else(|| {
                anyhow!(
                    "secret {}/{} has no 'zap_api_key' entry",
                    config.proxy_namespace,
                    config.proxy_name
                )
            })?;
        let api_key = String::from_utf8(api_key.0.clone()).context("API key is not UTF-8")?;

        let proxy = zap::ScanProxyClient::new(&self.settings, &config, api_key);
        let target = self
            .settings
            .service_url(&backend.service_name, namespace, &backend.port);
        let summary = proxy
            .alerts_summary(&target)
            .await
            .with_context(|| format!("failed to get the alerts summary for {target}"))?;

        Ok(match decide(&summary, thresholds) {
            Verdict::Allow => Gate::Pass,
            Verdict::Deny {
                severity,
                count,
                limit,
            } => Gate::Deny {
                service: backend.service_name.clone(),
                severity,
                count,
                limit,
            },
        })
    }
}

fn parse_spec(obj: &DynamicObject) -> Result<IngressSpec> {
    let data = obj
        .data
        .get("spec")
        .cloned()
        .ok_or_else(|| anyhow!("admission request missing 'spec'"))?;
    serde_json::from_value(data).context("invalid ingress spec")
}

/// A policy denial: `allowed=false` with the reason field populated.
fn deny_response(mut rsp: AdmissionResponse, reason: String) -> AdmissionResponse {
    rsp.allowed = false;
    rsp.result = Status::failure("", &reason);
    rsp
}

/// A processing error: `allowed=false` with the message field populated.
/// Distinct from a denial so callers can tell infrastructure failures from
/// policy outcomes by the response shape.
fn error_response(mut rsp: AdmissionResponse, error: &anyhow::Error) -> AdmissionResponse {
    rsp.allowed = false;
    rsp.result = Status::failure(&format!("{error:#}"), "");
    rsp
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_settings;
    use futures::FutureExt;
    use serde_json::json;

    type ApiHandle =
        tower_test::mock::Handle<http::Request<kube::client::Body>, http::Response<kube::client::Body>>;

    fn admission_with_server() -> (Admission, ApiHandle) {
        let (svc, handle) = tower_test::mock::pair();
        let client = kube::Client::new(svc, "default");
        (Admission::new(client, Arc::new(test_settings())), handle)
    }

    fn mock_admission() -> Admission {
        // The mock service is never driven in these tests; requests that
        // would touch the API server are out of scope here.
        let (admission, handle) = admission_with_server();
        std::mem::forget(handle);
        admission
    }

    fn json_ok(body: serde_json::Value) -> http::Response<kube::client::Body> {
        http::Response::builder()
            .status(http::StatusCode::OK)
            .body(kube::client::Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    fn json_not_found() -> http::Response<kube::client::Body> {
        let status = json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": "not found",
            "reason": "NotFound",
            "code": 404
        });
        http::Response::builder()
            .status(http::StatusCode::NOT_FOUND)
            .body(kube::client::Body::from(serde_json::to_vec(&status).unwrap()))
            .unwrap()
    }

    fn ingress_with_one_backend() -> serde_json::Value {
        json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": {"name": "my-ingress", "namespace": "apps"},
            "spec": {
                "rules": [{
                    "http": {
                        "paths": [{
                            "path": "/",
                            "backend": {"service": {"name": "payments", "port": {"number": 8080}}}
                        }]
                    }
                }]
            }
        })
    }

    fn review(kind: &str, object: serde_json::Value) -> AdmissionRequest {
        let review: AdmissionReview = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "networking.k8s.io", "version": "v1", "kind": kind},
                "resource": {"group": "networking.k8s.io", "version": "v1", "resource": "ingresses"},
                "requestKind": {"group": "networking.k8s.io", "version": "v1", "kind": kind},
                "requestResource": {"group": "networking.k8s.io", "version": "v1", "resource": "ingresses"},
                "name": "my-ingress",
                "namespace": "apps",
                "operation": "CREATE",
                "userInfo": {"username": "admin"},
                "object": object,
                "dryRun": false
            }
        }))
        .expect("valid admission review");
        review.try_into().expect("review must carry a request")
    }

    #[tokio::test]
    async fn non_ingress_kinds_are_allowed_untouched() {
        let rsp = mock_admission()
            .admit(review(
                "Gateway",
                json!({
                    "apiVersion": "networking.k8s.io/v1",
                    "kind": "Gateway",
                    "metadata": {"name": "gw", "namespace": "apps"}
                }),
            ))
            .await;
        assert!(rsp.allowed);
    }

    #[tokio::test]
    async fn ingress_without_backends_is_allowed() {
        let rsp = mock_admission()
            .admit(review(
                "Ingress",
                json!({
                    "apiVersion": "networking.k8s.io/v1",
                    "kind": "Ingress",
                    "metadata": {"name": "my-ingress", "namespace": "apps"},
                    "spec": {"rules": []}
                }),
            ))
            .await;
        assert!(rsp.allowed);
    }

    #[tokio::test]
    async fn undecodable_ingress_yields_an_error_not_a_denial() {
        let rsp = mock_admission()
            .admit(review(
                "Ingress",
                json!({
                    "apiVersion": "networking.k8s.io/v1",
                    "kind": "Ingress",
                    "metadata": {"name": "my-ingress", "namespace": "apps"},
                    "spec": {"rules": 3}
                }),
            ))
            .await;
        assert!(!rsp.allowed);
        assert!(!rsp.result.message.is_empty());
        assert!(rsp.result.reason.is_empty());
    }

    #[tokio::test]
    async fn missing_object_yields_an_error() {
        let mut req = review(
            "Ingress",
            json!({
                "apiVersion": "networking.k8s.io/v1",
                "kind": "Ingress",
                "metadata": {"name": "my-ingress", "namespace": "apps"}
            }),
        );
        req.object = None;
        let rsp = mock_admission().admit(req).await;
        assert!(!rsp.allowed);
        assert!(!rsp.result.message.is_empty());
    }

    #[tokio::test]
    async fn unannotated_backend_service_is_exempt() {
        let (admission, mut handle) = admission_with_server();

        let server = async move {
            let (request, send) = handle.next_request().await.expect("service lookup");
            assert!(request.uri().path().ends_with("/services/payments"));
            send.send_response(json_ok(json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": {"name": "payments", "namespace": "apps"}
            })));
            handle
        };

        let admit = admission.admit(review("Ingress", ingress_with_one_backend()));
        let (rsp, mut handle) = tokio::join!(admit, server);
        assert!(rsp.allowed);

        // Exemption ends the chain; no secret or proxy lookup follows.
        assert!(handle.next_request().now_or_never().is_none());
    }

    #[tokio::test]
    async fn missing_proxy_secret_is_an_error_never_a_silent_allow() {
        let (admission, mut handle) = admission_with_server();

        let server = async move {
            let (_, send) = handle.next_request().await.expect("service lookup");
            send.send_response(json_ok(json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": {
                    "name": "payments",
                    "namespace": "apps",
                    "annotations": {
                        "dast.security.banzaicloud.io/zapproxy": "zap",
                        "dast.security.banzaicloud.io/zapproxy_namespace": "scanning"
                    }
                }
            })));

            let (request, send) = handle.next_request().await.expect("secret lookup");
            assert!(request
                .uri()
                .path()
                .ends_with("/namespaces/scanning/secrets/zap"));
            send.send_response(json_not_found());
        };

        let admit = admission.admit(review("Ingress", ingress_with_one_backend()));
        let (rsp, ()) = tokio::join!(admit, server);
        assert!(!rsp.allowed);
        assert!(rsp.result.message.contains("zap"));
        assert!(rsp.result.reason.is_empty());
    }

    #[test]
    fn denials_carry_a_reason_errors_carry_a_message() {
        let base = AdmissionResponse::invalid("x");

        let denied = deny_response(base.clone(), "thresholds exceeded".to_string());
        assert!(!denied.allowed);
        assert_eq!(denied.result.reason, "thresholds exceeded");
        assert!(denied.result.message.is_empty());

        let errored = error_response(base, &anyhow!("boom"));
        assert!(!errored.allowed);
        assert!(errored.result.reason.is_empty());
        assert_eq!(errored.result.message, "boom");
    }
}
