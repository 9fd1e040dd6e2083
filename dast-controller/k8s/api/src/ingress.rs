//! A schema-tolerant model of the ingress spec.
//!
//! Path backends have two encodings across platform versions: the legacy
//! `serviceName`/`servicePort` pair and the structured
//! `service.name`/`service.port` object. Both must decode to the same
//! [`Backend`], so the spec is modeled here instead of binding to a single
//! generated API version.

use serde::Deserialize;
use std::fmt;

/// A named, ported backend referenced by an ingress path rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backend {
    pub service_name: String,
    pub port: Port,
}

/// References a service port by number or name.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Port {
    Number(u16),
    Name(String),
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Port::Number(n) => fmt::Display::fmt(n, f),
            Port::Name(n) => fmt::Display::fmt(n, f),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct IngressSpec {
    #[serde(default)]
    pub rules: Vec<IngressRule>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct IngressRule {
    #[serde(default)]
    pub http: Option<HttpIngressRuleValue>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct HttpIngressRuleValue {
    #[serde(default)]
    pub paths: Vec<HttpIngressPath>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct HttpIngressPath {
    pub backend: PathBackend,
}

/// One path backend in either encoding.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum PathBackend {
    Structured {
        service: ServiceBackend,
    },
    #[serde(rename_all = "camelCase")]
    Legacy {
        service_name: String,
        service_port: Port,
    },
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServiceBackend {
    pub name: String,
    #[serde(default)]
    pub port: Option<ServiceBackendPort>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServiceBackendPort {
    #[serde(default)]
    pub number: Option<u16>,
    #[serde(default)]
    pub name: Option<String>,
}

impl IngressSpec {
    /// All backends referenced by path rules, in rule order.
    pub fn backends(&self) -> Vec<Backend> {
        self.rules
            .iter()
            .filter_map(|rule| rule.http.as_ref())
            .flat_map(|http| http.paths.iter())
            .map(|path| path.backend.resolve())
            .collect()
    }
}

impl PathBackend {
    fn resolve(&self) -> Backend {
        match self {
            PathBackend::Legacy {
                service_name,
                service_port,
            } => Backend {
                service_name: service_name.clone(),
                port: service_port.clone(),
            },
            PathBackend::Structured { service } => {
                let port = match &service.port {
                    Some(ServiceBackendPort {
                        number: Some(number),
                        ..
                    }) => Port::Number(*number),
                    Some(ServiceBackendPort {
                        name: Some(name), ..
                    }) => Port::Name(name.clone()),
                    // The platform only leaves the port unset for non-service
                    // backends; fall back to the HTTP default.
                    _ => Port::Number(80),
                };
                Backend {
                    service_name: service.name.clone(),
                    port,
                }
            }
        }
    }
}
