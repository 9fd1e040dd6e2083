#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use dast_controller_core as core;
pub use dast_controller_k8s_api as k8s;

mod admission;
mod annotations;
mod args;
mod ready;
mod reconciler;
mod resources;
mod zap;

pub use self::args::Args;

/// Cluster-specific configuration shared by every component.
///
/// Constructed once in [`Args::run`] and passed explicitly wherever it is
/// needed; nothing reads these values from ambient state.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Domain prefixing every annotation key, e.g. `dast.security.banzaicloud.io`.
    pub annotation_domain: String,

    /// Cluster DNS domain used to build in-cluster addresses.
    pub cluster_domain: String,

    /// Analyzer image used when a service does not pin one.
    pub default_analyzer_image: String,

    /// Scan-proxy image used when a Dast does not pin one.
    pub default_zap_image: String,

    /// Port the scan-proxy daemon listens on.
    pub zap_port: u16,
}

impl Settings {
    /// The full annotation key for `suffix`, e.g. `<domain>/zapproxy`.
    pub fn annotation(&self, suffix: &str) -> String {
        format!("{}/{}", self.annotation_domain, suffix)
    }

    /// In-cluster URL of a named, ported service.
    pub fn service_url(&self, name: &str, namespace: &str, port: impl std::fmt::Display) -> String {
        format!(
            "http://{}.{}.svc.{}:{}",
            name, namespace, self.cluster_domain, port
        )
    }
}

#[cfg(test)]
pub(crate) fn test_settings() -> Settings {
    Settings {
        annotation_domain: "dast.security.banzaicloud.io".to_string(),
        cluster_domain: "cluster.local".to_string(),
        default_analyzer_image: "ghcr.io/banzaicloud/dast-analyzer:latest".to_string(),
        default_zap_image: "owasp/zap2docker-live".to_string(),
        zap_port: 8080,
    }
}
