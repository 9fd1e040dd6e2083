//! Resolution of scan configuration and thresholds from object metadata.

use crate::core::{Severity, SeverityThresholds};
use crate::Settings;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Scan-proxy configuration resolved from a backend service's annotations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanConfig {
    pub proxy_name: String,
    pub proxy_namespace: String,
    pub analyzer_image: String,
}

/// Resolves a service's scan configuration.
///
/// Returns `None` when the service never opted in (no proxy-name
/// annotation). That outcome is expected, not an error: callers use it to
/// skip gating for unmanaged services.
pub fn scan_config(
    settings: &Settings,
    annotations: &BTreeMap<String, String>,
    service_namespace: &str,
) -> Option<ScanConfig> {
    let proxy_name = annotations.get(&settings.annotation("zapproxy"))?.clone();

    let proxy_namespace = match annotations.get(&settings.annotation("zapproxy_namespace")) {
        Some(ns) => ns.clone(),
        None => {
            info!(
                namespace = %service_namespace,
                "missing scan-proxy namespace annotation, using the service namespace"
            );
            service_namespace.to_string()
        }
    };

    let analyzer_image = match annotations.get(&settings.annotation("analyzer_image")) {
        Some(image) => image.clone(),
        None => {
            info!(
                image = %settings.default_analyzer_image,
                "missing analyzer image annotation, using the default"
            );
            settings.default_analyzer_image.clone()
        }
    };

    Some(ScanConfig {
        proxy_name,
        proxy_namespace,
        analyzer_image,
    })
}

/// Severity ceilings from ingress annotations.
///
/// Each severity is an independent non-negative integer; a ceiling stays at
/// zero when its annotation is absent or unparsable.
pub fn thresholds(
    settings: &Settings,
    annotations: &BTreeMap<String, String>,
) -> SeverityThresholds {
    let mut thresholds = SeverityThresholds::default();
    for severity in Severity::ALL {
        let key = settings.annotation(annotation_suffix(severity));
        if let Some(raw) = annotations.get(&key) {
            match raw.parse::<u32>() {
                Ok(limit) => thresholds.set(severity, limit),
                Err(error) => {
                    warn!(%key, value = %raw, %error, "ignoring unparsable threshold annotation");
                }
            }
        } else {
            debug!(%key, "threshold annotation absent, keeping zero tolerance");
        }
    }
    thresholds
}

fn annotation_suffix(severity: Severity) -> &'static str {
    match severity {
        Severity::High => "high",
        Severity::Medium => "medium",
        Severity::Low => "low",
        Severity::Informational => "informational",
    }
}
