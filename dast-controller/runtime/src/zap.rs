//! REST client for the scan proxy's alert views.

use crate::annotations::ScanConfig;
use crate::core::{AlertsSummary, SummaryError};
use crate::Settings;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scan engine request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("scan engine returned an invalid alerts summary: {0}")]
    Summary(#[from] SummaryError),

    #[error("scan engine response is missing 'alertsSummary'")]
    MissingSummary,
}

/// A client bound to one scan-proxy daemon.
///
/// Every call re-queries live state; results are never cached. Admission
/// trades a round trip per decision for always-current scan results.
#[derive(Clone, Debug)]
pub struct ScanProxyClient {
    http: reqwest::Client,
    base: String,
    api_key: String,
}

impl ScanProxyClient {
    /// Binds to the proxy's in-cluster address on the fixed scan-proxy port.
    pub fn new(settings: &Settings, config: &ScanConfig, api_key: String) -> Self {
        let base = settings.service_url(
            &config.proxy_name,
            &config.proxy_namespace,
            settings.zap_port,
        );
        Self {
            http: reqwest::Client::new(),
            base,
            api_key,
        }
    }

    /// Per-severity alert counts the proxy has recorded for `target`.
    pub async fn alerts_summary(&self, target: &str) -> Result<AlertsSummary, ScanError> {
        let url = format!("{}/JSON/alert/view/alertsSummary/", self.base);
        debug!(%url, %target, "querying alerts summary");

        let body: serde_json::Value = self
            .http
            .get(&url)
            .query(&[("baseurl", target)])
            .header("X-ZAP-API-Key", &self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let summary = body
            .get("alertsSummary")
            .ok_or(ScanError::MissingSummary)?;
        Ok(AlertsSummary::from_value(summary)?)
    }

    #[cfg(test)]
    pub(crate) fn base(&self) -> &str {
        &self.base
    }
}
