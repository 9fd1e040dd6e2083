use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Declares a dynamic security scan: the scan-proxy daemon to provision and
/// the analyzer session to drive against a target.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "security.banzaicloud.io",
    version = "v1alpha1",
    kind = "Dast",
    status = "DastStatus",
    namespaced
)]
pub struct DastSpec {
    pub zapproxy: ZapProxy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyzer: Option<Analyzer>,
}

/// The scan-proxy daemon serving the REST scanning API.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ZapProxy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apikey: Option<String>,
}

/// The one-shot job that drives the proxy through a scan of `target`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Analyzer {
    pub image: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<BackingService>,
}

/// Reference back to the service a scan was generated for.
///
/// Present only on resources synthesized from an annotated service; the
/// analyzer job is then parented to that service instead of the Dast.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct BackingService {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
}

/// Observed state of a Dast.
///
/// Currently carries no fields; no phase machine is exposed to clients.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct DastStatus {}
