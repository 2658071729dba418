use kube::CustomResource;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// A user cluster whose control plane runs on a seed.
#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
#[kube(
    group = "kubermatic.k8c.io",
    version = "v1",
    kind = "Cluster",
    plural = "clusters",
    status = "ClusterStatus",
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub human_readable_name: String,
    /// Paused clusters are ignored by every controller.
    #[serde(default)]
    pub pause: bool,
    #[serde(default)]
    pub cloud: CloudSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_logging: Option<AuditLoggingSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opa_integration: Option<OpaIntegrationSettings>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
pub struct CloudSpec {
    /// Name of the seed datacenter the cluster runs in.
    #[serde(rename = "dc", default)]
    pub datacenter: String,
}

/// Kubernetes API audit logging of a user cluster. Both fields are omitted when unset.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuditLoggingSettings {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub policy_preset: String,
}

impl AuditLoggingSettings {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
pub struct OpaIntegrationSettings {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// The seed namespace hosting the control plane, once allocated.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace_name: String,
}

impl Cluster {
    pub fn is_paused(&self) -> bool {
        self.spec.pause
    }

    pub fn opa_enabled(&self) -> bool {
        self.spec.opa_integration.as_ref().is_some_and(|opa| opa.enabled)
    }

    /// The control plane namespace, if one has been allocated yet.
    pub fn namespace_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|status| status.namespace_name.as_str())
            .filter(|namespace| !namespace.is_empty())
    }
}
