//! Resources that controllers synchronize between clusters.

use std::collections::BTreeSet;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Targets a fan-out controller has written copies to, kept in the status of the source.
pub trait SyncedTargets {
    fn synced_targets(&self) -> BTreeSet<String>;
}

/// Credentials shared by many clusters. Master only.
#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
#[kube(
    group = "kubermatic.k8c.io",
    version = "v1",
    kind = "Preset",
    plural = "presets",
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct PresetSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_emails: Vec<String>,
}

/// An SSH public key that is installed on the clusters it lists. Master only.
#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
#[kube(
    group = "kubermatic.k8c.io",
    version = "v1",
    kind = "UserSSHKey",
    plural = "usersshkeys",
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct UserSSHKeySpec {
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub public_key: String,
    /// Names of the clusters the key is installed on.
    #[serde(default)]
    pub clusters: Vec<String>,
}

/// A project quota defined on the master and copied to every seed.
#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
#[kube(
    group = "kubermatic.k8c.io",
    version = "v1",
    kind = "ResourceQuota",
    plural = "resourcequotas",
    status = "SyncStatus",
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceQuotaSpec {
    pub subject: Subject,
    #[serde(default)]
    pub quota: ResourceDetails,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
pub struct Subject {
    pub name: String,
    #[serde(default = "default_subject_kind")]
    pub kind: String,
}

fn default_subject_kind() -> String {
    "project".to_owned()
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
pub struct ResourceDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
}

/// A Gatekeeper constraint defined in the KKP namespace of a seed and copied into the
/// namespace of every cluster with OPA integration.
#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
#[kube(
    group = "kubermatic.k8c.io",
    version = "v1",
    kind = "Constraint",
    plural = "constraints",
    namespaced,
    status = "SyncStatus",
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintSpec {
    /// Kind of the constraint template this constraint instantiates.
    pub constraint_type: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforcement_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    #[serde(default)]
    pub synced_targets: Vec<String>,
}

impl SyncedTargets for ResourceQuota {
    fn synced_targets(&self) -> BTreeSet<String> {
        synced(self.status.as_ref())
    }
}

impl SyncedTargets for Constraint {
    fn synced_targets(&self) -> BTreeSet<String> {
        synced(self.status.as_ref())
    }
}

fn synced(status: Option<&SyncStatus>) -> BTreeSet<String> {
    status
        .map(|status| status.synced_targets.iter().cloned().collect())
        .unwrap_or_default()
}
