use std::collections::BTreeSet;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use super::SyncedTargets;

/// Label on project-owned resources naming the project they belong to.
pub const PROJECT_ID_LABEL: &str = "project-id";

/// A group of users sharing clusters and keys. Master only; the object name is the project id.
#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
#[kube(
    group = "kubermatic.k8c.io",
    version = "v1",
    kind = "Project",
    plural = "projects",
    status = "ProjectStatus",
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSpec {
    /// Human readable name.
    #[serde(default)]
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, JsonSchema)]
pub enum ProjectPhase {
    #[default]
    Inactive,
    Active,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ProjectPhase>,
    #[serde(default)]
    pub synced_targets: Vec<String>,
}

impl Project {
    pub fn phase(&self) -> ProjectPhase {
        self.status
            .as_ref()
            .and_then(|status| status.phase)
            .unwrap_or_default()
    }
}

impl SyncedTargets for Project {
    fn synced_targets(&self) -> BTreeSet<String> {
        self.status
            .as_ref()
            .map(|status| status.synced_targets.iter().cloned().collect())
            .unwrap_or_default()
    }
}
