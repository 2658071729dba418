use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::crd::AuditLoggingSettings;

/// A seed cluster and the datacenters it serves. Lives in the KKP namespace and is named
/// after the seed.
#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
#[kube(
    group = "kubermatic.k8c.io",
    version = "v1",
    kind = "Seed",
    plural = "seeds",
    namespaced,
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct SeedSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub country: String,
    #[serde(default)]
    pub datacenters: BTreeMap<String, Datacenter>,
    /// Audit logging settings enforced on the clusters of enforcing datacenters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_logging: Option<AuditLoggingSettings>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
pub struct Datacenter {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location: String,
    #[serde(default)]
    pub spec: DatacenterSpec,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatacenterSpec {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub enforce_audit_logging: bool,
}

impl Seed {
    pub fn datacenter(&self, name: &str) -> Option<&Datacenter> {
        self.spec.datacenters.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_seed_wire_format() {
        let seed: Seed = serde_json::from_value(json!({
            "apiVersion": "kubermatic.k8c.io/v1",
            "kind": "Seed",
            "metadata": {"name": "europe-west", "namespace": "kubermatic"},
            "spec": {
                "datacenters": {"test-dc": {"spec": {"enforceAuditLogging": true}}},
                "auditLogging": {"enabled": true, "policyPreset": "recommended"}
            }
        }))
        .unwrap();

        assert!(seed.datacenter("test-dc").unwrap().spec.enforce_audit_logging);
        assert!(seed.datacenter("other-dc").is_none());
        assert_eq!(seed.spec.audit_logging.unwrap().policy_preset, "recommended");
    }
}
