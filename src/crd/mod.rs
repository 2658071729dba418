//! KKP custom resources (group `kubermatic.k8c.io/v1`) the controllers work with, and the
//! well-known labels and annotations on them.

mod cluster;
mod project;
mod seed;
mod sync;

pub use cluster::AuditLoggingSettings;
pub use cluster::CloudSpec;
pub use cluster::Cluster;
pub use cluster::ClusterSpec;
pub use cluster::ClusterStatus;
pub use cluster::OpaIntegrationSettings;
pub use project::Project;
pub use project::ProjectPhase;
pub use project::ProjectSpec;
pub use project::ProjectStatus;
pub use project::PROJECT_ID_LABEL;
pub use seed::Datacenter;
pub use seed::DatacenterSpec;
pub use seed::Seed;
pub use seed::SeedSpec;
pub use sync::Constraint;
pub use sync::ConstraintSpec;
pub use sync::Preset;
pub use sync::PresetSpec;
pub use sync::ResourceDetails;
pub use sync::ResourceQuota;
pub use sync::ResourceQuotaSpec;
pub use sync::Subject;
pub use sync::SyncStatus;
pub use sync::SyncedTargets;
pub use sync::UserSSHKey;
pub use sync::UserSSHKeySpec;

/// Set on clusters created from a credential preset.
pub const IS_CREDENTIAL_PRESET_LABEL: &str = "is-credential-preset";
/// Name of the preset a cluster was created from.
pub const PRESET_NAME_ANNOTATION: &str = "presetName";
/// Why the preset of a cluster is no longer usable.
pub const PRESET_INVALIDATED_ANNOTATION: &str = "presetInvalidated";
pub const PRESET_DELETED: &str = "deleted";
