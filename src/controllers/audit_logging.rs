//! Enforces the audit logging settings of a seed on the clusters of its datacenters.
//!
//! Clusters in a datacenter with `enforceAuditLogging` get the Seed's settings, or plain
//! `{enabled: true}` when the Seed has none. Everywhere else a missing setting is defaulted
//! to `{enabled: false}` and an existing one is left as the user wrote it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;

use crate::config::ControllerOptions;
use crate::controller::Controller;
use crate::crd::AuditLoggingSettings;
use crate::crd::Cluster;
use crate::crd::Seed;
use crate::error::Result;
use crate::predicate::FieldChanged;
use crate::predicate::InNamespace;
use crate::predicate::SpecChanged;
use crate::predicate::WorkerName;
use crate::queue::WorkItem;
use crate::reconciler::Action;
use crate::reconciler::Context;
use crate::seed::SeedGetter;
use crate::seed::StoreSeedGetter;
use crate::store::LabelSelector;
use crate::store::TypedStore;
use crate::target::TargetCluster;
use crate::target::TargetRef;
use crate::target::TargetTable;
use crate::watch::WatchSpec;

pub const CONTROLLER_NAME: &str = "audit-logging-controller";

pub struct AuditLogging {
    seeds: Arc<dyn SeedGetter>,
    dependency_requeue: Duration,
}

impl AuditLogging {
    pub fn new(seeds: Arc<dyn SeedGetter>, dependency_requeue: Duration) -> Self {
        Self {
            seeds,
            dependency_requeue,
        }
    }
}

/// The settings `cluster` must end up with, or `None` when it is fine as it is.
pub fn desired_settings(cluster: &Cluster, seed: &Seed, enforced: bool) -> Option<AuditLoggingSettings> {
    let desired = if enforced {
        seed.spec.audit_logging.clone().unwrap_or_else(AuditLoggingSettings::enabled)
    } else {
        match &cluster.spec.audit_logging {
            Some(_) => return None,
            None => AuditLoggingSettings::disabled(),
        }
    };

    (cluster.spec.audit_logging.as_ref() != Some(&desired)).then_some(desired)
}

#[async_trait]
impl Context<Cluster> for AuditLogging {
    fn partitioned(&self) -> bool {
        true
    }

    async fn is_paused(&self, cluster: &Cluster, _source: &TargetCluster) -> Result<bool> {
        Ok(cluster.is_paused())
    }

    async fn handle_apply(&self, cluster: Arc<Cluster>, source: &TargetCluster) -> Result<Action> {
        let seed = self.seeds.seed(source).await?;
        let datacenter_name = &cluster.spec.cloud.datacenter;
        let Some(datacenter) = seed.datacenter(datacenter_name) else {
            tracing::debug!(datacenter = %datacenter_name, "Datacenter not found on seed yet");
            return Ok(Action::requeue(self.dependency_requeue));
        };

        let Some(settings) = desired_settings(&cluster, &seed, datacenter.spec.enforce_audit_logging) else {
            return Ok(Action::await_change());
        };

        let mut modified = (*cluster).clone();
        modified.spec.audit_logging = Some(settings);
        source.store().patch_typed(&modified, cluster.as_ref()).await?;
        tracing::debug!(cluster = %cluster.name_any(), "Audit logging settings updated");
        Ok(Action::await_change())
    }
}

/// Work items for every Cluster on `target`, used when the Seed of that target changes.
async fn all_clusters(target: TargetCluster, seed: Arc<Seed>) -> Result<Vec<WorkItem>> {
    if seed.name_any() != target.identity() {
        return Ok(Vec::new());
    }

    let clusters: Vec<Cluster> = target.store().list_typed(None, &LabelSelector::everything()).await?;
    Ok(clusters
        .iter()
        .map(|cluster| WorkItem::new(target.identity(), None, cluster.name_any()))
        .collect())
}

fn seed_audit_settings(seed: &Seed) -> (AuditLoggingSettings, Vec<(String, bool)>) {
    let datacenters = seed
        .spec
        .datacenters
        .iter()
        .map(|(name, datacenter)| (name.clone(), datacenter.spec.enforce_audit_logging))
        .collect();
    (seed.spec.audit_logging.clone().unwrap_or_default(), datacenters)
}

pub fn controller(targets: Arc<TargetTable>, options: &ControllerOptions) -> Controller<Cluster, AuditLogging> {
    let context = AuditLogging::new(
        Arc::new(StoreSeedGetter::new(options.namespace.clone())),
        options.dependency_requeue,
    );

    Controller::new(CONTROLLER_NAME, targets, Arc::new(context), options)
        .watches(
            TargetRef::Seeds,
            WatchSpec::<Cluster>::new()
                .with_predicate(WorkerName::new(options.worker_name.clone()))
                .with_predicate(SpecChanged),
        )
        .watches(
            TargetRef::Seeds,
            WatchSpec::<Seed>::new()
                .with_predicate(InNamespace::new(options.namespace.clone()))
                .with_predicate(FieldChanged::new(seed_audit_settings))
                .map_with(all_clusters),
        )
}
