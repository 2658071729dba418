//! Replicates master ResourceQuotas to every seed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::ObjectMeta;

use crate::config::ControllerOptions;
use crate::controller::Controller;
use crate::crd::ResourceQuota;
use crate::error::Result;
use crate::fanout;
use crate::fanout::Destination;
use crate::fanout::Destinations;
use crate::fanout::FanOut;
use crate::predicate::SpecChanged;
use crate::predicate::WorkerName;
use crate::reconciler::Action;
use crate::reconciler::Context;
use crate::reconciling;
use crate::reconciling::managed_labels;
use crate::target::TargetCluster;
use crate::target::TargetRef;
use crate::target::TargetTable;
use crate::watch::WatchSpec;
use crate::TryResource;

pub const CONTROLLER_NAME: &str = "resource-quota-synchronizer";
pub const CLEANUP_FINALIZER: &str = "kubermatic.k8c.io/cleanup-seed-resource-quota";

pub struct ResourceQuotaSync {
    targets: Arc<TargetTable>,
    dependency_requeue: Duration,
}

impl ResourceQuotaSync {
    pub fn new(targets: Arc<TargetTable>, dependency_requeue: Duration) -> Self {
        Self {
            targets,
            dependency_requeue,
        }
    }
}

fn seed_copy(quota: &ResourceQuota) -> Result<ResourceQuota> {
    Ok(ResourceQuota {
        metadata: ObjectMeta {
            name: Some(quota.try_name()?.to_owned()),
            labels: Some(managed_labels(CONTROLLER_NAME)),
            ..Default::default()
        },
        spec: quota.spec.clone(),
        status: None,
    })
}

#[async_trait]
impl FanOut<ResourceQuota> for ResourceQuotaSync {
    async fn destinations(&self, _quota: &ResourceQuota, _source: &TargetCluster) -> Result<Destinations> {
        Ok(Destinations {
            ready: self.targets.seeds().map(Destination::cluster).collect(),
            ..Default::default()
        })
    }

    fn resolve(&self, key: &str, _source: &TargetCluster) -> Option<Destination> {
        self.targets.seed(key).ok().map(Destination::cluster)
    }

    async fn converge(&self, quota: &ResourceQuota, destination: &Destination) -> Result<()> {
        let desired = seed_copy(quota)?;
        reconciling::converge(destination.store(), &desired, |existing: &mut ResourceQuota, desired| {
            reconciling::merge_metadata(&mut existing.metadata, &desired.metadata);
            existing.spec = desired.spec.clone();
        })
        .await?;
        Ok(())
    }

    async fn remove(&self, quota: &ResourceQuota, destination: &Destination) -> Result<()> {
        reconciling::delete_if_exists::<ResourceQuota, _>(destination.store(), None, quota.try_name()?).await?;
        Ok(())
    }
}

#[async_trait]
impl Context<ResourceQuota> for ResourceQuotaSync {
    fn finalizer(&self) -> Option<&str> {
        Some(CLEANUP_FINALIZER)
    }

    fn partitioned(&self) -> bool {
        true
    }

    async fn handle_apply(&self, quota: Arc<ResourceQuota>, source: &TargetCluster) -> Result<Action> {
        fanout::apply(self, quota.as_ref(), source, self.dependency_requeue).await
    }

    async fn handle_cleanup(&self, quota: Arc<ResourceQuota>, source: &TargetCluster) -> Result<Action> {
        fanout::remove_all(self, quota.as_ref(), source).await
    }
}

pub fn controller(targets: Arc<TargetTable>, options: &ControllerOptions) -> Controller<ResourceQuota, ResourceQuotaSync> {
    let context = ResourceQuotaSync::new(Arc::clone(&targets), options.dependency_requeue);

    Controller::new(CONTROLLER_NAME, targets, Arc::new(context), options).watches(
        TargetRef::Master,
        WatchSpec::<ResourceQuota>::new()
            .with_predicate(WorkerName::new(options.worker_name.clone()))
            .with_predicate(SpecChanged),
    )
}
