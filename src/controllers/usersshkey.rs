//! Keeps the `usersshkeys` Secret in the namespace of every cluster in sync with the master
//! UserSSHKeys that list the cluster.
//!
//! When a cluster is deleted, it is removed from the cluster lists of those keys before its
//! finalizer is released.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::Resource;
use kube::ResourceExt;

use crate::config::ControllerOptions;
use crate::controller::Controller;
use crate::crd::Cluster;
use crate::crd::ClusterSpec;
use crate::crd::UserSSHKey;
use crate::error::Result;
use crate::predicate::FieldChanged;
use crate::predicate::WorkerName;
use crate::queue::WorkItem;
use crate::reconciler::Action;
use crate::reconciler::Context;
use crate::reconciling;
use crate::reconciling::managed_labels;
use crate::store::LabelSelector;
use crate::store::TypedStore;
use crate::target::TargetCluster;
use crate::target::TargetRef;
use crate::target::TargetTable;
use crate::watch::WatchSpec;
use crate::TryResource;

pub const CONTROLLER_NAME: &str = "usersshkey-synchronizer";
pub const CLEANUP_FINALIZER: &str = "kubermatic.k8c.io/cleanup-usersshkeys-cluster-ids";
pub const SECRET_NAME: &str = "usersshkeys";

pub struct UserSshKeySync {
    targets: Arc<TargetTable>,
    dependency_requeue: Duration,
}

impl UserSshKeySync {
    pub fn new(targets: Arc<TargetTable>, dependency_requeue: Duration) -> Self {
        Self {
            targets,
            dependency_requeue,
        }
    }

    /// Master keys that list the cluster named `cluster`.
    async fn keys_of(&self, cluster: &str) -> Result<Vec<UserSSHKey>> {
        let keys: Vec<UserSSHKey> = self
            .targets
            .master()
            .store()
            .list_typed(None, &LabelSelector::everything())
            .await?;
        Ok(keys
            .into_iter()
            .filter(|key| key.spec.clusters.iter().any(|c| c == cluster))
            .collect())
    }
}

/// The Secret holding `keys`, one data entry per key named after the UserSSHKey.
pub fn keys_secret(namespace: &str, keys: &[UserSSHKey]) -> Result<Secret> {
    let data = keys
        .iter()
        .map(|key| -> Result<(String, ByteString)> {
            Ok((key.try_name()?.to_owned(), ByteString(key.spec.public_key.clone().into_bytes())))
        })
        .collect::<Result<BTreeMap<_, _>>>()?;

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(SECRET_NAME.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(managed_labels(CONTROLLER_NAME)),
            ..Default::default()
        },
        type_: Some("Opaque".to_owned()),
        data: Some(data),
        ..Default::default()
    })
}

#[async_trait]
impl Context<Cluster> for UserSshKeySync {
    fn finalizer(&self) -> Option<&str> {
        Some(CLEANUP_FINALIZER)
    }

    fn partitioned(&self) -> bool {
        true
    }

    async fn is_paused(&self, cluster: &Cluster, _source: &TargetCluster) -> Result<bool> {
        Ok(cluster.is_paused())
    }

    async fn handle_apply(&self, cluster: Arc<Cluster>, source: &TargetCluster) -> Result<Action> {
        let Some(namespace) = cluster.namespace_name() else {
            tracing::debug!("Cluster namespace not allocated yet");
            return Ok(Action::requeue(self.dependency_requeue));
        };

        let keys = self.keys_of(&cluster.name_any()).await?;
        let desired = keys_secret(namespace, &keys)?;
        reconciling::converge(source.store().as_ref(), &desired, |existing: &mut Secret, desired| {
            reconciling::merge_metadata(&mut existing.metadata, &desired.metadata);
            existing.data = desired.data.clone();
        })
        .await?;

        Ok(Action::await_change())
    }

    async fn handle_cleanup(&self, cluster: Arc<Cluster>, _source: &TargetCluster) -> Result<Action> {
        let name = cluster.name_any();
        let master = self.targets.master().store();

        for key in self.keys_of(&name).await? {
            let mut modified = key.clone();
            modified.spec.clusters.retain(|c| c != &name);
            match master.patch_typed(&modified, &key).await {
                Ok(_) => tracing::debug!(key = %key.name_any(), "Removed deleted cluster from key"),
                Err(error) if error.is_not_found() => {}
                Err(error) => return Err(error),
            }
        }

        Ok(Action::await_change())
    }
}

/// Work items for every Cluster on every seed. Keys can drop a cluster from their list, so a
/// key change cannot be narrowed down to the clusters it lists now.
async fn clusters_on_seeds(targets: &TargetTable) -> Result<Vec<WorkItem>> {
    let mut items = Vec::new();
    for seed in targets.seeds() {
        let clusters: Vec<Cluster> = seed.store().list_typed(None, &LabelSelector::everything()).await?;
        items.extend(
            clusters
                .iter()
                .map(|cluster| WorkItem::new(seed.identity(), None, cluster.name_any())),
        );
    }
    Ok(items)
}

type ClusterFields = (ClusterSpec, Option<String>, bool);

fn cluster_fields(cluster: &Cluster) -> ClusterFields {
    (
        cluster.spec.clone(),
        cluster.namespace_name().map(str::to_owned),
        cluster.meta().deletion_timestamp.is_some(),
    )
}

pub fn controller(targets: Arc<TargetTable>, options: &ControllerOptions) -> Controller<Cluster, UserSshKeySync> {
    let context = UserSshKeySync::new(Arc::clone(&targets), options.dependency_requeue);
    let mapped = Arc::clone(&targets);

    Controller::new(CONTROLLER_NAME, targets, Arc::new(context), options)
        .watches(
            TargetRef::Seeds,
            WatchSpec::<Cluster>::new()
                .with_predicate(WorkerName::new(options.worker_name.clone()))
                .with_predicate(FieldChanged::new(cluster_fields)),
        )
        .watches(
            TargetRef::Master,
            WatchSpec::<UserSSHKey>::new().map_with(move |_master: TargetCluster, _key: Arc<UserSSHKey>| {
                let targets = Arc::clone(&mapped);
                async move { clusters_on_seeds(&targets).await }
            }),
        )
}
