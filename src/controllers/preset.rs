//! Invalidates the clusters created from a credential preset once the preset is deleted.
//!
//! Presets live on the master, the clusters that use them on the seeds. The controller holds
//! a finalizer on every Preset so that deleting one annotates each of its clusters on every
//! seed with `presetInvalidated=deleted` before the Preset goes away.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use kube::ResourceExt;

use crate::config::ControllerOptions;
use crate::controller::Controller;
use crate::crd::Cluster;
use crate::crd::Preset;
use crate::crd::IS_CREDENTIAL_PRESET_LABEL;
use crate::crd::PRESET_DELETED;
use crate::crd::PRESET_INVALIDATED_ANNOTATION;
use crate::crd::PRESET_NAME_ANNOTATION;
use crate::error::Result;
use crate::error::TargetErrors;
use crate::predicate::WorkerName;
use crate::reconciler::Action;
use crate::reconciler::Context;
use crate::store::LabelSelector;
use crate::store::TypedStore;
use crate::target::TargetCluster;
use crate::target::TargetRef;
use crate::target::TargetTable;
use crate::watch::WatchSpec;

pub const CONTROLLER_NAME: &str = "preset-controller";
pub const CLEANUP_FINALIZER: &str = "kubermatic.k8c.io/cleanup-credential-preset";

pub struct PresetInvalidation {
    targets: Arc<TargetTable>,
}

impl PresetInvalidation {
    pub fn new(targets: Arc<TargetTable>) -> Self {
        Self { targets }
    }
}

/// Marks every cluster on `seed` created from `preset` as invalidated. Returns how many
/// clusters were changed.
async fn invalidate_clusters(seed: &TargetCluster, preset: &str) -> Result<usize> {
    let selector = LabelSelector::everything().eq(IS_CREDENTIAL_PRESET_LABEL, "true");
    let clusters: Vec<Cluster> = seed.store().list_typed(None, &selector).await?;

    let mut invalidated = 0;
    for cluster in clusters {
        let annotations = cluster.annotations();
        if annotations.get(PRESET_NAME_ANNOTATION).map(String::as_str) != Some(preset)
            || annotations.get(PRESET_INVALIDATED_ANNOTATION).map(String::as_str) == Some(PRESET_DELETED)
        {
            continue;
        }

        let mut modified = cluster.clone();
        modified
            .annotations_mut()
            .insert(PRESET_INVALIDATED_ANNOTATION.to_owned(), PRESET_DELETED.to_owned());
        match seed.store().patch_typed(&modified, &cluster).await {
            Ok(_) => invalidated += 1,
            // Deleted in the meantime, nothing left to invalidate.
            Err(error) if error.is_not_found() => {}
            Err(error) => return Err(error),
        }
    }

    Ok(invalidated)
}

#[async_trait]
impl Context<Preset> for PresetInvalidation {
    fn finalizer(&self) -> Option<&str> {
        Some(CLEANUP_FINALIZER)
    }

    fn partitioned(&self) -> bool {
        true
    }

    async fn handle_apply(&self, _preset: Arc<Preset>, _source: &TargetCluster) -> Result<Action> {
        Ok(Action::await_change())
    }

    async fn handle_cleanup(&self, preset: Arc<Preset>, _source: &TargetCluster) -> Result<Action> {
        let name = preset.name_any();
        let results = join_all(self.targets.seeds().map(|seed| {
            let name = name.as_str();
            async move { (seed.identity(), invalidate_clusters(seed, name).await) }
        }))
        .await;

        let mut errors = TargetErrors::new();
        for (seed, result) in results {
            match result {
                Ok(0) => {}
                Ok(invalidated) => tracing::info!(preset = %name, seed, invalidated, "Invalidated clusters of deleted preset"),
                Err(error) => errors.push(seed, error),
            }
        }
        errors.into_result()?;

        Ok(Action::await_change())
    }
}

pub fn controller(targets: Arc<TargetTable>, options: &ControllerOptions) -> Controller<Preset, PresetInvalidation> {
    let context = PresetInvalidation::new(Arc::clone(&targets));

    Controller::new(CONTROLLER_NAME, targets, Arc::new(context), options).watches(
        TargetRef::Master,
        WatchSpec::<Preset>::new().with_predicate(WorkerName::new(options.worker_name.clone())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ClusterSpec;
    use crate::store::memory::Fault;
    use crate::store::memory::MemoryStore;

    fn cluster(name: &str, preset: &str) -> Cluster {
        let mut cluster = Cluster::new(name, ClusterSpec::default());
        cluster
            .labels_mut()
            .insert(IS_CREDENTIAL_PRESET_LABEL.to_string(), "true".to_string());
        cluster
            .annotations_mut()
            .insert(PRESET_NAME_ANNOTATION.to_string(), preset.to_string());
        cluster
    }

    async fn invalidation(store: &MemoryStore, name: &str) -> Option<String> {
        let cluster: Cluster = store.get_typed(None, name).await.unwrap();
        cluster.annotations().get(PRESET_INVALIDATED_ANNOTATION).cloned()
    }

    #[tokio::test]
    async fn test_only_clusters_of_the_preset_are_invalidated() {
        // Given: Two clusters from preset x and one from preset y
        let seed = Arc::new(MemoryStore::new("seed-a"));
        seed.insert(&cluster("a", "x")).unwrap();
        seed.insert(&cluster("b", "x")).unwrap();
        seed.insert(&cluster("c", "y")).unwrap();

        // When: Invalidating preset x
        let invalidated = invalidate_clusters(&TargetCluster::new(seed.clone()), "x").await.unwrap();

        // Then: Exactly the x clusters are marked
        assert_eq!(invalidated, 2);
        assert_eq!(invalidation(&seed, "a").await.as_deref(), Some(PRESET_DELETED));
        assert_eq!(invalidation(&seed, "b").await.as_deref(), Some(PRESET_DELETED));
        assert_eq!(invalidation(&seed, "c").await, None);
    }

    #[tokio::test]
    async fn test_invalidation_is_idempotent() {
        let seed = Arc::new(MemoryStore::new("seed-a"));
        seed.insert(&cluster("a", "x")).unwrap();
        let target = TargetCluster::new(seed.clone());
        invalidate_clusters(&target, "x").await.unwrap();
        seed.clear_actions();

        let invalidated = invalidate_clusters(&target, "x").await.unwrap();

        assert_eq!(invalidated, 0);
        assert_eq!(seed.writes(), 0);
    }

    #[tokio::test]
    async fn test_unlabeled_clusters_are_ignored() {
        let seed = Arc::new(MemoryStore::new("seed-a"));
        let mut unlabeled = cluster("a", "x");
        unlabeled.labels_mut().clear();
        seed.insert(&unlabeled).unwrap();

        let invalidated = invalidate_clusters(&TargetCluster::new(seed.clone()), "x").await.unwrap();

        assert_eq!(invalidated, 0);
    }

    #[tokio::test]
    async fn test_cleanup_fails_when_one_seed_fails() {
        // Given: Two seeds with clusters of preset x, seed-b rejecting writes
        let seed_a = Arc::new(MemoryStore::new("seed-a"));
        let seed_b = Arc::new(MemoryStore::new("seed-b"));
        seed_a.insert(&cluster("a", "x")).unwrap();
        seed_b.insert(&cluster("b", "x")).unwrap();
        seed_b.fail_writes(Fault::Forbidden);
        let targets = Arc::new(
            TargetTable::new(Arc::new(MemoryStore::new("master")))
                .with_seed(seed_a.clone())
                .with_seed(seed_b.clone()),
        );
        let context = PresetInvalidation::new(Arc::clone(&targets));

        // When: Cleaning up preset x
        let preset = Arc::new(Preset::new("x", Default::default()));
        let result = context.handle_cleanup(preset, targets.master()).await;

        // Then: seed-a was handled and the failure of seed-b is reported
        assert_eq!(invalidation(&seed_a, "a").await.as_deref(), Some(PRESET_DELETED));
        assert!(result.is_err());
    }
}
