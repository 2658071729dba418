//! Replicating one source object into many destinations, and removing the copies again.
//!
//! A destination is a cluster, or a namespace within one. Every destination a copy was
//! attempted on is recorded under a stable key in the source's `status.syncedTargets`.
//! Cleanup works on the union of that record and the currently eligible destinations, so it
//! does not depend on fields that may have changed by the time the source is deleted.
//!
//! Destinations are handled concurrently and independently: one failing destination is
//! reported in the aggregate error but never keeps the others from converging.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;

use crate::crd::SyncedTargets;
use crate::error::Result;
use crate::error::TargetErrors;
use crate::reconciler::Action;
use crate::store::Object;
use crate::store::ObjectStore;
use crate::store::TypedStore;
use crate::target::TargetCluster;

/// Where a copy goes.
#[derive(Debug, Clone)]
pub struct Destination {
    key: String,
    cluster: TargetCluster,
    namespace: Option<String>,
}

impl Destination {
    /// A whole cluster, keyed by its identity.
    pub fn cluster(cluster: &TargetCluster) -> Self {
        Self {
            key: cluster.identity().to_owned(),
            cluster: cluster.clone(),
            namespace: None,
        }
    }

    /// A namespace of `cluster`, keyed by the namespace name.
    pub fn namespace(cluster: &TargetCluster, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            key: namespace.clone(),
            cluster: cluster.clone(),
            namespace: Some(namespace),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn target(&self) -> &TargetCluster {
        &self.cluster
    }

    pub fn store(&self) -> &dyn ObjectStore {
        self.cluster.store().as_ref()
    }

    pub fn namespace_name(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

/// The destinations a source object should currently be copied to.
#[derive(Debug, Default)]
pub struct Destinations {
    pub ready: Vec<Destination>,
    /// Eligible destinations that cannot take a copy yet, e.g. a namespace not allocated.
    pub waiting: Vec<String>,
    /// Keys of destinations to leave alone for now, e.g. paused clusters. A copy there is
    /// neither converged nor removed, and stays recorded.
    pub untouched: Vec<String>,
}

/// The per-controller fan-out policy.
#[async_trait]
pub trait FanOut<K: Object>: Send + Sync {
    async fn destinations(&self, source_object: &K, source: &TargetCluster) -> Result<Destinations>;

    /// Maps a recorded key back to a destination. `None` when the destination no longer
    /// exists at all, e.g. a seed that was removed from the installation.
    fn resolve(&self, key: &str, source: &TargetCluster) -> Option<Destination>;

    async fn converge(&self, source_object: &K, destination: &Destination) -> Result<()>;

    /// Removes the copy from `destination`. Must treat an absent copy as removed.
    async fn remove(&self, source_object: &K, destination: &Destination) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct SyncReport {
    /// Keys to record as synced: every destination a copy was attempted on, plus any
    /// unwanted destination whose copy could not be removed yet.
    pub synced: BTreeSet<String>,
    pub waiting: Vec<String>,
    pub errors: TargetErrors,
}

enum Step {
    Converge,
    Remove,
}

/// Converges every eligible destination and removes copies from recorded destinations that
/// are no longer eligible.
pub async fn sync<K, P>(policy: &P, source_object: &K, source: &TargetCluster, recorded: &BTreeSet<String>) -> Result<SyncReport>
where
    K: Object,
    P: FanOut<K> + ?Sized,
{
    let destinations = policy.destinations(source_object, source).await?;
    let wanted: BTreeSet<&str> = destinations.ready.iter().map(Destination::key).collect();
    let untouched: BTreeSet<&str> = destinations.untouched.iter().map(String::as_str).collect();

    let unwanted = recorded
        .iter()
        .filter(|key| !wanted.contains(key.as_str()) && !untouched.contains(key.as_str()))
        .filter_map(|key| {
            let destination = policy.resolve(key, source);
            if destination.is_none() {
                tracing::debug!(destination = %key, "Recorded destination no longer exists, forgetting it");
            }
            destination
        });

    let steps = destinations
        .ready
        .iter()
        .cloned()
        .map(|destination| (Step::Converge, destination))
        .chain(unwanted.map(|destination| (Step::Remove, destination)));

    let results = join_all(steps.map(|(step, destination)| async move {
        let result = match step {
            Step::Converge => policy.converge(source_object, &destination).await,
            Step::Remove => policy.remove(source_object, &destination).await,
        };
        (step, destination, result)
    }))
    .await;

    let mut report = SyncReport {
        synced: recorded
            .iter()
            .filter(|key| untouched.contains(key.as_str()))
            .cloned()
            .collect(),
        waiting: destinations.waiting.clone(),
        ..Default::default()
    };
    for (step, destination, result) in results {
        match (step, result) {
            (Step::Converge, Ok(())) => {
                report.synced.insert(destination.key);
            }
            (Step::Converge, Err(error)) => {
                report.synced.insert(destination.key.clone());
                report.errors.push(destination.key, error);
            }
            (Step::Remove, Ok(())) => {
                tracing::debug!(destination = %destination.key, "Removed copy from destination that is no longer eligible");
            }
            (Step::Remove, Err(error)) => {
                report.synced.insert(destination.key.clone());
                report.errors.push(destination.key, error);
            }
        }
    }

    Ok(report)
}

/// Removes the copies from every recorded and every currently eligible destination.
/// Succeeds only if every removal did.
pub async fn cleanup<K, P>(policy: &P, source_object: &K, source: &TargetCluster, recorded: &BTreeSet<String>) -> Result<()>
where
    K: Object,
    P: FanOut<K> + ?Sized,
{
    let eligible = policy.destinations(source_object, source).await?.ready;
    let mut keys: BTreeSet<&str> = recorded.iter().map(String::as_str).collect();
    let mut destinations: Vec<Destination> = Vec::new();
    for destination in eligible {
        keys.remove(destination.key());
        destinations.push(destination);
    }
    destinations.extend(keys.into_iter().filter_map(|key| policy.resolve(key, source)));

    let results = join_all(destinations.into_iter().map(|destination| async move {
        let result = policy.remove(source_object, &destination).await;
        (destination.key, result)
    }))
    .await;

    let mut errors = TargetErrors::new();
    for (key, result) in results {
        if let Err(error) = result {
            errors.push(key, error);
        }
    }
    errors.into_result()
}

/// Persists `synced` into the status of `source_object` unless it is already recorded.
pub async fn record_synced<K>(store: &dyn ObjectStore, source_object: &K, synced: &BTreeSet<String>) -> Result<()>
where
    K: Object + SyncedTargets,
{
    if source_object.synced_targets() == *synced {
        return Ok(());
    }

    store
        .patch_status_typed(source_object, &json!({ "syncedTargets": synced }))
        .await?;
    Ok(())
}

/// The usual apply hook of a fan-out controller: sync, record, then report.
///
/// Returns a requeue after `dependency_requeue` while some destination is waiting.
pub async fn apply<K, P>(policy: &P, source_object: &K, source: &TargetCluster, dependency_requeue: Duration) -> Result<Action>
where
    K: Object + SyncedTargets,
    P: FanOut<K> + ?Sized,
{
    let report = sync(policy, source_object, source, &source_object.synced_targets()).await?;
    record_synced(source.store().as_ref(), source_object, &report.synced).await?;
    report.errors.into_result()?;

    if report.waiting.is_empty() {
        Ok(Action::await_change())
    } else {
        tracing::debug!(waiting = ?report.waiting, "Destinations not ready yet");
        Ok(Action::requeue(dependency_requeue))
    }
}

/// The usual cleanup hook of a fan-out controller.
pub async fn remove_all<K, P>(policy: &P, source_object: &K, source: &TargetCluster) -> Result<Action>
where
    K: Object + SyncedTargets,
    P: FanOut<K> + ?Sized,
{
    cleanup(policy, source_object, source, &source_object.synced_targets()).await?;
    Ok(Action::await_change())
}
