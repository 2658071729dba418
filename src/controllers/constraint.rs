//! Replicates Constraints from the installation namespace of a seed into the control plane
//! namespace of every cluster with OPA integration.
//!
//! A cluster is eligible while OPA integration is enabled. Paused clusters keep whatever copy
//! they have; clusters whose namespace has not been allocated yet are polled for.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::ObjectMeta;
use kube::ResourceExt;

use crate::config::ControllerOptions;
use crate::controller::Controller;
use crate::crd::Cluster;
use crate::crd::Constraint;
use crate::error::Result;
use crate::fanout;
use crate::fanout::Destination;
use crate::fanout::Destinations;
use crate::fanout::FanOut;
use crate::predicate::FieldChanged;
use crate::predicate::InNamespace;
use crate::predicate::SpecChanged;
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

pub const CONTROLLER_NAME: &str = "constraint-synchronizer";
pub const CLEANUP_FINALIZER: &str = "kubermatic.k8c.io/cleanup-kubermatic-constraint";

pub struct ConstraintSync {
    namespace: String,
    dependency_requeue: Duration,
}

impl ConstraintSync {
    pub fn new(namespace: impl Into<String>, dependency_requeue: Duration) -> Self {
        Self {
            namespace: namespace.into(),
            dependency_requeue,
        }
    }
}

fn namespaced_copy(constraint: &Constraint, namespace: &str) -> Result<Constraint> {
    Ok(Constraint {
        metadata: ObjectMeta {
            name: Some(constraint.try_name()?.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(managed_labels(CONTROLLER_NAME)),
            ..Default::default()
        },
        spec: constraint.spec.clone(),
        status: None,
    })
}

#[async_trait]
impl FanOut<Constraint> for ConstraintSync {
    async fn destinations(&self, _constraint: &Constraint, source: &TargetCluster) -> Result<Destinations> {
        let clusters: Vec<Cluster> = source.store().list_typed(None, &LabelSelector::everything()).await?;

        let mut destinations = Destinations::default();
        for cluster in clusters.iter().filter(|cluster| cluster.opa_enabled()) {
            match cluster.namespace_name() {
                Some(namespace) if cluster.is_paused() => destinations.untouched.push(namespace.to_owned()),
                Some(namespace) => destinations.ready.push(Destination::namespace(source, namespace)),
                None if cluster.is_paused() => {}
                None => destinations.waiting.push(cluster.name_any()),
            }
        }
        Ok(destinations)
    }

    fn resolve(&self, key: &str, source: &TargetCluster) -> Option<Destination> {
        Some(Destination::namespace(source, key))
    }

    async fn converge(&self, constraint: &Constraint, destination: &Destination) -> Result<()> {
        let Some(namespace) = destination.namespace_name() else {
            return Ok(());
        };
        let desired = namespaced_copy(constraint, namespace)?;
        reconciling::converge(destination.store(), &desired, |existing: &mut Constraint, desired| {
            reconciling::merge_metadata(&mut existing.metadata, &desired.metadata);
            existing.spec = desired.spec.clone();
        })
        .await?;
        Ok(())
    }

    async fn remove(&self, constraint: &Constraint, destination: &Destination) -> Result<()> {
        reconciling::delete_if_exists::<Constraint, _>(destination.store(), destination.namespace_name(), constraint.try_name()?)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Context<Constraint> for ConstraintSync {
    fn finalizer(&self) -> Option<&str> {
        Some(CLEANUP_FINALIZER)
    }

    fn partitioned(&self) -> bool {
        true
    }

    async fn handle_apply(&self, constraint: Arc<Constraint>, source: &TargetCluster) -> Result<Action> {
        if constraint.namespace().as_deref() != Some(self.namespace.as_str()) {
            return Ok(Action::await_change());
        }
        fanout::apply(self, constraint.as_ref(), source, self.dependency_requeue).await
    }

    async fn handle_cleanup(&self, constraint: Arc<Constraint>, source: &TargetCluster) -> Result<Action> {
        fanout::remove_all(self, constraint.as_ref(), source).await
    }
}

/// Cluster fields that decide whether and where a cluster gets copies.
fn eligibility(cluster: &Cluster) -> (bool, bool, Option<String>) {
    (cluster.opa_enabled(), cluster.is_paused(), cluster.namespace_name().map(str::to_owned))
}

pub fn controller(targets: Arc<TargetTable>, options: &ControllerOptions) -> Controller<Constraint, ConstraintSync> {
    let context = ConstraintSync::new(options.namespace.clone(), options.dependency_requeue);
    let namespace = options.namespace.clone();

    Controller::new(CONTROLLER_NAME, targets, Arc::new(context), options)
        .watches(
            TargetRef::Seeds,
            WatchSpec::<Constraint>::new()
                .with_predicate(InNamespace::new(options.namespace.clone()))
                .with_predicate(WorkerName::new(options.worker_name.clone()))
                .with_predicate(SpecChanged),
        )
        .watches(
            TargetRef::Seeds,
            WatchSpec::<Cluster>::new()
                .with_predicate(FieldChanged::new(eligibility))
                .map_with(move |target: TargetCluster, _cluster: Arc<Cluster>| {
                    let namespace = namespace.clone();
                    async move { constraints_in(&target, &namespace).await }
                }),
        )
}

/// Work items for every Constraint in `namespace` on `target`.
async fn constraints_in(target: &TargetCluster, namespace: &str) -> Result<Vec<WorkItem>> {
    let constraints: Vec<Constraint> = target
        .store()
        .list_typed(Some(namespace), &LabelSelector::everything())
        .await?;
    Ok(constraints
        .iter()
        .map(|constraint| WorkItem::new(target.identity(), Some(namespace), constraint.name_any()))
        .collect())
}
