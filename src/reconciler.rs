//! The reconcile state machine every controller runs for one work item:
//!
//! `Fetch -> WorkerNameCheck -> DeletionCheck -> PauseCheck -> Converge -> FinalizerEnsure`
//!
//! A controller only supplies a [Context]; the [Reconciler] decides which of its hooks runs
//! and manages the controller's finalizer token around them.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;

use crate::config::ControllerOptions;
use crate::error::FinalizerError;
use crate::error::Result;
use crate::events::EmitEvent;
use crate::events::EventData;
use crate::events::EventRecorder;
use crate::finalizer;
use crate::predicate::worker_name_matches;
use crate::queue::WorkItem;
use crate::store::Object;
use crate::store::TypedStore;
use crate::target::TargetCluster;
use crate::target::TargetTable;

/// What to do with a work item after a successful reconcile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile again after `duration`, e.g. to poll for a dependency that does not exist yet.
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Wait for the next watch event.
    pub fn await_change() -> Self {
        Self { requeue_after: None }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// The per-controller policy plugged into the [Reconciler].
///
/// Both hooks must be idempotent: they are re-run from scratch after any failure.
///
/// The [Context::finalizer] is added only after a successful [Context::handle_apply]. An object
/// deleted before that point goes away without [Context::handle_cleanup], so anything its first
/// apply already wrote to other clusters is left behind.
#[async_trait]
pub trait Context<K: Object>: Send + Sync {
    /// The finalizer token this controller owns, if it has remote state to clean up.
    fn finalizer(&self) -> Option<&str> {
        None
    }

    /// Whether objects are routed between controller replicas by their worker-name label.
    fn partitioned(&self) -> bool {
        false
    }

    /// Paused objects are left alone until a later change. Deletion still proceeds.
    async fn is_paused(&self, _object: &K, _source: &TargetCluster) -> Result<bool> {
        Ok(false)
    }

    /// Converges everything derived from `object`, which lives on `source`.
    async fn handle_apply(&self, object: Arc<K>, source: &TargetCluster) -> Result<Action>;

    /// Removes everything derived from a deleting `object`. Returning a requeue means cleanup
    /// is not finished yet; the finalizer is kept.
    async fn handle_cleanup(&self, _object: Arc<K>, _source: &TargetCluster) -> Result<Action> {
        Ok(Action::await_change())
    }
}

pub struct Reconciler<K, C> {
    name: String,
    context: Arc<C>,
    targets: Arc<TargetTable>,
    worker_name: String,
    _kind: PhantomData<fn() -> K>,
}

impl<K, C> Reconciler<K, C>
where
    K: Object,
    C: Context<K>,
{
    pub fn new(name: impl Into<String>, context: Arc<C>, targets: Arc<TargetTable>, options: &ControllerOptions) -> Self {
        Self {
            name: name.into(),
            context,
            targets,
            worker_name: options.worker_name.clone(),
            _kind: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the state machine for `item`. Failures other than conflicts are also reported
    /// as a Warning event on the object.
    #[tracing::instrument(skip(self, item), fields(controller = %self.name, item = %item))]
    pub async fn reconcile(&self, item: &WorkItem) -> Result<Action> {
        let source = self.targets.get(&item.target)?;
        let Some(object) = source
            .store()
            .get_opt::<K>(item.namespace.as_deref(), &item.name)
            .await?
        else {
            tracing::debug!("Object no longer exists");
            return Ok(Action::await_change());
        };
        let object = Arc::new(object);

        let result = self.reconcile_object(Arc::clone(&object), source).await;
        if let Err(error) = &result {
            if !error.is_conflict() && !error.is_cancelled() {
                EventRecorder::new(Arc::clone(source.store()), self.name.clone())
                    .emit(object.as_ref(), EventData::reconcile_failed(error))
                    .await;
            }
        }
        result
    }

    async fn reconcile_object(&self, object: Arc<K>, source: &TargetCluster) -> Result<Action> {
        if self.context.partitioned() && !worker_name_matches(object.labels(), &self.worker_name) {
            tracing::debug!(worker_name = %self.worker_name, "Object belongs to another worker");
            return Ok(Action::await_change());
        }

        if object.meta().deletion_timestamp.is_some() {
            return self.cleanup(object, source).await;
        }

        if self.context.is_paused(&object, source).await? {
            tracing::debug!("Object is paused");
            return Ok(Action::await_change());
        }

        let action = self.context.handle_apply(Arc::clone(&object), source).await?;

        if let Some(token) = self.context.finalizer() {
            if !finalizer::has_finalizer(object.as_ref(), token) {
                finalizer::add(source.store().as_ref(), object.as_ref(), token).await?;
            }
        }

        Ok(action)
    }

    async fn cleanup(&self, object: Arc<K>, source: &TargetCluster) -> Result<Action> {
        let Some(token) = self.context.finalizer() else {
            return Ok(Action::await_change());
        };
        if !finalizer::has_finalizer(object.as_ref(), token) {
            return Ok(Action::await_change());
        }

        let action = self
            .context
            .handle_cleanup(Arc::clone(&object), source)
            .await
            .map_err(|error| FinalizerError::CleanupFailed {
                finalizer: token.to_owned(),
                source: Box::new(error),
            })?;
        if action.requeue_after().is_some() {
            return Ok(action);
        }

        finalizer::remove(source.store().as_ref(), object.as_ref(), token).await?;
        tracing::debug!(finalizer = token, "Cleanup finished, finalizer removed");
        Ok(Action::await_change())
    }
}
