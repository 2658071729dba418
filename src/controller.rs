//! Running a [Reconciler] against its watches with a pool of workers.
//!
//! ```ignore
//! Controller::new("resource-quota-synchronizer", targets, context, &options)
//!     .watches(TargetRef::Master, WatchSpec::<ResourceQuota>::new().with_predicate(SpecChanged))
//!     .run(token)
//!     .await?;
//! ```
//!
//! Each controller owns one [WorkQueue]. Watch tasks feed it, `max_concurrent_reconciles`
//! workers drain it. The queue guarantees that an item is never handed to two workers at
//! once, so a controller never reconciles the same object concurrently.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ControllerOptions;
use crate::error::Error;
use crate::error::Result;
use crate::queue::WorkItem;
use crate::queue::WorkQueue;
use crate::reconciler::Action;
use crate::reconciler::Context;
use crate::reconciler::Reconciler;
use crate::store::Object;
use crate::target::TargetRef;
use crate::target::TargetTable;
use crate::watch::WatchSpec;

type WatchStarter =
    Box<dyn FnOnce(&TargetTable, &Arc<WorkQueue>, &CancellationToken, &mut JoinSet<()>) -> Result<()> + Send>;

pub struct Controller<K, C> {
    reconciler: Arc<Reconciler<K, C>>,
    targets: Arc<TargetTable>,
    options: ControllerOptions,
    watches: Vec<WatchStarter>,
}

impl<K, C> Controller<K, C>
where
    K: Object,
    C: Context<K> + 'static,
{
    pub fn new(name: impl Into<String>, targets: Arc<TargetTable>, context: Arc<C>, options: &ControllerOptions) -> Self {
        Self {
            reconciler: Arc::new(Reconciler::new(name, context, Arc::clone(&targets), options)),
            targets,
            options: options.clone(),
            watches: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.reconciler.name()
    }

    /// Watches kind `W` on the clusters `target` resolves to. Unknown targets fail [Controller::run].
    pub fn watches<W: Object>(mut self, target: TargetRef, spec: WatchSpec<W>) -> Self {
        let backoff = self.options.backoff.clone();
        self.watches.push(Box::new(
            move |targets: &TargetTable, queue: &Arc<WorkQueue>, token: &CancellationToken, tasks: &mut JoinSet<()>| {
                for cluster in targets.resolve(&target)? {
                    let run = spec.clone().run(cluster.clone(), Arc::clone(queue), backoff.clone(), token.clone());
                    tasks.spawn(run);
                }
                Ok(())
            },
        ));
        self
    }

    /// Runs watches and workers until `token` is cancelled. Reconciles in flight are abandoned
    /// at that point; nothing is requeued.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let name = self.reconciler.name().to_owned();
        let queue = Arc::new(WorkQueue::new(self.options.backoff.clone()));
        let mut tasks = JoinSet::new();

        for start in self.watches {
            if let Err(error) = start(&self.targets, &queue, &token, &mut tasks) {
                token.cancel();
                tasks.shutdown().await;
                return Err(error);
            }
        }

        let workers = self.options.max_concurrent_reconciles.max(1);
        for _ in 0..workers {
            tasks.spawn(work(Arc::clone(&self.reconciler), Arc::clone(&queue), token.clone()));
        }
        tracing::info!(controller = %name, workers, "Controller started");

        token.cancelled().await;
        queue.shut_down();
        while let Some(joined) = tasks.join_next().await {
            if let Err(error) = joined {
                if error.is_panic() {
                    tracing::error!(controller = %name, error = %error, "Controller task panicked");
                }
            }
        }

        tracing::info!(controller = %name, "Controller stopped");
        Ok(())
    }
}

async fn work<K, C>(reconciler: Arc<Reconciler<K, C>>, queue: Arc<WorkQueue>, token: CancellationToken)
where
    K: Object,
    C: Context<K>,
{
    while let Some(item) = queue.get().await {
        let result = tokio::select! {
            result = reconciler.reconcile(&item) => result,
            _ = token.cancelled() => Err(Error::Cancelled),
        };
        handle_result(&queue, &item, result, reconciler.name());
        queue.done(&item);
    }
}

fn handle_result(queue: &Arc<WorkQueue>, item: &WorkItem, result: Result<Action>, controller: &str) {
    match result {
        Ok(action) => {
            queue.forget(item);
            match action.requeue_after() {
                Some(delay) => {
                    tracing::debug!(controller, item = %item, ?delay, "Reconciled, requeueing");
                    queue.add_after(item.clone(), delay);
                }
                None => tracing::debug!(controller, item = %item, "Reconciled"),
            }
        }
        Err(error) if error.is_cancelled() => {
            tracing::debug!(controller, item = %item, "Reconcile cancelled");
        }
        Err(error) if error.is_conflict() => {
            tracing::debug!(controller, item = %item, error = %error, "Conflict, retrying");
            queue.add_rate_limited(item.clone());
        }
        Err(error) => {
            tracing::error!(
                controller,
                item = %item,
                retries = queue.num_requeues(item),
                error = %error,
                "Reconcile failed"
            );
            queue.add_rate_limited(item.clone());
        }
    }
}
