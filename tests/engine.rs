//! End-to-end behavior of the reconcile engine, driven through the resource quota
//! synchronizer against in-memory clusters.

use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use kubermatic_sync::config::ControllerOptions;
use kubermatic_sync::controllers::resource_quota;
use kubermatic_sync::controllers::resource_quota::ResourceQuotaSync;
use kubermatic_sync::crd::ResourceDetails;
use kubermatic_sync::crd::ResourceQuota;
use kubermatic_sync::crd::ResourceQuotaSpec;
use kubermatic_sync::crd::Subject;
use kubermatic_sync::error::Error;
use kubermatic_sync::error::FinalizerError;
use kubermatic_sync::finalizer::has_finalizer;
use kubermatic_sync::predicate::WORKER_NAME_LABEL;
use kubermatic_sync::queue::WorkItem;
use kubermatic_sync::reconciler::Reconciler;
use kubermatic_sync::store::memory::Fault;
use kubermatic_sync::store::memory::MemoryStore;
use kubermatic_sync::store::memory::Verb;
use kubermatic_sync::store::TypedStore;
use kubermatic_sync::target::TargetTable;
use tokio_util::sync::CancellationToken;

const QUOTA: &str = "project-abc";

struct Installation {
    master: Arc<MemoryStore>,
    seeds: Vec<Arc<MemoryStore>>,
    targets: Arc<TargetTable>,
}

impl Installation {
    fn new(seeds: &[&str]) -> Self {
        let master = Arc::new(MemoryStore::new("master"));
        let seeds: Vec<Arc<MemoryStore>> = seeds.iter().map(|name| Arc::new(MemoryStore::new(*name))).collect();
        let mut targets = TargetTable::new(master.clone());
        for seed in &seeds {
            targets = targets.with_seed(seed.clone());
        }
        Self {
            master,
            seeds,
            targets: Arc::new(targets),
        }
    }

    fn reconciler(&self, worker_name: &str) -> Reconciler<ResourceQuota, ResourceQuotaSync> {
        let options = ControllerOptions {
            worker_name: worker_name.to_string(),
            ..Default::default()
        };
        let context = ResourceQuotaSync::new(Arc::clone(&self.targets), options.dependency_requeue);
        Reconciler::new(resource_quota::CONTROLLER_NAME, Arc::new(context), Arc::clone(&self.targets), &options)
    }

    fn writes(&self) -> usize {
        self.master.writes() + self.seeds.iter().map(|seed| seed.writes()).sum::<usize>()
    }

    fn clear_actions(&self) {
        self.master.clear_actions();
        self.seeds.iter().for_each(|seed| seed.clear_actions());
    }

    async fn master_quota(&self) -> Option<ResourceQuota> {
        self.master.get_opt(None, QUOTA).await.unwrap()
    }
}

async fn seed_quota(seed: &MemoryStore) -> Option<ResourceQuota> {
    seed.get_opt(None, QUOTA).await.unwrap()
}

fn quota(labels: &[(&str, &str)]) -> ResourceQuota {
    let mut quota = ResourceQuota::new(
        QUOTA,
        ResourceQuotaSpec {
            subject: Subject {
                name: "abc".to_string(),
                kind: "project".to_string(),
            },
            quota: ResourceDetails {
                cpu: Some("10".to_string()),
                memory: Some("32Gi".to_string()),
                ..Default::default()
            },
        },
    );
    for (key, value) in labels {
        quota.labels_mut().insert(key.to_string(), value.to_string());
    }
    quota
}

fn item() -> WorkItem {
    WorkItem::new("master", None, QUOTA)
}

#[tokio::test]
async fn test_second_reconcile_of_converged_object_writes_nothing() {
    // Given: A quota that has been reconciled once
    let installation = Installation::new(&["seed-a", "seed-b"]);
    installation.master.insert(&quota(&[])).unwrap();
    let reconciler = installation.reconciler("");
    reconciler.reconcile(&item()).await.unwrap();
    assert!(installation.writes() > 0);
    installation.clear_actions();

    // When: Reconciling again without any change
    reconciler.reconcile(&item()).await.unwrap();

    // Then: No cluster saw a write
    assert_eq!(installation.writes(), 0);
}

#[tokio::test]
async fn test_finalizer_outlives_failed_remote_cleanup() {
    // Given: A synced quota whose copy on seed-b cannot be deleted
    let installation = Installation::new(&["seed-a", "seed-b"]);
    installation.master.insert(&quota(&[])).unwrap();
    let reconciler = installation.reconciler("");
    reconciler.reconcile(&item()).await.unwrap();
    installation.seeds[1].fail_on(Verb::Delete, Some("ResourceQuota"), None, Fault::Forbidden);

    // When: The quota is deleted on master and reconciled
    installation.master.delete_typed::<ResourceQuota>(None, QUOTA).await.unwrap();
    let error = reconciler.reconcile(&item()).await.unwrap_err();

    // Then: The cleanup failure is reported and the quota is still held by the finalizer
    assert!(matches!(error, Error::Finalizer(FinalizerError::CleanupFailed { .. })));
    let held = installation.master_quota().await.unwrap();
    assert!(has_finalizer(&held, resource_quota::CLEANUP_FINALIZER));
    assert!(held.metadata.deletion_timestamp.is_some());
    assert!(seed_quota(&installation.seeds[0]).await.is_none());
    assert!(seed_quota(&installation.seeds[1]).await.is_some());

    // When: seed-b recovers
    installation.seeds[1].clear_faults();
    reconciler.reconcile(&item()).await.unwrap();

    // Then: Every copy is gone and the quota is released
    assert!(seed_quota(&installation.seeds[1]).await.is_none());
    assert!(installation.master_quota().await.is_none());
}

#[tokio::test]
async fn test_other_workers_never_mutate_an_object() {
    // Given: A quota routed to worker w1 and two controller instances
    let installation = Installation::new(&["seed-a"]);
    installation.master.insert(&quota(&[(WORKER_NAME_LABEL, "w1")])).unwrap();

    // When: The w2 instance reconciles it
    installation.reconciler("w2").reconcile(&item()).await.unwrap();

    // Then: Nothing was written anywhere
    assert_eq!(installation.writes(), 0);

    // When: The w1 instance reconciles it
    installation.reconciler("w1").reconcile(&item()).await.unwrap();

    // Then: It converges
    assert!(seed_quota(&installation.seeds[0]).await.is_some());
}

#[tokio::test]
async fn test_one_broken_seed_does_not_block_the_others() {
    // Given: Three seeds, seed-b failing every write
    let installation = Installation::new(&["seed-a", "seed-b", "seed-c"]);
    installation.master.insert(&quota(&[])).unwrap();
    installation.seeds[1].fail_writes(Fault::Unavailable);

    // When: Reconciling
    let result = installation.reconciler("").reconcile(&item()).await;

    // Then: seed-a and seed-c converged and the reconcile reports the failure of seed-b
    assert!(seed_quota(&installation.seeds[0]).await.is_some());
    assert!(seed_quota(&installation.seeds[2]).await.is_some());
    assert!(seed_quota(&installation.seeds[1]).await.is_none());
    match result {
        Err(Error::Targets(errors)) => assert_eq!(errors.targets().collect::<Vec<_>>(), vec!["seed-b"]),
        other => panic!("Expected aggregate target error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_controller_syncs_and_cleans_up_end_to_end() {
    // Given: A running resource quota controller
    let installation = &Installation::new(&["seed-a", "seed-b"]);
    let token = CancellationToken::new();
    let controller = resource_quota::controller(Arc::clone(&installation.targets), &ControllerOptions::default());
    let running = tokio::spawn(controller.run(token.clone()));

    // When: A quota is created on master
    installation.master.insert(&quota(&[])).unwrap();

    // Then: Both seeds get a copy and the master quota carries the finalizer
    eventually(move || async move {
        let master = installation.master_quota().await;
        seed_quota(&installation.seeds[0]).await.is_some()
            && seed_quota(&installation.seeds[1]).await.is_some()
            && master.is_some_and(|quota| has_finalizer(&quota, resource_quota::CLEANUP_FINALIZER))
    })
    .await;

    // When: The quota is deleted on master
    installation.master.delete_typed::<ResourceQuota>(None, QUOTA).await.unwrap();

    // Then: The copies are removed before the quota goes away
    eventually(move || async move {
        installation.master_quota().await.is_none()
            && seed_quota(&installation.seeds[0]).await.is_none()
            && seed_quota(&installation.seeds[1]).await.is_none()
    })
    .await;

    token.cancel();
    running.await.unwrap().unwrap();
}

async fn eventually<F, Fut>(condition: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
