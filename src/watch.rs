//! Turning store change feeds into work items.
//!
//! A [WatchSpec] is registered per watched kind and cluster. Its event source remembers
//! the last version of every object it has seen, so predicates get `(old, new)` pairs for
//! updates. Events that pass the predicates are mapped to [WorkItem]s: by default the
//! object itself, or through a mapper that can enqueue unrelated objects.

use std::collections::HashMap;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use futures::future;
use futures::future::BoxFuture;
use futures::stream;
use futures::stream::BoxStream;
use futures::FutureExt;
use futures::StreamExt;
use kube::api::DynamicObject;
use kube::Resource;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;

use crate::config::BackoffConfig;
use crate::error::Result;
use crate::predicate::Predicate;
use crate::predicate::Predicates;
use crate::queue::WorkItem;
use crate::queue::WorkQueue;
use crate::store::api_resource;
use crate::store::from_dynamic;
use crate::store::Object;
use crate::store::RawEvent;
use crate::target::TargetCluster;

/// A typed change of one object.
#[derive(Debug)]
pub enum WatchEvent<K> {
    Create(Arc<K>),
    Update { old: Arc<K>, new: Arc<K> },
    Delete(Arc<K>),
}

impl<K> WatchEvent<K> {
    /// The object as it is now, or as it was last seen for deletions.
    pub fn object(&self) -> &Arc<K> {
        match self {
            WatchEvent::Create(object) | WatchEvent::Delete(object) => object,
            WatchEvent::Update { new, .. } => new,
        }
    }
}

type Mapper<K> = Arc<dyn Fn(TargetCluster, Arc<K>) -> BoxFuture<'static, Result<Vec<WorkItem>>> + Send + Sync>;

/// How changes of kind `K` on one cluster become work.
pub struct WatchSpec<K> {
    predicates: Predicates<K>,
    mapper: Option<Mapper<K>>,
}

impl<K> Default for WatchSpec<K> {
    fn default() -> Self {
        Self {
            predicates: Predicates::new(),
            mapper: None,
        }
    }
}

impl<K> Clone for WatchSpec<K> {
    fn clone(&self) -> Self {
        Self {
            predicates: self.predicates.clone(),
            mapper: self.mapper.clone(),
        }
    }
}

impl<K: Object> WatchSpec<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_predicate(mut self, predicate: impl Predicate<K> + 'static) -> Self {
        self.predicates = self.predicates.and(predicate);
        self
    }

    /// Replaces the direct mapping with `mapper`, which receives the cluster the change was
    /// seen on. A failing mapper is retried with backoff until it succeeds or the watch is
    /// cancelled.
    pub fn map_with<F, Fut>(mut self, mapper: F) -> Self
    where
        F: Fn(TargetCluster, Arc<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<WorkItem>>> + Send + 'static,
    {
        self.mapper = Some(Arc::new(move |target, object| mapper(target, object).boxed()));
        self
    }

    pub fn matches(&self, event: &WatchEvent<K>) -> bool {
        self.predicates.matches(event)
    }

    /// Work items for an accepted event.
    pub async fn map(&self, target: &TargetCluster, event: &WatchEvent<K>) -> Result<Vec<WorkItem>> {
        let object = event.object();
        match &self.mapper {
            Some(mapper) => mapper(target.clone(), Arc::clone(object)).await,
            None => Ok(vec![WorkItem::new(
                target.identity(),
                object.namespace().as_deref(),
                object.name_any(),
            )]),
        }
    }

    /// Maps `event`, retrying failures after `backoff` delays. `None` once `token` is cancelled.
    async fn map_until_done(
        &self,
        target: &TargetCluster,
        event: &WatchEvent<K>,
        backoff: &BackoffConfig,
        token: &CancellationToken,
    ) -> Option<Vec<WorkItem>> {
        let mut failures = 0;
        loop {
            match self.map(target, event).await {
                Ok(items) => return Some(items),
                Err(error) => {
                    failures += 1;
                    let delay = backoff.delay(failures);
                    tracing::warn!(
                        cluster = %target.identity(),
                        kind = %K::kind(&()),
                        object = %event.object().name_any(),
                        error = %error,
                        failures,
                        retry_in = ?delay,
                        "Failed to map watch event"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => return None,
                    }
                }
            }
        }
    }

    /// Feeds `queue` from the change stream of `target` until `token` is cancelled.
    pub async fn run(self, target: TargetCluster, queue: Arc<WorkQueue>, backoff: BackoffConfig, token: CancellationToken) {
        let mut events = events::<K>(&target);
        loop {
            let event = tokio::select! {
                event = events.next() => event,
                _ = token.cancelled() => return,
            };
            let Some(event) = event else {
                tracing::warn!(cluster = %target.identity(), kind = %K::kind(&()), "Watch stream ended");
                return;
            };

            if !self.matches(&event) {
                continue;
            }

            let Some(items) = self.map_until_done(&target, &event, &backoff, &token).await else {
                return;
            };
            items.into_iter().for_each(|item| queue.add(item));
        }
    }
}

/// Typed change events of kind `K` on `target`, starting with the objects that exist.
pub fn events<K: Object>(target: &TargetCluster) -> BoxStream<'static, WatchEvent<K>> {
    typed_events(target.identity().to_owned(), target.store().watch(&api_resource::<K>()))
}

fn typed_events<K: Object>(identity: String, raw: BoxStream<'static, RawEvent>) -> BoxStream<'static, WatchEvent<K>> {
    raw.scan(Tracker::<K>::default(), move |tracker, raw| {
        future::ready(Some(stream::iter(tracker.track(raw, &identity))))
    })
    .flatten()
    .boxed()
}

type Key = (Option<String>, String);

/// The last seen version of every object of one watch.
struct Tracker<K> {
    seen: HashMap<Key, Arc<K>>,
    /// Keys applied since the last `Init`, while a relist is running.
    relisted: Option<HashSet<Key>>,
}

impl<K> Default for Tracker<K> {
    fn default() -> Self {
        Self {
            seen: HashMap::new(),
            relisted: None,
        }
    }
}

impl<K: Object> Tracker<K> {
    fn track(&mut self, raw: RawEvent, identity: &str) -> Vec<WatchEvent<K>> {
        match raw {
            RawEvent::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            RawEvent::InitDone => self.finish_relist(),
            RawEvent::Applied(object) => self.decode(object, identity).map_or_else(Vec::new, |(key, object)| {
                if let Some(relisted) = &mut self.relisted {
                    relisted.insert(key.clone());
                }
                let event = match self.seen.insert(key, Arc::clone(&object)) {
                    // Same name, new object: it was deleted and recreated while we were not looking.
                    Some(old) if old.meta().uid != object.meta().uid => WatchEvent::Create(object),
                    Some(old) => WatchEvent::Update { old, new: object },
                    None => WatchEvent::Create(object),
                };
                vec![event]
            }),
            RawEvent::Deleted(object) => self.decode(object, identity).map_or_else(Vec::new, |(key, object)| {
                self.seen.remove(&key);
                vec![WatchEvent::Delete(object)]
            }),
        }
    }

    /// Objects not seen again during the relist were deleted while the watch was down.
    fn finish_relist(&mut self) -> Vec<WatchEvent<K>> {
        let Some(relisted) = self.relisted.take() else {
            return Vec::new();
        };
        let gone: Vec<Key> = self.seen.keys().filter(|key| !relisted.contains(*key)).cloned().collect();
        gone.into_iter()
            .filter_map(|key| self.seen.remove(&key))
            .map(WatchEvent::Delete)
            .collect()
    }

    fn decode(&self, raw: DynamicObject, identity: &str) -> Option<(Key, Arc<K>)> {
        let key = (raw.metadata.namespace.clone(), raw.name_any());
        match from_dynamic(raw) {
            Ok(object) => Some((key, Arc::new(object))),
            Err(error) => {
                tracing::warn!(cluster = %identity, kind = %K::kind(&()), error = %error, "Dropping undecodable object");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::predicate::SpecChanged;
    use crate::store::memory::MemoryStore;
    use crate::store::to_dynamic;
    use crate::store::TypedStore;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn config_map(name: &str, value: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("kubermatic".to_string()),
                ..Default::default()
            },
            data: Some([("key".to_string(), value.to_string())].into()),
            ..Default::default()
        }
    }

    fn target(store: &Arc<MemoryStore>) -> TargetCluster {
        TargetCluster::new(Arc::clone(store) as Arc<dyn crate::store::ObjectStore>)
    }

    #[tokio::test]
    async fn test_events_pair_updates_with_previous_version() {
        // Given: A store with one object and a typed event stream
        let store = Arc::new(MemoryStore::new("seed-a"));
        let created = store.insert(&config_map("c", "1")).unwrap();
        let mut events = events::<ConfigMap>(&target(&store));

        // When: The object changes and is deleted
        let mut changed = created.clone();
        changed.data = Some([("key".to_string(), "2".to_string())].into());
        store.patch_typed(&changed, &created).await.unwrap();
        store.delete_typed::<ConfigMap>(Some("kubermatic"), "c").await.unwrap();

        // Then: Create, Update with the old version, Delete
        assert!(matches!(events.next().await, Some(WatchEvent::Create(_))));
        match events.next().await {
            Some(WatchEvent::Update { old, new }) => {
                assert_eq!(old.data.as_ref().unwrap()["key"], "1");
                assert_eq!(new.data.as_ref().unwrap()["key"], "2");
            }
            other => panic!("Expected update, got {other:?}"),
        }
        assert!(matches!(events.next().await, Some(WatchEvent::Delete(_))));
    }

    #[tokio::test]
    async fn test_default_mapping_targets_the_object() {
        let store = Arc::new(MemoryStore::new("seed-a"));
        let spec = WatchSpec::<ConfigMap>::new();

        let items = spec
            .map(&target(&store), &WatchEvent::Create(Arc::new(config_map("c", "1"))))
            .await
            .unwrap();

        assert_eq!(items, vec![WorkItem::new("seed-a", Some("kubermatic"), "c")]);
    }

    #[tokio::test]
    async fn test_mapper_fans_out() {
        // Given: A mapper enqueueing two unrelated objects
        let store = Arc::new(MemoryStore::new("seed-a"));
        let spec = WatchSpec::<ConfigMap>::new().map_with(|target, _| async move {
            Ok(vec![
                WorkItem::new(target.identity(), None, "cluster-1"),
                WorkItem::new(target.identity(), None, "cluster-2"),
            ])
        });

        // When: Mapping any event
        let items = spec
            .map(&target(&store), &WatchEvent::Create(Arc::new(config_map("c", "1"))))
            .await
            .unwrap();

        // Then: Both are returned
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].name, "cluster-2");
    }

    #[tokio::test]
    async fn test_run_enqueues_matching_events_until_cancelled() {
        // Given: A watch that drops status-only changes
        let store = Arc::new(MemoryStore::new("seed-a"));
        store.insert(&config_map("c", "1")).unwrap();
        let queue = Arc::new(WorkQueue::new(BackoffConfig::default()));
        let token = CancellationToken::new();
        let spec = WatchSpec::<ConfigMap>::new().with_predicate(SpecChanged);
        let handle = tokio::spawn(spec.run(target(&store), Arc::clone(&queue), BackoffConfig::default(), token.clone()));

        // When: The initial state has been delivered
        let item = tokio::time::timeout(Duration::from_secs(5), queue.get()).await.unwrap();

        // Then: The existing object was enqueued
        assert_eq!(item, Some(WorkItem::new("seed-a", Some("kubermatic"), "c")));

        // When: Cancelling
        token.cancel();

        // Then: The watch task ends
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }

    fn applied(name: &str, uid: &str) -> RawEvent {
        let mut object = config_map(name, "1");
        object.metadata.uid = Some(uid.to_string());
        RawEvent::Applied(to_dynamic(&object).unwrap())
    }

    async fn typed(raw: Vec<RawEvent>) -> Vec<WatchEvent<ConfigMap>> {
        typed_events::<ConfigMap>("seed-a".to_string(), stream::iter(raw).boxed())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_object_recreated_while_disconnected_is_a_create() {
        // Given: An object that is deleted and recreated unchanged while the watch relists
        let raw = vec![
            RawEvent::Init,
            applied("c", "uid-a"),
            RawEvent::InitDone,
            RawEvent::Init,
            applied("c", "uid-b"),
            RawEvent::InitDone,
        ];

        // When: Turning the feed into typed events
        let events = typed(raw).await;

        // Then: The new object is reported as created and passes spec filtering
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], WatchEvent::Create(object) if object.metadata.uid.as_deref() == Some("uid-b")));
        assert!(<SpecChanged as Predicate<ConfigMap>>::matches(&SpecChanged, &events[1]));
    }

    #[tokio::test]
    async fn test_relist_reports_objects_deleted_while_disconnected() {
        // Given: Two objects, only one of them listed again after a reconnect
        let raw = vec![
            RawEvent::Init,
            applied("a", "uid-a"),
            applied("b", "uid-b"),
            RawEvent::InitDone,
            RawEvent::Init,
            applied("a", "uid-a"),
            RawEvent::InitDone,
        ];

        // When: Turning the feed into typed events
        let events = typed(raw).await;

        // Then: The unchanged object is an update and the missing one is deleted
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[2], WatchEvent::Update { .. }));
        assert!(matches!(&events[3], WatchEvent::Delete(object) if object.metadata.name.as_deref() == Some("b")));
    }

    #[tokio::test]
    async fn test_relist_forgets_deleted_objects() {
        let raw = vec![
            RawEvent::Init,
            applied("b", "uid-b"),
            RawEvent::InitDone,
            RawEvent::Init,
            RawEvent::InitDone,
            RawEvent::Init,
            applied("b", "uid-b"),
            RawEvent::InitDone,
        ];

        let events = typed(raw).await;

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[1], WatchEvent::Delete(_)));
        assert!(matches!(&events[2], WatchEvent::Create(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_mapping_is_retried() {
        // Given: A mapper whose first call fails
        let store = Arc::new(MemoryStore::new("seed-a"));
        store.insert(&config_map("c", "1")).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let spec = WatchSpec::<ConfigMap>::new().map_with(move |target, _| {
            let attempt = counted.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    return Err(Error::Anyhow(anyhow::anyhow!("list failed")));
                }
                Ok(vec![WorkItem::new(target.identity(), None, "cluster-1")])
            }
        });
        let queue = Arc::new(WorkQueue::new(BackoffConfig::default()));
        let token = CancellationToken::new();
        let handle = tokio::spawn(spec.run(target(&store), Arc::clone(&queue), BackoffConfig::default(), token.clone()));

        // When: Waiting for work
        let item = tokio::time::timeout(Duration::from_secs(30), queue.get()).await.unwrap();

        // Then: The event was mapped on the second attempt
        assert_eq!(item, Some(WorkItem::new("seed-a", None, "cluster-1")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_mapping_retries() {
        let store = Arc::new(MemoryStore::new("seed-a"));
        store.insert(&config_map("c", "1")).unwrap();
        let spec = WatchSpec::<ConfigMap>::new()
            .map_with(|_, _| async { Err::<Vec<WorkItem>, _>(Error::Anyhow(anyhow::anyhow!("list failed"))) });
        let queue = Arc::new(WorkQueue::new(BackoffConfig::default()));
        let token = CancellationToken::new();
        let handle = tokio::spawn(spec.run(target(&store), Arc::clone(&queue), BackoffConfig::default(), token.clone()));
        tokio::time::sleep(Duration::from_secs(5)).await;

        token.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(queue.is_empty());
    }
}
