//! Filters deciding whether a watch event is worth a reconcile.
//!
//! A [Predicates] chain is attached to one watch registration; an event passes when every
//! predicate in the chain accepts it.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::Arc;

use kube::Resource;
use kube::ResourceExt;
use serde::Serialize;
use serde_json::Value;

use crate::watch::WatchEvent;

/// Label used to partition objects between controller replicas.
pub const WORKER_NAME_LABEL: &str = "worker-name";

pub trait Predicate<K>: Send + Sync {
    fn matches(&self, event: &WatchEvent<K>) -> bool;
}

impl<K, F> Predicate<K> for F
where
    F: Fn(&WatchEvent<K>) -> bool + Send + Sync,
{
    fn matches(&self, event: &WatchEvent<K>) -> bool {
        self(event)
    }
}

/// An AND-chain of predicates. The empty chain accepts everything.
pub struct Predicates<K> {
    chain: Vec<Arc<dyn Predicate<K>>>,
}

impl<K> Default for Predicates<K> {
    fn default() -> Self {
        Self { chain: Vec::new() }
    }
}

impl<K> Clone for Predicates<K> {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
        }
    }
}

impl<K> Predicates<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn and(mut self, predicate: impl Predicate<K> + 'static) -> Self {
        self.chain.push(Arc::new(predicate));
        self
    }

    pub fn matches(&self, event: &WatchEvent<K>) -> bool {
        self.chain.iter().all(|predicate| predicate.matches(event))
    }
}

/// Whether `labels` route the object to the controller instance named `worker_name`.
///
/// An empty worker name claims the objects without a worker-name label.
pub fn worker_name_matches(labels: &BTreeMap<String, String>, worker_name: &str) -> bool {
    match labels.get(WORKER_NAME_LABEL) {
        Some(label) => label == worker_name,
        None => worker_name.is_empty(),
    }
}

/// Accepts objects routed to this worker, see [worker_name_matches].
pub struct WorkerName {
    worker_name: String,
}

impl WorkerName {
    pub fn new(worker_name: impl Into<String>) -> Self {
        Self {
            worker_name: worker_name.into(),
        }
    }
}

impl<K: Resource + Send + Sync> Predicate<K> for WorkerName {
    fn matches(&self, event: &WatchEvent<K>) -> bool {
        worker_name_matches(event.object().labels(), &self.worker_name)
    }
}

/// Drops updates that leave `spec` untouched, e.g. status heartbeats. The update that marks an
/// object for deletion always passes.
pub struct SpecChanged;

impl<K: Resource + Serialize + Send + Sync> Predicate<K> for SpecChanged {
    fn matches(&self, event: &WatchEvent<K>) -> bool {
        match event {
            WatchEvent::Update { old, new } => {
                old.meta().deletion_timestamp != new.meta().deletion_timestamp
                    || spec_of(old.as_ref()) != spec_of(new.as_ref())
            }
            WatchEvent::Create(_) | WatchEvent::Delete(_) => true,
        }
    }
}

fn spec_of<K: Serialize>(object: &K) -> Option<Value> {
    serde_json::to_value(object)
        .ok()
        .and_then(|mut value| value.get_mut("spec").map(Value::take))
}

/// Drops updates where the extracted field compares equal.
///
/// The extractor picks and normalizes a single sub-field so that representations that only
/// differ in omitted defaults compare equal.
pub struct FieldChanged<K, T, F> {
    extract: F,
    _marker: PhantomData<fn(&K) -> T>,
}

impl<K, T, F> FieldChanged<K, T, F>
where
    F: Fn(&K) -> T,
{
    pub fn new(extract: F) -> Self {
        Self {
            extract,
            _marker: PhantomData,
        }
    }
}

impl<K, T, F> Predicate<K> for FieldChanged<K, T, F>
where
    K: Send + Sync,
    T: PartialEq,
    F: Fn(&K) -> T + Send + Sync,
{
    fn matches(&self, event: &WatchEvent<K>) -> bool {
        match event {
            WatchEvent::Update { old, new } => (self.extract)(old) != (self.extract)(new),
            WatchEvent::Create(_) | WatchEvent::Delete(_) => true,
        }
    }
}

pub struct InNamespace {
    namespace: String,
}

impl InNamespace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }
}

impl<K: Resource + Send + Sync> Predicate<K> for InNamespace {
    fn matches(&self, event: &WatchEvent<K>) -> bool {
        event.object().namespace().as_deref() == Some(self.namespace.as_str())
    }
}

/// Accepts objects whose name is in a fixed allow-list.
pub struct NameIn {
    names: BTreeSet<String>,
}

impl NameIn {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl<K: Resource + Send + Sync> Predicate<K> for NameIn {
    fn matches(&self, event: &WatchEvent<K>) -> bool {
        self.names.contains(&event.object().name_any())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;

    fn pod(name: &str, labels: &[(&str, &str)]) -> Arc<Pod> {
        Arc::new(Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("kubermatic".to_string()),
                labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
                ..Default::default()
            },
            spec: Some(PodSpec::default()),
            ..Default::default()
        })
    }

    #[test]
    fn test_worker_name_matches_label() {
        assert!(worker_name_matches(&[("worker-name".to_string(), "w1".to_string())].into(), "w1"));
        assert!(!worker_name_matches(&[("worker-name".to_string(), "w1".to_string())].into(), "w2"));
        assert!(!worker_name_matches(&[("worker-name".to_string(), "w1".to_string())].into(), ""));
    }

    #[test]
    fn test_empty_worker_name_claims_unlabeled_objects() {
        assert!(worker_name_matches(&BTreeMap::new(), ""));
        assert!(!worker_name_matches(&BTreeMap::new(), "w1"));
    }

    #[test]
    fn test_spec_changed_ignores_status_churn() {
        // Given: Two versions of a pod that only differ in status
        let old = pod("p", &[]);
        let mut new = (*old).clone();
        new.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });

        // Then: The update is dropped
        let event = WatchEvent::Update { old: old.clone(), new: Arc::new(new) };
        assert!(!SpecChanged.matches(&event));

        // When: The spec changes too
        let mut changed = (*old).clone();
        changed.spec = Some(PodSpec {
            hostname: Some("node-1".to_string()),
            ..Default::default()
        });

        // Then: The update passes
        assert!(SpecChanged.matches(&WatchEvent::Update { old, new: Arc::new(changed) }));
    }

    #[test]
    fn test_spec_changed_passes_deletion_start() {
        let old = pod("p", &[]);
        let mut deleting = (*old).clone();
        deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

        assert!(SpecChanged.matches(&WatchEvent::Update { old, new: Arc::new(deleting) }));
    }

    #[test]
    fn test_spec_changed_passes_create_and_delete() {
        assert!(SpecChanged.matches(&WatchEvent::Create(pod("p", &[]))));
        assert!(SpecChanged.matches(&WatchEvent::Delete(pod("p", &[]))));
    }

    #[test]
    fn test_field_changed_compares_extracted_value() {
        // Given: A predicate looking at a normalized label
        let predicate = FieldChanged::new(|pod: &Pod| pod.labels().get("tier").cloned().unwrap_or_default());

        // Then: A missing label equals an empty one, other label changes are ignored
        let unlabeled = pod("p", &[]);
        let empty = pod("p", &[("tier", "")]);
        let other = pod("p", &[("team", "x")]);
        let db = pod("p", &[("tier", "db")]);
        assert!(!predicate.matches(&WatchEvent::Update { old: unlabeled.clone(), new: empty }));
        assert!(!predicate.matches(&WatchEvent::Update { old: unlabeled.clone(), new: other }));
        assert!(predicate.matches(&WatchEvent::Update { old: unlabeled, new: db }));
    }

    #[test]
    fn test_chain_is_anded() {
        // Given: A chain of worker name and namespace predicates
        let chain = Predicates::<Pod>::new()
            .and(WorkerName::new("w1"))
            .and(InNamespace::new("kubermatic"));

        // Then: Both must hold
        assert!(chain.matches(&WatchEvent::Create(pod("p", &[("worker-name", "w1")]))));
        assert!(!chain.matches(&WatchEvent::Create(pod("p", &[("worker-name", "w2")]))));
        assert!(Predicates::<Pod>::new().matches(&WatchEvent::Create(pod("p", &[]))));
    }

    #[test]
    fn test_name_allow_list_and_closures() {
        let chain = Predicates::<ConfigMap>::new()
            .and(NameIn::new(["admin", "edit", "view"]))
            .and(|event: &WatchEvent<ConfigMap>| !matches!(event, WatchEvent::Delete(_)));
        let config_map = |name: &str| {
            Arc::new(ConfigMap {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            })
        };

        assert!(chain.matches(&WatchEvent::Create(config_map("edit"))));
        assert!(!chain.matches(&WatchEvent::Create(config_map("cluster-admin"))));
        assert!(!chain.matches(&WatchEvent::Delete(config_map("view"))));
    }
}
