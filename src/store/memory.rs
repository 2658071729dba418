//! An in-memory [ObjectStore] with the consistency rules of the Kubernetes API server that
//! the engine relies on: resourceVersion-conditioned writes, two-phase deletion through
//! finalizers, a status subresource, and a watch feed.
//!
//! Successful writes are recorded so tests can assert on exactly what a reconcile did, and
//! faults can be injected per verb, kind and name.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::MutexGuard;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ApiResource;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Error;
use crate::error::Result;
use crate::store::api_resource;
use crate::store::object_id;
use crate::store::to_dynamic;
use crate::store::from_dynamic;
use crate::store::LabelSelector;
use crate::store::Object;
use crate::store::ObjectStore;
use crate::store::RawEvent;
use crate::TryResource;

const WATCH_BUFFER: usize = 1024;

/// Store calls faults can be injected on. Only writes are recorded as actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    List,
    Create,
    Update,
    Patch,
    PatchStatus,
    Delete,
}

/// A write that went through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAction {
    pub verb: Verb,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

/// What an injected fault makes the store return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Forbidden,
    Conflict,
    Unavailable,
}

type Key = (String, Option<String>, String);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FaultRule {
    verb: Verb,
    kind: Option<String>,
    name: Option<String>,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, DynamicObject>,
    resource_version: u64,
    actions: Vec<WriteAction>,
    faults: HashMap<FaultRule, Fault>,
}

impl Inner {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

pub struct MemoryStore {
    identity: String,
    inner: Mutex<Inner>,
    events: broadcast::Sender<(String, RawEvent)>,
}

impl MemoryStore {
    pub fn new(identity: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            identity: identity.into(),
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    /// Puts a typed object into the store without recording it as a write.
    pub fn insert<K: Object>(&self, object: &K) -> Result<K> {
        let ar = api_resource::<K>();
        let mut inner = self.lock()?;
        let created = self.create_locked(&mut inner, &ar, &to_dynamic(object)?)?;
        from_dynamic(created)
    }

    /// Makes every matching call fail with `fault`. `None` for kind or name matches any.
    pub fn fail_on(&self, verb: Verb, kind: Option<&str>, name: Option<&str>, fault: Fault) {
        let rule = FaultRule {
            verb,
            kind: kind.map(str::to_owned),
            name: name.map(str::to_owned),
        };
        self.lock_unpoisoned().faults.insert(rule, fault);
    }

    /// Makes every write on this store fail, as for an unreachable cluster.
    pub fn fail_writes(&self, fault: Fault) {
        for verb in [Verb::Create, Verb::Update, Verb::Patch, Verb::PatchStatus, Verb::Delete] {
            self.fail_on(verb, None, None, fault);
        }
    }

    pub fn clear_faults(&self) {
        self.lock_unpoisoned().faults.clear();
    }

    pub fn actions(&self) -> Vec<WriteAction> {
        self.lock_unpoisoned().actions.clone()
    }

    pub fn writes(&self) -> usize {
        self.lock_unpoisoned().actions.len()
    }

    pub fn clear_actions(&self) {
        self.lock_unpoisoned().actions.clear();
    }

    pub fn contains(&self, ar: &ApiResource, namespace: Option<&str>, name: &str) -> bool {
        self.lock_unpoisoned()
            .objects
            .contains_key(&key(ar, namespace, name))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        Ok(self.inner.lock()?)
    }

    fn lock_unpoisoned(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_fault(&self, inner: &Inner, verb: Verb, ar: &ApiResource, namespace: Option<&str>, name: &str) -> Result<()> {
        let fault = inner.faults.iter().find_map(|(rule, fault)| {
            let kind_matches = rule.kind.as_deref().map_or(true, |kind| kind == ar.kind);
            let name_matches = rule.name.as_deref().map_or(true, |n| n == name);
            (rule.verb == verb && kind_matches && name_matches).then_some(*fault)
        });

        match fault {
            None => Ok(()),
            Some(Fault::Forbidden) => Err(Error::Forbidden(format!("{} {name} on {}", ar.kind, self.identity))),
            Some(Fault::Conflict) => Err(Error::Conflict(object_id(&self.identity, ar, namespace, name))),
            Some(Fault::Unavailable) => Err(Error::Anyhow(anyhow::anyhow!("cluster {} is unavailable", self.identity))),
        }
    }

    fn record(&self, inner: &mut Inner, verb: Verb, ar: &ApiResource, namespace: Option<&str>, name: &str) {
        inner.actions.push(WriteAction {
            verb,
            kind: ar.kind.clone(),
            namespace: namespace.map(str::to_owned),
            name: name.to_owned(),
        });
    }

    fn publish(&self, ar: &ApiResource, event: RawEvent) {
        // Nobody watching is fine.
        let _ = self.events.send((kind_key(ar), event));
    }

    fn create_locked(&self, inner: &mut Inner, ar: &ApiResource, object: &DynamicObject) -> Result<DynamicObject> {
        let name = object.try_name()?.to_owned();
        let namespace = object.metadata.namespace.clone();
        let key = key(ar, namespace.as_deref(), &name);
        if inner.objects.contains_key(&key) {
            return Err(Error::AlreadyExists(object_id(&self.identity, ar, namespace.as_deref(), &name)));
        }

        let mut created = object.clone();
        let resource_version = inner.next_resource_version();
        created.types.get_or_insert_with(|| kube::core::TypeMeta {
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
        });
        created.metadata.uid = Some(format!("{}-{resource_version}", self.identity));
        created.metadata.resource_version = Some(resource_version);
        created.metadata.creation_timestamp = Some(Time(Utc::now()));
        created.metadata.deletion_timestamp = None;
        created.metadata.generation = Some(1);

        inner.objects.insert(key, created.clone());
        self.publish(ar, RawEvent::Applied(created.clone()));
        Ok(created)
    }

    /// Stores `updated` in place of `current`, completing a pending deletion once the last
    /// finalizer is gone.
    fn store_locked(&self, inner: &mut Inner, ar: &ApiResource, current: &DynamicObject, mut updated: DynamicObject) -> DynamicObject {
        let key = key(ar, current.metadata.namespace.as_deref(), &current.name_any());

        updated.metadata.resource_version = Some(inner.next_resource_version());
        updated.metadata.uid = current.metadata.uid.clone();
        updated.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
        updated.metadata.deletion_timestamp = current.metadata.deletion_timestamp.clone();
        updated.metadata.generation = current.metadata.generation;
        if updated.data.get("spec") != current.data.get("spec") {
            updated.metadata.generation = Some(current.metadata.generation.unwrap_or_default() + 1);
        }

        if updated.metadata.deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            inner.objects.remove(&key);
            self.publish(ar, RawEvent::Deleted(updated.clone()));
        } else {
            inner.objects.insert(key, updated.clone());
            self.publish(ar, RawEvent::Applied(updated.clone()));
        }
        updated
    }

    fn current(&self, inner: &Inner, ar: &ApiResource, namespace: Option<&str>, name: &str) -> Result<DynamicObject> {
        inner
            .objects
            .get(&key(ar, namespace, name))
            .cloned()
            .ok_or_else(|| Error::NotFound(object_id(&self.identity, ar, namespace, name)))
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn get(&self, ar: &ApiResource, namespace: Option<&str>, name: &str) -> Result<DynamicObject> {
        let inner = self.lock()?;
        self.current(&inner, ar, namespace, name)
    }

    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<DynamicObject>> {
        let kind = kind_key(ar);
        let inner = self.lock()?;
        self.check_fault(&inner, Verb::List, ar, namespace, "")?;
        Ok(inner
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && (namespace.is_none() || ns.as_deref() == namespace))
            .filter(|(_, object)| selector.matches(object.labels()))
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn create(&self, ar: &ApiResource, object: &DynamicObject) -> Result<DynamicObject> {
        let mut inner = self.lock()?;
        let namespace = object.metadata.namespace.as_deref();
        let name = object.try_name()?;
        self.check_fault(&inner, Verb::Create, ar, namespace, name)?;

        let created = self.create_locked(&mut inner, ar, object)?;
        self.record(&mut inner, Verb::Create, ar, namespace, name);
        Ok(created)
    }

    async fn update(&self, ar: &ApiResource, object: &DynamicObject) -> Result<DynamicObject> {
        let mut inner = self.lock()?;
        let namespace = object.metadata.namespace.as_deref();
        let name = object.try_name()?;
        self.check_fault(&inner, Verb::Update, ar, namespace, name)?;

        let current = self.current(&inner, ar, namespace, name)?;
        if object.metadata.resource_version.is_some() && object.metadata.resource_version != current.metadata.resource_version {
            return Err(Error::Conflict(object_id(&self.identity, ar, namespace, name)));
        }

        let mut updated = object.clone();
        match current.data.get("status") {
            Some(status) => updated.data["status"] = status.clone(),
            None => {
                if let Value::Object(data) = &mut updated.data {
                    data.remove("status");
                }
            }
        }

        let stored = self.store_locked(&mut inner, ar, &current, updated);
        self.record(&mut inner, Verb::Update, ar, namespace, name);
        Ok(stored)
    }

    async fn patch_merge(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<DynamicObject> {
        let mut inner = self.lock()?;
        self.check_fault(&inner, Verb::Patch, ar, namespace, name)?;

        let current = self.current(&inner, ar, namespace, name)?;
        let mut patch = patch.clone();
        if let Some(locked) = patch.pointer("/metadata/resourceVersion").and_then(Value::as_str) {
            if Some(locked) != current.metadata.resource_version.as_deref() {
                return Err(Error::Conflict(object_id(&self.identity, ar, namespace, name)));
            }
        }
        if let Some(Value::Object(metadata)) = patch.get_mut("metadata") {
            metadata.remove("resourceVersion");
        }
        if let Value::Object(fields) = &mut patch {
            fields.remove("status");
        }

        let mut merged = serde_json::to_value(&current)?;
        json_patch::merge(&mut merged, &patch);
        let updated: DynamicObject = serde_json::from_value(merged)?;

        let stored = self.store_locked(&mut inner, ar, &current, updated);
        self.record(&mut inner, Verb::Patch, ar, namespace, name);
        Ok(stored)
    }

    async fn patch_status(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        status: &Value,
    ) -> Result<DynamicObject> {
        let mut inner = self.lock()?;
        self.check_fault(&inner, Verb::PatchStatus, ar, namespace, name)?;

        let current = self.current(&inner, ar, namespace, name)?;
        let mut updated = current.clone();
        let mut merged = current.data.get("status").cloned().unwrap_or(Value::Null);
        json_patch::merge(&mut merged, status);
        updated.data["status"] = merged;

        let stored = self.store_locked(&mut inner, ar, &current, updated);
        self.record(&mut inner, Verb::PatchStatus, ar, namespace, name);
        Ok(stored)
    }

    async fn delete(&self, ar: &ApiResource, namespace: Option<&str>, name: &str) -> Result<()> {
        let mut inner = self.lock()?;
        self.check_fault(&inner, Verb::Delete, ar, namespace, name)?;

        let current = self.current(&inner, ar, namespace, name)?;
        if current.finalizers().is_empty() {
            inner.objects.remove(&key(ar, namespace, name));
            self.publish(ar, RawEvent::Deleted(current));
        } else if current.metadata.deletion_timestamp.is_none() {
            let mut deleting = current.clone();
            deleting.metadata.deletion_timestamp = Some(Time(Utc::now()));
            deleting.metadata.resource_version = Some(inner.next_resource_version());
            inner.objects.insert(key(ar, namespace, name), deleting.clone());
            self.publish(ar, RawEvent::Applied(deleting));
        }

        self.record(&mut inner, Verb::Delete, ar, namespace, name);
        Ok(())
    }

    fn watch(&self, ar: &ApiResource) -> BoxStream<'static, RawEvent> {
        let kind = kind_key(ar);
        // Subscribe before taking the snapshot so nothing falls in between.
        let receiver = self.events.subscribe();
        let snapshot: Vec<RawEvent> = std::iter::once(RawEvent::Init)
            .chain(
                self.lock_unpoisoned()
                    .objects
                    .iter()
                    .filter(|((k, _, _), _)| *k == kind)
                    .map(|(_, object)| RawEvent::Applied(object.clone())),
            )
            .chain(std::iter::once(RawEvent::InitDone))
            .collect();

        let live = stream::unfold(receiver, move |mut receiver| {
            let kind = kind.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok((k, event)) if k == kind => return Some((event, receiver)),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Watch consumer lagged behind, events were dropped");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        stream::iter(snapshot).chain(live).boxed()
    }
}

fn kind_key(ar: &ApiResource) -> String {
    format!("{}/{}", ar.group, ar.kind)
}

fn key(ar: &ApiResource, namespace: Option<&str>, name: &str) -> Key {
    (kind_key(ar), namespace.map(str::to_owned), name.to_owned())
}
