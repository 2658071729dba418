//! Capability-typed access to the objects of one Kubernetes cluster.
//!
//! Every target (the master, a seed, a user cluster) is represented by an [ObjectStore].
//! The trait speaks [DynamicObject] so that stores of different clusters can live side by
//! side in one [crate::target::TargetTable]; [TypedStore] layers typed access on top.
//!
//! Expected steady-state outcomes are reported as classified errors: `NotFound` on get and
//! `AlreadyExists` on create are not failures for a converging caller, see
//! [crate::error::Error::is_not_found] and [crate::error::Error::is_already_exists].

pub mod client;
pub mod memory;
pub mod selector;

pub use selector::LabelSelector;

use std::fmt;
use std::fmt::Debug;

use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::api::ApiResource;
use kube::api::DynamicObject;
use kube::Resource;
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::error::Result;
use crate::TryResource;

/// Typed objects the engine can move through an [ObjectStore].
pub trait Object: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {}

impl<K> Object for K where K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static
{}

/// Identity of a single object in a single cluster, used in errors and logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectId {
    pub target: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectId {
    pub fn new(target: impl Into<String>, kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            kind: kind.into(),
            namespace: namespace.map(str::to_owned),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{} {}/{} on {}", self.kind, namespace, self.name, self.target),
            None => write!(f, "{} {} on {}", self.kind, self.name, self.target),
        }
    }
}

/// A change observed on a store, carrying the object as last seen.
///
/// Every (re)list of the store is framed by `Init` and `InitDone`: objects that existed
/// before `Init` and were not applied again before `InitDone` are gone.
#[derive(Debug, Clone)]
pub enum RawEvent {
    Init,
    Applied(DynamicObject),
    Deleted(DynamicObject),
    InitDone,
}

/// The object-store contract of a single target cluster.
///
/// Implementations must be safe for concurrent use; the engine shares one store across all
/// workers of all controllers.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Identity of the cluster behind this store, e.g. `master` or the seed name.
    fn identity(&self) -> &str;

    async fn get(&self, ar: &ApiResource, namespace: Option<&str>, name: &str) -> Result<DynamicObject>;

    async fn list(&self, ar: &ApiResource, namespace: Option<&str>, selector: &LabelSelector)
        -> Result<Vec<DynamicObject>>;

    async fn create(&self, ar: &ApiResource, object: &DynamicObject) -> Result<DynamicObject>;

    /// Replaces the object. The write is conditioned on `metadata.resourceVersion`.
    async fn update(&self, ar: &ApiResource, object: &DynamicObject) -> Result<DynamicObject>;

    /// Applies a raw JSON merge patch. A `metadata.resourceVersion` in the patch conditions
    /// the write on it.
    async fn patch_merge(&self, ar: &ApiResource, namespace: Option<&str>, name: &str, patch: &Value)
        -> Result<DynamicObject>;

    /// Merges `status` into the status subresource.
    async fn patch_status(&self, ar: &ApiResource, namespace: Option<&str>, name: &str, status: &Value)
        -> Result<DynamicObject>;

    /// Requests deletion. Objects carrying finalizers only get a deletion timestamp.
    async fn delete(&self, ar: &ApiResource, namespace: Option<&str>, name: &str) -> Result<()>;

    /// Streams changes of one kind, beginning with the objects that already exist.
    fn watch(&self, ar: &ApiResource) -> BoxStream<'static, RawEvent>;

    /// Patches `modified` against `baseline` with a merge patch, conditioned on the
    /// baseline's resourceVersion so a concurrent writer turns this into a `Conflict`.
    async fn patch(&self, ar: &ApiResource, modified: &DynamicObject, baseline: &DynamicObject) -> Result<DynamicObject> {
        let mut patch = merge_diff(&serde_json::to_value(baseline)?, &serde_json::to_value(modified)?);
        if let Some(resource_version) = baseline.resource_version() {
            lock_resource_version(&mut patch, resource_version);
        }

        let namespace = baseline.namespace();
        self.patch_merge(ar, namespace.as_deref(), baseline.try_name()?, &patch).await
    }
}

/// Typed access on top of any [ObjectStore].
#[async_trait]
pub trait TypedStore: ObjectStore {
    async fn get_typed<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<K> {
        from_dynamic(self.get(&api_resource::<K>(), namespace, name).await?)
    }

    /// Like [TypedStore::get_typed], turning `NotFound` into `None`.
    async fn get_opt<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        match self.get_typed(namespace, name).await {
            Ok(object) => Ok(Some(object)),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn list_typed<K: Object>(&self, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<K>> {
        self.list(&api_resource::<K>(), namespace, selector)
            .await?
            .into_iter()
            .map(from_dynamic)
            .collect()
    }

    async fn create_typed<K: Object>(&self, object: &K) -> Result<K> {
        from_dynamic(self.create(&api_resource::<K>(), &to_dynamic(object)?).await?)
    }

    async fn patch_typed<K: Object>(&self, modified: &K, baseline: &K) -> Result<K> {
        let modified = to_dynamic(modified)?;
        let baseline = to_dynamic(baseline)?;
        from_dynamic(self.patch(&api_resource::<K>(), &modified, &baseline).await?)
    }

    async fn patch_status_typed<K: Object, S: Serialize + Send + Sync>(&self, object: &K, status: &S) -> Result<K> {
        let namespace = object.namespace();
        let status = serde_json::to_value(status)?;
        from_dynamic(
            self.patch_status(&api_resource::<K>(), namespace.as_deref(), object.try_name()?, &status)
                .await?,
        )
    }

    async fn delete_typed<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        self.delete(&api_resource::<K>(), namespace, name).await
    }
}

impl<S> TypedStore for S where S: ObjectStore + ?Sized {}

pub fn api_resource<K: Object>() -> ApiResource {
    ApiResource::erase::<K>(&())
}

pub fn to_dynamic<K: Object>(object: &K) -> Result<DynamicObject> {
    let mut dynamic: DynamicObject = serde_json::from_value(serde_json::to_value(object)?)?;
    if dynamic.types.is_none() {
        dynamic.types = Some(kube::core::TypeMeta {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
        });
    }
    Ok(dynamic)
}

pub fn from_dynamic<K: Object>(object: DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

/// Object id of `object` on `target`, for errors and logs.
pub fn object_id(target: &str, ar: &ApiResource, namespace: Option<&str>, name: &str) -> ObjectId {
    ObjectId::new(target, ar.kind.as_str(), namespace, name)
}

/// Computes an RFC 7386 merge patch turning `original` into `modified`.
pub fn merge_diff(original: &Value, modified: &Value) -> Value {
    match (original, modified) {
        (Value::Object(original), Value::Object(modified)) => {
            let mut patch = Map::new();
            for (key, old) in original {
                match modified.get(key) {
                    None => {
                        patch.insert(key.clone(), Value::Null);
                    }
                    Some(new) if new != old => {
                        patch.insert(key.clone(), merge_diff(old, new));
                    }
                    Some(_) => {}
                }
            }
            for (key, new) in modified {
                if !original.contains_key(key) {
                    patch.insert(key.clone(), new.clone());
                }
            }
            Value::Object(patch)
        }
        _ => modified.clone(),
    }
}

fn lock_resource_version(patch: &mut Value, resource_version: String) {
    if let Value::Object(patch) = patch {
        let metadata = patch
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(metadata) = metadata {
            metadata.insert("resourceVersion".to_owned(), Value::String(resource_version));
        }
    }
}
