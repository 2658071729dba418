//! [ObjectStore] backed by a real Kubernetes API server.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::ApiResource;
use kube::api::DeleteParams;
use kube::api::DynamicObject;
use kube::api::ListParams;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::api::PostParams;
use kube::runtime::watcher;
use kube::runtime::WatchStreamExt;
use kube::Api;
use kube::Client;
use serde_json::json;
use serde_json::Value;

use crate::error::Error;
use crate::error::Result;
use crate::store::object_id;
use crate::store::LabelSelector;
use crate::store::ObjectStore;
use crate::store::RawEvent;
use crate::TryResource;

type ApiKey = (String, Option<String>);

/// Caches [Arc<Api>] instances per kind and namespace to avoid repeatedly creating them.
///
/// Cache hits only take a read lock and bump a reference count; misses take the write lock
/// once per kind and namespace.
struct ApiCache {
    client: Client,
    cache: RwLock<HashMap<ApiKey, Arc<Api<DynamicObject>>>>,
}

impl ApiCache {
    fn new(client: Client) -> Self {
        Self {
            client,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, ar: &ApiResource, namespace: Option<&str>) -> Result<Arc<Api<DynamicObject>>> {
        let key = (format!("{}/{}", ar.api_version, ar.plural), namespace.map(str::to_owned));

        // Fast path: try to get from cache with read lock
        {
            let cache = self.cache.read()?;
            if let Some(api) = cache.get(&key) {
                return Ok(Arc::clone(api));
            }
        }

        let mut cache = self.cache.write()?;

        // Another worker may have created it while we waited for the write lock
        if let Some(api) = cache.get(&key) {
            return Ok(Arc::clone(api));
        }

        let api = Arc::new(match namespace {
            Some(namespace) => Api::namespaced_with(self.client.clone(), namespace, ar),
            None => Api::all_with(self.client.clone(), ar),
        });
        cache.insert(key, Arc::clone(&api));

        Ok(api)
    }
}

/// An [ObjectStore] talking to the API server of one cluster through `kube-rs`.
pub struct KubeStore {
    identity: String,
    client: Client,
    apis: ApiCache,
}

impl KubeStore {
    pub fn new(identity: impl Into<String>, client: Client) -> Self {
        Self {
            identity: identity.into(),
            apis: ApiCache::new(client.clone()),
            client,
        }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn api(&self, ar: &ApiResource, namespace: Option<&str>) -> Result<Arc<Api<DynamicObject>>> {
        self.apis.get(ar, namespace)
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn get(&self, ar: &ApiResource, namespace: Option<&str>, name: &str) -> Result<DynamicObject> {
        self.api(ar, namespace)?
            .get(name)
            .await
            .map_err(|e| Error::classify(e, object_id(&self.identity, ar, namespace, name)))
    }

    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<DynamicObject>> {
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector.to_string());
        }

        let list = self.api(ar, namespace)?.list(&params).await?;
        Ok(list.items)
    }

    async fn create(&self, ar: &ApiResource, object: &DynamicObject) -> Result<DynamicObject> {
        let namespace = object.metadata.namespace.as_deref();
        self.api(ar, namespace)?
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| Error::classify(e, object_id(&self.identity, ar, namespace, object.try_name().unwrap_or_default())))
    }

    async fn update(&self, ar: &ApiResource, object: &DynamicObject) -> Result<DynamicObject> {
        let namespace = object.metadata.namespace.as_deref();
        let name = object.try_name()?;
        self.api(ar, namespace)?
            .replace(name, &PostParams::default(), object)
            .await
            .map_err(|e| Error::classify(e, object_id(&self.identity, ar, namespace, name)))
    }

    #[tracing::instrument(skip(self, ar, patch), fields(cluster = %self.identity, kind = %ar.kind))]
    async fn patch_merge(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<DynamicObject> {
        self.api(ar, namespace)?
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| Error::classify(e, object_id(&self.identity, ar, namespace, name)))
    }

    async fn patch_status(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        status: &Value,
    ) -> Result<DynamicObject> {
        let patch = json!({ "status": status });
        self.api(ar, namespace)?
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::classify(e, object_id(&self.identity, ar, namespace, name)))
    }

    async fn delete(&self, ar: &ApiResource, namespace: Option<&str>, name: &str) -> Result<()> {
        self.api(ar, namespace)?
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| Error::classify(e, object_id(&self.identity, ar, namespace, name)))
    }

    fn watch(&self, ar: &ApiResource) -> BoxStream<'static, RawEvent> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), ar);
        let identity = self.identity.clone();
        let kind = ar.kind.clone();

        watcher(api, watcher::Config::default())
            .default_backoff()
            .filter_map(move |event| {
                let identity = identity.clone();
                let kind = kind.clone();
                async move {
                    match event {
                        Ok(watcher::Event::Apply(object) | watcher::Event::InitApply(object)) => {
                            Some(RawEvent::Applied(object))
                        }
                        Ok(watcher::Event::Delete(object)) => Some(RawEvent::Deleted(object)),
                        Ok(watcher::Event::Init) => Some(RawEvent::Init),
                        Ok(watcher::Event::InitDone) => Some(RawEvent::InitDone),
                        Err(error) => {
                            tracing::warn!(cluster = %identity, kind = %kind, error = %error, "Watch failed, backing off");
                            None
                        }
                    }
                }
            })
            .boxed()
    }
}
