//! Adding and removing a controller's finalizer token.
//!
//! Both operations read the latest version of the object and write the new finalizer list
//! with a merge patch conditioned on that version, so tokens owned by other controllers are
//! never lost to a concurrent writer. A stale read turns into a `Conflict` and a requeue.

use kube::ResourceExt;

use crate::error::Error;
use crate::error::FinalizerError;
use crate::error::Result;
use crate::store::Object;
use crate::store::ObjectStore;
use crate::store::TypedStore;
use crate::TryResource;

pub fn has_finalizer<K: Object>(object: &K, finalizer: &str) -> bool {
    object.finalizers().iter().any(|f| f == finalizer)
}

/// Adds `finalizer` to `object` unless it is already present.
pub async fn add<K, S>(store: &S, object: &K, finalizer: &str) -> Result<()>
where
    K: Object,
    S: ObjectStore + ?Sized,
{
    update(store, object, finalizer, |finalizers| {
        if finalizers.iter().any(|f| f == finalizer) {
            false
        } else {
            finalizers.push(finalizer.to_owned());
            true
        }
    })
    .await
    .map_err(|e| FinalizerError::Add(Box::new(e)).into())
}

/// Removes `finalizer` from `object`. An object that is already gone counts as done.
pub async fn remove<K, S>(store: &S, object: &K, finalizer: &str) -> Result<()>
where
    K: Object,
    S: ObjectStore + ?Sized,
{
    update(store, object, finalizer, |finalizers| {
        let before = finalizers.len();
        finalizers.retain(|f| f != finalizer);
        finalizers.len() != before
    })
    .await
    .map_err(|e| FinalizerError::Remove(Box::new(e)).into())
}

async fn update<K, S, F>(store: &S, object: &K, finalizer: &str, change: F) -> Result<()>
where
    K: Object,
    S: ObjectStore + ?Sized,
    F: FnOnce(&mut Vec<String>) -> bool + Send,
{
    if finalizer.is_empty() {
        return Err(FinalizerError::InvalidFinalizer.into());
    }

    let namespace = object.namespace();
    let Some(latest) = store.get_opt::<K>(namespace.as_deref(), object.try_name()?).await? else {
        return Ok(());
    };

    let mut modified = latest.clone();
    if !change(modified.finalizers_mut()) {
        return Ok(());
    }

    match store.patch_typed(&modified, &latest).await {
        Ok(_) => Ok(()),
        Err(Error::NotFound(_)) => Ok(()),
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::Fault;
    use crate::store::memory::MemoryStore;
    use crate::store::memory::Verb;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    const FINALIZER: &str = "kubermatic.k8c.io/cleanup-test";

    fn config_map(finalizers: &[&str]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("c".to_string()),
                namespace: Some("kubermatic".to_string()),
                finalizers: Some(finalizers.iter().map(|f| f.to_string()).collect()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn finalizers(store: &MemoryStore) -> Vec<String> {
        let object: ConfigMap = store.get_typed(Some("kubermatic"), "c").await.unwrap();
        object.finalizers().to_vec()
    }

    #[tokio::test]
    async fn test_add_keeps_foreign_tokens() {
        // Given: An object carrying another controller's finalizer
        let store = MemoryStore::new("seed-a");
        let object = store.insert(&config_map(&["other"])).unwrap();

        // When: Adding ours
        add(&store, &object, FINALIZER).await.unwrap();

        // Then: Both are present
        assert_eq!(finalizers(&store).await, vec!["other".to_string(), FINALIZER.to_string()]);
    }

    #[tokio::test]
    async fn test_add_is_noop_when_present() {
        let store = MemoryStore::new("seed-a");
        let object = store.insert(&config_map(&[FINALIZER])).unwrap();

        add(&store, &object, FINALIZER).await.unwrap();

        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_add_uses_latest_version() {
        // Given: A stale copy of the object
        let store = MemoryStore::new("seed-a");
        let stale = store.insert(&config_map(&[])).unwrap();
        let mut labeled = stale.clone();
        labeled.metadata.labels = Some([("a".to_string(), "b".to_string())].into());
        store.patch_typed(&labeled, &stale).await.unwrap();

        // When: Adding the finalizer from the stale copy
        add(&store, &stale, FINALIZER).await.unwrap();

        // Then: It is added and the label survives
        let current: ConfigMap = store.get_typed(Some("kubermatic"), "c").await.unwrap();
        assert!(has_finalizer(&current, FINALIZER));
        assert_eq!(current.labels()["a"], "b");
    }

    #[tokio::test]
    async fn test_remove_releases_deleted_object() {
        // Given: A deleting object held only by our finalizer
        let store = MemoryStore::new("seed-a");
        let object = store.insert(&config_map(&[FINALIZER])).unwrap();
        store.delete_typed::<ConfigMap>(Some("kubermatic"), "c").await.unwrap();

        // When: Removing the finalizer
        remove(&store, &object, FINALIZER).await.unwrap();

        // Then: The store completes the deletion
        assert_eq!(store.get_opt::<ConfigMap>(Some("kubermatic"), "c").await.unwrap(), None);

        // And: Removing again is fine
        remove(&store, &object, FINALIZER).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_conflict_is_classified() {
        let store = MemoryStore::new("seed-a");
        let object = store.insert(&config_map(&[FINALIZER])).unwrap();
        store.fail_on(Verb::Patch, None, None, Fault::Conflict);

        let error = remove(&store, &object, FINALIZER).await.unwrap_err();

        assert!(matches!(error, Error::Finalizer(FinalizerError::Remove(_))));
        assert!(error.is_conflict());
    }

    #[tokio::test]
    async fn test_empty_finalizer_is_invalid() {
        let store = MemoryStore::new("seed-a");
        let object = store.insert(&config_map(&[])).unwrap();

        let error = add(&store, &object, "").await.unwrap_err();

        assert!(error.to_string().contains("Invalid finalizer"));
    }
}
