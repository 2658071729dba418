//! Converging child objects: get or create, then patch only the fields the controller owns.

use std::collections::BTreeMap;

use kube::api::ObjectMeta;
use kube::ResourceExt;

use crate::error::Result;
use crate::store::Object;
use crate::store::ObjectStore;
use crate::store::TypedStore;
use crate::TryResource;

/// Label marking objects written by one of our controllers.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// What [converge] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Patched,
    Unchanged,
}

/// Makes the object named like `desired` exist with `desired`'s owned fields.
///
/// `merge_owned(existing, desired)` copies the controller-owned fields from `desired` onto
/// the existing object in place; everything it leaves alone is preserved. No write happens
/// when that leaves the object unchanged.
pub async fn converge<K, S, F>(store: &S, desired: &K, merge_owned: F) -> Result<Outcome>
where
    K: Object + PartialEq,
    S: ObjectStore + ?Sized,
    F: Fn(&mut K, &K) + Send + Sync,
{
    let namespace = desired.namespace();
    let name = desired.try_name()?;

    let existing = match store.get_opt::<K>(namespace.as_deref(), name).await? {
        Some(existing) => existing,
        None => match store.create_typed(desired).await {
            Ok(_) => return Ok(Outcome::Created),
            // Somebody else created it between our get and create; verify what they wrote.
            Err(error) if error.is_already_exists() => store.get_typed::<K>(namespace.as_deref(), name).await?,
            Err(error) => return Err(error),
        },
    };

    let mut modified = existing.clone();
    merge_owned(&mut modified, desired);
    if modified == existing {
        return Ok(Outcome::Unchanged);
    }

    store.patch_typed(&modified, &existing).await?;
    Ok(Outcome::Patched)
}

/// Deletes an object, treating an absent one as deleted. Returns whether it existed.
pub async fn delete_if_exists<K, S>(store: &S, namespace: Option<&str>, name: &str) -> Result<bool>
where
    K: Object,
    S: ObjectStore + ?Sized,
{
    match store.delete_typed::<K>(namespace, name).await {
        Ok(()) => Ok(true),
        Err(error) if error.is_not_found() => Ok(false),
        Err(error) => Err(error),
    }
}

/// Copies the desired labels and annotations onto `existing`, keeping any others.
pub fn merge_metadata(existing: &mut ObjectMeta, desired: &ObjectMeta) {
    merge_map(&mut existing.labels, desired.labels.as_ref());
    merge_map(&mut existing.annotations, desired.annotations.as_ref());
}

fn merge_map(existing: &mut Option<BTreeMap<String, String>>, desired: Option<&BTreeMap<String, String>>) {
    let Some(desired) = desired.filter(|desired| !desired.is_empty()) else {
        return;
    };

    let existing = existing.get_or_insert_with(BTreeMap::new);
    for (key, value) in desired {
        existing.insert(key.clone(), value.clone());
    }
}

/// Labels every object written by the controller named `controller` carries.
pub fn managed_labels(controller: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_BY_LABEL.to_owned(), controller.to_owned())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::Fault;
    use crate::store::memory::MemoryStore;
    use crate::store::memory::Verb;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::ByteString;

    fn desired(value: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("usersshkeys".to_string()),
                namespace: Some("cluster-abc".to_string()),
                labels: Some(managed_labels("test-controller")),
                ..Default::default()
            },
            data: Some([("key".to_string(), ByteString(value.as_bytes().to_vec()))].into()),
            ..Default::default()
        }
    }

    fn merge_secret(existing: &mut Secret, desired: &Secret) {
        merge_metadata(&mut existing.metadata, &desired.metadata);
        existing.data = desired.data.clone();
    }

    #[tokio::test]
    async fn test_converge_creates_missing_object() {
        let store = MemoryStore::new("seed-a");

        let outcome = converge(&store, &desired("a"), merge_secret).await.unwrap();

        assert_eq!(outcome, Outcome::Created);
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn test_second_converge_writes_nothing() {
        // Given: An already converged object
        let store = MemoryStore::new("seed-a");
        converge(&store, &desired("a"), merge_secret).await.unwrap();
        store.clear_actions();

        // When: Converging the same desired state again
        let outcome = converge(&store, &desired("a"), merge_secret).await.unwrap();

        // Then: No write call is made
        assert_eq!(outcome, Outcome::Unchanged);
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_converge_preserves_fields_it_does_not_own() {
        // Given: An existing secret with a label set by someone else
        let store = MemoryStore::new("seed-a");
        let mut existing = desired("old");
        existing.metadata.labels = Some([("team".to_string(), "infra".to_string())].into());
        store.insert(&existing).unwrap();

        // When: Converging new data
        let outcome = converge(&store, &desired("new"), merge_secret).await.unwrap();

        // Then: Data is patched and the foreign label kept
        assert_eq!(outcome, Outcome::Patched);
        let current: Secret = store.get_typed(Some("cluster-abc"), "usersshkeys").await.unwrap();
        assert_eq!(current.labels()["team"], "infra");
        assert_eq!(current.labels()[MANAGED_BY_LABEL], "test-controller");
        assert_eq!(current.data.unwrap()["key"], ByteString(b"new".to_vec()));
    }

    #[tokio::test]
    async fn test_converge_surfaces_write_failures() {
        let store = MemoryStore::new("seed-b");
        store.fail_writes(Fault::Forbidden);

        let error = converge(&store, &desired("a"), merge_secret).await.unwrap_err();

        assert!(error.to_string().contains("Forbidden"));
    }

    #[tokio::test]
    async fn test_delete_if_exists_tolerates_absence() {
        let store = MemoryStore::new("seed-a");
        store.insert(&desired("a")).unwrap();

        assert!(delete_if_exists::<Secret, _>(&store, Some("cluster-abc"), "usersshkeys").await.unwrap());
        assert!(!delete_if_exists::<Secret, _>(&store, Some("cluster-abc"), "usersshkeys").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_if_exists_propagates_other_errors() {
        let store = MemoryStore::new("seed-a");
        store.insert(&desired("a")).unwrap();
        store.fail_on(Verb::Delete, Some("Secret"), None, Fault::Unavailable);

        assert!(delete_if_exists::<Secret, _>(&store, Some("cluster-abc"), "usersshkeys").await.is_err());
    }
}
