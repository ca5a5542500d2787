//! In-memory repository store
//!
//! Objects and references live in maps behind `RwLock`s and are lost when the
//! process exits.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::{ObjectStore, Result, StoreError, check_transition};
use crate::object::{Object, ObjectId};
use crate::reference::{
    self, DEFAULT_BRANCH, HEAD, MAX_SYMREF_DEPTH, RefTarget, Reference,
};

/// In-memory repository
pub struct MemoryStore {
    /// Object storage
    objects: RwLock<HashMap<ObjectId, Object>>,

    /// References by name
    refs: RwLock<BTreeMap<String, Reference>>,
}

impl MemoryStore {
    /// Create an empty repository whose HEAD points at the default branch
    pub fn new() -> Self {
        let mut refs = BTreeMap::new();
        refs.insert(HEAD.to_string(), Reference::symbolic(HEAD, DEFAULT_BRANCH));

        Self {
            objects: RwLock::new(HashMap::new()),
            refs: RwLock::new(refs),
        }
    }

    /// Number of stored objects
    pub async fn object_count(&self) -> usize {
        self.objects.read().await.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve `name` against an already locked reference map
fn resolve_in(refs: &BTreeMap<String, Reference>, name: &str) -> Result<Option<ObjectId>> {
    let mut current = name;
    for _ in 0..MAX_SYMREF_DEPTH {
        match refs.get(current).map(Reference::target) {
            None => return Ok(None),
            Some(RefTarget::Direct(id)) => return Ok(Some(*id)),
            Some(RefTarget::Symbolic(target)) => current = target.as_str(),
        }
    }
    Err(StoreError::SymbolicLoop(name.to_string()))
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn references(&self) -> Result<Vec<Reference>> {
        let refs = self.refs.read().await;
        let mut list: Vec<Reference> = refs.values().cloned().collect();
        reference::sort_for_listing(&mut list);
        Ok(list)
    }

    async fn reference(&self, name: &str) -> Result<Option<Reference>> {
        Ok(self.refs.read().await.get(name).cloned())
    }

    async fn compare_and_set(&self, name: &str, new: ObjectId, expected_old: ObjectId) -> Result<()> {
        reference::validate_name(name)?;

        // The write lock is the per-store CAS arbiter
        let mut refs = self.refs.write().await;
        let current = resolve_in(&refs, name)?;
        check_transition(name, current, expected_old)?;

        if new.is_null() {
            refs.remove(name);
            return Ok(());
        }

        if current.is_none() {
            if let Some(existing) = reference::find_conflict(name, refs.keys().map(String::as_str)) {
                return Err(StoreError::ReferenceConflict {
                    name: name.to_string(),
                    existing,
                });
            }
        }

        refs.insert(name.to_string(), Reference::direct(name, new));
        Ok(())
    }

    async fn object(&self, id: ObjectId) -> Result<Object> {
        self.objects
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::ObjectNotFound(id))
    }

    async fn has_object(&self, id: ObjectId) -> Result<bool> {
        Ok(self.objects.read().await.contains_key(&id))
    }

    async fn put_object(&self, object: Object) -> Result<ObjectId> {
        let id = object.id();
        self.objects.write().await.entry(id).or_insert(object);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(seed: &[u8]) -> ObjectId {
        ObjectId::from_data(seed)
    }

    #[tokio::test]
    async fn test_new_store_has_unresolvable_head() {
        let store = MemoryStore::new();
        let refs = store.references().await.unwrap();
        assert_eq!(refs.len(), 1);
        assert!(refs[0].is_symbolic());
        assert_eq!(store.resolve(HEAD).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_create_update_delete() {
        let store = MemoryStore::new();
        let (a, b) = (id(b"a"), id(b"b"));

        store
            .compare_and_set("refs/heads/master", a, ObjectId::null())
            .await
            .unwrap();
        assert_eq!(store.resolve(HEAD).await.unwrap(), Some(a));

        store.compare_and_set("refs/heads/master", b, a).await.unwrap();
        assert_eq!(store.resolve("refs/heads/master").await.unwrap(), Some(b));

        store
            .compare_and_set("refs/heads/master", ObjectId::null(), b)
            .await
            .unwrap();
        assert!(store.reference("refs/heads/master").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_old_value_is_rejected() {
        let store = MemoryStore::new();
        let (a, b, c) = (id(b"a"), id(b"b"), id(b"c"));
        store
            .compare_and_set("refs/heads/topic", a, ObjectId::null())
            .await
            .unwrap();

        let err = store
            .compare_and_set("refs/heads/topic", c, b)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ReferenceChanged { .. }));
        assert_eq!(store.resolve("refs/heads/topic").await.unwrap(), Some(a));

        let err = store
            .compare_and_set("refs/heads/topic", c, ObjectId::null())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ReferenceExists(_)));
    }

    #[tokio::test]
    async fn test_directory_file_conflict() {
        let store = MemoryStore::new();
        store
            .compare_and_set("refs/heads/a", id(b"a"), ObjectId::null())
            .await
            .unwrap();
        let err = store
            .compare_and_set("refs/heads/a/b", id(b"b"), ObjectId::null())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ReferenceConflict { .. }));
    }

    #[tokio::test]
    async fn test_invalid_name_is_rejected() {
        let store = MemoryStore::new();
        let err = store
            .compare_and_set("HEAD", id(b"a"), ObjectId::null())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidReferenceName { .. }));
    }

    #[tokio::test]
    async fn test_objects_are_deduplicated() {
        let store = MemoryStore::new();
        let blob = Object::blob(&b"same"[..]);
        let first = store.put_object(blob.clone()).await.unwrap();
        let second = store.put_object(blob.clone()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.object_count().await, 1);
        assert_eq!(store.object(first).await.unwrap(), blob);
        assert!(matches!(
            store.object(id(b"missing")).await,
            Err(StoreError::ObjectNotFound(_))
        ));
    }
}
