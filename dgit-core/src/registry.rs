//! Repository id to store mapping
//!
//! A registry creates the store for a repository id on first lookup and hands
//! out the same instance for the rest of the process lifetime.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::store::{FilesystemStore, MemoryStore, ObjectStore};
use crate::store::filesystem::DEFAULT_CACHE_SIZE;

/// Lookup of repository stores by id
pub trait StoreRegistry: Send + Sync {
    /// The store for `id`, created on first access
    ///
    /// Concurrent first lookups of one id all get the same instance.
    fn get_store(&self, id: &str) -> Option<Arc<dyn ObjectStore>>;
}

type StoreMap = Mutex<HashMap<String, Arc<dyn ObjectStore>>>;

fn lock(stores: &StoreMap) -> MutexGuard<'_, HashMap<String, Arc<dyn ObjectStore>>> {
    stores.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of in-memory repositories; every id resolves
#[derive(Default)]
pub struct MemoryRegistry {
    stores: StoreMap,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of repositories created so far
    pub fn len(&self) -> usize {
        lock(&self.stores).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StoreRegistry for MemoryRegistry {
    fn get_store(&self, id: &str) -> Option<Arc<dyn ObjectStore>> {
        let mut stores = lock(&self.stores);
        let store = stores
            .entry(id.to_string())
            .or_insert_with(|| -> Arc<dyn ObjectStore> {
                tracing::info!("Created in-memory repository '{}'", id);
                Arc::new(MemoryStore::new())
            });
        Some(Arc::clone(store))
    }
}

/// Registry of bare repositories under a data directory
///
/// Only ids naming an existing directory resolve; the registry never creates
/// repositories.
pub struct FilesystemRegistry {
    data_dir: PathBuf,
    cache_size: usize,
    stores: StoreMap,
}

impl FilesystemRegistry {
    pub fn new(data_dir: impl Into<PathBuf>, cache_size: usize) -> Self {
        Self {
            data_dir: data_dir.into(),
            cache_size,
            stores: StoreMap::default(),
        }
    }

    pub fn with_default_cache(data_dir: impl Into<PathBuf>) -> Self {
        Self::new(data_dir, DEFAULT_CACHE_SIZE)
    }

    pub fn len(&self) -> usize {
        lock(&self.stores).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Directory for `id`, if the id is a plain relative path
    fn repository_path(&self, id: &str) -> Option<PathBuf> {
        let relative = Path::new(id);
        if id.is_empty()
            || !relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)))
        {
            return None;
        }
        Some(self.data_dir.join(relative))
    }
}

impl StoreRegistry for FilesystemRegistry {
    fn get_store(&self, id: &str) -> Option<Arc<dyn ObjectStore>> {
        let path = self.repository_path(id)?;

        let mut stores = lock(&self.stores);
        if let Some(store) = stores.get(id) {
            return Some(Arc::clone(store));
        }
        if !path.is_dir() {
            tracing::debug!("No repository at {}", path.display());
            return None;
        }

        tracing::info!("Opened repository '{}' at {}", id, path.display());
        let store: Arc<dyn ObjectStore> = Arc::new(FilesystemStore::open(path, self.cache_size));
        stores.insert(id.to_string(), Arc::clone(&store));
        Some(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::init_bare_repository;
    use tempfile::TempDir;

    #[test]
    fn test_memory_registry_reuses_store() {
        let registry = MemoryRegistry::new();
        let first = registry.get_store("project.git").unwrap();
        let second = registry.get_store("project.git").unwrap();
        let other = registry.get_store("other.git").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_filesystem_registry_requires_directory() {
        let dir = TempDir::new().unwrap();
        let registry = FilesystemRegistry::with_default_cache(dir.path());

        assert!(registry.get_store("repo.git").is_none());
        assert!(registry.is_empty());

        init_bare_repository(&dir.path().join("repo.git")).unwrap();
        let first = registry.get_store("repo.git").unwrap();
        let second = registry.get_store("repo.git").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_filesystem_registry_rejects_escaping_ids() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("inner")).unwrap();
        let registry = FilesystemRegistry::with_default_cache(dir.path().join("inner"));

        for id in ["", "..", "../inner", "/etc", "a/../..", "./repo"] {
            assert!(registry.get_store(id).is_none(), "{:?}", id);
        }
    }

    #[test]
    fn test_nested_ids() {
        let dir = TempDir::new().unwrap();
        init_bare_repository(&dir.path().join("group/repo.git")).unwrap();
        let registry = FilesystemRegistry::with_default_cache(dir.path());
        assert!(registry.get_store("group/repo.git").is_some());
    }
}
