//! Bare repository on the local filesystem
//!
//! Uses the standard git layout so repositories can also be inspected with
//! regular git tooling:
//!
//! - `objects/xx/yyyy...` zlib-compressed loose objects
//! - `refs/...` one file per reference, `packed-refs` for packed ones
//! - `HEAD` either `ref: <name>` or a hex id
//!
//! Decoded objects are kept in a bounded LRU cache.

use async_trait::async_trait;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use lru::LruCache;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use super::{ObjectStore, Result, StoreError, check_transition};
use crate::object::{Object, ObjectId};
use crate::reference::{self, DEFAULT_BRANCH, HEAD, Reference};

/// Default number of decoded objects kept in memory per repository
pub const DEFAULT_CACHE_SIZE: usize = 4096;

const PACKED_REFS: &str = "packed-refs";
const SYMREF_PREFIX: &str = "ref: ";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Create the directory skeleton of an empty bare repository
///
/// Existing files are left untouched.
pub fn init_bare_repository(path: &Path) -> io::Result<()> {
    for dir in ["objects/info", "objects/pack", "refs/heads", "refs/tags"] {
        fs::create_dir_all(path.join(dir))?;
    }

    let head = path.join(HEAD);
    if !head.exists() {
        fs::write(&head, format!("{}{}\n", SYMREF_PREFIX, DEFAULT_BRANCH))?;
    }

    let config = path.join("config");
    if !config.exists() {
        fs::write(
            &config,
            "[core]\n\trepositoryformatversion = 0\n\tfilemode = true\n\tbare = true\n",
        )?;
    }
    Ok(())
}

/// Filesystem-backed repository store
pub struct FilesystemStore {
    /// Repository root (the bare repository directory)
    root: PathBuf,

    /// Recently decoded objects
    cache: Mutex<LruCache<ObjectId, Object>>,
}

impl FilesystemStore {
    /// Open the repository at `root` with an object cache of `cache_size`
    /// entries. No I/O happens until the store is used.
    pub fn open(root: impl Into<PathBuf>, cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_size)
            .or(NonZeroUsize::new(DEFAULT_CACHE_SIZE))
            .unwrap_or(NonZeroUsize::MIN);

        Self {
            root: root.into(),
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Number of objects currently held by the cache
    pub fn cached_objects(&self) -> usize {
        self.cache_lock().len()
    }

    fn cache_lock(&self) -> std::sync::MutexGuard<'_, LruCache<ObjectId, Object>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn object_path(&self, id: ObjectId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join("objects").join(&hex[..2]).join(&hex[2..])
    }

    fn ref_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Read a reference stored as its own file
    fn read_loose_ref(&self, name: &str) -> Result<Option<Reference>> {
        let content = match fs::read_to_string(self.ref_path(name)) {
            Ok(content) => content,
            Err(e) if is_missing(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let value = content.trim();
        if let Some(target) = value.strip_prefix(SYMREF_PREFIX) {
            return Ok(Some(Reference::symbolic(name, target.trim())));
        }
        let id = ObjectId::from_hex(value).map_err(|e| StoreError::CorruptReference {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(Reference::direct(name, id)))
    }

    /// Entries of `packed-refs`, in file order
    fn read_packed_refs(&self) -> Result<Vec<Reference>> {
        let content = match fs::read_to_string(self.root.join(PACKED_REFS)) {
            Ok(content) => content,
            Err(e) if is_missing(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut refs = Vec::new();
        for line in content.lines() {
            // Header comments and peeled tag lines
            if line.is_empty() || line.starts_with('#') || line.starts_with('^') {
                continue;
            }
            let corrupt = || StoreError::CorruptReference {
                name: PACKED_REFS.to_string(),
                reason: format!("bad line '{}'", line),
            };
            let (hex, name) = line.split_once(' ').ok_or_else(corrupt)?;
            let id = ObjectId::from_hex(hex).map_err(|_| corrupt())?;
            refs.push(Reference::direct(name.trim(), id));
        }
        Ok(refs)
    }

    /// Collect every loose reference below `dir`
    fn collect_loose_refs(&self, dir: &Path, prefix: &str, out: &mut Vec<Reference>) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if is_missing(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let name = format!("{}/{}", prefix, file_name);

            if entry.file_type()?.is_dir() {
                self.collect_loose_refs(&entry.path(), &name, out)?;
            } else if !file_name.ends_with(".lock") {
                if let Some(reference) = self.read_loose_ref(&name)? {
                    out.push(reference);
                }
            }
        }
        Ok(())
    }

    /// Existing reference that `name` would collide with on disk
    fn find_conflict(&self, name: &str) -> Result<Option<String>> {
        // A file at any ancestor path
        let mut ancestor = name;
        while let Some((parent, _)) = ancestor.rsplit_once('/') {
            if parent == "refs" {
                break;
            }
            if self.ref_path(parent).is_file() {
                return Ok(Some(parent.to_string()));
            }
            ancestor = parent;
        }

        // A directory holding references where the file should go
        let path = self.ref_path(name);
        if path.is_dir() {
            let mut nested = Vec::new();
            self.collect_loose_refs(&path, name, &mut nested)?;
            if let Some(first) = nested.first() {
                return Ok(Some(first.name().to_string()));
            }
            // Leftover empty directories from deleted references. Only empty
            // ones go; a lock taken meanwhile makes the removal fail.
            if let Some(blocker) = remove_empty_dirs(&path, name)? {
                return Ok(Some(blocker));
            }
        }

        let packed = self.read_packed_refs()?;
        Ok(reference::find_conflict(name, packed.iter().map(Reference::name)))
    }

    /// Rewrite `packed-refs` without `name`
    fn remove_packed_ref(&self, name: &str) -> Result<()> {
        let packed = self.read_packed_refs()?;
        if !packed.iter().any(|r| r.name() == name) {
            return Ok(());
        }

        let lock = LockFile::acquire(&self.root.join(PACKED_REFS))
            .map_err(|_| StoreError::ReferenceLocked(name.to_string()))?;
        let mut content = String::from("# pack-refs with: peeled\n");
        for reference in packed.iter().filter(|r| r.name() != name) {
            if let Some(id) = reference.id() {
                content.push_str(&format!("{} {}\n", id, reference.name()));
            }
        }
        lock.commit(content.as_bytes())?;
        Ok(())
    }

    /// Remove now-empty directories left by a deleted reference, keeping
    /// the top level namespaces such as `refs/heads`
    fn prune_empty_parents(&self, name: &str) {
        let mut current = name;
        while let Some((parent, _)) = current.rsplit_once('/') {
            if parent.matches('/').count() < 2 {
                break;
            }
            // Fails (and stops) on the first non-empty directory
            if fs::remove_dir(self.ref_path(parent)).is_err() {
                break;
            }
            current = parent;
        }
    }

    fn read_object(&self, id: ObjectId) -> Result<Object> {
        let file = match File::open(self.object_path(id)) {
            Ok(file) => file,
            Err(e) if is_missing(&e) => return Err(StoreError::ObjectNotFound(id)),
            Err(e) => return Err(e.into()),
        };

        let mut raw = Vec::new();
        ZlibDecoder::new(file).read_to_end(&mut raw)?;
        Object::from_loose(&raw).map_err(|source| StoreError::CorruptObject { id, source })
    }

    fn write_object(&self, id: ObjectId, object: &Object) -> Result<()> {
        let path = self.object_path(id);
        if path.exists() {
            return Ok(());
        }
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;

        let temp = dir.join(format!(
            "tmp_obj_{}_{}",
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let result = (|| -> io::Result<()> {
            let mut encoder = ZlibEncoder::new(File::create(&temp)?, Compression::default());
            encoder.write_all(&object.to_loose())?;
            encoder.finish()?.sync_all()?;
            fs::rename(&temp, &path)
        })();

        if result.is_err() {
            let _ = fs::remove_file(&temp);
        }
        result.map_err(StoreError::from)
    }
}

#[async_trait]
impl ObjectStore for FilesystemStore {
    async fn references(&self) -> Result<Vec<Reference>> {
        let mut refs = Vec::new();
        if let Some(head) = self.read_loose_ref(HEAD)? {
            refs.push(head);
        }
        self.collect_loose_refs(&self.root.join("refs"), "refs", &mut refs)?;

        // Loose files take precedence over packed entries
        for packed in self.read_packed_refs()? {
            if !refs.iter().any(|r| r.name() == packed.name()) {
                refs.push(packed);
            }
        }

        reference::sort_for_listing(&mut refs);
        Ok(refs)
    }

    async fn reference(&self, name: &str) -> Result<Option<Reference>> {
        if name != HEAD && reference::validate_name(name).is_err() {
            return Ok(None);
        }
        if let Some(loose) = self.read_loose_ref(name)? {
            return Ok(Some(loose));
        }
        Ok(self
            .read_packed_refs()?
            .into_iter()
            .find(|r| r.name() == name))
    }

    async fn compare_and_set(&self, name: &str, new: ObjectId, expected_old: ObjectId) -> Result<()> {
        reference::validate_name(name)?;

        if !new.is_null() {
            if let Some(existing) = self.find_conflict(name)? {
                return Err(StoreError::ReferenceConflict {
                    name: name.to_string(),
                    existing,
                });
            }
        }

        let path = self.ref_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // The lock file is held until commit or drop
        let lock = LockFile::acquire(&path).map_err(|e| {
            tracing::debug!("Failed to lock {}: {}", name, e);
            StoreError::ReferenceLocked(name.to_string())
        })?;

        let current = self.resolve(name).await?;
        check_transition(name, current, expected_old)?;

        if new.is_null() {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if is_missing(&e) => {}
                Err(e) => return Err(e.into()),
            }
            self.remove_packed_ref(name)?;
            drop(lock);
            self.prune_empty_parents(name);
            return Ok(());
        }

        lock.commit(format!("{}\n", new).as_bytes())?;
        Ok(())
    }

    async fn object(&self, id: ObjectId) -> Result<Object> {
        if let Some(object) = self.cache_lock().get(&id) {
            return Ok(object.clone());
        }

        let object = self.read_object(id)?;
        self.cache_lock().put(id, object.clone());
        Ok(object)
    }

    async fn has_object(&self, id: ObjectId) -> Result<bool> {
        if self.cache_lock().contains(&id) {
            return Ok(true);
        }
        Ok(self.object_path(id).is_file())
    }

    async fn put_object(&self, object: Object) -> Result<ObjectId> {
        let id = object.id();
        self.write_object(id, &object)?;
        self.cache_lock().put(id, object);
        Ok(id)
    }
}

/// A `<path>.lock` file created exclusively
///
/// Committing renames it over `<path>`; dropping it uncommitted removes it.
struct LockFile {
    lock_path: PathBuf,
    target: PathBuf,
    file: File,
    committed: bool,
}

impl LockFile {
    fn acquire(target: &Path) -> io::Result<Self> {
        let mut lock_name = target.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let lock_path = target.with_file_name(lock_name);

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)?;

        Ok(Self {
            lock_path,
            target: target.to_path_buf(),
            file,
            committed: false,
        })
    }

    fn commit(mut self, content: &[u8]) -> io::Result<()> {
        self.file.write_all(content)?;
        self.file.sync_all()?;
        fs::rename(&self.lock_path, &self.target)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}

/// Remove `dir` and its subdirectories if none of them holds a file
///
/// Returns the name of the first entry standing in the way, with any
/// `.lock` suffix stripped.
fn remove_empty_dirs(dir: &Path, prefix: &str) -> Result<Option<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if is_missing(&e) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let name = format!("{}/{}", prefix, file_name);
        if !entry.file_type()?.is_dir() {
            return Ok(Some(
                name.strip_suffix(".lock").map(str::to_string).unwrap_or(name),
            ));
        }
        if let Some(blocker) = remove_empty_dirs(&entry.path(), &name)? {
            return Ok(Some(blocker));
        }
    }

    match fs::remove_dir(dir) {
        Ok(()) => Ok(None),
        Err(e) if is_missing(&e) => Ok(None),
        // Something appeared after the scan
        Err(_) => Ok(Some(prefix.to_string())),
    }
}

fn is_missing(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::NotFound
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (TempDir, FilesystemStore) {
        let dir = TempDir::new().unwrap();
        init_bare_repository(dir.path()).unwrap();
        let store = FilesystemStore::open(dir.path(), 16);
        (dir, store)
    }

    #[tokio::test]
    async fn test_init_writes_symbolic_head() {
        let (_dir, store) = create_test_store();
        let refs = store.references().await.unwrap();
        assert_eq!(refs, vec![Reference::symbolic(HEAD, DEFAULT_BRANCH)]);
        assert_eq!(store.resolve(HEAD).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_object_roundtrip_and_cache() {
        let (dir, store) = create_test_store();
        let blob = Object::blob(&b"hello world\n"[..]);
        let id = store.put_object(blob.clone()).await.unwrap();

        let hex = id.to_hex();
        assert!(dir.path().join("objects").join(&hex[..2]).join(&hex[2..]).is_file());
        assert!(store.has_object(id).await.unwrap());

        // A fresh store reads it back from disk
        let reopened = FilesystemStore::open(dir.path(), 16);
        assert_eq!(reopened.cached_objects(), 0);
        assert_eq!(reopened.object(id).await.unwrap(), blob);
        assert_eq!(reopened.cached_objects(), 1);
    }

    #[tokio::test]
    async fn test_cache_is_bounded() {
        let (_dir, store) = create_test_store();
        for i in 0..40u32 {
            store
                .put_object(Object::blob(i.to_string().into_bytes()))
                .await
                .unwrap();
        }
        assert_eq!(store.cached_objects(), 16);
    }

    #[tokio::test]
    async fn test_missing_object() {
        let (_dir, store) = create_test_store();
        let id = ObjectId::from_data(b"nothing");
        assert!(!store.has_object(id).await.unwrap());
        assert!(matches!(
            store.object(id).await,
            Err(StoreError::ObjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reference_cas_persists() {
        let (dir, store) = create_test_store();
        let a = ObjectId::from_data(b"a");
        let b = ObjectId::from_data(b"b");

        store
            .compare_and_set("refs/heads/master", a, ObjectId::null())
            .await
            .unwrap();
        store.compare_and_set("refs/heads/master", b, a).await.unwrap();
        assert!(store.compare_and_set("refs/heads/master", a, a).await.is_err());

        let content = fs::read_to_string(dir.path().join("refs/heads/master")).unwrap();
        assert_eq!(content, format!("{}\n", b));
        assert!(!dir.path().join("refs/heads/master.lock").exists());

        let reopened = FilesystemStore::open(dir.path(), 16);
        assert_eq!(reopened.resolve(HEAD).await.unwrap(), Some(b));
    }

    #[tokio::test]
    async fn test_existing_lock_rejects_update() {
        let (dir, store) = create_test_store();
        fs::write(dir.path().join("refs/heads/master.lock"), b"").unwrap();

        let err = store
            .compare_and_set("refs/heads/master", ObjectId::from_data(b"a"), ObjectId::null())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ReferenceLocked(_)));
        // Someone else's lock is left alone
        assert!(dir.path().join("refs/heads/master.lock").exists());
    }

    #[tokio::test]
    async fn test_delete_prunes_directories() {
        let (dir, store) = create_test_store();
        let a = ObjectId::from_data(b"a");
        store
            .compare_and_set("refs/heads/feature/x", a, ObjectId::null())
            .await
            .unwrap();
        store
            .compare_and_set("refs/heads/feature/x", ObjectId::null(), a)
            .await
            .unwrap();
        assert!(!dir.path().join("refs/heads/feature").exists());
        assert!(dir.path().join("refs/heads").is_dir());

        // Now the former directory name is free for a branch
        store
            .compare_and_set("refs/heads/feature", a, ObjectId::null())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_directory_file_conflict() {
        let (_dir, store) = create_test_store();
        let a = ObjectId::from_data(b"a");
        store
            .compare_and_set("refs/heads/a", a, ObjectId::null())
            .await
            .unwrap();
        let err = store
            .compare_and_set("refs/heads/a/b", a, ObjectId::null())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ReferenceConflict { .. }));
    }

    #[tokio::test]
    async fn test_directory_with_pending_lock_is_kept() {
        let (dir, store) = create_test_store();
        let a = ObjectId::from_data(b"a");
        // Another update is creating refs/heads/feature/x
        fs::create_dir_all(dir.path().join("refs/heads/feature")).unwrap();
        fs::write(dir.path().join("refs/heads/feature/x.lock"), b"").unwrap();

        let err = store
            .compare_and_set("refs/heads/feature", a, ObjectId::null())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::ReferenceConflict { ref existing, .. } if existing == "refs/heads/feature/x"
        ));
        assert!(dir.path().join("refs/heads/feature/x.lock").is_file());
    }

    #[tokio::test]
    async fn test_empty_nested_directories_are_reclaimed() {
        let (dir, store) = create_test_store();
        let a = ObjectId::from_data(b"a");
        fs::create_dir_all(dir.path().join("refs/heads/topic/deep/er")).unwrap();

        store
            .compare_and_set("refs/heads/topic", a, ObjectId::null())
            .await
            .unwrap();
        assert!(dir.path().join("refs/heads/topic").is_file());
    }

    #[tokio::test]
    async fn test_packed_refs_are_listed_and_deletable() {
        let (dir, store) = create_test_store();
        let a = ObjectId::from_data(b"a");
        let t = ObjectId::from_data(b"t");
        fs::write(
            dir.path().join(PACKED_REFS),
            format!(
                "# pack-refs with: peeled fully-peeled sorted\n{} refs/heads/master\n{} refs/tags/v1\n^{}\n",
                a, t, a
            ),
        )
        .unwrap();

        let names: Vec<String> = store
            .references()
            .await
            .unwrap()
            .iter()
            .map(|r| r.name().to_string())
            .collect();
        assert_eq!(names, vec!["HEAD", "refs/heads/master", "refs/tags/v1"]);
        assert_eq!(store.resolve(HEAD).await.unwrap(), Some(a));

        store
            .compare_and_set("refs/tags/v1", ObjectId::null(), t)
            .await
            .unwrap();
        assert!(store.reference("refs/tags/v1").await.unwrap().is_none());
        assert!(store.reference("refs/heads/master").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reference_lookup_ignores_traversal() {
        let (_dir, store) = create_test_store();
        assert!(store.reference("refs/../config").await.unwrap().is_none());
    }
}
