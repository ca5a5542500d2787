//! Storage abstraction layer for DGit
//!
//! An [`ObjectStore`] holds one repository: its objects and its references.
//! Two backends are provided, an in-memory store and a bare repository on the
//! local filesystem fronted by an LRU object cache.

use async_trait::async_trait;

use crate::object::{Object, ObjectError, ObjectId};
use crate::reference::{MAX_SYMREF_DEPTH, RefTarget, Reference};

pub mod filesystem;
pub mod memory;

pub use filesystem::{FilesystemStore, init_bare_repository};
pub use memory::MemoryStore;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    #[error("reference has changed (expected {expected}, found {actual})")]
    ReferenceChanged {
        name: String,
        expected: ObjectId,
        actual: ObjectId,
    },

    #[error("reference already exists")]
    ReferenceExists(String),

    #[error("failed to lock reference")]
    ReferenceLocked(String),

    #[error("invalid reference name: {reason}")]
    InvalidReferenceName { name: String, reason: String },

    #[error("reference conflicts with existing {existing}")]
    ReferenceConflict { name: String, existing: String },

    #[error("symbolic reference nested too deeply: {0}")]
    SymbolicLoop(String),

    #[error("corrupt reference {name}: {reason}")]
    CorruptReference { name: String, reason: String },

    #[error("corrupt object {id}: {source}")]
    CorruptObject {
        id: ObjectId,
        #[source]
        source: ObjectError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Repository storage interface
///
/// All backends implement this trait. Reference updates go exclusively
/// through [`ObjectStore::compare_and_set`], which is atomic per reference.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// All references, HEAD first when present, the rest sorted by name
    async fn references(&self) -> Result<Vec<Reference>>;

    /// Look up one reference without following symbolic targets
    async fn reference(&self, name: &str) -> Result<Option<Reference>>;

    /// Atomically move `name` from `expected_old` to `new`
    ///
    /// A null `expected_old` requires the reference to be absent, a null
    /// `new` deletes it.
    async fn compare_and_set(&self, name: &str, new: ObjectId, expected_old: ObjectId) -> Result<()>;

    /// Get object by ID
    async fn object(&self, id: ObjectId) -> Result<Object>;

    /// Check if object exists
    async fn has_object(&self, id: ObjectId) -> Result<bool>;

    /// Store an object (returns its ID)
    async fn put_object(&self, object: Object) -> Result<ObjectId>;

    /// Follow symbolic references from `name` down to an object id
    async fn resolve(&self, name: &str) -> Result<Option<ObjectId>> {
        let mut current = name.to_string();
        for _ in 0..MAX_SYMREF_DEPTH {
            match self.reference(&current).await? {
                None => return Ok(None),
                Some(reference) => match reference.target() {
                    RefTarget::Direct(id) => return Ok(Some(*id)),
                    RefTarget::Symbolic(target) => current = target.clone(),
                },
            }
        }
        Err(StoreError::SymbolicLoop(name.to_string()))
    }
}

/// Compare the current value of a reference against the expected one
pub(crate) fn check_transition(
    name: &str,
    current: Option<ObjectId>,
    expected: ObjectId,
) -> Result<()> {
    match current {
        Some(_) if expected.is_null() => Err(StoreError::ReferenceExists(name.to_string())),
        None if expected.is_null() => Ok(()),
        Some(actual) if actual == expected => Ok(()),
        actual => Err(StoreError::ReferenceChanged {
            name: name.to_string(),
            expected,
            actual: actual.unwrap_or_else(ObjectId::null),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_transition() {
        let a = ObjectId::from_data(b"a");
        let b = ObjectId::from_data(b"b");
        let null = ObjectId::null();

        assert!(check_transition("refs/heads/x", None, null).is_ok());
        assert!(check_transition("refs/heads/x", Some(a), a).is_ok());
        assert!(matches!(
            check_transition("refs/heads/x", Some(a), null),
            Err(StoreError::ReferenceExists(_))
        ));
        assert!(matches!(
            check_transition("refs/heads/x", Some(a), b),
            Err(StoreError::ReferenceChanged { .. })
        ));
        assert!(matches!(
            check_transition("refs/heads/x", None, b),
            Err(StoreError::ReferenceChanged { .. })
        ));
    }
}
