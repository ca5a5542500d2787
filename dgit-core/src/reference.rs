//! Named references (branches, tags, HEAD)

use crate::object::ObjectId;
use crate::store::StoreError;

/// Name of the symbolic reference pointing at the default branch
pub const HEAD: &str = "HEAD";

/// Branch HEAD points at in a freshly initialized repository
pub const DEFAULT_BRANCH: &str = "refs/heads/master";

/// Symbolic references are followed at most this many levels
pub const MAX_SYMREF_DEPTH: usize = 5;

const FORBIDDEN_CHARS: &[char] = &[' ', '~', '^', ':', '?', '*', '[', '\\'];

/// What a reference points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefTarget {
    /// An object id
    Direct(ObjectId),
    /// The name of another reference
    Symbolic(String),
}

/// A named pointer into the object graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    name: String,
    target: RefTarget,
}

impl Reference {
    pub fn direct(name: impl Into<String>, id: ObjectId) -> Self {
        Self {
            name: name.into(),
            target: RefTarget::Direct(id),
        }
    }

    pub fn symbolic(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: RefTarget::Symbolic(target.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &RefTarget {
        &self.target
    }

    /// The object id for direct references
    pub fn id(&self) -> Option<ObjectId> {
        match &self.target {
            RefTarget::Direct(id) => Some(*id),
            RefTarget::Symbolic(_) => None,
        }
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self.target, RefTarget::Symbolic(_))
    }
}

/// Order used when listing references: HEAD first, then by name
pub fn sort_for_listing(refs: &mut [Reference]) {
    refs.sort_by(|a, b| {
        (a.name() != HEAD)
            .cmp(&(b.name() != HEAD))
            .then_with(|| a.name().cmp(b.name()))
    });
}

/// Check that `name` can be created or updated by a client
///
/// Follows git's `check-ref-format` rules for fully qualified names.
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    let invalid = |reason: &str| StoreError::InvalidReferenceName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if !name.starts_with("refs/") {
        return Err(invalid("must start with 'refs/'"));
    }
    if name.ends_with('/') || name.ends_with('.') {
        return Err(invalid("must not end with '/' or '.'"));
    }
    if name.contains("..") || name.contains("@{") {
        return Err(invalid("must not contain '..' or '@{'"));
    }
    if let Some(ch) = name
        .chars()
        .find(|c| c.is_control() || FORBIDDEN_CHARS.contains(c))
    {
        return Err(invalid(&format!("contains forbidden character {:?}", ch)));
    }
    for component in name.split('/') {
        if component.is_empty() {
            return Err(invalid("empty path component"));
        }
        if component.starts_with('.') {
            return Err(invalid("path component starts with '.'"));
        }
        if component.ends_with(".lock") {
            return Err(invalid("path component ends with '.lock'"));
        }
    }
    Ok(())
}

/// Find an existing reference that would collide with `name` on disk
///
/// `refs/heads/a` and `refs/heads/a/b` cannot coexist.
pub fn find_conflict<'a>(
    name: &str,
    existing: impl IntoIterator<Item = &'a str>,
) -> Option<String> {
    existing
        .into_iter()
        .find(|other| {
            let (shorter, longer) = if other.len() < name.len() {
                (*other, name)
            } else {
                (name, *other)
            };
            longer.len() > shorter.len()
                && longer.starts_with(shorter)
                && longer.as_bytes()[shorter.len()] == b'/'
        })
        .map(str::to_string)
}
