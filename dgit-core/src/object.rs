//! Core object model for DGit
//!
//! Content-addressed git objects (blob, tree, commit, tag) identified by the
//! SHA-1 of their canonical `"<kind> <len>\0"` header followed by the payload.

use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;

/// Length of a raw object id in bytes
pub const ID_LEN: usize = 20;

/// Length of a hex-encoded object id
pub const HEX_LEN: usize = 40;

/// Mode of a tree entry that points at a submodule commit
const GITLINK_MODE: &[u8] = b"160000";

/// Errors raised while parsing objects
#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    #[error("invalid object header: {0}")]
    InvalidHeader(String),

    #[error("malformed {kind}: {reason}")]
    Malformed { kind: ObjectKind, reason: String },
}

/// Unique identifier for any stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; ID_LEN]);

impl ObjectId {
    /// Create a new ObjectId from raw bytes
    pub const fn new(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// The all-zero id, used on the wire for "no object"
    pub const fn null() -> Self {
        Self([0u8; ID_LEN])
    }

    pub fn is_null(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Compute the SHA-1 of arbitrary data
    pub fn from_data(data: &[u8]) -> Self {
        Self(Sha1::digest(data).into())
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal string (either case)
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let mut arr = [0u8; ID_LEN];
        hex::decode_to_slice(hex_str, &mut arr)?;
        Ok(Self(arr))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Object type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Commit,
    Tree,
    Blob,
    Tag,
}

impl ObjectKind {
    /// Name used in object headers
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Commit => "commit",
            ObjectKind::Tree => "tree",
            ObjectKind::Blob => "blob",
            ObjectKind::Tag => "tag",
        }
    }

    pub fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"commit" => Some(ObjectKind::Commit),
            b"tree" => Some(ObjectKind::Tree),
            b"blob" => Some(ObjectKind::Blob),
            b"tag" => Some(ObjectKind::Tag),
            _ => None,
        }
    }

    /// Type number used in pack entry headers
    pub fn pack_type(&self) -> u8 {
        match self {
            ObjectKind::Commit => 1,
            ObjectKind::Tree => 2,
            ObjectKind::Blob => 3,
            ObjectKind::Tag => 4,
        }
    }

    pub fn from_pack_type(code: u8) -> Option<Self> {
        match code {
            1 => Some(ObjectKind::Commit),
            2 => Some(ObjectKind::Tree),
            3 => Some(ObjectKind::Blob),
            4 => Some(ObjectKind::Tag),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded object: its kind and raw payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    pub kind: ObjectKind,
    pub data: Bytes,
}

impl Object {
    pub fn new(kind: ObjectKind, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    /// Create a blob object
    pub fn blob(data: impl Into<Bytes>) -> Self {
        Self::new(ObjectKind::Blob, data)
    }

    /// Canonical header, e.g. `blob 12\0`
    pub fn header(&self) -> Vec<u8> {
        format!("{} {}\0", self.kind, self.data.len()).into_bytes()
    }

    /// Compute the object ID
    pub fn id(&self) -> ObjectId {
        let mut hasher = Sha1::new();
        hasher.update(self.header());
        hasher.update(&self.data);
        ObjectId(hasher.finalize().into())
    }

    /// Header and payload as stored in a loose object (before compression)
    pub fn to_loose(&self) -> Vec<u8> {
        let mut out = self.header();
        out.extend_from_slice(&self.data);
        out
    }

    /// Parse an inflated loose object
    pub fn from_loose(raw: &[u8]) -> Result<Self, ObjectError> {
        let nul = raw
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| ObjectError::InvalidHeader("missing NUL".into()))?;
        let header = &raw[..nul];
        let space = header
            .iter()
            .position(|b| *b == b' ')
            .ok_or_else(|| ObjectError::InvalidHeader("missing size".into()))?;

        let kind = ObjectKind::from_name(&header[..space]).ok_or_else(|| {
            ObjectError::InvalidHeader(String::from_utf8_lossy(&header[..space]).into_owned())
        })?;
        let size: usize = std::str::from_utf8(&header[space + 1..])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ObjectError::InvalidHeader("bad size".into()))?;

        let data = &raw[nul + 1..];
        if data.len() != size {
            return Err(ObjectError::InvalidHeader(format!(
                "size mismatch: header says {}, found {}",
                size,
                data.len()
            )));
        }

        Ok(Self::new(kind, Bytes::copy_from_slice(data)))
    }

    /// Ids of the objects this one points at
    ///
    /// Commits link to their tree and parents, trees to their entries
    /// (submodule commits excluded), tags to the tagged object.
    pub fn links(&self) -> Result<Vec<ObjectId>, ObjectError> {
        match self.kind {
            ObjectKind::Blob => Ok(Vec::new()),
            ObjectKind::Tree => self.tree_links(),
            ObjectKind::Commit => self.header_links(&[b"tree ", b"parent "]),
            ObjectKind::Tag => self.header_links(&[b"object "]),
        }
    }

    fn tree_links(&self) -> Result<Vec<ObjectId>, ObjectError> {
        let malformed = |reason: &str| ObjectError::Malformed {
            kind: ObjectKind::Tree,
            reason: reason.to_string(),
        };

        let mut links = Vec::new();
        let mut rest = &self.data[..];
        while !rest.is_empty() {
            let space = rest
                .iter()
                .position(|b| *b == b' ')
                .ok_or_else(|| malformed("entry without mode"))?;
            let mode = &rest[..space];
            let nul = rest[space..]
                .iter()
                .position(|b| *b == 0)
                .map(|p| p + space)
                .ok_or_else(|| malformed("entry without name terminator"))?;
            let end = nul + 1 + ID_LEN;
            if rest.len() < end {
                return Err(malformed("truncated entry id"));
            }

            if mode != GITLINK_MODE {
                let mut id = [0u8; ID_LEN];
                id.copy_from_slice(&rest[nul + 1..end]);
                links.push(ObjectId(id));
            }
            rest = &rest[end..];
        }
        Ok(links)
    }

    fn header_links(&self, prefixes: &[&[u8]]) -> Result<Vec<ObjectId>, ObjectError> {
        let mut links = Vec::new();
        for line in self.data.split(|b| *b == b'\n') {
            // Headers end at the first blank line
            if line.is_empty() {
                break;
            }
            for prefix in prefixes {
                if let Some(hex) = line.strip_prefix(*prefix) {
                    let id = std::str::from_utf8(hex)
                        .ok()
                        .and_then(|s| ObjectId::from_hex(s).ok())
                        .ok_or_else(|| ObjectError::Malformed {
                            kind: self.kind,
                            reason: format!("bad id in '{}'", String::from_utf8_lossy(line)),
                        })?;
                    links.push(id);
                }
            }
        }
        Ok(links)
    }
}
