//! Pack stream codec
//!
//! A pack is `PACK`, a version, an object count, the entries and a SHA-1 of
//! everything before it. Entries are zlib-compressed objects or deltas
//! against another entry (ofs-delta) or object (ref-delta).

use async_trait::async_trait;
use std::io::{self, Read, Write};

use crate::object::{ObjectError, ObjectId};
use crate::store::{ObjectStore, StoreError};

mod decode;
mod delta;
mod encode;

pub use delta::apply_delta;

/// Pack signature
pub const SIGNATURE: &[u8; 4] = b"PACK";

/// Length of the SHA-1 trailer
pub const TRAILER_LEN: usize = 20;

/// Signature, version and object count
pub const HEADER_LEN: usize = 12;

/// Entry type codes for deltas (object kinds use 1-4)
pub(crate) const OFS_DELTA: u8 = 6;
pub(crate) const REF_DELTA: u8 = 7;

/// Result type for pack operations
pub type Result<T> = std::result::Result<T, PackError>;

/// Errors raised while producing or consuming pack streams
#[derive(Debug, thiserror::Error)]
pub enum PackError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid pack signature")]
    InvalidSignature,

    #[error("unsupported pack version {0}")]
    UnsupportedVersion(u32),

    #[error("pack checksum mismatch")]
    ChecksumMismatch,

    #[error("truncated pack: {0}")]
    Truncated(String),

    #[error("invalid entry at offset {offset}: {reason}")]
    InvalidEntry { offset: usize, reason: String },

    #[error("invalid delta: {0}")]
    InvalidDelta(String),

    #[error("missing delta base {0}")]
    MissingBase(ObjectId),

    #[error("missing object {0}")]
    MissingObject(ObjectId),

    #[error(transparent)]
    Object(#[from] ObjectError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Converts between object graphs in a store and pack streams
#[async_trait]
pub trait PackCodec: Send + Sync {
    /// Write a pack holding every object reachable from `wants`
    ///
    /// Returns the number of objects written.
    async fn encode(
        &self,
        wants: &[ObjectId],
        store: &dyn ObjectStore,
        out: &mut (dyn Write + Send),
    ) -> Result<usize>;

    /// Read a pack from `input` and store every object it contains
    ///
    /// Returns the number of objects stored. Empty input is an empty pack.
    async fn decode(&self, input: &mut (dyn Read + Send), store: &dyn ObjectStore) -> Result<usize>;
}

/// Pack version 2 codec without delta compression on output
#[derive(Debug, Default, Clone, Copy)]
pub struct PackfileCodec;

impl PackfileCodec {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PackCodec for PackfileCodec {
    async fn encode(
        &self,
        wants: &[ObjectId],
        store: &dyn ObjectStore,
        out: &mut (dyn Write + Send),
    ) -> Result<usize> {
        let objects = encode::collect_reachable(wants, store).await?;
        encode::write_pack(&objects, out)?;
        tracing::debug!("Encoded pack with {} objects", objects.len());
        Ok(objects.len())
    }

    async fn decode(&self, input: &mut (dyn Read + Send), store: &dyn ObjectStore) -> Result<usize> {
        let mut data = Vec::new();
        input.read_to_end(&mut data)?;
        if data.is_empty() {
            return Ok(0);
        }

        let objects = decode::parse_pack(&data, store).await?;
        let count = objects.len();
        for object in objects {
            store.put_object(object).await?;
        }
        tracing::debug!("Decoded pack with {} objects ({} bytes)", count, data.len());
        Ok(count)
    }
}
