//! DGit Core Library
//!
//! Server side of the git smart protocol, independent of any transport:
//! - Object model (blob, tree, commit, tag) and SHA-1 ids
//! - pkt-line framing
//! - References, name validation and update transactions
//! - Storage abstraction (in-memory, bare repository on disk with LRU cache)
//! - Pack stream codec
//! - Reference advertisement, upload-pack and receive-pack engines
//! - Registry mapping repository ids to stores

pub mod object;
pub mod packfile;
pub mod pktline;
pub mod protocol;
pub mod reference;
pub mod registry;
pub mod store;
pub mod transaction;

pub use object::{Object, ObjectError, ObjectId, ObjectKind};
pub use packfile::{PackCodec, PackError, PackfileCodec};
pub use pktline::{PktLineError, PktLineReader, PktLineWriter};
pub use protocol::{
    CAPABILITIES, ProtocolError, ReceiveReport, RefUpdateStatus, Service, UploadRequest,
    advertised_references, list_references, receive_pack, upload_pack,
};
pub use reference::{RefTarget, Reference};
pub use registry::{FilesystemRegistry, MemoryRegistry, StoreRegistry};
pub use store::{
    FilesystemStore, MemoryStore, ObjectStore, Result, StoreError, init_bare_repository,
};
pub use transaction::{RefTransaction, UpdateKind};
