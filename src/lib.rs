pub mod backend;
pub mod client;
pub mod crypto;
pub mod document;
pub mod error;
pub mod maintenance;
pub mod manifest;
pub mod options;
pub mod shard;
pub mod store;
pub mod sync;

pub use backend::{ChangeNotice, DatabaseBackend, MemoryBackend};
pub use client::{ClientEvent, ClientState, ClientStats, SealClient, Unlock};
pub use crypto::{CryptoManager, DeviceIdentity};
pub use document::{Document, SEQ_UNASSIGNED};
pub use error::{DbError, DbResult, ErrorKind};
pub use maintenance::{CompactionEngine, GcEngine, VacuumEngine};
pub use manifest::{
    Manifest, ManifestManager, ShardFileInfo, MANIFEST_NAME, PROTOCOL_VERSION,
};
pub use options::SealOptions;
pub use shard::{HeaderCache, ShardReader};
pub use store::{
    ByteRange, FileSystemStore, MemoryStore, Precondition, StorageBackend, StoreConfig,
};
pub use sync::{SyncEngine, SyncReport};
