//! Background maintenance engines
//!
//! Compaction keeps per-level shard counts bounded, the garbage collector
//! removes orphaned objects, and vacuum trims tombstones past the retention
//! horizon. All three mutate the database exclusively through the manifest
//! CAS loop and never run concurrently with a sync of the same client; the
//! client state machine guards that.

pub mod compaction;
pub mod gc;
pub mod vacuum;

pub use compaction::{CompactionEngine, CompactionReport};
pub use gc::{GcEngine, GcReport};
pub use vacuum::{VacuumEngine, VacuumReport};

use std::sync::Arc;

use crate::manifest::ManifestManager;
use crate::options::SealOptions;
use crate::shard::ShardReader;
use crate::store::StorageBackend;

/// Handles shared by the maintenance engines, wired by the client at
/// construction (one direction of borrowing, no cycles).
pub struct MaintenanceContext {
    pub store: Arc<dyn StorageBackend>,
    pub manifest: Arc<ManifestManager>,
    pub reader: Arc<ShardReader>,
    pub options: SealOptions,
}
