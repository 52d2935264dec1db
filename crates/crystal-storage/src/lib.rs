#![warn(missing_docs)]

//! Crystal/Zen storage engine.
//!
//! A crash-consistent object store in two layers: directory shards holding
//! content-addressed, hash-framed blob files behind per-shard background
//! workers, and crystal objects — versioned root documents anchored to an
//! append-only journal through waypoints. Corruption is detected with a
//! fast 64-bit hash on every persisted blob and converted to absence, so
//! callers treat corrupt and missing data identically.

pub mod buffer;
pub mod crystal;
pub mod error;
pub mod filer;
pub mod group;
pub mod hash;
pub mod journal;
pub mod query;
pub mod shard;
pub mod snowflake;
pub mod waypoint;

mod worker;

pub use buffer::{BufferPool, BufferPoolConfig, BufferPoolStats, PooledBuffer};
pub use crystal::{
    CrystalConfig, CrystalData, CrystalObject, CrystalState, SaveFormat, SaveOutcome, SavePolicy,
};
pub use error::{StorageError, StorageResult};
pub use filer::{CrystalFiler, SnapshotEnvelope};
pub use group::{AddStorageResult, GroupConfig, GroupStats, StorageGroup, StorageRecord};
pub use journal::{Journal, JournalRecord, MemoryJournal};
pub use query::{QueryAnswer, QueryPrompt, StorageQuery};
pub use shard::{DirectoryShard, ShardStats};
pub use snowflake::{FileId, Snowflake};
pub use waypoint::{PlaneRegistry, Waypoint};
