//! Storage group: a set of directory shards with rotating, wear-leveled writes.
//!
//! Writes stick to one "current" shard until a byte-count threshold trips,
//! then move to the shard with the lowest usage ratio. This levels wear
//! across shards without recomputing ratios on every write.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{StorageError, StorageResult};
use crate::hash;
use crate::query::{QueryAnswer, QueryPrompt, StorageQuery};
use crate::shard::DirectoryShard;
use crate::snowflake::FileId;

/// Subdirectory used when auto-creating a default shard.
const DEFAULT_SHARD_SUBDIR: &str = "storage";
/// Capacity assigned to an auto-created default shard.
const DEFAULT_SHARD_CAPACITY: i64 = 1 << 40;
/// File name of the primary shard registry blob.
const REGISTRY_MAIN: &str = "storage.main";
/// File name of the backup shard registry blob.
const REGISTRY_BACKUP: &str = "storage.back";

/// Tunables for a storage group.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Bytes written to the current shard before rotation re-selects.
    pub rotation_threshold: u64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            rotation_threshold: 100 * 1024 * 1024,
        }
    }
}

/// One persisted shard registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageRecord {
    /// Non-zero shard id.
    pub storage_id: u16,
    /// Shard root, relative to the group root where possible.
    pub path: PathBuf,
    /// Capacity in bytes.
    pub capacity: i64,
}

/// Outcome of registering a new shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddStorageResult {
    /// Registered under this id.
    Success(u16),
    /// The path is already registered.
    FileExists,
    /// The explicit id is already taken.
    DuplicateId,
}

/// Aggregate statistics for the group.
#[derive(Debug, Clone)]
pub struct GroupStats {
    /// Number of registered shards.
    pub shard_count: usize,
    /// Sum of live payload bytes across shards.
    pub total_size: i64,
    /// Sum of capacities across shards.
    pub total_capacity: i64,
}

struct GroupInner {
    shards: HashMap<u16, Arc<DirectoryShard>>,
    records: HashMap<u16, StorageRecord>,
    current: Option<u16>,
    rotation_bytes: u64,
}

/// A set of directory shards behind one save/load/delete surface.
pub struct StorageGroup {
    root: PathBuf,
    config: GroupConfig,
    inner: Mutex<GroupInner>,
}

impl StorageGroup {
    /// Creates an empty group rooted at `root` with default tunables.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_config(root, GroupConfig::default())
    }

    /// Creates an empty group rooted at `root`.
    pub fn with_config(root: impl Into<PathBuf>, config: GroupConfig) -> Self {
        Self {
            root: root.into(),
            config,
            inner: Mutex::new(GroupInner {
                shards: HashMap::new(),
                records: HashMap::new(),
                current: None,
                rotation_bytes: 0,
            }),
        }
    }

    /// Registers a new shard.
    ///
    /// The path is normalized (trailing separators stripped, made relative
    /// to the group root when possible). An id of zero asks for a random
    /// unique non-zero 16-bit id.
    pub fn add_storage(&self, path: impl AsRef<Path>, id: u16, capacity: i64) -> AddStorageResult {
        let normalized = normalize_path(self.root.as_path(), path.as_ref());
        let mut inner = self.inner.lock();
        if inner.records.values().any(|r| r.path == normalized) {
            return AddStorageResult::FileExists;
        }
        let id = if id == 0 {
            mint_storage_id(&inner.records)
        } else if inner.records.contains_key(&id) {
            return AddStorageResult::DuplicateId;
        } else {
            id
        };
        let resolved = self.resolve(&normalized);
        let shard = Arc::new(DirectoryShard::new(id as u32, resolved, capacity));
        inner.shards.insert(id, shard);
        inner.records.insert(
            id,
            StorageRecord {
                storage_id: id,
                path: normalized,
                capacity,
            },
        );
        info!(storage_id = id, "storage shard registered");
        AddStorageResult::Success(id)
    }

    /// Saves a payload.
    ///
    /// If `storage_id` resolves to a live shard the write delegates there
    /// directly. Otherwise (zero, or a stale id whose shard is gone)
    /// rotation selection runs: past the byte threshold (or with no current
    /// shard) the lowest-usage-ratio shard becomes current and the counter
    /// restarts at this write's size; below it, the counter accumulates and
    /// the current shard keeps receiving writes.
    pub fn save(&self, storage_id: u16, file_id: FileId, data: Bytes) -> StorageResult<(u16, FileId)> {
        let (chosen_id, shard) = {
            let mut inner = self.inner.lock();
            let direct = if storage_id != 0 {
                inner.shards.get(&storage_id).cloned()
            } else {
                None
            };
            if let Some(shard) = direct {
                (storage_id, shard)
            } else {
                if inner.shards.is_empty() {
                    return Err(StorageError::NoDirectoryAvailable);
                }
                if storage_id != 0 {
                    debug!(storage_id, "stale shard id, re-homing via rotation");
                }
                let size = data.len() as u64;
                let rotate = inner.current.is_none()
                    || inner.rotation_bytes > self.config.rotation_threshold;
                if rotate {
                    let chosen = lowest_usage_shard(&inner.shards).expect("non-empty");
                    debug!(storage_id = chosen, "rotating to new current shard");
                    inner.current = Some(chosen);
                    // the triggering write counts against the new shard
                    inner.rotation_bytes = size;
                } else {
                    inner.rotation_bytes += size;
                }
                let chosen = inner.current.expect("set above");
                (chosen, Arc::clone(inner.shards.get(&chosen).expect("registered")))
            }
        };
        let file_id = shard.save(file_id, data);
        Ok((chosen_id, file_id))
    }

    /// Loads a payload from the shard owning `storage_id`.
    pub async fn load(&self, storage_id: u16, file_id: FileId) -> StorageResult<Bytes> {
        let shard = self.resolve_shard(storage_id)?;
        shard.load(file_id).await
    }

    /// Deletes a payload on the shard owning `storage_id`.
    pub fn delete(&self, storage_id: u16, file_id: FileId) -> StorageResult<()> {
        let shard = self.resolve_shard(storage_id)?;
        shard.delete(file_id);
        Ok(())
    }

    /// Deletes every blob in every shard. Used when the owning document is
    /// destroyed.
    pub fn delete_all(&self) {
        let shards: Vec<Arc<DirectoryShard>> = {
            let inner = self.inner.lock();
            inner.shards.values().cloned().collect()
        };
        for shard in shards {
            shard.delete_all();
        }
    }

    /// Starts the group: loads the persisted registry, prepares and checks
    /// every shard, and auto-creates a default shard if none survive.
    ///
    /// Every abort point goes through `query`; the engine never drops user
    /// data without that confirmation, except when creating directories
    /// that did not exist at all.
    pub async fn try_start(&self, query: &dyn StorageQuery) -> StorageResult<()> {
        let records = match self.load_registry().await {
            RegistryLoad::Loaded(records) => records,
            RegistryLoad::Missing => Vec::new(),
            RegistryLoad::Corrupt => {
                warn!("shard registry corrupt");
                match query.ask(QueryPrompt::CorruptedRegistry).await {
                    QueryAnswer::Abort => return Err(StorageError::Aborted),
                    QueryAnswer::Continue => Vec::new(),
                }
            }
        };

        let mut prepared: Vec<(StorageRecord, Arc<DirectoryShard>)> = Vec::new();
        let mut failed: Vec<PathBuf> = Vec::new();
        for record in records {
            let resolved = self.resolve(&record.path);
            let shard = Arc::new(DirectoryShard::new(
                record.storage_id as u32,
                resolved,
                record.capacity,
            ));
            if shard.prepare_and_check().await {
                prepared.push((record, shard));
            } else {
                failed.push(record.path.clone());
            }
        }
        if !failed.is_empty() {
            match query.ask(QueryPrompt::UnavailableDirectories(&failed)).await {
                QueryAnswer::Abort => return Err(StorageError::Aborted),
                QueryAnswer::Continue => {}
            }
        }

        {
            let mut inner = self.inner.lock();
            for (record, shard) in prepared {
                inner.shards.insert(record.storage_id, shard);
                inner.records.insert(record.storage_id, record);
            }
        }

        if self.inner.lock().shards.is_empty() {
            let default_path = self.root.join(DEFAULT_SHARD_SUBDIR);
            tokio::fs::create_dir_all(&default_path).await?;
            match self.add_storage(&default_path, 0, DEFAULT_SHARD_CAPACITY) {
                AddStorageResult::Success(id) => {
                    info!(storage_id = id, "default shard created");
                }
                _ => return Err(StorageError::NoDirectoryAvailable),
            }
        }

        let shards: Vec<Arc<DirectoryShard>> = {
            let inner = self.inner.lock();
            if inner.shards.is_empty() {
                return Err(StorageError::NoDirectoryAvailable);
            }
            inner.shards.values().cloned().collect()
        };
        for shard in &shards {
            if !shard.prepare_and_check().await {
                return Err(StorageError::NoDirectoryAvailable);
            }
            shard.start().await;
        }
        Ok(())
    }

    /// Stops every shard (draining their workers, persisting their indices)
    /// and persists the shard registry to main and backup paths.
    pub async fn stop(&self) -> StorageResult<()> {
        let (shards, records) = {
            let inner = self.inner.lock();
            (
                inner.shards.values().cloned().collect::<Vec<_>>(),
                inner.records.values().cloned().collect::<Vec<_>>(),
            )
        };
        for shard in shards {
            shard.stop().await?;
        }
        let payload = bincode::serialize(&records).map_err(|err| StorageError::DeserializeError {
            context: format!("registry encode: {err}"),
        })?;
        let sealed = hash::seal(&payload);
        tokio::fs::create_dir_all(&self.root).await?;
        for name in [REGISTRY_MAIN, REGISTRY_BACKUP] {
            tokio::fs::write(self.root.join(name), &sealed).await?;
        }
        Ok(())
    }

    /// Aggregate statistics across shards.
    pub fn stats(&self) -> GroupStats {
        let inner = self.inner.lock();
        let mut total_size = 0;
        let mut total_capacity = 0;
        for shard in inner.shards.values() {
            let stats = shard.stats();
            total_size += stats.current_size;
            total_capacity += stats.capacity;
        }
        GroupStats {
            shard_count: inner.shards.len(),
            total_size,
            total_capacity,
        }
    }

    /// Usage ratios keyed by storage id, for balance inspection.
    pub fn usage_ratios(&self) -> Vec<(u16, f64)> {
        let inner = self.inner.lock();
        inner
            .shards
            .iter()
            .map(|(id, shard)| (*id, shard.usage_ratio()))
            .collect()
    }

    fn resolve_shard(&self, storage_id: u16) -> StorageResult<Arc<DirectoryShard>> {
        if storage_id == 0 {
            return Err(StorageError::NoStorage { storage_id });
        }
        let inner = self.inner.lock();
        inner
            .shards
            .get(&storage_id)
            .cloned()
            .ok_or(StorageError::NoStorage { storage_id })
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    async fn load_registry(&self) -> RegistryLoad {
        let mut saw_file = false;
        for name in [REGISTRY_MAIN, REGISTRY_BACKUP] {
            let blob = match tokio::fs::read(self.root.join(name)).await {
                Ok(blob) => blob,
                Err(_) => continue,
            };
            saw_file = true;
            if let Some(payload) = hash::unseal(&blob) {
                if let Ok(records) = bincode::deserialize::<Vec<StorageRecord>>(payload) {
                    return RegistryLoad::Loaded(records);
                }
            }
        }
        if saw_file {
            RegistryLoad::Corrupt
        } else {
            RegistryLoad::Missing
        }
    }
}

enum RegistryLoad {
    Loaded(Vec<StorageRecord>),
    Missing,
    Corrupt,
}

/// Strips trailing separators and makes the path relative to `root` when it
/// is a prefix.
fn normalize_path(root: &Path, path: &Path) -> PathBuf {
    let trimmed: PathBuf = {
        let s = path.to_string_lossy();
        let s = s.trim_end_matches(std::path::MAIN_SEPARATOR);
        PathBuf::from(s)
    };
    match trimmed.strip_prefix(root) {
        Ok(relative) if !relative.as_os_str().is_empty() => relative.to_path_buf(),
        _ => trimmed,
    }
}

/// Picks the shard with the lowest usage ratio, ties broken by iteration
/// order.
fn lowest_usage_shard(shards: &HashMap<u16, Arc<DirectoryShard>>) -> Option<u16> {
    let mut best: Option<(u16, f64)> = None;
    for (id, shard) in shards {
        let ratio = shard.usage_ratio();
        match best {
            Some((_, best_ratio)) if best_ratio <= ratio => {}
            _ => best = Some((*id, ratio)),
        }
    }
    best.map(|(id, _)| id)
}

/// Mints a random non-zero storage id unique within the registry.
fn mint_storage_id(existing: &HashMap<u16, StorageRecord>) -> u16 {
    let mut rng = rand::thread_rng();
    loop {
        let candidate: u16 = rng.gen();
        if candidate != 0 && !existing.contains_key(&candidate) {
            return candidate;
        }
    }
}
