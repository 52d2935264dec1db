//! Directory shard: one independently-rooted partition of the blob store.
//!
//! A shard owns a snowflake index guarded by a single mutex and delegates
//! all physical I/O to its background worker, so index lock hold times stay
//! at enqueue cost regardless of disk latency. The index itself persists to
//! a redundant main/backup file pair, each hash-framed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{StorageError, StorageResult};
use crate::hash;
use crate::snowflake::{blob_path, FileId, Snowflake};
use crate::worker::{DirectoryWorker, WorkItem};

/// File name of the primary snowflake index.
const INDEX_MAIN: &str = "zen.main";
/// File name of the backup snowflake index.
const INDEX_BACKUP: &str = "zen.back";

/// Point-in-time statistics for one shard.
#[derive(Debug, Clone)]
pub struct ShardStats {
    /// Number of live snowflakes.
    pub snowflake_count: usize,
    /// Sum of live payload sizes in bytes (hash headers excluded).
    pub current_size: i64,
    /// Configured capacity in bytes.
    pub capacity: i64,
    /// `current_size / capacity`, clamped to `[0, 1]`.
    pub usage_ratio: f64,
}

/// The mutable, persisted part of a shard: its live snowflake table.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ShardIndex {
    snowflakes: HashMap<u32, Snowflake>,
    current_size: i64,
}

/// One directory shard.
pub struct DirectoryShard {
    directory_id: u32,
    path: PathBuf,
    capacity: i64,
    index: Mutex<ShardIndex>,
    worker: DirectoryWorker,
}

impl DirectoryShard {
    /// Creates a shard rooted at `path` and spawns its worker.
    ///
    /// The shard is empty until [`DirectoryShard::start`] loads its index.
    pub fn new(directory_id: u32, path: impl Into<PathBuf>, capacity: i64) -> Self {
        Self {
            directory_id,
            path: path.into(),
            capacity,
            index: Mutex::new(ShardIndex::default()),
            worker: DirectoryWorker::spawn(),
        }
    }

    /// This shard's id.
    pub fn directory_id(&self) -> u32 {
        self.directory_id
    }

    /// This shard's root path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Saves a payload, returning the (possibly newly minted) file id.
    ///
    /// All size bookkeeping happens here under the index lock; the physical
    /// write is queued on the worker. An existing alive snowflake keeps its
    /// id, and the running total grows only by the size increase. The hash
    /// header bytes are deliberately not counted.
    pub fn save(&self, file_id: FileId, data: Bytes) -> FileId {
        let size = data.len() as i32;
        let snowflake_id = {
            let mut index = self.index.lock();
            let requested = file_id.snowflake_id();
            if requested != 0 && index.snowflakes.contains_key(&requested) {
                let previous = {
                    let entry = index.snowflakes.get_mut(&requested).expect("checked above");
                    let previous = entry.size;
                    entry.size = size;
                    previous
                };
                if size > previous {
                    index.current_size += (size - previous) as i64;
                }
                requested
            } else {
                let minted = mint_snowflake_id(&index.snowflakes);
                index.snowflakes.insert(minted, Snowflake::new(minted, size));
                index.current_size += size as i64;
                minted
            }
        };
        self.worker.enqueue(WorkItem::Save {
            path: blob_path(&self.path, snowflake_id),
            data,
        });
        FileId::new(self.directory_id, snowflake_id)
    }

    /// Loads a payload by file id.
    ///
    /// Returns `NoFile` when the snowflake is absent or dead, and also when
    /// the worker reports a read failure: corrupt data takes the same path
    /// as missing data.
    pub async fn load(&self, file_id: FileId) -> StorageResult<Bytes> {
        let snowflake_id = file_id.snowflake_id();
        let expected_size = {
            let index = self.index.lock();
            match index.snowflakes.get(&snowflake_id) {
                Some(snowflake) => Some(snowflake.size as usize),
                None => {
                    return Err(StorageError::NoFile {
                        file_id: file_id.raw(),
                    })
                }
            }
        };
        let (tx, rx) = oneshot::channel();
        let queued = self.worker.enqueue(WorkItem::Load {
            path: blob_path(&self.path, snowflake_id),
            expected_size,
            reply: tx,
        });
        if !queued {
            return Err(StorageError::NoFile {
                file_id: file_id.raw(),
            });
        }
        match rx.await {
            Ok(Ok(data)) => Ok(data),
            _ => Err(StorageError::NoFile {
                file_id: file_id.raw(),
            }),
        }
    }

    /// Deletes a snowflake: removes it from the live index immediately and
    /// queues the file removal. Idempotent on repeated deletes.
    pub fn delete(&self, file_id: FileId) {
        let snowflake_id = file_id.snowflake_id();
        let removed = {
            let mut index = self.index.lock();
            index.snowflakes.remove(&snowflake_id).map(|s| {
                index.current_size -= s.size as i64;
            })
        };
        if removed.is_some() {
            self.worker.enqueue(WorkItem::Remove {
                path: blob_path(&self.path, snowflake_id),
            });
        }
    }

    /// Resolves and creates the shard's directory and verifies an index
    /// file (main or backup) would be openable. Returns false on any
    /// failure; the caller treats the shard as unavailable.
    pub async fn prepare_and_check(&self) -> bool {
        if let Err(err) = tokio::fs::create_dir_all(&self.path).await {
            warn!(path = %self.path.display(), %err, "failed to prepare shard directory");
            return false;
        }
        for name in [INDEX_MAIN, INDEX_BACKUP] {
            match tokio::fs::File::open(self.path.join(name)).await {
                Ok(_) => return true,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    warn!(path = %self.path.display(), %err, "index file not openable");
                    return false;
                }
            }
        }
        // fresh directory, no index yet; usable if the directory itself is
        tokio::fs::metadata(&self.path).await.is_ok()
    }

    /// Loads the snowflake index from the main file, falling back to the
    /// backup on any failure. Corrupt or undecodable data is treated as
    /// absent and leaves the shard empty.
    pub async fn start(&self) {
        for name in [INDEX_MAIN, INDEX_BACKUP] {
            let path = self.path.join(name);
            let blob = match tokio::fs::read(&path).await {
                Ok(blob) => blob,
                Err(_) => continue,
            };
            let payload = match hash::unseal(&blob) {
                Some(payload) => payload,
                None => {
                    debug!(path = %path.display(), "index hash mismatch, trying next");
                    continue;
                }
            };
            match bincode::deserialize::<ShardIndex>(payload) {
                Ok(loaded) => {
                    info!(
                        directory_id = self.directory_id,
                        snowflakes = loaded.snowflakes.len(),
                        "shard index loaded"
                    );
                    *self.index.lock() = loaded;
                    return;
                }
                Err(err) => {
                    debug!(path = %path.display(), %err, "index deserialize failed, trying next");
                }
            }
        }
        debug!(directory_id = self.directory_id, "no usable index, starting empty");
    }

    /// Drains pending worker I/O, then persists the snowflake index to both
    /// the main and backup paths, hash-framed.
    pub async fn stop(&self) -> StorageResult<()> {
        self.worker.flush().await;
        let sealed = {
            let index = self.index.lock();
            let payload = bincode::serialize(&*index).map_err(|err| {
                StorageError::DeserializeError {
                    context: format!("shard index encode: {err}"),
                }
            })?;
            hash::seal(&payload)
        };
        tokio::fs::create_dir_all(&self.path).await?;
        for name in [INDEX_MAIN, INDEX_BACKUP] {
            tokio::fs::write(self.path.join(name), &sealed).await?;
        }
        self.worker.stop().await;
        Ok(())
    }

    /// Deletes every live snowflake and queues removal of their files.
    /// Used when an owning document is destroyed.
    pub fn delete_all(&self) {
        let ids: Vec<u32> = {
            let mut index = self.index.lock();
            let ids = index.snowflakes.keys().copied().collect();
            index.snowflakes.clear();
            index.current_size = 0;
            ids
        };
        for id in ids {
            self.worker.enqueue(WorkItem::Remove {
                path: blob_path(&self.path, id),
            });
        }
    }

    /// `current_size / capacity`, clamped to `[0, 1]`.
    pub fn usage_ratio(&self) -> f64 {
        let size = self.index.lock().current_size;
        if self.capacity <= 0 {
            return 1.0;
        }
        (size as f64 / self.capacity as f64).clamp(0.0, 1.0)
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> ShardStats {
        let index = self.index.lock();
        let ratio = if self.capacity <= 0 {
            1.0
        } else {
            (index.current_size as f64 / self.capacity as f64).clamp(0.0, 1.0)
        };
        ShardStats {
            snowflake_count: index.snowflakes.len(),
            current_size: index.current_size,
            capacity: self.capacity,
            usage_ratio: ratio,
        }
    }
}

/// Mints a random non-zero snowflake id unique within the shard. Ids come
/// from a 32-bit space, so collision-and-retry is the load-bearing strategy.
fn mint_snowflake_id(existing: &HashMap<u32, Snowflake>) -> u32 {
    let mut rng = rand::thread_rng();
    loop {
        let candidate: u32 = rng.gen();
        if candidate != 0 && !existing.contains_key(&candidate) {
            return candidate;
        }
    }
}
