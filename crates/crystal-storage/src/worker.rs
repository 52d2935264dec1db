//! Per-shard background I/O worker.
//!
//! Exactly one consumer task drains a FIFO of save/load/remove work items so
//! the shard's index lock is only ever held for an enqueue, never for disk
//! latency. The loop survives failing items: an error is converted into a
//! `WriteError`/`ReadError` result and processing continues.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::{StorageError, StorageResult};
use crate::hash;

/// Bounded attempts for a save before reporting `WriteError`.
const MAX_SAVE_ATTEMPTS: u32 = 3;

/// One unit of work for the shard's consumer task.
pub(crate) enum WorkItem {
    /// Write `[8B hash][payload]` to `path`, creating the parent on demand.
    Save {
        /// Destination blob path.
        path: PathBuf,
        /// Payload bytes; ownership moves into the queue.
        data: Bytes,
    },
    /// Read and verify a blob, replying with the payload.
    Load {
        /// Source blob path.
        path: PathBuf,
        /// Expected payload size, if the index knows it.
        expected_size: Option<usize>,
        /// Completion channel.
        reply: oneshot::Sender<StorageResult<Bytes>>,
    },
    /// Best-effort file delete; already-absent counts as success.
    Remove {
        /// Path of the blob to remove.
        path: PathBuf,
    },
    /// Barrier: replies once every prior item has been processed.
    Flush {
        /// Completion channel.
        reply: oneshot::Sender<()>,
    },
}

/// Handle to one shard's single-consumer work queue.
pub(crate) struct DirectoryWorker {
    queue: mpsc::UnboundedSender<WorkItem>,
    handle: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DirectoryWorker {
    /// Spawns the consumer task.
    pub(crate) fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(worker_loop(rx));
        Self {
            queue: tx,
            handle: parking_lot::Mutex::new(Some(handle)),
        }
    }

    /// Enqueues a work item. Returns false if the worker has shut down.
    pub(crate) fn enqueue(&self, item: WorkItem) -> bool {
        self.queue.send(item).is_ok()
    }

    /// Waits until all currently queued items have been processed.
    pub(crate) async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.enqueue(WorkItem::Flush { reply: tx }) {
            let _ = rx.await;
        }
    }

    /// Drains the queue and stops the consumer task.
    pub(crate) async fn stop(&self) {
        self.flush().await;
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

async fn worker_loop(mut rx: mpsc::UnboundedReceiver<WorkItem>) {
    while let Some(item) = rx.recv().await {
        match item {
            WorkItem::Save { path, data } => {
                if let Err(err) = save_file(&path, &data).await {
                    warn!(path = %path.display(), %err, "background save failed");
                }
            }
            WorkItem::Load {
                path,
                expected_size,
                reply,
            } => {
                let result = load_file(&path, expected_size).await;
                let _ = reply.send(result);
            }
            WorkItem::Remove { path } => {
                trace!(path = %path.display(), "removing blob");
                let _ = tokio::fs::remove_file(&path).await;
            }
            WorkItem::Flush { reply } => {
                let _ = reply.send(());
            }
        }
    }
}

/// Writes a hash-framed blob, creating the parent directory once on a
/// missing-directory failure. Bounded retries, then `WriteError`.
async fn save_file(path: &Path, data: &[u8]) -> StorageResult<()> {
    let sealed = hash::seal(data);
    let mut created_parent = false;
    let mut last_reason = String::new();
    for attempt in 0..MAX_SAVE_ATTEMPTS {
        match tokio::fs::write(path, &sealed).await {
            Ok(()) => {
                trace!(path = %path.display(), size = data.len(), attempt, "blob written");
                return Ok(());
            }
            Err(err) => {
                last_reason = err.to_string();
                if err.kind() == std::io::ErrorKind::NotFound && !created_parent {
                    if let Some(parent) = path.parent() {
                        let _ = tokio::fs::create_dir_all(parent).await;
                        created_parent = true;
                    }
                }
            }
        }
    }
    Err(StorageError::WriteError {
        path: path.display().to_string(),
        reason: last_reason,
    })
}

/// Reads and verifies a hash-framed blob. A length or hash mismatch deletes
/// the corrupt file and reports `ReadError`; corrupt bytes never escape.
async fn load_file(path: &Path, expected_size: Option<usize>) -> StorageResult<Bytes> {
    let blob = tokio::fs::read(path).await.map_err(|err| StorageError::ReadError {
        path: path.display().to_string(),
        reason: err.to_string(),
    })?;

    if let Some(expected) = expected_size {
        if blob.len() != expected + hash::HASH_HEADER_SIZE {
            debug!(path = %path.display(), actual = blob.len(), expected, "length mismatch, discarding blob");
            let _ = tokio::fs::remove_file(path).await;
            return Err(StorageError::ReadError {
                path: path.display().to_string(),
                reason: "length mismatch".to_string(),
            });
        }
    }

    match hash::unseal(&blob) {
        Some(payload) => Ok(Bytes::copy_from_slice(payload)),
        None => {
            debug!(path = %path.display(), "hash mismatch, discarding blob");
            let _ = tokio::fs::remove_file(path).await;
            Err(StorageError::ReadError {
                path: path.display().to_string(),
                reason: "hash mismatch".to_string(),
            })
        }
    }
}
