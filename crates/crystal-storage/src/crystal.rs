//! Crystal object: a versioned, journaled root document.
//!
//! A crystal owns its in-memory document, the waypoint anchoring that state
//! to the journal, and the filer/storage pair backing it on disk. One async
//! mutex per document serializes prepare/load/save/delete; different
//! documents are fully independent.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};
use crate::filer::{CrystalFiler, SnapshotEnvelope};
use crate::group::StorageGroup;
use crate::hash::content_hash;
use crate::journal::{Journal, JournalRecord};
use crate::query::{QueryAnswer, QueryPrompt, StorageQuery};
use crate::waypoint::{PlaneRegistry, Waypoint};

/// Capability a document type needs to live inside a crystal.
pub trait CrystalData: Default + Serialize + DeserializeOwned + Send + 'static {
    /// Applies one recorded journal mutation to the in-memory state.
    fn apply_journal(&mut self, record: &JournalRecord);
}

/// On-disk encoding for document snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveFormat {
    /// Length-prefixed binary encoding.
    Binary,
    /// UTF8 text encoding.
    Utf8,
}

/// When saves actually touch the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavePolicy {
    /// Saves persist through the filer.
    Durable,
    /// Saves are a no-op; the document lives only in memory.
    Volatile,
}

/// Lifecycle state of a crystal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrystalState {
    /// Configured but not yet loaded.
    Initial,
    /// Loaded and usable.
    Prepared,
    /// Destroyed. Accessing data yields a fresh default document.
    Deleted,
}

/// What a save call actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The snapshot was written and the waypoint advanced.
    Written,
    /// The content hash matched the waypoint; no physical write.
    Unchanged,
    /// Volatile policy; nothing persisted by design.
    VolatileSkip,
}

/// Configuration for one crystal.
#[derive(Debug, Clone)]
pub struct CrystalConfig {
    /// Snapshot encoding. The other format is tried as a load fallback.
    pub format: SaveFormat,
    /// Save policy.
    pub policy: SavePolicy,
    /// If true, a failed load is surfaced through the query callback
    /// instead of silently reconstructing a default document.
    pub required_for_loading: bool,
}

impl Default for CrystalConfig {
    fn default() -> Self {
        Self {
            format: SaveFormat::Binary,
            policy: SavePolicy::Durable,
            required_for_loading: false,
        }
    }
}

struct Inner<T> {
    state: CrystalState,
    data: Option<T>,
    waypoint: Waypoint,
}

/// A versioned, journaled root document.
pub struct CrystalObject<T: CrystalData> {
    config: CrystalConfig,
    filer: Arc<CrystalFiler>,
    storage: Option<Arc<StorageGroup>>,
    journal: Arc<dyn Journal>,
    planes: Arc<PlaneRegistry>,
    query: Arc<dyn StorageQuery>,
    owner: u64,
    inner: Mutex<Inner<T>>,
}

impl<T: CrystalData> CrystalObject<T> {
    /// Creates a crystal in the `Initial` state.
    pub fn new(
        config: CrystalConfig,
        filer: Arc<CrystalFiler>,
        storage: Option<Arc<StorageGroup>>,
        journal: Arc<dyn Journal>,
        planes: Arc<PlaneRegistry>,
        query: Arc<dyn StorageQuery>,
    ) -> Self {
        Self {
            config,
            filer,
            storage,
            journal,
            planes,
            query,
            owner: rand::random(),
            inner: Mutex::new(Inner {
                state: CrystalState::Initial,
                data: None,
                waypoint: Waypoint::default(),
            }),
        }
    }

    /// Runs `f` against the document, loading it first if needed.
    ///
    /// A deleted crystal yields a fresh default document (without clearing
    /// the `Deleted` state) so it remains usable as an empty document.
    pub async fn with_data<R>(&self, f: impl FnOnce(&mut T) -> R) -> StorageResult<R> {
        let mut guard = self.lock_loaded().await?;
        let data = guard.data.as_mut().expect("loaded by lock_loaded");
        Ok(f(data))
    }

    /// Applies a journaled mutation: records it under the current plane and
    /// applies it to the in-memory document.
    pub async fn apply(&self, mutation: Vec<u8>) -> StorageResult<()> {
        let mut guard = self.lock_loaded().await?;
        let plane = guard.waypoint.current_plane;
        let position = self.journal.record(plane, mutation.clone());
        let record = JournalRecord {
            position,
            plane,
            data: mutation,
        };
        guard
            .data
            .as_mut()
            .expect("loaded by lock_loaded")
            .apply_journal(&record);
        Ok(())
    }

    /// Saves the document.
    ///
    /// With the `Volatile` policy nothing touches the disk. Otherwise the
    /// serialized content hash is compared against the waypoint: an
    /// identical hash skips the physical write, anything else advances the
    /// waypoint and persists through the filer. `unload` drops the
    /// in-memory copy afterwards and reverts the state to `Initial`.
    pub async fn save(&self, unload: bool) -> StorageResult<SaveOutcome> {
        let mut guard = self.inner.lock().await;
        if self.config.policy == SavePolicy::Volatile {
            if unload {
                guard.data = None;
                guard.state = CrystalState::Initial;
            }
            return Ok(SaveOutcome::VolatileSkip);
        }
        let Some(data) = guard.data.as_ref() else {
            return Ok(SaveOutcome::Unchanged);
        };
        let bytes = serialize(self.config.format, data)?;
        let hash = content_hash(&bytes);

        let outcome = if guard.waypoint.is_valid() && guard.waypoint.hash == hash {
            debug!(hash, "content unchanged, skipping physical write");
            SaveOutcome::Unchanged
        } else {
            if !guard.waypoint.is_valid() {
                let mut waypoint = guard.waypoint;
                self.planes.adopt(&mut waypoint, self.owner);
                guard.waypoint = waypoint;
            }
            // mint the new next plane before writing so a failed write can
            // roll back without having retired anything
            let minted = self.planes.mint(self.owner);
            let advanced = Waypoint {
                journal_position: self.journal.current_position(),
                current_plane: guard.waypoint.next_plane,
                next_plane: minted,
                hash,
            };
            let envelope = SnapshotEnvelope {
                waypoint: advanced,
                data: bytes,
            };
            match self.filer.save(envelope).await {
                Ok(()) => {
                    self.planes.release(guard.waypoint.current_plane);
                    guard.waypoint = advanced;
                    SaveOutcome::Written
                }
                Err(err) => {
                    self.planes.release(minted);
                    return Err(err);
                }
            }
        };

        if unload {
            guard.data = None;
            guard.state = CrystalState::Initial;
        } else {
            guard.state = CrystalState::Prepared;
        }
        Ok(outcome)
    }

    /// Destroys the crystal: removes the filer's files, then the storage's
    /// blobs (always attempted, even if the first removal failed), retires
    /// the waypoint's planes and installs a fresh default document in the
    /// `Deleted` state.
    pub async fn delete(&self) -> StorageResult<()> {
        let mut guard = self.inner.lock().await;
        info!("deleting crystal");
        let file_result = self.filer.delete().await;
        if let Some(storage) = &self.storage {
            storage.delete_all();
        }
        self.planes.retire(&guard.waypoint);
        guard.waypoint = Waypoint::default();
        guard.data = Some(T::default());
        guard.state = CrystalState::Deleted;
        file_result
    }

    /// Replays the journal across the filer's snapshot history and checks
    /// that each snapshot plus its journal entries reproduces the next
    /// snapshot byte-for-byte. Failures are collected, not short-circuited.
    pub async fn test_journal(&self) -> bool {
        let history = self.filer.history();
        let mut ok = true;
        for pair in history.windows(2) {
            let (from, to) = (&pair[0], &pair[1]);
            let Some(mut doc) = deserialize_with_fallback::<T>(self.config.format, &from.data)
            else {
                ok = false;
                continue;
            };
            let records = self.journal.entries_between(
                from.waypoint.current_plane,
                from.waypoint.journal_position,
                to.waypoint.journal_position,
            );
            for record in &records {
                doc.apply_journal(record);
            }
            match serialize(self.config.format, &doc) {
                Ok(bytes) if bytes == to.data => {}
                _ => {
                    debug!(
                        from_plane = from.waypoint.current_plane,
                        "journal replay mismatch"
                    );
                    ok = false;
                }
            }
        }
        ok
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> CrystalState {
        self.inner.lock().await.state
    }

    /// Current waypoint.
    pub async fn waypoint(&self) -> Waypoint {
        self.inner.lock().await.waypoint
    }

    /// Locks the document, running the prepare/load sequence if no data is
    /// resident. Two-phase: the filer I/O happens with the lock released,
    /// and residency is re-checked after reacquiring.
    async fn lock_loaded(&self) -> StorageResult<MutexGuard<'_, Inner<T>>> {
        let mut guard = self.inner.lock().await;
        if guard.data.is_some() {
            return Ok(guard);
        }
        if guard.state == CrystalState::Deleted {
            guard.data = Some(T::default());
            return Ok(guard);
        }

        // phase 1 done (nothing to compute); release for the blocking I/O
        drop(guard);
        let loaded = self.filer.load().await;

        // phase 2: reacquire and re-validate; another caller may have won
        let mut guard = self.inner.lock().await;
        if guard.data.is_some() {
            return Ok(guard);
        }
        match loaded {
            Some(envelope) => {
                match deserialize_with_fallback::<T>(self.config.format, &envelope.data) {
                    Some(data) => {
                        let mut waypoint = envelope.waypoint;
                        let current = self.journal.current_position();
                        if waypoint.journal_position > current {
                            match self
                                .query
                                .ask(QueryPrompt::InconsistentJournal {
                                    recorded: waypoint.journal_position,
                                    current,
                                })
                                .await
                            {
                                QueryAnswer::Abort => return Err(StorageError::Aborted),
                                QueryAnswer::Continue => {
                                    self.journal.reset_position(waypoint.journal_position);
                                }
                            }
                        }
                        self.planes.adopt(&mut waypoint, self.owner);
                        guard.waypoint = waypoint;
                        guard.data = Some(data);
                    }
                    None => {
                        self.handle_load_failure(&mut guard).await?;
                    }
                }
            }
            None => {
                self.handle_load_failure(&mut guard).await?;
            }
        }
        guard.state = CrystalState::Prepared;
        Ok(guard)
    }

    /// Reconstructs a default document, consulting the query callback first
    /// when the document is required for loading.
    async fn handle_load_failure(&self, guard: &mut Inner<T>) -> StorageResult<()> {
        if self.config.required_for_loading {
            match self.query.ask(QueryPrompt::LoadFailed).await {
                QueryAnswer::Abort => return Err(StorageError::Aborted),
                QueryAnswer::Continue => {}
            }
        }
        let mut waypoint = Waypoint::default();
        self.planes.adopt(&mut waypoint, self.owner);
        guard.waypoint = waypoint;
        guard.data = Some(T::default());
        Ok(())
    }
}

fn serialize<T: Serialize>(format: SaveFormat, data: &T) -> StorageResult<Vec<u8>> {
    match format {
        SaveFormat::Binary => bincode::serialize(data).map_err(|err| {
            StorageError::DeserializeError {
                context: format!("binary encode: {err}"),
            }
        }),
        SaveFormat::Utf8 => serde_json::to_vec(data).map_err(|err| {
            StorageError::DeserializeError {
                context: format!("utf8 encode: {err}"),
            }
        }),
    }
}

/// Tries the configured format first, the other on failure.
fn deserialize_with_fallback<T: DeserializeOwned>(format: SaveFormat, bytes: &[u8]) -> Option<T> {
    let binary_first = format == SaveFormat::Binary;
    let try_binary = || bincode::deserialize::<T>(bytes).ok();
    let try_utf8 = || serde_json::from_slice::<T>(bytes).ok();
    if binary_first {
        try_binary().or_else(try_utf8)
    } else {
        try_utf8().or_else(try_binary)
    }
}
