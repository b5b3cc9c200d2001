//! Durable, versioned key-value state with point-in-time recovery.
//!
//! Every mutating operation persists immediately through an atomic
//! write-then-rename, so the on-disk current-state file always represents
//! the last fully completed write. Checkpoints are immutable, checksummed
//! snapshots of the full state; restoring one verifies its checksum first
//! and stashes the pre-restore state as a safety checkpoint.

mod storage;

pub use storage::{atomic_write, FileLock};

use crate::errors::CheckpointError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Version tag written into every persisted file. Imports carrying any
/// other tag are rejected.
pub const STATE_FORMAT_VERSION: &str = "1";

/// Default bound on retained checkpoints.
pub const DEFAULT_MAX_CHECKPOINTS: usize = 50;

/// Configuration for a [`CheckpointStore`].
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Directory holding the state, history, and lock files.
    pub state_dir: PathBuf,
    /// Maximum checkpoints retained; oldest evicted first.
    pub max_checkpoints: usize,
}

impl CheckpointConfig {
    /// Creates a config rooted at `state_dir`.
    #[must_use]
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            max_checkpoints: DEFAULT_MAX_CHECKPOINTS,
        }
    }

    /// Sets the checkpoint retention bound.
    #[must_use]
    pub fn with_max_checkpoints(mut self, max: usize) -> Self {
        self.max_checkpoints = max.max(1);
        self
    }
}

/// An immutable, checksummed snapshot of the full state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Identifier derived from phase and creation time.
    pub id: String,
    /// When the checkpoint was created.
    pub timestamp: DateTime<Utc>,
    /// The pipeline phase that produced it.
    pub phase: String,
    /// The captured state.
    pub snapshot: HashMap<String, serde_json::Value>,
    /// Caller-supplied annotations.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// SHA-256 of the snapshot's canonical serialization.
    pub checksum: String,
}

impl Checkpoint {
    /// Recomputes the checksum and compares it to the stored one.
    #[must_use]
    pub fn verify(&self) -> bool {
        compute_checksum(&self.snapshot).map_or(false, |sum| sum == self.checksum)
    }
}

/// Listing entry: everything but the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSummary {
    /// Checkpoint id.
    pub id: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Producing phase.
    pub phase: String,
    /// Caller-supplied annotations.
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Diagnostic counters for a store.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    /// Entries in the current state.
    pub entries: usize,
    /// Retained checkpoints.
    pub checkpoints: usize,
    /// The state directory.
    pub state_dir: PathBuf,
}

/// Computes the SHA-256 checksum over the canonical serialization of a
/// snapshot.
///
/// Canonical means sorted-key JSON: the map is converted to a
/// `serde_json::Value` first, whose object representation orders keys.
pub fn compute_checksum(
    snapshot: &HashMap<String, serde_json::Value>,
) -> Result<String, serde_json::Error> {
    let canonical = serde_json::to_value(snapshot)?;
    let bytes = serde_json::to_vec(&canonical)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: String,
    updated_at: String,
    state: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryFile {
    version: String,
    checkpoints: Vec<Checkpoint>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExportFile {
    version: String,
    exported_at: String,
    state: HashMap<String, serde_json::Value>,
    checkpoints: Vec<Checkpoint>,
}

struct StoreState {
    current: HashMap<String, serde_json::Value>,
    history: Vec<Checkpoint>,
    seq: u64,
}

/// Durable key-value state with checksummed point-in-time recovery.
///
/// In-process mutations serialize through one mutex; the durable write path
/// additionally takes an advisory file lock so independent processes sharing
/// a state directory never interleave writes.
pub struct CheckpointStore {
    config: CheckpointConfig,
    state: Mutex<StoreState>,
}

impl CheckpointStore {
    /// Opens (or initializes) a store rooted at the configured directory.
    ///
    /// Unreadable or corrupt files fall back to empty state with a warning;
    /// only directory creation failures propagate.
    pub fn open(config: CheckpointConfig) -> Result<Self, CheckpointError> {
        fs::create_dir_all(&config.state_dir)?;

        let state_path = config.state_dir.join("current_state.json");
        let history_path = config.state_dir.join("state_history.json");

        let current = match Self::load_json::<StateFile>(&state_path) {
            Some(file) if file.version == STATE_FORMAT_VERSION => file.state,
            Some(file) => {
                warn!(
                    found = %file.version,
                    "State file has unknown version; starting from empty state"
                );
                HashMap::new()
            }
            None => HashMap::new(),
        };
        let history = match Self::load_json::<HistoryFile>(&history_path) {
            Some(file) if file.version == STATE_FORMAT_VERSION => file.checkpoints,
            Some(file) => {
                warn!(
                    found = %file.version,
                    "History file has unknown version; starting with no checkpoints"
                );
                Vec::new()
            }
            None => Vec::new(),
        };

        let seq = history.len() as u64;
        Ok(Self {
            config,
            state: Mutex::new(StoreState {
                current,
                history,
                seq,
            }),
        })
    }

    /// Returns a value from the current state.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.state.lock().current.get(key).cloned()
    }

    /// Returns a copy of the full current state.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.state.lock().current.clone()
    }

    /// Returns the number of entries in the current state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().current.len()
    }

    /// Returns true if the current state is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().current.is_empty()
    }

    /// Sets one entry and persists.
    pub fn set(
        &self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), CheckpointError> {
        let mut state = self.state.lock();
        state.current.insert(key.into(), value);
        self.persist_state(&state.current)
    }

    /// Merges a batch of entries and persists once.
    pub fn update(
        &self,
        entries: HashMap<String, serde_json::Value>,
    ) -> Result<(), CheckpointError> {
        let mut state = self.state.lock();
        state.current.extend(entries);
        self.persist_state(&state.current)
    }

    /// Deletes one entry and persists. Returns whether the key existed.
    pub fn delete(&self, key: &str) -> Result<bool, CheckpointError> {
        let mut state = self.state.lock();
        let existed = state.current.remove(key).is_some();
        if existed {
            self.persist_state(&state.current)?;
        }
        Ok(existed)
    }

    /// Clears the current state and persists.
    pub fn clear(&self) -> Result<(), CheckpointError> {
        let mut state = self.state.lock();
        state.current.clear();
        self.persist_state(&state.current)
    }

    /// Creates a checkpoint of the current state tagged with `phase`.
    ///
    /// Returns the new checkpoint's id. The oldest checkpoint is evicted
    /// once the retention bound is exceeded.
    pub fn create_checkpoint(
        &self,
        phase: &str,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<String, CheckpointError> {
        let mut state = self.state.lock();
        let checkpoint = Self::build_checkpoint(&mut state, phase, metadata.unwrap_or_default())?;
        let id = checkpoint.id.clone();

        state.history.push(checkpoint);
        Self::evict_excess(&mut state, self.config.max_checkpoints);
        self.persist_history(&state.history)?;

        debug!(id = %id, phase = %phase, "Created checkpoint");
        Ok(id)
    }

    /// Restores the checkpoint with the given id.
    ///
    /// Returns `Ok(false)` without touching state when the id is unknown or
    /// the checksum does not verify. On success, the pre-restore state is
    /// stashed as a `pre_restore` safety checkpoint before being replaced.
    pub fn restore_checkpoint(&self, id: &str) -> Result<bool, CheckpointError> {
        let mut state = self.state.lock();

        let Some(checkpoint) = state.history.iter().find(|c| c.id == id).cloned() else {
            warn!(id = %id, "Checkpoint not found; nothing restored");
            return Ok(false);
        };
        if !checkpoint.verify() {
            warn!(id = %id, "Checksum mismatch; restore refused");
            return Ok(false);
        }

        let safety_metadata = HashMap::from([(
            "restored_from".to_string(),
            serde_json::json!(id),
        )]);
        let safety = Self::build_checkpoint(&mut state, "pre_restore", safety_metadata)?;
        state.history.push(safety);
        Self::evict_excess(&mut state, self.config.max_checkpoints);

        state.current = checkpoint.snapshot;
        self.persist_history(&state.history)?;
        self.persist_state(&state.current)?;

        debug!(id = %id, "Restored checkpoint");
        Ok(true)
    }

    /// Lists checkpoints, newest last, optionally filtered by phase.
    ///
    /// Summaries carry id, timestamp, phase, and metadata — not the payload.
    #[must_use]
    pub fn list_checkpoints(&self, phase: Option<&str>) -> Vec<CheckpointSummary> {
        self.state
            .lock()
            .history
            .iter()
            .filter(|c| phase.map_or(true, |p| c.phase == p))
            .map(|c| CheckpointSummary {
                id: c.id.clone(),
                timestamp: c.timestamp,
                phase: c.phase.clone(),
                metadata: c.metadata.clone(),
            })
            .collect()
    }

    /// Prunes checkpoints older than `keep_days`. Returns how many were
    /// removed.
    pub fn cleanup_old_checkpoints(&self, keep_days: i64) -> Result<usize, CheckpointError> {
        let cutoff = Utc::now() - ChronoDuration::days(keep_days);
        let mut state = self.state.lock();
        let before = state.history.len();
        state.history.retain(|c| c.timestamp >= cutoff);
        let removed = before - state.history.len();
        if removed > 0 {
            self.persist_history(&state.history)?;
            debug!(removed, keep_days, "Pruned old checkpoints");
        }
        Ok(removed)
    }

    /// Writes a full-fidelity backup (state plus checkpoints) to `path`.
    pub fn export_state(&self, path: &Path) -> Result<(), CheckpointError> {
        let state = self.state.lock();
        let export = ExportFile {
            version: STATE_FORMAT_VERSION.to_string(),
            exported_at: crate::utils::iso_timestamp(),
            state: state.current.clone(),
            checkpoints: state.history.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&export)?;
        atomic_write(path, &bytes)?;
        Ok(())
    }

    /// Replaces the store contents from a backup written by
    /// [`export_state`](Self::export_state).
    ///
    /// Rejects files carrying an unknown version tag.
    pub fn import_state(&self, path: &Path) -> Result<(), CheckpointError> {
        let bytes = fs::read(path)?;
        let import: ExportFile = serde_json::from_slice(&bytes)?;
        if import.version != STATE_FORMAT_VERSION {
            return Err(CheckpointError::UnknownVersion {
                found: import.version,
                expected: STATE_FORMAT_VERSION.to_string(),
            });
        }

        let mut state = self.state.lock();
        state.current = import.state;
        state.history = import.checkpoints;
        state.seq = state.history.len() as u64;
        self.persist_state(&state.current)?;
        self.persist_history(&state.history)?;
        Ok(())
    }

    /// Returns diagnostic counters.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let state = self.state.lock();
        StoreStats {
            entries: state.current.len(),
            checkpoints: state.history.len(),
            state_dir: self.config.state_dir.clone(),
        }
    }

    fn build_checkpoint(
        state: &mut StoreState,
        phase: &str,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<Checkpoint, CheckpointError> {
        state.seq += 1;
        let timestamp = Utc::now();
        let id = format!(
            "{}_{}_{:04}",
            phase,
            timestamp.format("%Y%m%dT%H%M%S"),
            state.seq
        );
        let snapshot = state.current.clone();
        let checksum = compute_checksum(&snapshot)?;
        Ok(Checkpoint {
            id,
            timestamp,
            phase: phase.to_string(),
            snapshot,
            metadata,
            checksum,
        })
    }

    fn evict_excess(state: &mut StoreState, max: usize) {
        while state.history.len() > max {
            let evicted = state.history.remove(0);
            debug!(id = %evicted.id, "Evicted oldest checkpoint");
        }
    }

    fn persist_state(
        &self,
        current: &HashMap<String, serde_json::Value>,
    ) -> Result<(), CheckpointError> {
        let _lock = FileLock::acquire(&self.lock_path())?;
        let file = StateFile {
            version: STATE_FORMAT_VERSION.to_string(),
            updated_at: crate::utils::iso_timestamp(),
            state: current.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;
        atomic_write(&self.state_path(), &bytes)?;
        Ok(())
    }

    fn persist_history(&self, history: &[Checkpoint]) -> Result<(), CheckpointError> {
        let _lock = FileLock::acquire(&self.lock_path())?;
        let file = HistoryFile {
            version: STATE_FORMAT_VERSION.to_string(),
            checkpoints: history.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;
        atomic_write(&self.history_path(), &bytes)?;
        Ok(())
    }

    fn state_path(&self) -> PathBuf {
        self.config.state_dir.join("current_state.json")
    }

    fn history_path(&self) -> PathBuf {
        self.config.state_dir.join("state_history.json")
    }

    fn lock_path(&self) -> PathBuf {
        self.config.state_dir.join(".lock")
    }

    fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Unreadable state file; falling back to empty");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Corrupt state file; falling back to empty");
                None
            }
        }
    }
}
