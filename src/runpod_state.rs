//! Pod lifecycle state persistence.
//!
//! Unique responsibility: persist the tracked pod for an instance or caller
//! nickname: which remote pod we own (`pod_id`) and when it was last
//! confirmed in use (`last_run_at`).
//!
//! Non-goals:
//! - Call the `RunPod` API (runpod_client.rs).
//! - Decide when to create or prune (runpod_manager.rs).
//!
//! This module is intentionally "boring" and strict:
//! - A small serializable record stored as pretty-printed JSON,
//! - Atomic write-temp-then-rename so concurrent readers never observe a
//!   partial file,
//! - Unreadable or non-object content loads as "no state" so the manager
//!   self-heals by recreating, instead of wedging on a corrupt file.
//!
//! Why: without a persisted `pod_id`, the manager ends up recreating pods,
//! losing track of IDs, or paying for forgotten resources.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Persisted lifecycle record, one per instance/nickname.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodState {
    /// Provider-assigned pod ID. Absent means no pod is tracked.
    pub pod_id: Option<String>,
    /// Timestamp of last confirmed use (ISO-8601 on disk).
    pub last_run_at: Option<DateTime<Utc>>,
}

impl PodState {
    /// A record tracking `pod_id`, last used at `last_run_at`.
    #[must_use]
    pub fn tracked(pod_id: impl Into<String>, last_run_at: DateTime<Utc>) -> Self {
        Self {
            pod_id: Some(pod_id.into()),
            last_run_at: Some(last_run_at),
        }
    }

    /// The tracked pod ID, if any.
    #[must_use]
    pub fn pod_id(&self) -> Option<&str> {
        self.pod_id.as_deref()
    }
}

/// Errors for state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Serialization error.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Trait for persisting pod lifecycle state.
pub trait StateStore: Send + Sync {
    /// Load the state. Returns `Ok(None)` when absent or unreadable
    /// (corruption self-heals as "no state").
    ///
    /// # Errors
    ///
    /// Returns an error only on I/O failure reading an existing file.
    fn load(&self) -> Result<Option<PodState>, StateStoreError>;

    /// Save the state atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    fn save(&self, state: &PodState) -> Result<(), StateStoreError>;

    /// Delete the state if it exists. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure removing an existing file.
    fn clear(&self) -> Result<(), StateStoreError>;
}

/// File-based JSON state store with safe atomic writes.
#[derive(Debug, Clone)]
pub struct JsonFileStateStore {
    path: PathBuf,
}

impl JsonFileStateStore {
    /// Create a new JSON file state store.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the path to the state file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_parent_dir(&self) -> Result<(), io::Error> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl StateStore for JsonFileStateStore {
    fn load(&self) -> Result<Option<PodState>, StateStoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path)?;
        match serde_json::from_slice::<PodState>(&bytes) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "unreadable state file, treating as no state");
                Ok(None)
            }
        }
    }

    fn save(&self, state: &PodState) -> Result<(), StateStoreError> {
        self.ensure_parent_dir()?;

        // Write to temp file in same directory for atomic rename.
        let mut tmp = self.path.clone();
        let tmp_name = format!(
            ".{}.tmp",
            self.path
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("runpod_state")
        );
        tmp.set_file_name(tmp_name);

        let json = serde_json::to_vec_pretty(state)?;

        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&json)?;
            f.sync_all()?;
        }

        // Best-effort atomic replace (cross-platform pragmatic).
        if self.path.exists() {
            // On Windows, rename over existing can fail; remove first.
            let _ = fs::remove_file(&self.path);
        }
        fs::rename(&tmp, &self.path)?;

        Ok(())
    }

    fn clear(&self) -> Result<(), StateStoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateStoreError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store_in(dir: &tempfile::TempDir) -> JsonFileStateStore {
        JsonFileStateStore::new(dir.path().join("state/runpod-pod-state.json"))
    }

    #[test]
    fn round_trip_preserves_pod_id_and_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 0).unwrap();
        store.save(&PodState::tracked("p1", at)).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.pod_id(), Some("p1"));
        assert_eq!(loaded.last_run_at, Some(at));
    }

    #[test]
    fn missing_file_loads_as_no_state() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(store_in(&dir).load().unwrap(), None);
    }

    #[test]
    fn corrupt_file_loads_as_no_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), b"not json {{").unwrap();

        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.clear().unwrap();
        store.save(&PodState::tracked("p1", Utc::now())).unwrap();
        store.clear().unwrap();
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn save_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.save(&PodState::tracked("p1", Utc::now())).unwrap();

        let entries: Vec<_> = fs::read_dir(store.path().parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec!["runpod-pod-state.json"]);
    }
}
