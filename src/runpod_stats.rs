//! Dashboard stats snapshots.
//!
//! Unique responsibility: write a small JSON snapshot per instance combining
//! the latest pod descriptor, its telemetry, and the time remaining until the
//! inactivity pruner would reap it. Dashboards and status pages read this
//! file instead of calling the provider themselves.
//!
//! Snapshots are advisory. Writers treat failures as warnings upstream;
//! readers treat missing or stale files as "no data".

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runpod_client::{PodDescriptor, TelemetryDescriptor};
use crate::runpod_config::suffixed_path;

/// Errors for stats snapshot operations.
#[derive(Debug, Error)]
pub enum StatsError {
    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Serialization error.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// One instance's snapshot as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Instance the snapshot belongs to.
    pub instance: String,
    /// When the snapshot was written.
    pub updated_at: DateTime<Utc>,
    /// Pod descriptor at snapshot time.
    pub pod: PodDescriptor,
    /// Latest telemetry, when the pod was live enough to report any.
    pub telemetry: Option<TelemetryDescriptor>,
    /// Countdown until the pruner would reap the pod, `HH:MM:SS`. Already
    /// past (or unknown) renders as `00:00:00`.
    pub time_until_prune: String,
    /// Last confirmed use.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Inactivity threshold the countdown was computed against.
    pub inactivity_minutes: i64,
}

/// Render the time remaining until a pod becomes prune-eligible.
#[must_use]
pub fn time_until_prune(
    last_run_at: Option<DateTime<Utc>>,
    inactivity_minutes: i64,
    now: DateTime<Utc>,
) -> String {
    let Some(last) = last_run_at else {
        return "00:00:00".to_string();
    };
    let prune_at = last + Duration::minutes(inactivity_minutes);
    if now >= prune_at {
        return "00:00:00".to_string();
    }
    let secs = (prune_at - now).num_seconds();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Writes, reads and flushes per-instance stats snapshots derived from a
/// base path (`stats.json` becomes `stats-{instance}.json`).
#[derive(Debug, Clone)]
pub struct StatsWriter {
    base_path: PathBuf,
}

impl StatsWriter {
    /// Create a writer over the given base path.
    #[must_use]
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// The snapshot path for an instance.
    #[must_use]
    pub fn path_for(&self, instance: &str) -> PathBuf {
        suffixed_path(&self.base_path, instance)
    }

    /// Write a snapshot for an instance.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn write(
        &self,
        instance: &str,
        pod: &PodDescriptor,
        telemetry: Option<&TelemetryDescriptor>,
        last_run_at: Option<DateTime<Utc>>,
        inactivity_minutes: i64,
    ) -> Result<(), StatsError> {
        let now = Utc::now();
        let snapshot = StatsSnapshot {
            instance: instance.to_string(),
            updated_at: now,
            pod: pod.clone(),
            telemetry: telemetry.cloned(),
            time_until_prune: time_until_prune(last_run_at, inactivity_minutes, now),
            last_run_at,
            inactivity_minutes,
        };

        let path = self.path_for(instance);
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let mut tmp = path.clone();
        let tmp_name = format!(
            ".{}.tmp",
            path.file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("runpod_stats")
        );
        tmp.set_file_name(tmp_name);

        let json = serde_json::to_vec_pretty(&snapshot)?;
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&json)?;
            f.sync_all()?;
        }
        if path.exists() {
            let _ = fs::remove_file(&path);
        }
        fs::rename(&tmp, &path)?;

        Ok(())
    }

    /// Read the snapshot for an instance. Missing or unreadable files read
    /// as `None`.
    #[must_use]
    pub fn read(&self, instance: &str) -> Option<StatsSnapshot> {
        let bytes = fs::read(self.path_for(instance)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Delete snapshots. With an instance, only that instance's file; with
    /// `None`, every snapshot derived from the base path.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure removing an existing file.
    pub fn flush(&self, instance: Option<&str>) -> Result<(), StatsError> {
        match instance {
            Some(name) => remove_if_exists(&self.path_for(name)),
            None => {
                let Some(parent) = self.base_path.parent().filter(|p| p.exists()) else {
                    return Ok(());
                };
                let prefix = format!(
                    "{}-",
                    self.base_path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or("runpod-stats")
                );
                for entry in fs::read_dir(parent)? {
                    let entry = entry?;
                    let name = entry.file_name();
                    let Some(name) = name.to_str() else { continue };
                    if name.starts_with(&prefix) && name.ends_with(".json") {
                        remove_if_exists(&entry.path())?;
                    }
                }
                Ok(())
            }
        }
    }
}

fn remove_if_exists(path: &Path) -> Result<(), StatsError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StatsError::Io(e)),
    }
}
