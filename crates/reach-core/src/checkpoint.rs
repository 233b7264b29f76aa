//! Durable per-job progress records.
//!
//! One JSON file per job, `<dir>/<job>_checkpoint.json`, replaced atomically
//! on every save (temp file in the same directory, then rename). A file that
//! cannot be read or parsed is renamed aside and the job restarts from a
//! fresh record; corruption never aborts a run.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::AppError;
use crate::models::ContactInfo;

/// Last known outcome for a target identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetOutcome {
    pub row_index: usize,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub result: Option<ContactInfo>,
    pub error: Option<String>,
}

/// Why a row failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureDetail {
    pub target: String,
    pub kind: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Persisted job state. The single source of truth for what still needs doing.
///
/// Deserialization is lenient: unknown fields are ignored and missing fields
/// take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointRecord {
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub processed_targets: BTreeMap<String, TargetOutcome>,
    pub completed_rows: BTreeSet<usize>,
    pub failed_rows: BTreeMap<usize, FailureDetail>,
    pub total_rows: usize,
    /// High-water mark: max row index ever attempted, plus one.
    pub current_position: usize,
    pub is_completed: bool,
}

impl CheckpointRecord {
    pub fn new(job_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_name: job_name.into(),
            started_at: now,
            last_updated: now,
            ..Default::default()
        }
    }
}

/// Snapshot of job progress for status displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub percent_complete: f64,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub elapsed: Duration,
}

/// A serialized record detached from its store.
#[derive(Debug, Clone)]
pub struct CheckpointSnapshot {
    dir: PathBuf,
    path: PathBuf,
    json: String,
    pub completed: usize,
    pub total: usize,
}

impl CheckpointSnapshot {
    /// Replace the checkpoint file atomically. Blocking.
    pub fn write(&self) -> Result<(), AppError> {
        let io_err = |e: std::io::Error| {
            AppError::CheckpointError(format!("{}: {e}", self.path.display()))
        };
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        tmp.write_all(self.json.as_bytes()).map_err(io_err)?;
        tmp.flush().map_err(io_err)?;
        tmp.as_file_mut().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

/// File-backed checkpoint for one job.
#[derive(Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    path: PathBuf,
    record: CheckpointRecord,
}

impl CheckpointStore {
    /// Open (or create) the checkpoint for `job_name` inside `dir`.
    ///
    /// Failing to create the storage directory is the only fatal error;
    /// an unreadable checkpoint file is quarantined and replaced by a
    /// fresh record.
    pub fn open(dir: impl Into<PathBuf>, job_name: &str) -> Result<Self, AppError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            AppError::CheckpointError(format!(
                "cannot create checkpoint directory {}: {e}",
                dir.display()
            ))
        })?;

        let path = dir.join(checkpoint_file_name(job_name));
        let record = Self::load(&path, job_name);

        Ok(Self { dir, path, record })
    }

    /// Read the record at `path`, or return a fresh one.
    pub fn load(path: &Path, job_name: &str) -> CheckpointRecord {
        if !path.exists() {
            return CheckpointRecord::new(job_name);
        }

        let parsed = fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|raw| {
                serde_json::from_str::<CheckpointRecord>(&raw).map_err(|e| e.to_string())
            });

        match parsed {
            Ok(mut record) => {
                if record.job_name.is_empty() {
                    record.job_name = job_name.to_string();
                }
                tracing::info!(
                    job = %job_name,
                    completed = record.completed_rows.len(),
                    failed = record.failed_rows.len(),
                    "Checkpoint loaded"
                );
                record
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Unreadable checkpoint");
                quarantine(path);
                CheckpointRecord::new(job_name)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self) -> &CheckpointRecord {
        &self.record
    }

    /// Serialize the record for a later [`CheckpointSnapshot::write`].
    ///
    /// Lets callers holding the store behind a lock release it before the
    /// file I/O happens.
    pub fn snapshot(&mut self) -> Result<CheckpointSnapshot, AppError> {
        self.record.last_updated = Utc::now();
        Ok(CheckpointSnapshot {
            dir: self.dir.clone(),
            path: self.path.clone(),
            json: serde_json::to_string_pretty(&self.record)?,
            completed: self.record.completed_rows.len(),
            total: self.record.total_rows,
        })
    }

    /// Write the full record atomically, propagating I/O errors.
    pub fn try_save(&mut self) -> Result<(), AppError> {
        self.snapshot()?.write()
    }

    /// Best-effort save: errors are logged and swallowed.
    ///
    /// Returns whether the record reached disk.
    pub fn save(&mut self) -> bool {
        match self.try_save() {
            Ok(()) => {
                tracing::debug!(
                    path = %self.path.display(),
                    completed = self.record.completed_rows.len(),
                    "Checkpoint saved"
                );
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to save checkpoint");
                false
            }
        }
    }

    pub fn set_total_rows(&mut self, total: usize) {
        self.record.total_rows = total;
    }

    /// Record the outcome of one row.
    ///
    /// Success adds the row to the completed set and clears any earlier
    /// failure. Failure upserts the failure entry; it never removes a row
    /// from the completed set nor replaces a successful target outcome.
    pub fn mark_processed(
        &mut self,
        row_index: usize,
        target: &str,
        outcome: Result<&ContactInfo, &AppError>,
    ) {
        let now = Utc::now();
        match outcome {
            Ok(contacts) => {
                self.record.processed_targets.insert(
                    target.to_string(),
                    TargetOutcome {
                        row_index,
                        success: true,
                        timestamp: now,
                        result: Some(contacts.clone()),
                        error: None,
                    },
                );
                self.record.completed_rows.insert(row_index);
                self.record.failed_rows.remove(&row_index);
            }
            Err(error) => {
                let keeps_success = self
                    .record
                    .processed_targets
                    .get(target)
                    .is_some_and(|o| o.success);
                if !keeps_success {
                    self.record.processed_targets.insert(
                        target.to_string(),
                        TargetOutcome {
                            row_index,
                            success: false,
                            timestamp: now,
                            result: None,
                            error: Some(error.to_string()),
                        },
                    );
                }
                self.record.failed_rows.insert(
                    row_index,
                    FailureDetail {
                        target: target.to_string(),
                        kind: error.kind().to_string(),
                        error: error.to_string(),
                        timestamp: now,
                    },
                );
            }
        }

        self.record.current_position = self.record.current_position.max(row_index + 1);
    }

    pub fn is_row_completed(&self, row_index: usize) -> bool {
        self.record.completed_rows.contains(&row_index)
    }

    pub fn is_target_processed(&self, target: &str) -> bool {
        self.record.processed_targets.contains_key(target)
    }

    /// `all_indices` minus the completed set, preserving input order.
    pub fn pending_rows(&self, all_indices: &[usize]) -> Vec<usize> {
        all_indices
            .iter()
            .copied()
            .filter(|i| !self.record.completed_rows.contains(i))
            .collect()
    }

    pub fn failed_rows(&self) -> &BTreeMap<usize, FailureDetail> {
        &self.record.failed_rows
    }

    /// Failure detail for a row that is not (yet) completed.
    pub fn failure_for(&self, row_index: usize) -> Option<&FailureDetail> {
        if self.is_row_completed(row_index) {
            return None;
        }
        self.record.failed_rows.get(&row_index)
    }

    /// Extracted contacts stored for a completed row.
    pub fn completed_payload(&self, row_index: usize, target: &str) -> Option<&ContactInfo> {
        if !self.is_row_completed(row_index) {
            return None;
        }
        self.record
            .processed_targets
            .get(target)
            .filter(|o| o.success)
            .and_then(|o| o.result.as_ref())
    }

    /// Flag the job finished and save.
    pub fn mark_completed(&mut self) {
        self.set_completed();
        self.save();
    }

    /// Flag the job finished without writing; the caller saves.
    pub fn set_completed(&mut self) {
        self.record.is_completed = true;
    }

    pub fn is_completed(&self) -> bool {
        self.record.is_completed
    }

    /// Re-open a completed job so its failed rows are dispatched again.
    pub fn reopen(&mut self) {
        self.record.is_completed = false;
    }

    /// Discard all progress and start the job over.
    pub fn reset(&mut self) {
        tracing::info!(job = %self.record.job_name, "Discarding checkpoint progress");
        self.record = CheckpointRecord::new(self.record.job_name.clone());
    }

    pub fn progress(&self) -> Progress {
        let total = self.record.total_rows;
        let completed = self.record.completed_rows.len();
        let failed = self
            .record
            .failed_rows
            .keys()
            .filter(|i| !self.record.completed_rows.contains(i))
            .count();
        let elapsed = (Utc::now() - self.record.started_at)
            .to_std()
            .unwrap_or_default();

        Progress {
            total,
            completed,
            failed,
            pending: total.saturating_sub(completed),
            percent_complete: if total > 0 {
                completed as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            started_at: self.record.started_at,
            last_updated: self.record.last_updated,
            elapsed,
        }
    }
}

/// File name for a job's checkpoint; path separators in the job name are neutralised.
pub fn checkpoint_file_name(job_name: &str) -> String {
    let safe: String = job_name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect();
    format!("{safe}_checkpoint.json")
}

/// Move an unreadable checkpoint aside so it is preserved for inspection.
fn quarantine(path: &Path) -> Option<PathBuf> {
    let file_name = path.file_name()?.to_string_lossy().into_owned();
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
    let target = path.with_file_name(format!("{file_name}.corrupt-{stamp}"));

    match fs::rename(path, &target) {
        Ok(()) => {
            tracing::warn!(
                from = %path.display(),
                to = %target.display(),
                "Quarantined corrupt checkpoint"
            );
            Some(target)
        }
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Failed to quarantine checkpoint");
            None
        }
    }
}
