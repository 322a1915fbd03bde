//! Run-progress file writer for external observability.
//!
//! Manages `<savedir>/progress.json`, a single JSON file reflecting the
//! current state of a running engine instance. External tools (including
//! this crate's own `--status` flag) poll this file rather than parsing
//! history or terminal output.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::TerminationReason;

/// Current status of an engine run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Run is currently executing cycles.
    Running,
    /// Run ended in `TaskComplete`.
    Completed,
    /// Run ended in any non-success termination reason.
    Failed,
    /// Run was stopped by user interrupt before reaching a terminal reason.
    Stopped,
}

impl RunStatus {
    /// Map a termination reason to the status recorded in the final snapshot.
    #[must_use]
    pub const fn from_termination(reason: TerminationReason) -> Self {
        match reason {
            TerminationReason::TaskComplete => Self::Completed,
            TerminationReason::Canceled => Self::Stopped,
            _ => Self::Failed,
        }
    }
}

/// Snapshot of the current run state, written to `<savedir>/progress.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    /// When the run started.
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// Current cycle index (1-indexed).
    pub current_cycle: u32,
    /// `max_cycles` from the active configuration.
    pub max_cycles: u32,
    /// Current status of the run.
    pub current_status: RunStatus,
    /// Count of cycles per exit reason observed so far, keyed by reason name.
    pub exit_reason_counts: BTreeMap<String, u32>,
    /// Total wall-clock duration of all completed cycles, in seconds.
    pub total_duration_secs: u64,
    /// A short summary of the most recent analyzer verdict, if any cycle has run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_verdict_summary: Option<String>,
}

impl RunProgress {
    /// Create a new `RunProgress` for the start of a run.
    #[must_use]
    pub fn new(max_cycles: u32) -> Self {
        Self {
            started_at: chrono::Utc::now(),
            current_cycle: 0,
            max_cycles,
            current_status: RunStatus::Running,
            exit_reason_counts: BTreeMap::new(),
            total_duration_secs: 0,
            last_verdict_summary: None,
        }
    }
}

/// Manages reading and writing `<savedir>/progress.json`.
pub struct ProgressWriter {
    path: PathBuf,
}

impl ProgressWriter {
    /// Create a new `ProgressWriter` targeting `<save_dir>/progress.json`.
    ///
    /// # Errors
    /// Returns an error if `save_dir` cannot be created.
    pub fn new(save_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(save_dir)
            .with_context(|| format!("Failed to create save directory: {}", save_dir.display()))?;
        Ok(Self {
            path: save_dir.join("progress.json"),
        })
    }

    /// Atomically write progress to the file (write to temp, then rename).
    ///
    /// # Errors
    /// Returns an error if serialization or either filesystem operation fails.
    pub fn write(&self, progress: &RunProgress) -> Result<()> {
        let json =
            serde_json::to_string_pretty(progress).context("Failed to serialize run progress")?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json.as_bytes())
            .with_context(|| format!("Failed to write temp file: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename {} -> {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;
        Ok(())
    }

    /// Read the current progress from the file, or `None` if it doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn read(&self) -> Result<Option<RunProgress>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let progress: RunProgress =
            serde_json::from_str(&content).context("Failed to parse progress.json")?;
        Ok(Some(progress))
    }
}
