//! Durable per-cycle execution history.
//!
//! One directory per engine run under the configured save directory. Each
//! cycle is persisted as its own JSON file; a latest-snapshot summary file is
//! rewritten at every cycle boundary so a `--status` query never needs to
//! scan the full per-cycle set.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::analyzer::AnalyzerVerdict;
use crate::circuit_breaker::BreakerState;

/// One attempted cycle, immutable once finalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// 1-indexed cycle number within this run.
    pub cycle_index: u32,
    /// Unique id for this cycle, `cycle_<unixts>_<index>`.
    pub cycle_id: String,
    /// When the cycle's executor call started.
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// When the cycle's executor call ended.
    pub ended_at: chrono::DateTime<chrono::Utc>,
    /// Raw stdout transcript captured for this cycle.
    pub stdout: String,
    /// Raw stderr transcript captured for this cycle.
    pub stderr: String,
    /// Process exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// Wall-clock duration of the invocation.
    pub duration_secs: f64,
    /// The analyzer's verdict for this cycle's transcript, if execution succeeded.
    pub verdict: Option<AnalyzerVerdict>,
    /// Circuit-breaker state snapshot taken immediately after this cycle.
    pub breaker_state: BreakerState,
    /// Why this cycle itself ended (distinct from the eventual run termination reason).
    pub cycle_outcome: CycleOutcome,
}

/// How an individual cycle concluded, independent of the overall run outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    /// The executor returned normally; the analyzer did not flag completion.
    Progressed,
    /// The executor returned normally and the analyzer flagged completion.
    Completed,
    /// The executor call hit the per-cycle deadline.
    TimedOut,
    /// The executor call was canceled.
    Canceled,
    /// The assistant failed to spawn, or exited non-zero with empty output.
    ExecutionFailed,
}

impl ExecutionRecord {
    /// Build the cycle id for the given start instant and cycle index.
    #[must_use]
    pub fn cycle_id(started_at: chrono::DateTime<chrono::Utc>, cycle_index: u32) -> String {
        format!("cycle_{}_{cycle_index}", started_at.timestamp())
    }
}

/// Aggregate counters alongside the ordered record list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistorySnapshot {
    /// All records in cycle-index order.
    pub records: Vec<ExecutionRecord>,
    /// Total cycles attempted.
    pub total: u32,
    /// Cycles that completed the task.
    pub completions: u32,
    /// Cycles that failed to execute.
    pub failures: u32,
    /// Cycles that timed out.
    pub timeouts: u32,
}

impl HistorySnapshot {
    fn push(&mut self, record: ExecutionRecord) {
        self.total += 1;
        match record.cycle_outcome {
            CycleOutcome::Completed => self.completions += 1,
            CycleOutcome::ExecutionFailed => self.failures += 1,
            CycleOutcome::TimedOut => self.timeouts += 1,
            CycleOutcome::Progressed | CycleOutcome::Canceled => {}
        }
        self.records.push(record);
    }
}

/// Durable store of per-cycle execution records.
pub struct HistoryStore {
    dir: PathBuf,
    snapshot: HistorySnapshot,
    retention: u32,
}

impl HistoryStore {
    /// Open (or create) the history directory under `save_dir`, loading any
    /// existing per-cycle records in cycle-index order, retaining at most
    /// `retention` of them (oldest pruned first; aggregate counters are
    /// unaffected).
    ///
    /// Unreadable or malformed per-cycle files are skipped with a logged
    /// warning rather than aborting the load; if none are readable the store
    /// simply starts empty.
    ///
    /// # Errors
    /// Returns an error only if the history directory cannot be created or
    /// listed.
    pub fn open(save_dir: &Path, retention: u32) -> Result<Self> {
        let dir = save_dir.join("history");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create history directory: {}", dir.display()))?;

        let mut records = Vec::new();
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to list history directory: {}", dir.display()))?;
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with("cycle_") || path.extension().and_then(|e| e.to_str()) != Some("json")
            {
                continue;
            }
            match std::fs::read_to_string(&path)
                .ok()
                .and_then(|content| serde_json::from_str::<ExecutionRecord>(&content).ok())
            {
                Some(record) => records.push(record),
                None => {
                    eprintln!("warning: skipping unreadable history file {}", path.display());
                }
            }
        }
        records.sort_by_key(|r| r.cycle_index);

        let mut snapshot = HistorySnapshot::default();
        for record in records {
            snapshot.push(record);
        }

        let mut store = Self { dir, snapshot, retention };
        store.prune();
        Ok(store)
    }

    /// Number of records currently held (including ones loaded at startup).
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot.records.len()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot.records.is_empty()
    }

    /// The most recently appended record, if any.
    #[must_use]
    pub fn last(&self) -> Option<&ExecutionRecord> {
        self.snapshot.records.last()
    }

    /// A read-only view of the current snapshot.
    #[must_use]
    pub const fn snapshot(&self) -> &HistorySnapshot {
        &self.snapshot
    }

    /// Append a record, persist it as its own file, and rewrite the summary.
    ///
    /// Records must be appended in cycle-index order; this is the
    /// controller's responsibility to uphold, not this store's to enforce.
    /// Persistence is best-effort: a write failure is logged and the
    /// in-memory snapshot (authoritative for the current run) is updated
    /// regardless.
    pub fn append(&mut self, record: ExecutionRecord) {
        self.write_cycle_file(&record);
        self.snapshot.push(record);
        self.prune();
        self.write_summary();
    }

    /// Drop the oldest retained records (and their per-cycle files) beyond
    /// `retention`. Aggregate counters already reflect every cycle seen and
    /// are not affected.
    fn prune(&mut self) {
        let cap = self.retention as usize;
        while self.snapshot.records.len() > cap {
            let evicted = self.snapshot.records.remove(0);
            let path = self.dir.join(format!("{}.json", evicted.cycle_id));
            let _ = std::fs::remove_file(path);
        }
    }

    fn write_cycle_file(&self, record: &ExecutionRecord) {
        if let Err(err) = self.try_write_cycle_file(record) {
            eprintln!("warning: failed to persist history cycle file: {err:#}");
        }
    }

    fn try_write_cycle_file(&self, record: &ExecutionRecord) -> Result<()> {
        let path = self.dir.join(format!("{}.json", record.cycle_id));
        let json = serde_json::to_string_pretty(record)
            .context("Failed to serialize execution record")?;
        std::fs::write(&path, json.as_bytes())
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    fn write_summary(&self) {
        if let Err(err) = self.try_write_summary() {
            eprintln!("warning: failed to persist history summary: {err:#}");
        }
    }

    fn try_write_summary(&self) -> Result<()> {
        let path = self.dir.join("summary.json");
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&self.snapshot)
            .context("Failed to serialize history summary")?;
        std::fs::write(&tmp_path, json.as_bytes())
            .with_context(|| format!("Failed to write temp file: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path).with_context(|| {
            format!("Failed to rename {} -> {}", tmp_path.display(), path.display())
        })
    }
}

/// Classify how a cycle concluded, for the record's `cycle_outcome` field.
#[must_use]
pub const fn classify_outcome(
    executor_succeeded: bool,
    timed_out: bool,
    canceled: bool,
    analyzer_completed: bool,
) -> CycleOutcome {
    if timed_out {
        CycleOutcome::TimedOut
    } else if canceled {
        CycleOutcome::Canceled
    } else if !executor_succeeded {
        CycleOutcome::ExecutionFailed
    } else if analyzer_completed {
        CycleOutcome::Completed
    } else {
        CycleOutcome::Progressed
    }
}
