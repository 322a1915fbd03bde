//! Circuit breaker: guards against runaway or stuck iteration loops.
//!
//! Three states — `Closed` (normal), `Open` (halt further cycles), `HalfOpen`
//! (single probe after an explicit reset). Unlike a wall-clock-timeout
//! breaker, `Open` here never auto-transitions on its own; only an explicit
//! [`CircuitBreaker::reset`] call moves it to `HalfOpen`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStateKind {
    /// Normal operation.
    Closed,
    /// Halting further cycles until a reset.
    Open,
    /// One probe cycle allowed after a reset.
    HalfOpen,
}

/// Persisted circuit breaker state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerState {
    /// Current state.
    pub state: BreakerStateKind,
    /// Consecutive no-progress counter.
    pub no_progress_count: u32,
    /// Consecutive repeated-error counter.
    pub repeated_error_count: u32,
    /// Digest of the last stderr signature observed by `record_repeated_error`.
    pub last_error_digest: Option<String>,
    /// When the state last changed.
    pub last_change: DateTime<Utc>,
}

impl BreakerState {
    fn fresh() -> Self {
        Self {
            state: BreakerStateKind::Closed,
            no_progress_count: 0,
            repeated_error_count: 0,
            last_error_digest: None,
            last_change: Utc::now(),
        }
    }
}

/// The three-state circuit breaker, with disk persistence across process restarts.
pub struct CircuitBreaker {
    state: BreakerState,
    no_progress_threshold: u32,
    repeated_error_threshold: u32,
    state_path: PathBuf,
}

impl CircuitBreaker {
    /// Load breaker state from `<save_dir>/circuit_breaker_state`, or start fresh
    /// (`Closed`, zeroed counters) if the file is missing or malformed.
    ///
    /// # Errors
    /// Returns an error only if the save directory cannot be created.
    pub fn load(
        save_dir: &Path,
        no_progress_threshold: u32,
        repeated_error_threshold: u32,
    ) -> Result<Self> {
        std::fs::create_dir_all(save_dir)
            .with_context(|| format!("Failed to create save directory: {}", save_dir.display()))?;
        let state_path = save_dir.join("circuit_breaker_state");

        let state = std::fs::read_to_string(&state_path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_else(BreakerState::fresh);

        Ok(Self {
            state,
            no_progress_threshold,
            repeated_error_threshold,
            state_path,
        })
    }

    /// The current state kind.
    #[must_use]
    pub const fn state(&self) -> BreakerStateKind {
        self.state.state
    }

    /// Whether the breaker is currently `Open`.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.state == BreakerStateKind::Open
    }

    /// A read-only snapshot of the persisted state.
    #[must_use]
    pub const fn snapshot(&self) -> &BreakerState {
        &self.state
    }

    /// Record a cycle that made progress.
    ///
    /// `Closed` stays `Closed` with counters reset; `HalfOpen` returns to
    /// `Closed` with counters reset; `Open` is a no-op (requires an explicit
    /// [`Self::reset`]).
    pub fn record_success(&mut self) {
        match self.state.state {
            BreakerStateKind::Closed | BreakerStateKind::HalfOpen => {
                self.transition(BreakerStateKind::Closed, 0, 0, self.state.last_error_digest.clone());
            }
            BreakerStateKind::Open => {}
        }
    }

    /// Record a cycle whose transcript made no progress (digest matched the prior cycle).
    pub fn record_no_progress(&mut self) {
        match self.state.state {
            BreakerStateKind::Closed => {
                let count = self.state.no_progress_count + 1;
                let next = if count >= self.no_progress_threshold {
                    BreakerStateKind::Open
                } else {
                    BreakerStateKind::Closed
                };
                self.transition(next, count, self.state.repeated_error_count, self.state.last_error_digest.clone());
            }
            BreakerStateKind::HalfOpen => self.transition(
                BreakerStateKind::Open,
                self.state.no_progress_count,
                self.state.repeated_error_count,
                self.state.last_error_digest.clone(),
            ),
            BreakerStateKind::Open => {}
        }
    }

    /// Record a cycle that produced empty output with a non-zero exit code.
    ///
    /// `digest` identifies the stderr signature; consecutive calls with the
    /// same digest accumulate, a changed digest resets the counter to 1.
    pub fn record_repeated_error(&mut self, digest: &str) {
        match self.state.state {
            BreakerStateKind::Closed => {
                let count = if self.state.last_error_digest.as_deref() == Some(digest) {
                    self.state.repeated_error_count + 1
                } else {
                    1
                };
                let next = if count >= self.repeated_error_threshold {
                    BreakerStateKind::Open
                } else {
                    BreakerStateKind::Closed
                };
                self.transition(next, self.state.no_progress_count, count, Some(digest.to_string()));
            }
            BreakerStateKind::HalfOpen => self.transition(
                BreakerStateKind::Open,
                self.state.no_progress_count,
                self.state.repeated_error_count,
                Some(digest.to_string()),
            ),
            BreakerStateKind::Open => {}
        }
    }

    /// Reset the breaker: `Open` moves to `HalfOpen` for a single probe;
    /// `Closed`/`HalfOpen` stay `Closed`. Counters are always cleared.
    pub fn reset(&mut self) {
        let next = match self.state.state {
            BreakerStateKind::Open => BreakerStateKind::HalfOpen,
            BreakerStateKind::Closed | BreakerStateKind::HalfOpen => BreakerStateKind::Closed,
        };
        self.transition(next, 0, 0, None);
    }

    fn transition(
        &mut self,
        next: BreakerStateKind,
        no_progress_count: u32,
        repeated_error_count: u32,
        last_error_digest: Option<String>,
    ) {
        self.state = BreakerState {
            state: next,
            no_progress_count,
            repeated_error_count,
            last_error_digest,
            last_change: Utc::now(),
        };
        self.persist();
    }

    /// Persist the current state to disk, best-effort: the in-memory state
    /// is authoritative for this run, so a write failure is logged and
    /// swallowed rather than propagated.
    fn persist(&self) {
        if let Err(err) = self.try_persist() {
            eprintln!("warning: failed to persist circuit breaker state: {err:#}");
        }
    }

    fn try_persist(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.state)
            .context("Failed to serialize circuit breaker state")?;
        let tmp_path = self.state_path.with_extension("tmp");
        std::fs::write(&tmp_path, json.as_bytes())
            .with_context(|| format!("Failed to write temp file: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.state_path).with_context(|| {
            format!(
                "Failed to rename {} -> {}",
                tmp_path.display(),
                self.state_path.display()
            )
        })?;
        Ok(())
    }
}
