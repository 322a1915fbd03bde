//! Termination reason taxonomy.
//!
//! A run of the [`crate::controller::IterationController`] always ends in exactly one
//! of these reasons. Unlike the rest of the crate's fallible operations (which
//! propagate as `anyhow::Error`), a termination reason is an expected outcome,
//! not a failure to be logged and bubbled up — it is the `Ok` payload of
//! `IterationController::run`.

use thiserror::Error;

/// Why an iteration run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TerminationReason {
    /// The analyzer detected task completion.
    #[error("task completed successfully")]
    TaskComplete,
    /// `max_cycles` was reached without completion.
    #[error("maximum cycle count reached without completion; try raising --max-cycles")]
    MaxCyclesReached,
    /// A per-cycle or total-run deadline fired.
    #[error("execution exceeded deadline; try increasing the per-cycle timeout")]
    Timeout,
    /// The run was canceled (SIGINT or equivalent).
    #[error("run canceled by user interrupt")]
    Canceled,
    /// The circuit breaker is OPEN.
    #[error(
        "circuit breaker is open after repeated no-progress or error cycles; run with --reset to clear it"
    )]
    CircuitOpen,
    /// The analyzer detected repetition with no progress.
    #[error("assistant output stopped changing across cycles; likely stuck")]
    Stuck,
    /// The assistant failed to spawn, or produced empty output with a non-zero exit code.
    #[error("assistant process failed to run correctly")]
    ExecutionError,
    /// Configuration failed validation at startup.
    #[error("configuration is invalid")]
    ConfigError,
}

impl TerminationReason {
    /// The process exit code this reason maps to.
    ///
    /// `TaskComplete` is the only reason that exits `0`; every other reason
    /// gets a distinct non-zero code so callers can distinguish them without
    /// parsing the printed message.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::TaskComplete => 0,
            Self::MaxCyclesReached => 1,
            Self::Timeout => 2,
            Self::Canceled => 3,
            Self::CircuitOpen => 4,
            Self::Stuck => 5,
            Self::ExecutionError => 6,
            Self::ConfigError => 7,
        }
    }

    /// Whether this reason represents a successful run.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::TaskComplete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_complete_exits_zero() {
        assert_eq!(TerminationReason::TaskComplete.exit_code(), 0);
        assert!(TerminationReason::TaskComplete.is_success());
    }

    #[test]
    fn test_non_complete_reasons_are_nonzero_and_distinct() {
        let reasons = [
            TerminationReason::MaxCyclesReached,
            TerminationReason::Timeout,
            TerminationReason::Canceled,
            TerminationReason::CircuitOpen,
            TerminationReason::Stuck,
            TerminationReason::ExecutionError,
            TerminationReason::ConfigError,
        ];
        let mut codes: Vec<i32> = reasons.iter().map(|r| r.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), reasons.len(), "exit codes must be distinct");
        assert!(codes.iter().all(|&c| c != 0));
        assert!(reasons.iter().all(|r| !r.is_success()));
    }

    #[test]
    fn test_display_messages_are_actionable() {
        assert!(TerminationReason::Timeout.to_string().contains("deadline"));
        assert!(TerminationReason::CircuitOpen.to_string().contains("--reset"));
    }
}
