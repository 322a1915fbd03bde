//! Iteration controller: drives the cycle loop, owns the per-run budgets,
//! and decides termination.
//!
//! This is the only component that calls the other four core components in
//! sequence; none of them call back into it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::analyzer::{self, AnalyzerVerdict};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::EngineConfig;
use crate::error::TerminationReason;
use crate::executor::{ChildExecutor, ExecuteError, StreamObserver};
use crate::history::{classify_outcome, CycleOutcome, ExecutionRecord, HistoryStore};
use crate::progress::{ProgressWriter, RunProgress, RunStatus};

/// The directive appended to every cycle's prompt, instructing the assistant
/// how to signal completion. Identical text every cycle so the composed
/// prompt is deterministic for a given initial prompt.
fn completion_directive(config: &EngineConfig) -> String {
    format!(
        "\n\n---\nWhen you have fully completed the task above and there is no \
         remaining work, emit the literal token {tag} on its own. You may \
         additionally emit a structured status block:\n{start}\nEXIT_SIGNAL: true\n\
         REASON: <one line>\n{end}\nDo not emit either unless the task is actually done.",
        tag = config.promise_tag,
        start = config.status_markers.start,
        end = config.status_markers.end,
    )
}

fn compose_prompt(initial_prompt: &str, config: &EngineConfig) -> String {
    format!("{initial_prompt}{}", completion_directive(config))
}

/// Result of a full `IterationController::run` call.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Why the run stopped.
    pub termination_reason: TerminationReason,
    /// Number of cycles attempted.
    pub cycles_executed: u32,
    /// Wall-clock duration of the whole run.
    pub total_duration: Duration,
    /// All execution records produced this run, in cycle order.
    pub records: Vec<ExecutionRecord>,
}

/// Coordinates the executor, analyzer, circuit breaker, and history store
/// across a bounded sequence of cycles.
pub struct IterationController {
    config: EngineConfig,
    executor: ChildExecutor,
    breaker: CircuitBreaker,
    history: HistoryStore,
    progress: ProgressWriter,
}

impl IterationController {
    /// Build a controller from `config`, loading or initializing all
    /// persisted state under `config.save_dir`.
    ///
    /// # Errors
    /// Returns an error if the save directory cannot be created, or if any
    /// persisted state file exists but cannot be created fresh.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let breaker = CircuitBreaker::load(
            &config.save_dir,
            config.breaker.no_progress,
            config.breaker.repeated_error,
        )?;
        let history = HistoryStore::open(&config.save_dir, config.history_retention)?;
        let progress = ProgressWriter::new(&config.save_dir)?;
        let executor = ChildExecutor::new(config.clone());
        Ok(Self {
            config,
            executor,
            breaker,
            history,
            progress,
        })
    }

    /// Run the engine to completion or termination.
    ///
    /// `cancel` should fire on user interrupt; the controller additionally
    /// derives its own child token to enforce `total_deadline_secs`
    /// independently of per-cycle deadlines.
    ///
    /// # Errors
    /// Returns an error only for I/O failures writing run-progress state —
    /// not for any of the taxonomy reasons in [`TerminationReason`], which are
    /// reported via the returned [`RunSummary`], and not for circuit-breaker
    /// or history persistence failures, which are logged and swallowed.
    pub async fn run(
        &mut self,
        initial_prompt: &str,
        cancel: &CancellationToken,
        observer: Arc<dyn StreamObserver>,
    ) -> Result<RunSummary> {
        let start = Instant::now();

        if let Some(reason) = self.check_preconditions() {
            return self.finish(reason, start, 0);
        }

        let total_deadline_guard = self.config.total_deadline_secs.map(|secs| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                cancel.cancel();
            })
        });

        let mut previous_digest: Option<String> = None;
        let mut cycles_executed = 0u32;
        let termination_reason;

        loop {
            if cancel.is_cancelled() {
                termination_reason = TerminationReason::Canceled;
                break;
            }

            let cycle_index = cycles_executed + 1;
            let prompt = compose_prompt(initial_prompt, &self.config);
            let started_at = chrono::Utc::now();

            let outcome = self
                .executor
                .execute(&prompt, cancel, Arc::clone(&observer))
                .await;

            cycles_executed = cycle_index;

            let (record, early_stop) = self.process_cycle_result(
                cycle_index,
                started_at,
                outcome,
                &mut previous_digest,
            )?;

            self.history.append(record);
            self.write_progress(cycle_index, RunStatus::Running, start.elapsed())?;

            if let Some(reason) = early_stop {
                termination_reason = reason;
                break;
            }
            if cycle_index >= self.config.max_cycles {
                termination_reason = TerminationReason::MaxCyclesReached;
                break;
            }
        }

        if let Some(guard) = total_deadline_guard {
            guard.abort();
        }

        self.finish(termination_reason, start, cycles_executed)
    }

    fn check_preconditions(&self) -> Option<TerminationReason> {
        if self.breaker.is_open() {
            return Some(TerminationReason::CircuitOpen);
        }
        if !self.config.working_dir.is_dir() {
            return Some(TerminationReason::ConfigError);
        }
        if !binary_reachable(&self.config.assistant_binary) {
            return Some(TerminationReason::ConfigError);
        }
        None
    }

    #[allow(clippy::too_many_lines)]
    fn process_cycle_result(
        &mut self,
        cycle_index: u32,
        started_at: chrono::DateTime<chrono::Utc>,
        outcome: Result<crate::executor::ExecuteOutcome, ExecuteError>,
        previous_digest: &mut Option<String>,
    ) -> Result<(ExecutionRecord, Option<TerminationReason>)> {
        let ended_at = chrono::Utc::now();
        let cycle_id = ExecutionRecord::cycle_id(started_at, cycle_index);

        match outcome {
            Err(ExecuteError::Timeout(output)) => {
                let record = ExecutionRecord {
                    cycle_index,
                    cycle_id,
                    started_at,
                    ended_at,
                    stdout: output.stdout,
                    stderr: output.stderr,
                    exit_code: None,
                    duration_secs: (ended_at - started_at).num_milliseconds() as f64 / 1000.0,
                    verdict: None,
                    breaker_state: self.breaker.snapshot().clone(),
                    cycle_outcome: classify_outcome(true, true, false, false),
                };
                // Deadline expiry terminates the run unconditionally; it is
                // not subject to circuit-breaker state.
                Ok((record, Some(TerminationReason::Timeout)))
            }
            Err(ExecuteError::Canceled(output)) => {
                let record = ExecutionRecord {
                    cycle_index,
                    cycle_id,
                    started_at,
                    ended_at,
                    stdout: output.stdout,
                    stderr: output.stderr,
                    exit_code: None,
                    duration_secs: (ended_at - started_at).num_milliseconds() as f64 / 1000.0,
                    verdict: None,
                    breaker_state: self.breaker.snapshot().clone(),
                    cycle_outcome: classify_outcome(true, false, true, false),
                };
                Ok((record, Some(TerminationReason::Canceled)))
            }
            Err(ExecuteError::Spawn(_)) => {
                let record = ExecutionRecord {
                    cycle_index,
                    cycle_id,
                    started_at,
                    ended_at,
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: None,
                    duration_secs: 0.0,
                    verdict: None,
                    breaker_state: self.breaker.snapshot().clone(),
                    cycle_outcome: classify_outcome(false, false, false, false),
                };
                // A spawn failure is a fail-fast condition, not subject to
                // circuit-breaker accounting.
                Ok((record, Some(TerminationReason::ExecutionError)))
            }
            Ok(exec_outcome) => {
                let stdout_empty = exec_outcome.output.stdout.trim().is_empty();
                let nonzero_exit = exec_outcome.exit_code.is_some_and(|c| c != 0);

                if stdout_empty && nonzero_exit {
                    let digest = analyzer::digest(&exec_outcome.output.stderr);
                    self.breaker.record_repeated_error(&digest);
                    let record = ExecutionRecord {
                        cycle_index,
                        cycle_id,
                        started_at,
                        ended_at,
                        stdout: exec_outcome.output.stdout,
                        stderr: exec_outcome.output.stderr,
                        exit_code: exec_outcome.exit_code,
                        duration_secs: exec_outcome.duration.as_secs_f64(),
                        verdict: None,
                        breaker_state: self.breaker.snapshot().clone(),
                        cycle_outcome: classify_outcome(true, false, false, false),
                    };
                    let stop = self.breaker_stop_or(TerminationReason::ExecutionError);
                    return Ok((record, stop));
                }

                // Non-empty stdout with a non-zero exit is treated as a
                // successful cycle for analysis purposes; only fully empty
                // output with a non-zero exit counts as an error cycle.
                let transcript = format!("{}\n{}", exec_outcome.output.stdout, exec_outcome.output.stderr);
                let verdict = analyzer::analyze(&transcript, previous_digest.as_deref(), &self.config);

                if verdict.stuck {
                    self.breaker.record_no_progress();
                } else {
                    self.breaker.record_success();
                }
                *previous_digest = Some(verdict.digest.clone());

                let completed = verdict.completed;
                let stuck = verdict.stuck;
                let record = ExecutionRecord {
                    cycle_index,
                    cycle_id,
                    started_at,
                    ended_at,
                    stdout: exec_outcome.output.stdout,
                    stderr: exec_outcome.output.stderr,
                    exit_code: exec_outcome.exit_code,
                    duration_secs: exec_outcome.duration.as_secs_f64(),
                    verdict: Some(verdict),
                    breaker_state: self.breaker.snapshot().clone(),
                    cycle_outcome: classify_outcome(true, false, false, completed),
                };

                let stop = if completed {
                    Some(TerminationReason::TaskComplete)
                } else if self.breaker.is_open() {
                    Some(TerminationReason::CircuitOpen)
                } else if stuck {
                    Some(TerminationReason::Stuck)
                } else {
                    None
                };
                Ok((record, stop))
            }
        }
    }

    /// After a breaker-affecting event, checked-open takes priority over the
    /// reason that would otherwise be reported.
    fn breaker_stop_or(&self, reason: TerminationReason) -> Option<TerminationReason> {
        if self.breaker.is_open() {
            Some(TerminationReason::CircuitOpen)
        } else {
            Some(reason)
        }
    }

    fn write_progress(&self, cycle_index: u32, status: RunStatus, elapsed: Duration) -> Result<()> {
        let mut counts = std::collections::BTreeMap::new();
        for record in &self.history.snapshot().records {
            let key = match record.cycle_outcome {
                CycleOutcome::Completed => "task_complete",
                CycleOutcome::TimedOut => "timeout",
                CycleOutcome::Canceled => "canceled",
                CycleOutcome::ExecutionFailed => "execution_error",
                CycleOutcome::Progressed => "progress",
            };
            *counts.entry(key.to_string()).or_insert(0) += 1;
        }
        let last_verdict_summary = self.history.last().and_then(|r| {
            r.verdict.as_ref().map(|v: &AnalyzerVerdict| {
                format!("score {} ({} indicators)", v.score, v.indicators.len())
            })
        });
        let progress = RunProgress {
            started_at: self
                .history
                .snapshot()
                .records
                .first()
                .map_or_else(chrono::Utc::now, |r| r.started_at),
            current_cycle: cycle_index,
            max_cycles: self.config.max_cycles,
            current_status: status,
            exit_reason_counts: counts,
            total_duration_secs: elapsed.as_secs(),
            last_verdict_summary,
        };
        self.progress.write(&progress)
    }

    fn finish(
        &mut self,
        reason: TerminationReason,
        start: Instant,
        cycles_executed: u32,
    ) -> Result<RunSummary> {
        let elapsed = start.elapsed();
        let status = RunStatus::from_termination(reason);
        self.write_progress(cycles_executed, status, elapsed)?;
        Ok(RunSummary {
            termination_reason: reason,
            cycles_executed,
            total_duration: elapsed,
            records: self.history.snapshot().records.clone(),
        })
    }
}

/// Best-effort reachability check for the assistant binary: either an
/// existing path, or a name found on `PATH`.
fn binary_reachable(binary: &str) -> bool {
    let path = std::path::Path::new(binary);
    if path.components().count() > 1 {
        return path.is_file();
    }
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| {
        let candidate = dir.join(binary);
        candidate.is_file()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::NullObserver;
    use tempfile::TempDir;

    fn test_config(save_dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            assistant_binary: "sh".to_string(),
            save_dir: save_dir.to_path_buf(),
            working_dir: std::env::temp_dir(),
            max_cycles: 3,
            cycle_deadline_secs: 5,
            kill_grace_secs: 1,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_precondition_fails_when_breaker_already_open() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        {
            let mut breaker =
                CircuitBreaker::load(&config.save_dir, config.breaker.no_progress, config.breaker.repeated_error)
                    .unwrap();
            for _ in 0..config.breaker.no_progress {
                breaker.record_no_progress();
            }
        }

        let mut controller = IterationController::new(config).unwrap();
        let cancel = CancellationToken::new();
        let summary = controller
            .run("do something", &cancel, Arc::new(NullObserver))
            .await
            .unwrap();
        assert_eq!(summary.termination_reason, TerminationReason::CircuitOpen);
        assert_eq!(summary.cycles_executed, 0);
    }

    #[tokio::test]
    async fn test_precondition_fails_on_unreachable_binary() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.assistant_binary = "definitely-not-a-real-binary-xyz".to_string();
        let mut controller = IterationController::new(config).unwrap();
        let cancel = CancellationToken::new();
        let summary = controller
            .run("do something", &cancel, Arc::new(NullObserver))
            .await
            .unwrap();
        assert_eq!(summary.termination_reason, TerminationReason::ConfigError);
    }

    #[tokio::test]
    async fn test_max_cycles_reached_without_completion() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.max_cycles = 2;
        config.promise_tag = "<totally-unique-marker-xyz>".to_string();
        let mut controller = IterationController::new(config).unwrap();
        let cancel = CancellationToken::new();
        let summary = controller
            .run("-c 'echo nothing interesting here'", &cancel, Arc::new(NullObserver))
            .await
            .unwrap();
        assert_eq!(summary.termination_reason, TerminationReason::MaxCyclesReached);
        assert_eq!(summary.cycles_executed, 2);
        assert_eq!(summary.records.len(), 2);
    }

    #[tokio::test]
    async fn test_promise_tag_in_output_completes_run() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.promise_tag = "<ralph-done>".to_string();
        let mut controller = IterationController::new(config).unwrap();
        let cancel = CancellationToken::new();
        let summary = controller
            .run("-c 'echo <ralph-done>'", &cancel, Arc::new(NullObserver))
            .await
            .unwrap();
        assert_eq!(summary.termination_reason, TerminationReason::TaskComplete);
        assert_eq!(summary.cycles_executed, 1);
    }

    #[tokio::test]
    async fn test_repeated_identical_output_triggers_stuck_or_circuit_open() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.max_cycles = 10;
        config.breaker.no_progress = 2;
        config.promise_tag = "<totally-unique-marker-xyz>".to_string();
        let mut controller = IterationController::new(config).unwrap();
        let cancel = CancellationToken::new();
        let summary = controller
            .run("-c 'echo identical output every time'", &cancel, Arc::new(NullObserver))
            .await
            .unwrap();
        assert!(matches!(
            summary.termination_reason,
            TerminationReason::Stuck | TerminationReason::CircuitOpen
        ));
        assert!(summary.cycles_executed <= 10);
    }

    #[test]
    fn test_compose_prompt_is_deterministic() {
        let config = EngineConfig::default();
        let a = compose_prompt("build the feature", &config);
        let b = compose_prompt("build the feature", &config);
        assert_eq!(a, b);
        assert!(a.contains(&config.promise_tag));
    }

    #[test]
    fn test_binary_reachable_finds_common_shell() {
        assert!(binary_reachable("sh"));
    }

    #[test]
    fn test_binary_reachable_rejects_unknown_name() {
        assert!(!binary_reachable("definitely-not-a-real-binary-xyz"));
    }
}
