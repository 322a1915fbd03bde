//! Terminal display for a running engine.
//!
//! Renders raw assistant output and a post-run summary to stderr so stdout
//! remains clean for piping. Line streaming is implemented as a
//! [`StreamObserver`] so it can be handed directly to the executor.

use colored::Colorize;

use crate::controller::RunSummary;
use crate::error::TerminationReason;
use crate::executor::StreamObserver;

/// Live display handler for one run.
pub struct RunDisplay {
    prompt_preview: String,
}

impl RunDisplay {
    /// Create a display for a run started with `prompt`.
    #[must_use]
    pub fn new(prompt: &str) -> Self {
        Self {
            prompt_preview: truncate(prompt, 80),
        }
    }

    /// Print the run header before the first cycle starts.
    pub fn print_run_header(&self) {
        eprintln!("{}", "─".repeat(60).dimmed());
        eprintln!("{} {}", "iterate".bold().cyan(), self.prompt_preview.dimmed());
        eprintln!("{}", "─".repeat(60).dimmed());
    }

    /// Print the header shown at the start of each cycle.
    pub fn print_cycle_header(&self, cycle_index: u32, max_cycles: u32) {
        eprintln!(
            "\n{} {}",
            "===".bold().cyan(),
            format!("Cycle {cycle_index}/{max_cycles}").bold().cyan()
        );
    }

    /// Print the final run summary after the controller returns.
    pub fn print_summary(&self, summary: &RunSummary) {
        eprintln!("\n{}", "─".repeat(60).dimmed());
        let status = if summary.termination_reason.is_success() {
            "COMPLETED".green().bold().to_string()
        } else {
            format!("STOPPED: {:?}", summary.termination_reason).yellow().bold().to_string()
        };
        eprintln!("  {status}");
        eprintln!("  {}", summary.termination_reason.to_string().dimmed());
        eprintln!(
            "  {} {} cycle(s) | {:.1}s total",
            "Stats:".dimmed(),
            summary.cycles_executed,
            summary.total_duration.as_secs_f64()
        );
        if let Some(last) = summary.records.last() {
            if let Some(verdict) = &last.verdict {
                eprintln!(
                    "  {} score {} | {} indicator(s)",
                    "Last verdict:".dimmed(),
                    verdict.score,
                    verdict.indicators.len()
                );
            }
        }
        eprintln!("{}", "─".repeat(60).dimmed());
    }

    /// Print a one-line notice when the circuit breaker trips.
    pub fn print_circuit_open_notice(&self) {
        eprintln!(
            "  {} {}",
            "⚠".yellow().bold(),
            "circuit breaker is open; run with --reset to clear it".yellow()
        );
    }
}

impl StreamObserver for RunDisplay {
    fn on_stdout_line(&self, line: &str) {
        println!("{line}");
    }

    fn on_stderr_line(&self, line: &str) {
        eprintln!("  {} {}", "│".dimmed(), line.dimmed());
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() > max {
        format!("{}...", &text[..max.saturating_sub(3)])
    } else {
        text.to_string()
    }
}

/// Render a one-line hint for a given termination reason, used by `main.rs`
/// when reporting the final exit.
#[must_use]
pub fn exit_hint(reason: TerminationReason) -> String {
    match reason {
        TerminationReason::TaskComplete => "done".to_string(),
        other => other.to_string(),
    }
}
