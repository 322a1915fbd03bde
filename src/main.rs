//! CLI entry point for the iteration engine.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use iterate::{
    CircuitBreaker, EngineConfig, HistoryStore, IterationController, ProgressWriter, RunDisplay,
};

/// An autonomous iteration engine that drives an AI coding assistant through
/// observe-reflect-act cycles.
#[derive(Debug, Parser)]
#[command(name = "iterate", version, about)]
struct Args {
    /// The initial prompt for the assistant. May also be given positionally.
    #[arg(long = "prompt")]
    prompt_flag: Option<String>,

    /// Positional form of the initial prompt.
    prompt_positional: Option<String>,

    /// Path to a TOML config file.
    #[arg(long, default_value = "iterate.toml")]
    config: PathBuf,

    /// Override the configured maximum number of cycles.
    #[arg(long)]
    max_cycles: Option<u32>,

    /// Override the configured per-cycle deadline, in seconds.
    #[arg(long)]
    cycle_deadline: Option<u64>,

    /// Override the configured total-run deadline, in seconds.
    #[arg(long)]
    total_deadline: Option<u64>,

    /// Persistence root directory.
    #[arg(long, default_value = ".iterate")]
    save_dir: PathBuf,

    /// Reset a previously-OPEN circuit breaker to HALF_OPEN and exit.
    #[arg(long)]
    reset: bool,

    /// Print the latest history summary and circuit state, then exit.
    #[arg(long)]
    status: bool,
}

impl Args {
    fn resolved_prompt(&self) -> Option<&str> {
        self.prompt_flag
            .as_deref()
            .or(self.prompt_positional.as_deref())
    }
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = if args.config.exists() {
        EngineConfig::from_path(&args.config)?
    } else {
        EngineConfig::default()
    };

    config.save_dir = args.save_dir.clone();
    if let Some(max_cycles) = args.max_cycles {
        config.max_cycles = max_cycles;
    }
    if let Some(cycle_deadline) = args.cycle_deadline {
        config.cycle_deadline_secs = cycle_deadline;
    }
    if let Some(total_deadline) = args.total_deadline {
        config.total_deadline_secs = Some(total_deadline);
    }

    config.validate().context("configuration is invalid")?;
    Ok(config)
}

fn run_reset(config: &EngineConfig) -> Result<()> {
    let mut breaker = CircuitBreaker::load(
        &config.save_dir,
        config.breaker.no_progress,
        config.breaker.repeated_error,
    )?;
    breaker.reset();
    eprintln!("circuit breaker reset; new state: {:?}", breaker.state());
    Ok(())
}

fn run_status(config: &EngineConfig) -> Result<()> {
    let breaker = CircuitBreaker::load(
        &config.save_dir,
        config.breaker.no_progress,
        config.breaker.repeated_error,
    )?;
    let history = HistoryStore::open(&config.save_dir, config.history_retention)?;
    let progress_writer = ProgressWriter::new(&config.save_dir)?;

    eprintln!("{}", "circuit breaker".bold());
    eprintln!("  state: {:?}", breaker.state());
    eprintln!("  no_progress_count: {}", breaker.snapshot().no_progress_count);
    eprintln!("  repeated_error_count: {}", breaker.snapshot().repeated_error_count);

    eprintln!("\n{}", "history".bold());
    let snapshot = history.snapshot();
    eprintln!("  total: {}", snapshot.total);
    eprintln!("  completions: {}", snapshot.completions);
    eprintln!("  failures: {}", snapshot.failures);
    eprintln!("  timeouts: {}", snapshot.timeouts);

    if let Some(progress) = progress_writer.read()? {
        eprintln!("\n{}", "progress".bold());
        eprintln!("  status: {:?}", progress.current_status);
        eprintln!("  cycle: {}/{}", progress.current_cycle, progress.max_cycles);
    }

    Ok(())
}

fn exit_with(code: i32) -> ! {
    std::process::exit(code);
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.reset {
        let config = load_config(&args)?;
        run_reset(&config)?;
        return Ok(());
    }

    if args.status {
        let config = load_config(&args)?;
        run_status(&config)?;
        return Ok(());
    }

    let Some(prompt) = args.resolved_prompt() else {
        eprintln!(
            "{}",
            "error: a prompt is required (use --prompt or pass it positionally)".red()
        );
        exit_with(7);
    };

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red().bold());
            exit_with(7);
        }
    };

    let cancel = CancellationToken::new();
    let sigint_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            sigint_cancel.cancel();
        }
    });

    let display = Arc::new(RunDisplay::new(prompt));
    display.print_run_header();

    let mut controller = IterationController::new(config)?;
    let observer = Arc::clone(&display) as Arc<dyn iterate::StreamObserver>;
    let summary = controller.run(prompt, &cancel, observer).await?;

    display.print_summary(&summary);

    exit_with(summary.termination_reason.exit_code());
}
