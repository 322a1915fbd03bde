//! iterate - an autonomous iteration engine for AI coding assistants
//!
//! iterate drives an external assistant binary through repeated
//! observe-reflect-act cycles against a single prompt, stopping when the
//! assistant signals completion, a configured budget is exhausted, or a
//! circuit breaker trips after repeated non-progress.

// Allow multiple crate versions from dependencies (can't easily control)
#![allow(clippy::multiple_crate_versions)]

pub mod analyzer;
pub mod circuit_breaker;
pub mod config;
pub mod controller;
pub mod display;
pub mod error;
pub mod executor;
pub mod history;
pub mod progress;

pub use analyzer::{analyze, AnalyzerVerdict, StructuredStatus};
pub use circuit_breaker::{BreakerState, BreakerStateKind, CircuitBreaker};
pub use config::{BreakerThresholds, EngineConfig, StatusBlockMarkers};
pub use controller::{IterationController, RunSummary};
pub use display::RunDisplay;
pub use error::TerminationReason;
pub use executor::{ChildExecutor, ExecuteError, ExecuteOutcome, NullObserver, StreamObserver};
pub use history::{CycleOutcome, ExecutionRecord, HistorySnapshot, HistoryStore};
pub use progress::{ProgressWriter, RunProgress, RunStatus};
