//! Engine configuration.
//!
//! `EngineConfig` is parsed from a TOML file and overlaid with CLI flags
//! (see `main.rs`). It is immutable for the lifetime of one engine run and
//! read-only to every component except the controller that owns it.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// The two accepted delimiter pairs for the structured status block.
///
/// The newer pair is the one the prompt directive instructs the assistant to
/// emit; the legacy pair is accepted read-only for migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBlockMarkers {
    /// Current start delimiter, e.g. `<<<ITERATE_STATUS>>>`.
    pub start: String,
    /// Current end delimiter, e.g. `<<<END_ITERATE_STATUS>>>`.
    pub end: String,
    /// Legacy start delimiter accepted for backward compatibility.
    pub legacy_start: String,
    /// Legacy end delimiter accepted for backward compatibility.
    pub legacy_end: String,
}

impl Default for StatusBlockMarkers {
    fn default() -> Self {
        Self {
            start: "<<<ITERATE_STATUS>>>".to_string(),
            end: "<<<END_ITERATE_STATUS>>>".to_string(),
            legacy_start: "<<START>>".to_string(),
            legacy_end: "<<END>>".to_string(),
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerThresholds {
    /// Consecutive no-progress cycles before the breaker opens (N1).
    #[serde(default = "default_no_progress_threshold")]
    pub no_progress: u32,
    /// Consecutive repeated-error cycles before the breaker opens (N2).
    #[serde(default = "default_repeated_error_threshold")]
    pub repeated_error: u32,
}

const fn default_no_progress_threshold() -> u32 {
    3
}

const fn default_repeated_error_threshold() -> u32 {
    3
}

impl Default for BreakerThresholds {
    fn default() -> Self {
        Self {
            no_progress: default_no_progress_threshold(),
            repeated_error: default_repeated_error_threshold(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of cycles to run before stopping with `MAX_CYCLES_REACHED`.
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
    /// Per-invocation wall-clock deadline, in seconds.
    #[serde(default = "default_cycle_deadline_secs")]
    pub cycle_deadline_secs: u64,
    /// Total wall-clock deadline for the whole run, in seconds. `None` means no total deadline.
    #[serde(default)]
    pub total_deadline_secs: Option<u64>,
    /// Circuit breaker thresholds.
    #[serde(default)]
    pub breaker: BreakerThresholds,
    /// Path to the assistant binary.
    #[serde(default = "default_assistant_binary")]
    pub assistant_binary: String,
    /// Working directory the assistant runs in.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// Directory under which circuit-breaker state, history, and progress are persisted.
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,
    /// Model identifier passed through to the assistant, if any.
    #[serde(default)]
    pub model: Option<String>,
    /// The promise-tag literal the assistant is instructed to emit on completion.
    #[serde(default = "default_promise_tag")]
    pub promise_tag: String,
    /// Structured status block delimiters.
    #[serde(default)]
    pub status_markers: StatusBlockMarkers,
    /// Natural-language heuristic score threshold for `completed`.
    #[serde(default = "default_score_threshold")]
    pub score_threshold: u32,
    /// Minimum number of distinct indicator tags required alongside the score threshold.
    #[serde(default = "default_min_indicators")]
    pub min_indicators: usize,
    /// Substrings on stderr lines that are suppressed from display (known-harmless warnings).
    #[serde(default)]
    pub suppressed_stderr_patterns: Vec<String>,
    /// Grace period between SIGTERM and SIGKILL when killing the process tree, in seconds.
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
    /// Maximum number of per-cycle records retained on disk and in the in-memory
    /// ordered list; older cycle files are pruned once this is exceeded. Aggregate
    /// counters are unaffected by pruning.
    #[serde(default = "default_history_retention")]
    pub history_retention: u32,
    /// Assistant does not prompt for approval on file edits or shell commands.
    #[serde(default = "default_true")]
    pub auto_approve_all: bool,
    /// Assistant ignores project-local instruction files it would otherwise auto-load.
    #[serde(default = "default_true")]
    pub disable_external_instructions: bool,
    /// Assistant does not route work through its built-in plugin servers.
    #[serde(default = "default_true")]
    pub disable_plugin_servers: bool,
    /// Environment variable names stripped from the child's environment before spawn,
    /// to prevent engine-level configuration from leaking into the assistant's own
    /// child-process spawning.
    #[serde(default = "default_stripped_env_vars")]
    pub stripped_env_vars: Vec<String>,
}

const fn default_max_cycles() -> u32 {
    20
}

const fn default_cycle_deadline_secs() -> u64 {
    180
}

fn default_assistant_binary() -> String {
    "claude".to_string()
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_save_dir() -> PathBuf {
    PathBuf::from(".iterate")
}

fn default_promise_tag() -> String {
    "<ralph-done>".to_string()
}

const fn default_score_threshold() -> u32 {
    20
}

const fn default_min_indicators() -> usize {
    1
}

const fn default_kill_grace_secs() -> u64 {
    5
}

const fn default_history_retention() -> u32 {
    200
}

const fn default_true() -> bool {
    true
}

fn default_stripped_env_vars() -> Vec<String> {
    vec![
        "ASSISTANT_AUTO_APPROVE".to_string(),
        "ASSISTANT_DISABLE_PLUGINS".to_string(),
        "ASSISTANT_CONFIG_DIR".to_string(),
    ]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_cycles: default_max_cycles(),
            cycle_deadline_secs: default_cycle_deadline_secs(),
            total_deadline_secs: None,
            breaker: BreakerThresholds::default(),
            assistant_binary: default_assistant_binary(),
            working_dir: default_working_dir(),
            save_dir: default_save_dir(),
            model: None,
            promise_tag: default_promise_tag(),
            status_markers: StatusBlockMarkers::default(),
            score_threshold: default_score_threshold(),
            min_indicators: default_min_indicators(),
            suppressed_stderr_patterns: Vec::new(),
            kill_grace_secs: default_kill_grace_secs(),
            history_retention: default_history_retention(),
            auto_approve_all: default_true(),
            disable_external_instructions: default_true(),
            disable_plugin_servers: default_true(),
            stripped_env_vars: default_stripped_env_vars(),
        }
    }
}

impl EngineConfig {
    /// Load and validate a config from a TOML file, falling back to defaults
    /// for any field the file omits.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, the TOML is malformed,
    /// or validation fails.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse and validate a config from a TOML string.
    ///
    /// # Errors
    /// Returns an error if the TOML is malformed or validation fails.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).context("Failed to parse engine config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field invariants.
    ///
    /// # Errors
    /// Returns an error describing the first invariant violation found.
    pub fn validate(&self) -> Result<()> {
        if self.max_cycles == 0 {
            bail!("max_cycles must be >= 1");
        }
        if self.cycle_deadline_secs == 0 {
            bail!("cycle_deadline_secs must be > 0");
        }
        if let Some(total) = self.total_deadline_secs {
            if total == 0 {
                bail!("total_deadline_secs must be > 0 when set");
            }
        }
        if self.breaker.no_progress == 0 {
            bail!("breaker.no_progress threshold must be >= 1");
        }
        if self.breaker.repeated_error == 0 {
            bail!("breaker.repeated_error threshold must be >= 1");
        }
        if self.assistant_binary.trim().is_empty() {
            bail!("assistant_binary must not be empty");
        }
        if self.promise_tag.trim().is_empty() {
            bail!("promise_tag must not be empty");
        }
        if self.history_retention == 0 {
            bail!("history_retention must be >= 1");
        }
        let markers = &self.status_markers;
        if markers.start == markers.end
            || markers.start == self.promise_tag
            || markers.end == self.promise_tag
        {
            bail!("promise_tag and status block markers must all be distinct");
        }
        if markers.start.is_empty() || markers.end.is_empty() {
            bail!("status block markers must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_minimal_toml_uses_defaults() {
        let config = EngineConfig::parse("").unwrap();
        assert_eq!(config.max_cycles, 20);
        assert_eq!(config.promise_tag, "<ralph-done>");
    }

    #[test]
    fn test_parse_overrides_fields() {
        let config = EngineConfig::parse(
            r#"
max_cycles = 5
cycle_deadline_secs = 60

[breaker]
no_progress = 2
repeated_error = 4
"#,
        )
        .unwrap();
        assert_eq!(config.max_cycles, 5);
        assert_eq!(config.cycle_deadline_secs, 60);
        assert_eq!(config.breaker.no_progress, 2);
        assert_eq!(config.breaker.repeated_error, 4);
    }

    #[test]
    fn test_rejects_zero_max_cycles() {
        let config = EngineConfig {
            max_cycles: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_cycle_deadline() {
        let config = EngineConfig {
            cycle_deadline_secs: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_total_deadline_when_set() {
        let config = EngineConfig {
            total_deadline_secs: Some(0),
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_breaker_thresholds() {
        let mut config = EngineConfig::default();
        config.breaker.no_progress = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.breaker.repeated_error = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_assistant_binary() {
        let config = EngineConfig {
            assistant_binary: String::new(),
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_promise_tag() {
        let config = EngineConfig {
            promise_tag: String::new(),
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_colliding_markers() {
        let mut config = EngineConfig::default();
        config.status_markers.start = config.status_markers.end.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_promise_tag_equal_to_marker() {
        let mut config = EngineConfig::default();
        config.status_markers.start = config.promise_tag.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_config_enables_all_safety_flags() {
        let config = EngineConfig::default();
        assert!(config.auto_approve_all);
        assert!(config.disable_external_instructions);
        assert!(config.disable_plugin_servers);
        assert!(!config.stripped_env_vars.is_empty());
    }

    #[test]
    fn test_rejects_zero_history_retention() {
        let config = EngineConfig {
            history_retention: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_toml_is_rejected() {
        let result = EngineConfig::parse("max_cycles = [this is not valid");
        assert!(result.is_err());
    }
}
