//! Response analyzer: pure classification of a single assistant transcript.
//!
//! `analyze` takes a transcript and the previous cycle's transcript digest
//! and returns an [`AnalyzerVerdict`]. It performs no I/O and touches no
//! external state, so the same transcript always yields the same verdict.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::config::EngineConfig;

/// Parsed contents of a structured status block, if one was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredStatus {
    /// The `EXIT_SIGNAL` value.
    pub exit_signal: bool,
    /// The `REASON` value, if present.
    pub reason: Option<String>,
    /// The `TASKS_DONE` value, if present, as the raw `m/n` string.
    pub tasks_done: Option<String>,
    /// Whether the block was delimited by the legacy marker pair.
    pub used_legacy_markers: bool,
}

/// The verdict produced by analyzing one transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzerVerdict {
    /// Whether the assistant signaled task completion.
    pub completed: bool,
    /// Accumulated heuristic score (promise tag and structured signals saturate it high).
    pub score: u32,
    /// Indicator tags that contributed to the score.
    pub indicators: BTreeSet<String>,
    /// Whether this cycle looks stuck relative to the previous one.
    pub stuck: bool,
    /// The parsed structured status block, if one was present.
    pub structured_status: Option<StructuredStatus>,
    /// Content digest of the normalized transcript, for the next cycle's comparison.
    pub digest: String,
}

/// Completion phrases; each occurrence contributes `+10` and one indicator tag.
const COMPLETION_PHRASES: &[&str] = &[
    "task is complete",
    "task complete",
    "i have completed",
    "implementation is complete",
    "all done",
    "finished implementing",
];

/// "No remaining work" phrases; each occurrence contributes `+15` and one indicator tag.
const NO_REMAINING_WORK_PHRASES: &[&str] = &[
    "no further action",
    "no remaining work",
    "nothing left to do",
    "no more changes needed",
];

const COMPLETION_PHRASE_SCORE: u32 = 10;
const NO_REMAINING_WORK_SCORE: u32 = 15;
const STRUCTURED_SIGNAL_SCORE: u32 = 100;

/// Compute the content digest of a transcript.
///
/// Strips ANSI escape sequences and trailing whitespace on each line before
/// hashing so cosmetic variation between otherwise-identical cycles does not
/// defeat stuck detection.
#[must_use]
pub fn digest(transcript: &str) -> String {
    let normalized = normalize(transcript);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn normalize(transcript: &str) -> String {
    strip_ansi(transcript)
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Strip ANSI CSI escape sequences (`ESC [ ... letter`) from a string.
fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next();
            for next in chars.by_ref() {
                if next.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Strip the markdown formatting the heuristic should not be fooled by:
/// code fences, bold/italic markers, and link syntax.
fn strip_markdown(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '`' | '*' | '_' => {}
            '[' | ']' | '(' | ')' => {}
            _ => out.push(c),
        }
    }
    out
}

fn find_status_block<'a>(
    transcript: &'a str,
    start: &str,
    end: &str,
) -> Option<&'a str> {
    let start_idx = transcript.find(start)?;
    let after_start = start_idx + start.len();
    let end_idx = transcript[after_start..].find(end)?;
    Some(&transcript[after_start..after_start + end_idx])
}

fn parse_status_block(body: &str, used_legacy_markers: bool) -> Option<StructuredStatus> {
    let mut exit_signal = None;
    let mut reason = None;
    let mut tasks_done = None;

    for raw_line in body.split(['\n', '\r']) {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_uppercase();
        let value = value.trim();
        match key.as_str() {
            "EXIT_SIGNAL" => exit_signal = Some(value.eq_ignore_ascii_case("true")),
            "REASON" => reason = Some(value.to_string()),
            "TASKS_DONE" => tasks_done = Some(value.to_string()),
            _ => {}
        }
    }

    exit_signal.map(|exit_signal| StructuredStatus {
        exit_signal,
        reason,
        tasks_done,
        used_legacy_markers,
    })
}

fn scan_structured_status(transcript: &str, config: &EngineConfig) -> Option<StructuredStatus> {
    let markers = &config.status_markers;
    if let Some(body) = find_status_block(transcript, &markers.start, &markers.end) {
        if let Some(status) = parse_status_block(body, false) {
            return Some(status);
        }
    }
    if let Some(body) = find_status_block(transcript, &markers.legacy_start, &markers.legacy_end) {
        if let Some(status) = parse_status_block(body, true) {
            return Some(status);
        }
    }
    None
}

fn natural_language_score(transcript: &str) -> (u32, BTreeSet<String>) {
    let stripped = strip_markdown(transcript).to_lowercase();
    let mut score = 0;
    let mut indicators = BTreeSet::new();

    for phrase in COMPLETION_PHRASES {
        if stripped.contains(phrase) {
            score += COMPLETION_PHRASE_SCORE;
            indicators.insert((*phrase).to_string());
        }
    }
    for phrase in NO_REMAINING_WORK_PHRASES {
        if stripped.contains(phrase) {
            score += NO_REMAINING_WORK_SCORE;
            indicators.insert((*phrase).to_string());
        }
    }

    (score, indicators)
}

/// Analyze a transcript and return the verdict.
///
/// `previous_digest` is the digest returned for the prior cycle's transcript,
/// or `None` on the first cycle.
#[must_use]
pub fn analyze(
    transcript: &str,
    previous_digest: Option<&str>,
    config: &EngineConfig,
) -> AnalyzerVerdict {
    let current_digest = digest(transcript);
    let stuck = previous_digest.is_some_and(|prev| prev == current_digest);

    // Layer 1: promise tag.
    let promise_tag_present = transcript.contains(&config.promise_tag);

    // Layer 2: structured status block.
    let structured_status = scan_structured_status(transcript, config);
    let structured_exit = structured_status.as_ref().is_some_and(|s| s.exit_signal);

    // Layer 3: natural-language heuristic.
    let (mut score, mut indicators) = natural_language_score(transcript);
    if structured_exit {
        score += STRUCTURED_SIGNAL_SCORE;
        indicators.insert("structured_exit_signal".to_string());
    }
    if promise_tag_present {
        score += STRUCTURED_SIGNAL_SCORE;
        indicators.insert("promise_tag".to_string());
    }

    let heuristic_completed =
        score >= config.score_threshold && indicators.len() >= config.min_indicators;

    let completed = promise_tag_present || structured_exit || heuristic_completed;

    AnalyzerVerdict {
        completed,
        score,
        indicators,
        stuck,
        structured_status,
        digest: current_digest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    #[test]
    fn test_empty_transcript_not_completed_not_stuck() {
        let verdict = analyze("", None, &config());
        assert!(!verdict.completed);
        assert!(!verdict.stuck);
    }

    #[test]
    fn test_promise_tag_anywhere_completes() {
        let transcript = "some prose\n<ralph-done>\nmore prose";
        let verdict = analyze(transcript, None, &config());
        assert!(verdict.completed);
        assert!(verdict.indicators.contains("promise_tag"));
    }

    #[test]
    fn test_promise_tag_inside_code_fence_still_completes() {
        let transcript = "```\n<ralph-done>\n```";
        let verdict = analyze(transcript, None, &config());
        assert!(verdict.completed);
    }

    #[test]
    fn test_structured_block_exit_true_completes() {
        let transcript = "work done\n<<<ITERATE_STATUS>>>\nEXIT_SIGNAL: true\nREASON: done\n<<<END_ITERATE_STATUS>>>";
        let verdict = analyze(transcript, None, &config());
        assert!(verdict.completed);
        assert_eq!(
            verdict.structured_status.unwrap().reason,
            Some("done".to_string())
        );
    }

    #[test]
    fn test_structured_block_exit_false_does_not_complete_alone() {
        let transcript = "<<<ITERATE_STATUS>>>\nEXIT_SIGNAL: false\n<<<END_ITERATE_STATUS>>>";
        let verdict = analyze(transcript, None, &config());
        assert!(!verdict.completed);
    }

    #[test]
    fn test_legacy_markers_accepted() {
        let transcript = "<<START>>EXIT_SIGNAL: true\nREASON: done<<END>>";
        let verdict = analyze(transcript, None, &config());
        assert!(verdict.completed);
        assert!(verdict.structured_status.unwrap().used_legacy_markers);
    }

    #[test]
    fn test_structured_block_tolerates_crlf_and_indentation() {
        let transcript = "<<<ITERATE_STATUS>>>\r\n  EXIT_SIGNAL: TRUE\r\n<<<END_ITERATE_STATUS>>>";
        let verdict = analyze(transcript, None, &config());
        assert!(verdict.completed);
    }

    #[test]
    fn test_natural_language_heuristic_completes_above_threshold() {
        let transcript = "The task is complete. There is no remaining work.";
        let verdict = analyze(transcript, None, &config());
        assert!(verdict.completed);
        assert!(verdict.score >= 20);
    }

    #[test]
    fn test_natural_language_below_threshold_does_not_complete() {
        let transcript = "I am working on the task complete feature request.";
        // Contains the substring "task complete" once: score 10, below threshold 20.
        let verdict = analyze(transcript, None, &config());
        assert!(!verdict.completed);
    }

    #[test]
    fn test_stuck_when_digest_matches_previous() {
        let transcript = "I cannot proceed without more context.";
        let prev_digest = digest(transcript);
        let verdict = analyze(transcript, Some(&prev_digest), &config());
        assert!(verdict.stuck);
    }

    #[test]
    fn test_not_stuck_when_digest_differs() {
        let verdict = analyze("new output", Some(&digest("old output")), &config());
        assert!(!verdict.stuck);
    }

    #[test]
    fn test_digest_ignores_trailing_whitespace_and_ansi() {
        let a = "line one   \nline two";
        let b = "\u{1b}[32mline one\u{1b}[0m\nline two   ";
        assert_eq!(digest(a), digest(b));
    }

    #[test]
    fn test_analyze_is_deterministic() {
        let transcript = "some output <ralph-done> more";
        let v1 = analyze(transcript, None, &config());
        let v2 = analyze(transcript, None, &config());
        assert_eq!(v1, v2);
    }

    #[test]
    fn test_score_and_indicators_recorded_even_when_not_completed() {
        let transcript = "task complete";
        let verdict = analyze(transcript, None, &config());
        assert!(verdict.score > 0);
        assert!(!verdict.indicators.is_empty());
    }
}
