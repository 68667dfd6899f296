//! Pane-content normalization for stable change detection.
//!
//! Raw pane text is non-deterministic: cursor blink redraws, elapsed-time
//! counters and progress percentages change without the agent doing
//! anything. Normalization strips ANSI escape sequences and replaces the
//! volatile substrings with fixed tokens so two captures of an idle pane
//! hash identically.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

/// One alternation per escape family, longest forms first so a CSI or OSC
/// introducer is never half-eaten by the catch-all `ESC <char>` arm:
/// CSI `ESC [ params intermediates final`, OSC `ESC ] ... (BEL | ESC \)`,
/// the single-byte CSI `U+009B`, any remaining two-char escape, and a
/// dangling ESC at end of capture.
const ANSI_PATTERN: &str = concat!(
    r"\x1b\[[0-?]*[ -/]*[@-~]",
    r"|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)?",
    r"|\x9b[0-?]*[ -/]*[@-~]",
    r"|\x1b.",
    r"|\x1b",
);

fn ansi_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(ANSI_PATTERN).expect("ansi regex"))
}

/// Strip ANSI escape sequences and carriage returns from captured text.
pub fn strip_ansi(input: &str) -> String {
    let stripped = ansi_regex().replace_all(input, "");
    if stripped.contains('\r') {
        stripped.replace('\r', "")
    } else {
        stripped.into_owned()
    }
}

fn time_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Deliberately loose: any H:MM:SS-shaped run is treated as a clock, even
    // when it is really something else. A false replacement only costs a
    // little diff sensitivity; a missed one makes an idle pane look active.
    RE.get_or_init(|| Regex::new(r"\d{1,2}:\d{2}:\d{2}|\d{4}-\d{2}-\d{2}").expect("time regex"))
}

fn percent_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+%").expect("percent regex"))
}

/// Normalize pane content: strip ANSI, replace clocks/dates/percentages with
/// fixed tokens, trim surrounding whitespace.
pub fn normalize(content: &str) -> String {
    let stripped = strip_ansi(content);
    let no_times = time_regex().replace_all(&stripped, "<TIME>");
    let no_percents = percent_regex().replace_all(&no_times, "<PCT>");
    no_percents.trim().to_string()
}

/// SHA-256 hex digest of arbitrary text.
pub fn digest(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Digest of the normalized content. Two captures that differ only by ANSI
/// sequences, clocks, dates or percentages hash identically.
pub fn normalized_digest(content: &str) -> String {
    digest(&normalize(content))
}
