//! Surface pattern matching over pane content.
//!
//! Nothing here understands the agent; these are literal substrings and a
//! few structural checks over the lowercased pane text. The prompt set
//! marks "the agent is waiting on a confirmation"; the completion set marks
//! "the agent believes it is finished" and only matters in continuous mode.

use std::time::Duration;

/// Phrases that indicate the agent is blocked on a confirmation prompt.
const PROMPT_PATTERNS: &[&str] = &[
    "i need confirmation to proceed",
    "should i continue?",
    "do you want me to continue?",
    "would you like me to proceed?",
    "press any key to continue",
    "continue? (y/n)",
    "proceed? (y/n)",
    "[y/n]",
    "(y/n)",
    "type 'continue' to proceed",
    "waiting for confirmation",
    "claude code is waiting",
    "do you want to proceed?",
    "1. yes",
    "> 1. yes",
];

/// Agent-specific phrases that indicate a completed work cycle.
const COMPLETION_PATTERNS: &[&str] = &[
    "what's working now:",
    "all essential features implemented",
    "auto-accept edits on",
    "context left until auto-compact:",
    "workflow complete",
];

/// Whether the content matches any prompt pattern or confirmation structure.
pub fn has_prompt_pattern(content: &str) -> bool {
    let lower = content.to_lowercase();

    if PROMPT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return true;
    }

    // "Do you want to <action>?" in any phrasing.
    if lower.contains("do you want to") && lower.contains('?') {
        return true;
    }
    // Numbered yes/no options.
    if lower.contains("1.") && lower.contains("yes") && lower.contains("2.") && lower.contains("no")
    {
        return true;
    }
    if lower.contains("(yes/no)") || lower.contains("(esc)") {
        return true;
    }
    // A bare prompt at the end of the buffer.
    if content.contains("\n> ") || content.trim_end().ends_with('>') {
        return true;
    }

    false
}

/// Whether the content matches any completion pattern.
pub fn has_completion_pattern(content: &str) -> bool {
    let lower = content.to_lowercase();
    COMPLETION_PATTERNS.iter().any(|p| lower.contains(p))
}

/// The built-in continue candidates, tried in order.
pub fn default_candidates() -> Vec<String> {
    ["1", "continue", "yes", "y", "proceed", "\n"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Pick continue candidates for the current pane content.
///
/// `continuous_remaining` is `Some` when the instance is in continuous mode:
/// `Some(Duration::ZERO)` means indefinite, anything else is the time left.
pub fn select_candidates(
    content: &str,
    continuous_remaining: Option<Duration>,
    defaults: &[String],
) -> Vec<String> {
    let lower = content.to_lowercase();
    let mut candidates: Vec<String> = if defaults.is_empty() {
        default_candidates()
    } else {
        defaults.to_vec()
    };

    if let Some(remaining) = continuous_remaining {
        if has_completion_pattern(content) {
            let message = if remaining.is_zero() {
                "/continuous You're in continuous mode (indefinite duration). Keep working on \
                 any remaining tasks or improvements. The system will auto-continue when you \
                 complete each task."
                    .to_string()
            } else {
                format!(
                    "/continuous You're in continuous mode. Time remaining: {}. Keep working \
                     on any remaining tasks or improvements.",
                    format_remaining(remaining)
                )
            };
            return vec![message, "continue".to_string(), "\n".to_string()];
        }
    }

    // A "don't ask again" option beats a plain yes; it is usually option 2.
    if lower.contains("don't ask again") && lower.contains("2.") {
        candidates = ["2", "yes", "1", "y", "continue"]
            .iter()
            .map(|s| s.to_string())
            .collect();
    }

    if lower.contains("do you want to create") {
        candidates = ["1", "yes", "y"].iter().map(|s| s.to_string()).collect();
    }

    candidates
}

/// Format a duration as `1h 2m 3s` / `2m 3s` / `3s`.
pub fn format_remaining(remaining: Duration) -> String {
    let total = remaining.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_prompt_patterns_match_case_insensitively() {
        assert!(has_prompt_pattern("Continue? (y/n)"));
        assert!(has_prompt_pattern("PRESS ANY KEY TO CONTINUE"));
        assert!(has_prompt_pattern("pick one:\n1. Yes\n2. No"));
    }

    #[test]
    fn structural_prompts_match() {
        assert!(has_prompt_pattern("Do you want to delete this file?"));
        assert!(has_prompt_pattern("output\n> "));
        assert!(has_prompt_pattern("done >"));
    }

    #[test]
    fn plain_output_is_not_a_prompt() {
        assert!(!has_prompt_pattern("compiling corral v0.3.1 (lib)"));
        assert!(!has_prompt_pattern("wrote 3 files"));
    }

    #[test]
    fn completion_patterns_match() {
        assert!(has_completion_pattern("What's Working Now:\n- everything"));
        assert!(has_completion_pattern("auto-accept edits on"));
        assert!(!has_completion_pattern("still running the tests"));
    }

    #[test]
    fn default_candidates_start_with_numbered_choice() {
        let candidates = default_candidates();
        assert_eq!(candidates[0], "1");
        assert!(candidates.contains(&"continue".to_string()));
        assert!(candidates.contains(&"\n".to_string()));
    }

    #[test]
    fn dont_ask_again_prefers_option_two() {
        let content = "1. Yes\n2. Yes, and don't ask again\n3. No";
        let candidates = select_candidates(content, None, &default_candidates());
        assert_eq!(candidates[0], "2");
    }

    #[test]
    fn create_file_prompt_prefers_yes() {
        let content = "Do you want to create src/main.rs?";
        let candidates = select_candidates(content, None, &default_candidates());
        assert_eq!(candidates, vec!["1", "yes", "y"]);
    }

    #[test]
    fn continuous_completion_leads_with_slash_command() {
        let content = "What's Working Now:\n- all done";
        let remaining = Duration::from_secs(25 * 60);
        let candidates =
            select_candidates(content, Some(remaining), &default_candidates());
        assert!(candidates[0].starts_with("/continuous "));
        assert!(candidates[0].contains("25m 0s"));
        assert_eq!(candidates[1], "continue");
    }

    #[test]
    fn continuous_indefinite_message() {
        let content = "auto-accept edits on";
        let candidates =
            select_candidates(content, Some(Duration::ZERO), &default_candidates());
        assert!(candidates[0].contains("indefinite duration"));
    }

    #[test]
    fn continuous_without_completion_uses_defaults() {
        let content = "Do you want to proceed?\n1. Yes\n2. No\n> ";
        let candidates =
            select_candidates(content, Some(Duration::from_secs(60)), &default_candidates());
        assert_eq!(candidates[0], "1");
    }

    #[test]
    fn remaining_time_formats() {
        assert_eq!(format_remaining(Duration::from_secs(3 * 3600 + 62)), "3h 1m 2s");
        assert_eq!(format_remaining(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_remaining(Duration::from_secs(9)), "9s");
    }
}
