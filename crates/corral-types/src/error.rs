//! Error types shared across all corral crates.

use std::path::PathBuf;

/// Maximum length of an instance title.
pub const MAX_TITLE_LEN: usize = 32;

/// Errors that can occur across the corral runtime.
///
/// Precondition variants surface to the operator verbatim and are never
/// retried; isolation variants come from the tmux and git layers; the
/// restart-governance variants gate the resume-with-session-id path.
#[derive(Debug, thiserror::Error)]
pub enum CorralError {
    /// Instance title was empty at start time.
    #[error("instance title cannot be empty")]
    TitleEmpty,

    /// Instance title exceeds [`MAX_TITLE_LEN`].
    #[error("instance title cannot be longer than {} characters (got {len})", MAX_TITLE_LEN)]
    TitleTooLong { len: usize },

    /// Title contains characters unusable as a tmux session name or branch suffix.
    #[error("instance title may only contain letters, digits, '-' and '_': {title:?}")]
    TitleInvalid { title: String },

    /// Operation requires a started instance.
    #[error("instance has not been started")]
    InstanceNotStarted,

    /// Operation requires a running (non-paused) instance with a live pane.
    #[error("instance is not running")]
    InstanceNotRunning,

    /// Pause was called on an already-paused instance.
    #[error("instance is already paused")]
    InstanceAlreadyPaused,

    /// Resume was called on an instance that is not paused.
    #[error("can only resume paused instances")]
    InstanceNotPaused,

    /// The fleet-wide instance cap was hit.
    #[error("you can't create more than {cap} instances")]
    InstanceCapReached { cap: usize },

    /// The fleet already contains an instance with this title.
    #[error("an instance titled '{title}' already exists")]
    TitleTaken { title: String },

    /// No instance with this title exists in the fleet.
    #[error("no instance titled '{title}'")]
    UnknownInstance { title: String },

    /// Restart is only supported for agent programs that accept `-r <id>`.
    #[error("restart is only supported for claude sessions (program: {program})")]
    UnsupportedForProgram { program: String },

    /// Continuous-mode duration above the 24 h ceiling.
    #[error("continuous mode duration cannot exceed 24 hours")]
    DurationTooLong,

    /// The instance branch is checked out outside the instance's own worktree.
    #[error("branch '{branch}' is checked out elsewhere, please switch to a different branch")]
    WorktreeConflict { branch: String },

    /// Operation on a worktree record whose working tree was never created.
    #[error("worktree not set up: {0}")]
    NotSetup(String),

    /// An underlying git invocation failed.
    #[error("git command failed ({command}) status={status:?}: {stderr}")]
    Vcs {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    /// Could not create a new terminal pane.
    #[error("failed to start terminal session: {0}")]
    SessionStartFailed(String),

    /// Restore was attempted on a pane that no longer exists.
    #[error("terminal session '{name}' does not exist")]
    SessionMissing { name: String },

    /// Pane capture failed. `gone` distinguishes a vanished pane, which the
    /// crash-restart path keys on.
    #[error("failed to capture pane content: {message}")]
    CaptureFailed { gone: bool, message: String },

    /// Manual restart attempted inside the cooldown window.
    #[error("please wait {remaining_secs}s before restarting again")]
    RestartCoolingDown { remaining_secs: u64 },

    /// The agent's on-disk session history directory is missing or empty.
    #[error("no agent session files found in {}", dir.display())]
    SessionHistoryMissing { dir: PathBuf },

    /// Configuration loading or persistence error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Snapshot store read/write error.
    #[error("state store error: {0}")]
    Store(String),

    /// An operation failed and the best-effort cleanup that followed also
    /// failed; both messages are preserved.
    #[error("{original} (cleanup error: {cleanup})")]
    Cleanup {
        original: Box<CorralError>,
        cleanup: Box<CorralError>,
    },

    /// Several independent cleanup steps failed.
    #[error("multiple cleanup errors occurred:{}", join_errors(.0))]
    Multiple(Vec<CorralError>),
}

impl CorralError {
    /// Fold a cleanup failure into an originating error, preserving both.
    pub fn with_cleanup(self, cleanup: CorralError) -> CorralError {
        CorralError::Cleanup {
            original: Box::new(self),
            cleanup: Box::new(cleanup),
        }
    }

    /// Combine independent errors: none -> `Ok`, one -> itself, several ->
    /// [`CorralError::Multiple`].
    pub fn combine(mut errs: Vec<CorralError>) -> Result<(), CorralError> {
        match errs.len() {
            0 => Ok(()),
            1 => Err(errs.remove(0)),
            _ => Err(CorralError::Multiple(errs)),
        }
    }

    /// True when the error indicates the terminal pane no longer exists.
    pub fn pane_gone(&self) -> bool {
        matches!(
            self,
            CorralError::CaptureFailed { gone: true, .. } | CorralError::SessionMissing { .. }
        )
    }
}

fn join_errors(errs: &[CorralError]) -> String {
    let mut out = String::new();
    for err in errs {
        out.push_str("\n  - ");
        out.push_str(&err.to_string());
    }
    out
}
