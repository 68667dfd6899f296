//! The tmux backend.
//!
//! Every operation is a short-lived `tmux` subprocess; the multiplexer
//! server itself holds the panes. The trait exists so the session and
//! supervision layers can run against an in-memory fake in tests -- tmux is
//! a process-global namespace and a poor test dependency.

use std::path::Path;
use std::process::Command;
use std::sync::mpsc;

use corral_types::CorralError;

/// Check whether tmux is available on the system.
pub fn tmux_available() -> bool {
    matches!(
        Command::new("tmux").arg("-V").output(),
        Ok(output) if output.status.success()
    )
}

/// Capability set corral needs from a terminal multiplexer.
///
/// Operations are keyed by session name; the caller serializes access.
pub trait TerminalMux: Send + Sync {
    /// Whether a session with this name exists.
    fn has_session(&self, name: &str) -> bool;

    /// Create a detached session running `command` with the given working
    /// directory and detached pane size.
    fn new_session(
        &self,
        name: &str,
        command: &str,
        workdir: &Path,
        width: u16,
        height: u16,
    ) -> Result<(), CorralError>;

    /// Kill the session. Succeeds if the session is already gone.
    fn kill_session(&self, name: &str) -> Result<(), CorralError>;

    /// Capture the pane's visible text.
    ///
    /// A vanished pane must surface as `CaptureFailed { gone: true, .. }`;
    /// the crash-restart path depends on the distinction.
    fn capture_pane(&self, name: &str) -> Result<String, CorralError>;

    /// Send a literal text string as if typed (no trailing Enter).
    fn send_text(&self, name: &str, text: &str) -> Result<(), CorralError>;

    /// Send a single Enter key press.
    fn send_enter(&self, name: &str) -> Result<(), CorralError>;

    /// Resize the detached pane.
    fn resize_window(&self, name: &str, width: u16, height: u16) -> Result<(), CorralError>;

    /// Attach the calling terminal interactively. The returned channel fires
    /// once when the operator detaches.
    fn attach(&self, name: &str) -> Result<mpsc::Receiver<()>, CorralError>;
}

/// The real tmux backend.
#[derive(Debug, Clone, Default)]
pub struct SystemTmux;

impl SystemTmux {
    pub fn new() -> Self {
        SystemTmux
    }

    fn run(&self, args: &[&str]) -> Result<String, CorralError> {
        let output = Command::new("tmux")
            .args(args)
            .output()
            .map_err(|e| CorralError::SessionStartFailed(format!("failed to run tmux: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(CorralError::SessionStartFailed(format!(
                "tmux {} exited with {}: {stderr}",
                args.first().unwrap_or(&""),
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Stderr fragments tmux emits when a session is gone. tmux's wording has
/// shifted between releases, so both spellings are matched.
fn session_gone(stderr: &str) -> bool {
    stderr.contains("can't find session")
        || stderr.contains("no server running")
        || stderr.contains("session not found")
}

impl TerminalMux for SystemTmux {
    fn has_session(&self, name: &str) -> bool {
        matches!(
            Command::new("tmux").args(["has-session", "-t", name]).output(),
            Ok(output) if output.status.success()
        )
    }

    fn new_session(
        &self,
        name: &str,
        command: &str,
        workdir: &Path,
        width: u16,
        height: u16,
    ) -> Result<(), CorralError> {
        self.run(&[
            "new-session",
            "-d",
            "-s",
            name,
            "-x",
            &width.to_string(),
            "-y",
            &height.to_string(),
            "-c",
            &workdir.to_string_lossy(),
            command,
        ])?;
        Ok(())
    }

    fn kill_session(&self, name: &str) -> Result<(), CorralError> {
        let output = Command::new("tmux")
            .args(["kill-session", "-t", name])
            .output()
            .map_err(|e| CorralError::SessionStartFailed(format!("failed to run tmux: {e}")))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if session_gone(&stderr) {
            // Already dead, which is what the caller wanted.
            return Ok(());
        }
        Err(CorralError::SessionStartFailed(format!(
            "tmux kill-session exited with {}: {stderr}",
            output.status
        )))
    }

    fn capture_pane(&self, name: &str) -> Result<String, CorralError> {
        let output = Command::new("tmux")
            .args(["capture-pane", "-t", name, "-p", "-e"])
            .output()
            .map_err(|e| CorralError::CaptureFailed {
                gone: false,
                message: format!("failed to run tmux: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(CorralError::CaptureFailed {
                gone: session_gone(&stderr) || !self.has_session(name),
                message: format!("tmux capture-pane exited with {}: {stderr}", output.status),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn send_text(&self, name: &str, text: &str) -> Result<(), CorralError> {
        // -l sends the string literally instead of interpreting key names.
        self.run(&["send-keys", "-t", name, "-l", text])?;
        Ok(())
    }

    fn send_enter(&self, name: &str) -> Result<(), CorralError> {
        self.run(&["send-keys", "-t", name, "Enter"])?;
        Ok(())
    }

    fn resize_window(&self, name: &str, width: u16, height: u16) -> Result<(), CorralError> {
        self.run(&[
            "resize-window",
            "-t",
            name,
            "-x",
            &width.to_string(),
            "-y",
            &height.to_string(),
        ])?;
        Ok(())
    }

    fn attach(&self, name: &str) -> Result<mpsc::Receiver<()>, CorralError> {
        if !self.has_session(name) {
            return Err(CorralError::SessionMissing {
                name: name.to_string(),
            });
        }

        let (tx, rx) = mpsc::channel();
        let session = name.to_string();
        std::thread::spawn(move || {
            // Blocks this thread until the operator detaches (or the pane
            // dies); the receiver fires either way.
            let status = Command::new("tmux")
                .args(["attach-session", "-t", &session])
                .status();
            if let Err(e) = status {
                tracing::error!(session, error = %e, "tmux attach-session failed");
            }
            let _ = tx.send(());
        });
        Ok(rx)
    }
}
