//! One instance's detached pane plus its change-monitor state.

use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use corral_types::CorralError;

use crate::tmux::TerminalMux;

/// Prefix for corral-owned tmux session names. Titles are unique per fleet,
/// so prefixed names are unique in the multiplexer's global namespace.
pub const SESSION_PREFIX: &str = "corral_";

/// Default detached pane size. Wide enough that agent TUIs don't wrap their
/// status lines, which would defeat content-hash diffing.
const DEFAULT_WIDTH: u16 = 200;
const DEFAULT_HEIGHT: u16 = 50;

/// A detached terminal pane hosting one agent process.
///
/// The pane outlives the supervisor process; `restore()` re-binds to an
/// existing pane after a supervisor restart. The struct also carries the
/// two-state monitor used by `has_updated()`: the hash of the previous
/// capture, so successive calls report whether anything changed.
pub struct PaneSession {
    name: String,
    program: String,
    mux: Arc<dyn TerminalMux>,
    width: u16,
    height: u16,
    prev_hash: Option<String>,
}

impl std::fmt::Debug for PaneSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaneSession")
            .field("name", &self.name)
            .field("program", &self.program)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("prev_hash", &self.prev_hash)
            .finish_non_exhaustive()
    }
}

impl PaneSession {
    /// Build a session handle for an instance title. No pane is created
    /// until [`start`](Self::start) or [`restore`](Self::restore).
    pub fn new(title: &str, program: &str, mux: Arc<dyn TerminalMux>) -> Self {
        Self {
            name: format!("{SESSION_PREFIX}{title}"),
            program: program.to_string(),
            mux,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            prev_hash: None,
        }
    }

    /// The tmux session name (e.g. `corral_feat`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The program command this pane was created with.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Create the detached pane with `workdir` as working directory.
    ///
    /// Fails with `SessionStartFailed` if a pane of this name already exists
    /// or tmux is not installed.
    pub fn start(&mut self, workdir: &Path) -> Result<(), CorralError> {
        if self.mux.has_session(&self.name) {
            return Err(CorralError::SessionStartFailed(format!(
                "session '{}' already exists",
                self.name
            )));
        }
        self.mux
            .new_session(&self.name, &self.program, workdir, self.width, self.height)?;
        self.prev_hash = None;
        Ok(())
    }

    /// Re-bind to an existing pane, e.g. after a supervisor restart.
    pub fn restore(&mut self) -> Result<(), CorralError> {
        if !self.mux.has_session(&self.name) {
            return Err(CorralError::SessionMissing {
                name: self.name.clone(),
            });
        }
        self.prev_hash = None;
        Ok(())
    }

    /// Kill the pane. Succeeds if it is already gone.
    pub fn close(&mut self) -> Result<(), CorralError> {
        self.mux.kill_session(&self.name)
    }

    /// Whether the pane currently exists.
    pub fn exists(&self) -> bool {
        self.mux.has_session(&self.name)
    }

    /// Capture the pane's visible text.
    pub fn capture_content(&self) -> Result<String, CorralError> {
        self.mux.capture_pane(&self.name)
    }

    /// Send a literal text string as if typed.
    pub fn send_text(&self, text: &str) -> Result<(), CorralError> {
        self.mux.send_text(&self.name, text)
    }

    /// Send a single Enter key press.
    pub fn tap_enter(&self) -> Result<(), CorralError> {
        self.mux.send_enter(&self.name)
    }

    /// Set the detached pane dimensions.
    pub fn set_detached_size(&mut self, width: u16, height: u16) -> Result<(), CorralError> {
        self.mux.resize_window(&self.name, width, height)?;
        self.width = width;
        self.height = height;
        Ok(())
    }

    /// Attach the calling terminal; the returned channel fires on detach.
    pub fn attach(&self) -> Result<mpsc::Receiver<()>, CorralError> {
        self.mux.attach(&self.name)
    }

    /// Monitor helper: `(changed_since_last_call, looks_like_prompt)`.
    ///
    /// `changed` compares the SHA-256 of the current capture against the
    /// previous call's. `looks_like_prompt` is a cheap surface signal used
    /// only to drive auto-yes; anything smarter belongs to the watchdog.
    pub fn has_updated(&mut self) -> (bool, bool) {
        let content = match self.capture_content() {
            Ok(content) => content,
            Err(_) => return (false, false),
        };

        let hash = hash_hex(&content);
        let changed = self.prev_hash.as_deref() != Some(hash.as_str());
        self.prev_hash = Some(hash);
        (changed, looks_like_prompt(&content))
    }
}

fn hash_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Cheap prompt heuristic for the auto-yes path: a confirmation marker
/// anywhere, or a bare `>` prompt at the end of the buffer.
fn looks_like_prompt(content: &str) -> bool {
    let lower = content.to_lowercase();
    if lower.contains("[y/n]") || lower.contains("(y/n)") || lower.contains("(yes/no)") {
        return true;
    }
    match content.trim_end().lines().last() {
        Some(last) => {
            let last = last.trim();
            last == ">" || last.starts_with("> ")
        }
        None => false,
    }
}
