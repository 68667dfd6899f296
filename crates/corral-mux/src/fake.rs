//! In-memory multiplexer for tests.
//!
//! tmux is a process-global namespace, so unit tests inject this fake
//! instead. Pane content is scripted with [`FakeMux::set_content`]; sent
//! keys are recorded for assertions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Mutex;

use corral_types::CorralError;

use crate::tmux::TerminalMux;

#[derive(Debug, Clone)]
struct FakePane {
    command: String,
    workdir: PathBuf,
    content: String,
    width: u16,
    height: u16,
}

/// A record of one key-send against a fake pane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentKeys {
    Text(String),
    Enter,
}

#[derive(Default)]
struct State {
    panes: HashMap<String, FakePane>,
    sent: HashMap<String, Vec<SentKeys>>,
    /// When set, capture_pane fails as if the pane vanished mid-capture.
    capture_gone: bool,
    /// Content newly created panes start with (scripts agent startup text).
    initial_content: String,
}

/// In-memory [`TerminalMux`] implementation.
#[derive(Default)]
pub struct FakeMux {
    state: Mutex<State>,
}

impl FakeMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the visible content of a pane.
    pub fn set_content(&self, name: &str, content: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(pane) = state.panes.get_mut(name) {
            pane.content = content.to_string();
        }
    }

    /// Make every subsequent capture fail with a pane-gone error, as if the
    /// agent process crashed and tmux reaped the session.
    pub fn set_capture_gone(&self, gone: bool) {
        self.state.lock().unwrap().capture_gone = gone;
    }

    /// Content that panes created from now on start with, simulating the
    /// agent's startup banner.
    pub fn set_initial_content(&self, content: &str) {
        self.state.lock().unwrap().initial_content = content.to_string();
    }

    /// Keys sent to a pane, in order.
    pub fn sent_keys(&self, name: &str) -> Vec<SentKeys> {
        self.state
            .lock()
            .unwrap()
            .sent
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Text payloads sent to a pane (Enter presses elided).
    pub fn sent_text(&self, name: &str) -> Vec<String> {
        self.sent_keys(name)
            .into_iter()
            .filter_map(|k| match k {
                SentKeys::Text(t) => Some(t),
                SentKeys::Enter => None,
            })
            .collect()
    }

    /// The command the pane was created with, if it exists.
    pub fn pane_command(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .panes
            .get(name)
            .map(|p| p.command.clone())
    }

    /// The working directory the pane was created with, if it exists.
    pub fn pane_workdir(&self, name: &str) -> Option<PathBuf> {
        self.state
            .lock()
            .unwrap()
            .panes
            .get(name)
            .map(|p| p.workdir.clone())
    }

    /// Forget recorded key-sends for a pane.
    pub fn clear_sent(&self, name: &str) {
        self.state.lock().unwrap().sent.remove(name);
    }
}

impl TerminalMux for FakeMux {
    fn has_session(&self, name: &str) -> bool {
        self.state.lock().unwrap().panes.contains_key(name)
    }

    fn new_session(
        &self,
        name: &str,
        command: &str,
        workdir: &Path,
        width: u16,
        height: u16,
    ) -> Result<(), CorralError> {
        let mut state = self.state.lock().unwrap();
        if state.panes.contains_key(name) {
            return Err(CorralError::SessionStartFailed(format!(
                "session '{name}' already exists"
            )));
        }
        let content = state.initial_content.clone();
        state.panes.insert(
            name.to_string(),
            FakePane {
                command: command.to_string(),
                workdir: workdir.to_path_buf(),
                content,
                width,
                height,
            },
        );
        Ok(())
    }

    fn kill_session(&self, name: &str) -> Result<(), CorralError> {
        self.state.lock().unwrap().panes.remove(name);
        Ok(())
    }

    fn capture_pane(&self, name: &str) -> Result<String, CorralError> {
        let state = self.state.lock().unwrap();
        if state.capture_gone {
            return Err(CorralError::CaptureFailed {
                gone: true,
                message: "can't find session".into(),
            });
        }
        match state.panes.get(name) {
            Some(pane) => Ok(pane.content.clone()),
            None => Err(CorralError::CaptureFailed {
                gone: true,
                message: format!("can't find session: {name}"),
            }),
        }
    }

    fn send_text(&self, name: &str, text: &str) -> Result<(), CorralError> {
        let mut state = self.state.lock().unwrap();
        if !state.panes.contains_key(name) {
            return Err(CorralError::SessionMissing {
                name: name.to_string(),
            });
        }
        state
            .sent
            .entry(name.to_string())
            .or_default()
            .push(SentKeys::Text(text.to_string()));
        Ok(())
    }

    fn send_enter(&self, name: &str) -> Result<(), CorralError> {
        let mut state = self.state.lock().unwrap();
        if !state.panes.contains_key(name) {
            return Err(CorralError::SessionMissing {
                name: name.to_string(),
            });
        }
        state
            .sent
            .entry(name.to_string())
            .or_default()
            .push(SentKeys::Enter);
        Ok(())
    }

    fn resize_window(&self, name: &str, width: u16, height: u16) -> Result<(), CorralError> {
        let mut state = self.state.lock().unwrap();
        match state.panes.get_mut(name) {
            Some(pane) => {
                pane.width = width;
                pane.height = height;
                Ok(())
            }
            None => Err(CorralError::SessionMissing {
                name: name.to_string(),
            }),
        }
    }

    fn attach(&self, name: &str) -> Result<mpsc::Receiver<()>, CorralError> {
        if !self.has_session(name) {
            return Err(CorralError::SessionMissing {
                name: name.to_string(),
            });
        }
        // Fake operators detach immediately.
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(());
        Ok(rx)
    }
}
