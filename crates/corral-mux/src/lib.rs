//! Detached terminal panes for corral instances.
//!
//! Each instance runs its agent inside a detached tmux session that survives
//! the supervisor process exiting. The operator can attach from any terminal
//! with `tmux attach-session -t corral_<title>`.
//!
//! - [`TerminalMux`]: the narrow capability set the rest of corral needs
//!   from a multiplexer backend
//! - [`SystemTmux`]: the real backend, shelling out to `tmux`
//! - [`PaneSession`]: one instance's pane plus its change-monitor state
//! - [`fake::FakeMux`]: in-memory backend for tests

pub mod fake;
pub mod pane;
pub mod tmux;

pub use pane::PaneSession;
pub use tmux::{tmux_available, SystemTmux, TerminalMux};
