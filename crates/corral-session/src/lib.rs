//! Instance lifecycle and supervision core.
//!
//! An [`Instance`] pairs one agent process with its isolation resources: a
//! detached tmux pane and a private git worktree. The module implements the
//! lifecycle state machine (ready/running/paused), the per-tick watchdog
//! (stall detection by content-hash diffing and pattern matching, bounded
//! continue injection), timed continuous mode, and crash-resume by
//! rediscovering the agent's own session id from its on-disk history.
//!
//! - [`instance`]: the state machine and watchdog
//! - [`norm`]: pane-content normalization and hashing
//! - [`patterns`]: prompt/completion pattern sets and candidate selection
//! - [`locator`]: resumable-session-id discovery

pub mod instance;
pub mod locator;
pub mod norm;
pub mod patterns;

pub use instance::{Instance, InstanceContext, InstanceOptions, InstanceSnapshot, Status};
pub use locator::find_session_id;
