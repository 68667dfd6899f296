//! Fleet supervision and persistence.
//!
//! The [`Supervisor`] owns the ordered collection of instances, drives the
//! ≈1 Hz watchdog tick, and surfaces the operations the UI layer calls. The
//! [`Store`] persists the fleet as a versioned JSON snapshot so it survives
//! supervisor restarts.

pub mod store;
pub mod supervisor;

pub use store::{Store, SCHEMA_VERSION};
pub use supervisor::{Supervisor, MAX_INSTANCES};
