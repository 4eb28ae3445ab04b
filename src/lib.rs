//! taskgate
//!
//! Per-user rate-limited task admission. A submission either runs now, when
//! its user still has capacity in the current window, or is parked in a
//! delayed queue that a background drain loop re-evaluates until the task
//! runs or is dead-lettered.

pub mod clock;
pub mod config;
pub mod drain;
pub mod error;
pub mod executor;
pub mod identity;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod rate_limit;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod sqlite;

pub use error::{GateError, Result};
pub use identity::Identity;
