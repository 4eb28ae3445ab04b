//! Rate Limiting Module
//!
//! Per-identity admission over a fixed window that opens lazily on first
//! use. Each task costs one point; once an identity has spent its capacity
//! further submissions are rejected until the window elapses.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │   AdmissionScheduler        QueueDrainLoop    │
//! │           └──────────┬──────────┘             │
//! │                 dyn Admitter                  │
//! │                 RateLimiter                   │
//! ├──────────────────────────────────────────────┤
//! │   WindowStore (MemoryWindowStore | Sqlite)    │
//! └──────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod limiter;
pub mod store;
pub mod window;

pub use config::{RateLimitConfig, WindowLimits};
pub use limiter::{Admitter, RateLimiter};
pub use store::{MemoryWindowStore, WindowStore};
pub use window::{Admission, ConsumptionWindow};
