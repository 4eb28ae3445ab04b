//! Rate Limit Configuration
//!
//! Capacity and window length for per-identity admission.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default points per window
pub const DEFAULT_CAPACITY: u32 = 20;

/// Default window length in seconds
pub const DEFAULT_WINDOW_SECS: u64 = 60;

/// Rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,

    /// Points each identity may consume per window
    pub capacity: u32,

    /// Window length in seconds
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: DEFAULT_CAPACITY,
            window_secs: DEFAULT_WINDOW_SECS,
        }
    }
}

impl RateLimitConfig {
    /// Create a new rate limit configuration
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            enabled: true,
            capacity,
            window_secs: window.as_secs(),
        }
    }

    /// Disable rate limiting (for testing)
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Window length
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Limits handed to the window store
    pub fn limits(&self) -> WindowLimits {
        WindowLimits {
            capacity: self.capacity,
            window: self.window(),
        }
    }
}

/// Capacity and window length applied to one consumption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimits {
    pub capacity: u32,
    pub window: Duration,
}
