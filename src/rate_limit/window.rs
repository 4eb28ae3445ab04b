//! Consumption Window
//!
//! Per-identity counter over a fixed window that restarts lazily on the
//! first consumption after it elapses. Both window store backends apply
//! consumptions through [`ConsumptionWindow::consume`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::config::WindowLimits;
use crate::clock::{add_duration, until};

/// Outcome of one admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// One point was charged
    Admitted {
        /// Points left in the current window
        remaining: u32,
    },
    /// Window is full
    Rejected {
        /// Time until the window resets
        retry_after: Duration,
    },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

/// Points consumed by one identity in the current window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumptionWindow {
    /// Points charged since `window_start`
    pub points_consumed: u32,

    /// When the current window opened
    pub window_start: DateTime<Utc>,
}

impl ConsumptionWindow {
    /// Fresh window opened at `now`
    pub fn open(now: DateTime<Utc>) -> Self {
        Self {
            points_consumed: 0,
            window_start: now,
        }
    }

    /// When this window stops counting
    pub fn resets_at(&self, window: Duration) -> DateTime<Utc> {
        add_duration(self.window_start, window)
    }

    /// Whether the window has elapsed at `now`
    pub fn is_expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now >= self.resets_at(window)
    }

    /// Charge one point if capacity allows, restarting the window first if
    /// it has elapsed
    pub fn consume(&mut self, now: DateTime<Utc>, limits: WindowLimits) -> Admission {
        if self.is_expired(now, limits.window) {
            *self = Self::open(now);
        }

        if self.points_consumed < limits.capacity {
            self.points_consumed += 1;
            Admission::Admitted {
                remaining: limits.capacity - self.points_consumed,
            }
        } else {
            Admission::Rejected {
                retry_after: until(now, self.resets_at(limits.window)),
            }
        }
    }
}

/// Apply one consumption to an optional existing window
pub fn consume_from(
    window: Option<ConsumptionWindow>,
    now: DateTime<Utc>,
    limits: WindowLimits,
) -> (ConsumptionWindow, Admission) {
    let mut window = window.unwrap_or_else(|| ConsumptionWindow::open(now));
    let admission = window.consume(now, limits);
    (window, admission)
}
