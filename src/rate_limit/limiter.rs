//! Rate Limiter
//!
//! The single admission decision shared by the request path and the drain
//! loop.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::config::RateLimitConfig;
use super::store::WindowStore;
use super::window::{Admission, ConsumptionWindow};
use crate::clock::Clock;
use crate::error::Result;
use crate::identity::Identity;
use crate::metrics;

/// Admission decision consulted by both orchestrators
#[async_trait]
pub trait Admitter: Send + Sync {
    /// Charge one point for `identity` or report when to come back
    async fn try_consume(&self, identity: &Identity) -> Result<Admission>;

    /// Drop state for identities whose window has elapsed
    async fn sweep(&self) -> Result<usize> {
        Ok(0)
    }
}

/// Fixed-window rate limiter keyed by identity
#[derive(Clone)]
pub struct RateLimiter {
    /// Configuration
    config: RateLimitConfig,

    /// Window store
    store: Arc<dyn WindowStore>,

    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a new rate limiter
    pub fn new(config: RateLimitConfig, store: Arc<dyn WindowStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Current window for an identity
    pub async fn window(&self, identity: &Identity) -> Result<Option<ConsumptionWindow>> {
        self.store.get(identity).await
    }
}

#[async_trait]
impl Admitter for RateLimiter {
    async fn try_consume(&self, identity: &Identity) -> Result<Admission> {
        if !self.config.enabled {
            return Ok(Admission::Admitted {
                remaining: u32::MAX,
            });
        }

        let timer = metrics::ADMISSION_DURATION_SECONDS.start_timer();
        let result = self
            .store
            .consume(identity, self.clock.now(), self.config.limits())
            .await;
        timer.observe_duration();

        let admission = result?;
        match admission {
            Admission::Admitted { remaining } => {
                debug!(%identity, remaining, "Admitted");
            }
            Admission::Rejected { retry_after } => {
                debug!(%identity, retry_after_ms = retry_after.as_millis() as u64, "Rate limit exceeded");
            }
        }
        Ok(admission)
    }

    async fn sweep(&self) -> Result<usize> {
        let purged = self
            .store
            .purge_expired(self.clock.now(), self.config.limits())
            .await?;
        if purged > 0 {
            debug!(purged, "Purged expired rate limit windows");
        }
        Ok(purged)
    }
}
