//! Window Store
//!
//! Backing storage for consumption windows. The only mutating primitive is
//! [`WindowStore::consume`], which must read, decide and write as one atomic
//! step so that concurrent submissions for the same identity cannot both
//! observe spare capacity.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::config::WindowLimits;
use super::window::{consume_from, Admission, ConsumptionWindow};
use crate::error::Result;
use crate::identity::Identity;

/// Storage for per-identity consumption windows
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Atomically charge one point for `identity` at `now`
    async fn consume(
        &self,
        identity: &Identity,
        now: DateTime<Utc>,
        limits: WindowLimits,
    ) -> Result<Admission>;

    /// Current window for `identity`, if any
    async fn get(&self, identity: &Identity) -> Result<Option<ConsumptionWindow>>;

    /// Drop windows that have elapsed at `now`; returns how many were removed
    async fn purge_expired(&self, now: DateTime<Utc>, limits: WindowLimits) -> Result<usize>;

    /// Number of tracked identities
    async fn count(&self) -> Result<usize>;
}

/// In-memory window store
#[derive(Debug, Clone, Default)]
pub struct MemoryWindowStore {
    windows: Arc<Mutex<HashMap<Identity, ConsumptionWindow>>>,
}

impl MemoryWindowStore {
    /// Create a new window store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn consume(
        &self,
        identity: &Identity,
        now: DateTime<Utc>,
        limits: WindowLimits,
    ) -> Result<Admission> {
        let mut windows = self.windows.lock().await;
        let (window, admission) = consume_from(windows.get(identity).copied(), now, limits);
        windows.insert(identity.clone(), window);
        Ok(admission)
    }

    async fn get(&self, identity: &Identity) -> Result<Option<ConsumptionWindow>> {
        let windows = self.windows.lock().await;
        Ok(windows.get(identity).copied())
    }

    async fn purge_expired(&self, now: DateTime<Utc>, limits: WindowLimits) -> Result<usize> {
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, w| !w.is_expired(now, limits.window));
        Ok(before - windows.len())
    }

    async fn count(&self) -> Result<usize> {
        let windows = self.windows.lock().await;
        Ok(windows.len())
    }
}
