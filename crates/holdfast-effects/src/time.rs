//! Time Effect Handlers - Production Only
//!
//! Stateless implementation of `PhysicalTimeEffects` delegating to system
//! time and the tokio timer. Controllable clocks for tests live in
//! `holdfast-testkit`.

use async_trait::async_trait;
use holdfast_core::effects::PhysicalTimeEffects;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Real time handler for production use
#[derive(Debug, Clone, Default)]
pub struct RealTimeHandler;

impl RealTimeHandler {
    /// Create a new real time handler
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PhysicalTimeEffects for RealTimeHandler {
    async fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
