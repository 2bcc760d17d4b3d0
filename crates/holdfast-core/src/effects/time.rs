//! Physical time interface
//!
//! Lease expiry, renewal deadlines and the autosave cadence all read time
//! through this trait so tests can run on a controllable clock.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Wall clock and sleeping
#[async_trait]
pub trait PhysicalTimeEffects: Send + Sync {
    /// Wall-clock milliseconds since the Unix epoch
    async fn now_ms(&self) -> u64;

    /// Suspend the caller for `duration`
    async fn sleep(&self, duration: Duration);
}

/// Blanket implementation for Arc<T> where T: PhysicalTimeEffects
#[async_trait]
impl<T: PhysicalTimeEffects + ?Sized> PhysicalTimeEffects for Arc<T> {
    async fn now_ms(&self) -> u64 {
        (**self).now_ms().await
    }

    async fn sleep(&self, duration: Duration) {
        (**self).sleep(duration).await;
    }
}
