//! Virtual clock for tests
//!
//! [`TokioClock`] derives wall-clock milliseconds from the tokio timer, so
//! under `#[tokio::test(start_paused = true)]` lease expiry, retry backoff and
//! autosave ticks all advance together on virtual time.

use async_trait::async_trait;
use holdfast_core::effects::PhysicalTimeEffects;
use std::time::Duration;
use tokio::time::Instant;

/// Arbitrary fixed epoch offset so timestamps look like real wall-clock values
pub const DEFAULT_BASE_MS: u64 = 1_700_000_000_000;

/// Clock driven by the tokio timer
#[derive(Debug, Clone)]
pub struct TokioClock {
    base_ms: u64,
    start: Instant,
}

impl TokioClock {
    /// Clock reading zero at the current instant
    pub fn new() -> Self {
        Self::starting_at(DEFAULT_BASE_MS)
    }

    /// Clock reading `base_ms` at the current instant
    pub fn starting_at(base_ms: u64) -> Self {
        Self {
            base_ms,
            start: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the clock was created
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PhysicalTimeEffects for TokioClock {
    async fn now_ms(&self) -> u64 {
        self.base_ms.saturating_add(self.elapsed_ms())
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn follows_virtual_time() {
        let clock = TokioClock::starting_at(1_000);
        assert_eq!(clock.now_ms().await, 1_000);
        clock.sleep(Duration::from_secs(90)).await;
        assert_eq!(clock.now_ms().await, 91_000);
    }
}
