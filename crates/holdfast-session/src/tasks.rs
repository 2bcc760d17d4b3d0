//! Cancellable background tasks.
//!
//! Lease renewal and autosave run as tokio tasks owned by the lock handle or
//! session that started them. Stopping a task signals it and then waits for
//! it to finish, so once [`BackgroundTask::stop`] returns the task has no
//! further side effects.

use holdfast_core::effects::PhysicalTimeEffects;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Whether an interval task should keep running after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Run again after the next interval
    Continue,
    /// Exit the task
    Stop,
}

/// A spawned task that stops when signalled or dropped
#[derive(Debug)]
pub struct BackgroundTask {
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Run `f` every `interval` until it returns [`Tick::Stop`] or the task is
    /// stopped. A stop signal that races with a completed sleep wins; a tick
    /// already in progress runs to completion.
    pub fn spawn_interval<F, Fut>(
        time: Arc<dyn PhysicalTimeEffects>,
        interval: Duration,
        mut f: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Tick> + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = time.sleep(interval) => {}
                }
                if *shutdown_rx.borrow() {
                    break;
                }
                if f().await == Tick::Stop {
                    break;
                }
            }
        });
        Self {
            shutdown_tx,
            handle: Some(handle),
        }
    }

    /// Run `fut` until it completes or the task is stopped
    pub fn spawn_cancellable<Fut>(fut: Fut) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = fut => {}
            }
        });
        Self {
            shutdown_tx,
            handle: Some(handle),
        }
    }

    /// Ask the task to stop without waiting for it
    pub fn signal(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Signal the task and wait until it has exited
    pub async fn stop(mut self) {
        self.signal();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    tracing::error!(error = %err, "Background task panicked");
                }
            }
        }
    }

    /// True once the task has exited
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use holdfast_effects::RealTimeHandler;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn interval_runs_until_stopped() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        let time = Arc::new(RealTimeHandler::new());
        let task = BackgroundTask::spawn_interval(time, Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Tick::Continue
            }
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        task.stop().await;
        let seen = ticks.load(Ordering::SeqCst);
        assert_eq!(seen, 3);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_stops_itself() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        let time = Arc::new(RealTimeHandler::new());
        let task = BackgroundTask::spawn_interval(time, Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 1 {
                    Tick::Stop
                } else {
                    Tick::Continue
                }
            }
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(task.is_finished());
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }
}
