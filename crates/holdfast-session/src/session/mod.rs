//! Lease-locked record sessions
//!
//! A [`Session`] owns the lock for one record key from load until unload.
//! Reads and mutations work on an in-memory copy; `save()` commits the
//! difference to the store through the transaction marker protocol.
//!
//! Concurrency rules:
//! - mutations are serialized by `mutation_gate`, so change callbacks fire in
//!   mutation order and never concurrently
//! - commits are serialized by `commit_gate`; a commit snapshots the working
//!   copy and mutations may continue while it runs
//! - losing the lock closes the session; every later call fails with
//!   `SessionClosed`

mod commit;
mod load;
mod state;

pub use state::SessionPhase;

use crate::context::{ChangedCallback, SessionContext};
use crate::lock::{DistributedLock, LockHandle, LockStatus};
use crate::shard::ShardCodec;
use crate::tasks::{BackgroundTask, Tick};
use crate::transaction::TransactionReader;
use holdfast_core::{HoldfastError, HoldfastResult, Value};
use parking_lot::Mutex;
use state::SessionState;
use std::sync::{Arc, Weak};

/// Handle to an open session; clones share the same session
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("store", &self.inner.ctx.name())
            .field("key", &self.inner.key)
            .field("phase", &self.phase())
            .finish()
    }
}

pub(crate) struct SessionInner {
    key: String,
    record_key: String,
    ctx: SessionContext,
    lock: DistributedLock,
    handle: LockHandle,
    reader: TransactionReader,
    codec: ShardCodec,
    state: Mutex<SessionState>,
    mutation_gate: tokio::sync::Mutex<()>,
    commit_gate: tokio::sync::Mutex<()>,
    callbacks: Mutex<Vec<ChangedCallback>>,
    autosave: Mutex<Option<BackgroundTask>>,
    lock_watch: Mutex<Option<BackgroundTask>>,
}

impl Session {
    /// Acquire the lock for `key` and load its record
    pub async fn load(ctx: SessionContext, key: &str) -> HoldfastResult<Session> {
        let inner = SessionInner::open(ctx, key).await?;
        let session = Session {
            inner: Arc::new(inner),
        };
        session.watch_lock();
        session.inner.drain_orphans().await;
        Ok(session)
    }

    /// Record key this session holds
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> SessionPhase {
        self.inner.state.lock().phase
    }

    /// Current record.
    ///
    /// The returned value shares nothing the caller could use to change the
    /// session's copy.
    pub fn get(&self) -> HoldfastResult<Value> {
        if !self.inner.handle.is_locked() {
            self.inner.force_close();
            return Err(HoldfastError::closed(&self.inner.key));
        }
        let state = self.inner.state.lock();
        if !state.phase.is_open() {
            return Err(HoldfastError::closed(&self.inner.key));
        }
        if self.inner.ctx.config.session.protect_references {
            Ok(state.current.deep_copy())
        } else {
            Ok(state.current.clone())
        }
    }

    /// Replace the record
    pub async fn set_data(&self, value: impl Into<Value>) -> HoldfastResult<()> {
        let value = value.into();
        self.update(move |data| *data = value).await
    }

    /// Mutate the record in place.
    ///
    /// `f` works on a draft; the draft replaces the record only if it passes
    /// the schema. A rejected draft leaves the record untouched.
    pub async fn update<F>(&self, f: F) -> HoldfastResult<()>
    where
        F: FnOnce(&mut Value) + Send,
    {
        let inner = &self.inner;
        let _gate = inner.mutation_gate.lock().await;
        inner.ensure_open().await?;

        let mut draft = inner.state.lock().current.clone();
        f(&mut draft);
        if !inner.ctx.validate(&draft) {
            tracing::debug!(key = %inner.key, "Update rejected by schema");
            return Err(HoldfastError::schema_rejected(&inner.key));
        }

        let old = {
            let mut state = inner.state.lock();
            if !state.phase.is_open() {
                return Err(HoldfastError::closed(&inner.key));
            }
            let old = std::mem::replace(&mut state.current, draft.clone());
            state.revision += 1;
            let first = !state.notified;
            state.notified = true;
            (!first).then_some(old)
        };

        inner.notify(&draft, old.as_ref());
        Ok(())
    }

    /// Register a change callback after the context's callbacks
    pub fn on_changed<F>(&self, callback: F)
    where
        F: Fn(&str, &Value, Option<&Value>) + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().push(Arc::new(callback));
    }

    /// Commit pending changes; a no-op when nothing changed.
    ///
    /// On failure the session stays open and dirty.
    pub async fn save(&self) -> HoldfastResult<()> {
        let _commit = self.inner.commit_gate.lock().await;
        self.inner.ensure_open().await?;
        self.inner.commit().await
    }

    /// True when every change has been durably committed
    pub fn is_saved(&self) -> bool {
        self.inner.state.lock().is_saved()
    }

    /// True while the session's lease is held and unexpired
    pub fn is_locked(&self) -> bool {
        self.inner.handle.is_locked()
    }

    /// Save periodically at the configured interval until stopped
    pub fn start_autosaving(&self) {
        let mut slot = self.inner.autosave.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.ctx.config.session.autosave_interval;
        *slot = Some(BackgroundTask::spawn_interval(
            self.inner.ctx.stores.time.clone(),
            interval,
            move || {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return Tick::Stop;
                    };
                    Session { inner }.autosave_tick().await
                }
            },
        ));
        tracing::debug!(
            key = %self.inner.key,
            interval_ms = interval.as_millis() as u64,
            "Autosave started"
        );
    }

    /// Stop autosaving; once this returns no autosave will run
    pub async fn stop_autosaving(&self) {
        let task = self.inner.autosave.lock().take();
        if let Some(task) = task {
            task.stop().await;
            tracing::debug!(key = %self.inner.key, "Autosave stopped");
        }
    }

    /// Commit outstanding changes, release the lock and close the session.
    ///
    /// The session ends `Closed` whatever the commit outcome; a failed
    /// commit is returned after the lock has been released.
    pub async fn unload(&self) -> HoldfastResult<()> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            if !state.phase.is_open() {
                return Err(HoldfastError::closed(&inner.key));
            }
            state.phase = SessionPhase::Closing;
        }

        self.stop_autosaving().await;
        let _mutations = inner.mutation_gate.lock().await;
        let _commit = inner.commit_gate.lock().await;

        let result = match inner.lock.ensure_held(&inner.handle).await {
            Ok(()) => inner.commit().await,
            Err(err) => Err(err.into_session_error(&inner.key)),
        };

        let watcher = inner.lock_watch.lock().take();
        if let Some(watcher) = watcher {
            watcher.stop().await;
        }
        if let Err(err) = inner.lock.release(&inner.handle).await {
            tracing::warn!(
                key = %inner.key,
                error = %err,
                "Failed to release lock; it will expire"
            );
        }

        inner.state.lock().phase = SessionPhase::Closed;
        match &result {
            Ok(()) => tracing::info!(key = %inner.key, "Session unloaded"),
            Err(err) => tracing::warn!(
                key = %inner.key,
                error = %err,
                "Session unloaded with unsaved changes"
            ),
        }
        result
    }

    async fn autosave_tick(&self) -> Tick {
        if !self.phase().is_open() {
            return Tick::Stop;
        }
        if self.is_saved() {
            return Tick::Continue;
        }
        match self.save().await {
            Ok(()) => Tick::Continue,
            Err(err) if err.is_terminal() => Tick::Stop,
            Err(err) => {
                tracing::warn!(key = %self.inner.key, error = %err, "Autosave failed");
                Tick::Continue
            }
        }
    }

    fn watch_lock(&self) {
        let weak = Arc::downgrade(&self.inner);
        let mut status = self.inner.handle.subscribe();
        let watcher = BackgroundTask::spawn_cancellable(async move {
            loop {
                if *status.borrow_and_update() == LockStatus::Lost {
                    if let Some(inner) = weak.upgrade() {
                        inner.force_close();
                    }
                    return;
                }
                if status.changed().await.is_err() {
                    return;
                }
            }
        });
        *self.inner.lock_watch.lock() = Some(watcher);
    }
}

impl SessionInner {
    /// Fail with `SessionClosed` unless the session is open and its lease
    /// still valid
    async fn ensure_open(&self) -> HoldfastResult<()> {
        if !self.state.lock().phase.is_open() {
            return Err(HoldfastError::closed(&self.key));
        }
        if let Err(err) = self.lock.ensure_held(&self.handle).await {
            self.force_close();
            return Err(err.into_session_error(&self.key));
        }
        Ok(())
    }

    /// Close after lock loss. An unload in progress finishes on its own.
    fn force_close(&self) {
        {
            let mut state = self.state.lock();
            if !state.phase.is_open() {
                return;
            }
            state.phase = SessionPhase::Closed;
        }
        tracing::error!(key = %self.key, "Lock lost; session closed");
        if let Some(task) = self.autosave.lock().as_ref() {
            task.signal();
        }
    }

    fn notify(&self, new: &Value, old: Option<&Value>) {
        let runtime = self.callbacks.lock().clone();
        for callback in self.ctx.changed_callbacks.iter().chain(runtime.iter()) {
            callback(&self.key, new, old);
        }
    }
}
