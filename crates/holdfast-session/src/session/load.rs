//! Session load: lock, read, repair, migrate, apply defaults

use super::state::{SessionPhase, SessionState, Unfinalized};
use super::SessionInner;
use crate::context::SessionContext;
use crate::lock::{DistributedLock, LockError, LockHandle};
use crate::orphan::OrphanQueue;
use crate::shard::ShardCodec;
use crate::transaction::TransactionReader;
use holdfast_core::{
    apply_template, ArtifactKind, CommittedSnapshot, HoldfastError, HoldfastResult, MarkerState,
    OrphanEntry, OwnerId, Payload, StoredRecord, Value,
};
use parking_lot::Mutex;

/// State resolved from the store before the session goes live
struct Loaded {
    current: Value,
    committed: CommittedSnapshot,
    payload: Payload,
    payload_migration_version: u32,
    dirty: bool,
    unfinalized: Option<Unfinalized>,
    orphans: OrphanQueue,
}

impl SessionInner {
    pub(super) async fn open(ctx: SessionContext, key: &str) -> HoldfastResult<SessionInner> {
        let config = &ctx.config;
        let stores = &ctx.stores;
        let lock = DistributedLock::new(
            stores.leases.clone(),
            stores.time.clone(),
            config.retry.clone(),
            config.lock.clone(),
        );
        let codec = ShardCodec::new(ctx.keyspace.clone(), config.session.max_entry_bytes);
        let reader = TransactionReader::new(
            stores.markers.clone(),
            ctx.keyspace.clone(),
            config.retry.clone(),
        )
        .with_patch_shards(stores.records.clone(), codec.clone());

        let owner = OwnerId::generate();
        let handle = lock
            .acquire_with_wait(
                &ctx.keyspace.lease_key(key),
                &owner,
                config.lock.ttl,
                config.lock.acquire_wait,
            )
            .await
            .map_err(|err| match err {
                LockError::Busy { .. } => HoldfastError::lock_unavailable(
                    key,
                    format!(
                        "lease still held by another owner after {}ms",
                        config.lock.acquire_wait.as_millis()
                    ),
                ),
                other => other.into_session_error(key),
            })?;

        let record_key = ctx.keyspace.record_key(key);
        let loaded = match load_record(&ctx, &reader, &codec, key, &record_key).await {
            Ok(loaded) => loaded,
            Err(err) => {
                release_after_failed_load(&lock, &handle, key).await;
                return Err(err);
            }
        };

        let revision = u64::from(loaded.dirty);
        tracing::info!(
            store = %ctx.name(),
            key,
            owner = %owner,
            dirty = loaded.dirty,
            "Session loaded"
        );

        let state = SessionState {
            phase: SessionPhase::Active,
            current: loaded.current,
            committed: loaded.committed,
            payload: loaded.payload,
            payload_migration_version: loaded.payload_migration_version,
            revision,
            saved_revision: 0,
            notified: false,
            unfinalized: loaded.unfinalized,
            orphans: loaded.orphans,
        };

        Ok(SessionInner {
            key: key.to_string(),
            record_key,
            ctx,
            lock,
            handle,
            reader,
            codec,
            state: Mutex::new(state),
            mutation_gate: tokio::sync::Mutex::new(()),
            commit_gate: tokio::sync::Mutex::new(()),
            callbacks: Mutex::new(Vec::new()),
            autosave: Mutex::new(None),
            lock_watch: Mutex::new(None),
        })
    }
}

async fn release_after_failed_load(lock: &DistributedLock, handle: &LockHandle, key: &str) {
    if let Err(err) = lock.release(handle).await {
        tracing::warn!(key, error = %err, "Failed to release lock after failed load");
    }
}

async fn load_record(
    ctx: &SessionContext,
    reader: &TransactionReader,
    codec: &ShardCodec,
    key: &str,
    record_key: &str,
) -> HoldfastResult<Loaded> {
    let records = ctx.stores.records.as_ref();
    let retry = &ctx.config.retry;
    let max_attempts = ctx.config.session.orphan_max_attempts;

    let entry = retry.execute(|| records.get(record_key)).await?;
    let Some(entry) = entry else {
        tracing::debug!(key, "No stored record; starting from template");
        return finish(
            ctx,
            key,
            Resolved {
                value: ctx.template.clone(),
                value_migration_version: ctx.migration_version(),
                committed: CommittedSnapshot {
                    value: Value::Null,
                    version: None,
                },
                payload: Payload::Inline(Value::Null),
                payload_migration_version: ctx.migration_version(),
                fresh: true,
                unfinalized: None,
                orphans: OrphanQueue::new(max_attempts),
            },
        );
    };

    let record = StoredRecord::decode(&entry.value)?;
    let base = codec.read_payload(records, retry, &record.committed).await?;
    let read = reader.read(&base, record.pending.as_ref()).await?;
    let mut orphans = OrphanQueue::from_entries(record.orphans.clone(), max_attempts);

    let mut value_migration_version = record.migration_version;
    let mut unfinalized = None;
    if let (Some(marker), Some(pending)) = (read.marker, &record.pending) {
        match marker {
            MarkerState::Committed => {
                value_migration_version =
                    pending.migration_version.unwrap_or(record.migration_version);
                tracing::info!(
                    key,
                    tx_id = %pending.tx_id,
                    "Recovered committed transaction; finalizing on next save"
                );
                unfinalized = Some(Unfinalized {
                    tx_id: pending.tx_id,
                    value: read.value.clone(),
                    migration_version: value_migration_version,
                    spilled_patch: pending.patch_shard_keys().to_vec(),
                });
            }
            MarkerState::Pending => {
                tracing::info!(key, tx_id = %pending.tx_id, "Rolling back interrupted transaction");
                let now = ctx.stores.time.now_ms().await;
                orphans.enqueue(OrphanEntry::new(
                    ArtifactKind::Marker,
                    vec![reader.marker_key(&pending.tx_id)],
                    now,
                ));
                orphans.enqueue(OrphanEntry::new(
                    ArtifactKind::Shard,
                    pending.patch_shard_keys().to_vec(),
                    now,
                ));
                let repaired = StoredRecord {
                    committed: record.committed.clone(),
                    pending: None,
                    migration_version: record.migration_version,
                    orphans: orphans.snapshot(),
                };
                // The marker and any spilled patch stay protected while the
                // document still names them
                let bytes = repaired.encode()?;
                if let Err(err) = retry.execute(|| records.set(record_key, bytes.clone())).await {
                    tracing::warn!(key, error = %err, "Failed to clear rolled-back transaction");
                }
            }
        }
    }

    finish(
        ctx,
        key,
        Resolved {
            value: read.value.clone(),
            value_migration_version,
            committed: CommittedSnapshot {
                value: read.value,
                version: Some(entry.version),
            },
            payload: record.committed,
            payload_migration_version: record.migration_version,
            fresh: false,
            unfinalized,
            orphans,
        },
    )
}

struct Resolved {
    value: Value,
    value_migration_version: u32,
    committed: CommittedSnapshot,
    payload: Payload,
    payload_migration_version: u32,
    fresh: bool,
    unfinalized: Option<Unfinalized>,
    orphans: OrphanQueue,
}

/// Migrate, fill template defaults and validate
fn finish(ctx: &SessionContext, key: &str, resolved: Resolved) -> HoldfastResult<Loaded> {
    let (migrated, migrated_changed) =
        ctx.migrate(resolved.value, resolved.value_migration_version)?;
    let templated = apply_template(&migrated, &ctx.template);
    let filled = templated.is_changed();
    let current = templated.into_value();

    if !ctx.validate(&current) {
        tracing::error!(key, "Stored record fails schema validation");
        return Err(HoldfastError::schema_rejected(key));
    }

    Ok(Loaded {
        current,
        committed: resolved.committed,
        payload: resolved.payload,
        payload_migration_version: resolved.payload_migration_version,
        dirty: resolved.fresh || migrated_changed || filled,
        unfinalized: resolved.unfinalized,
        orphans: resolved.orphans,
    })
}
