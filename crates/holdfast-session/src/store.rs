//! Session store façade

use crate::context::SessionContext;
use crate::session::Session;
use crate::shard::ShardCodec;
use crate::transaction::TransactionReader;
use holdfast_core::{apply_template, HoldfastResult, MarkerState, StoredRecord, Value};

/// Opens sessions for one logical store
#[derive(Debug, Clone)]
pub struct SessionStore {
    ctx: SessionContext,
}

impl SessionStore {
    /// Store over `ctx`
    pub fn new(ctx: SessionContext) -> Self {
        Self { ctx }
    }

    /// Context shared by every session this store opens
    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Lock and load `key`
    pub async fn load(&self, key: &str) -> HoldfastResult<Session> {
        Session::load(self.ctx.clone(), key).await
    }

    /// Read the committed value of `key` without taking its lock.
    ///
    /// Returns `None` for a key that was never committed. The value is
    /// migrated and template-filled the same way a load would, but nothing is
    /// written back.
    pub async fn peek(&self, key: &str) -> HoldfastResult<Option<Value>> {
        let ctx = &self.ctx;
        let retry = &ctx.config.retry;
        let records = ctx.stores.records.as_ref();
        let record_key = ctx.keyspace.record_key(key);

        let Some(entry) = retry.execute(|| records.get(&record_key)).await? else {
            return Ok(None);
        };
        let record = StoredRecord::decode(&entry.value)?;
        let codec = ShardCodec::new(ctx.keyspace.clone(), ctx.config.session.max_entry_bytes);
        let base = codec.read_payload(records, retry, &record.committed).await?;

        let reader = TransactionReader::new(
            ctx.stores.markers.clone(),
            ctx.keyspace.clone(),
            retry.clone(),
        )
        .with_patch_shards(ctx.stores.records.clone(), codec);
        let read = reader.read(&base, record.pending.as_ref()).await?;
        if read.value.is_null() {
            return Ok(None);
        }

        let version = match (&read.marker, &record.pending) {
            (Some(MarkerState::Committed), Some(pending)) => {
                pending.migration_version.unwrap_or(record.migration_version)
            }
            _ => record.migration_version,
        };
        let (migrated, _) = ctx.migrate(read.value, version)?;
        Ok(Some(apply_template(&migrated, &ctx.template).into_value()))
    }
}
