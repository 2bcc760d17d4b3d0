//! Store and context fixtures
//!
//! [`TestStores`] bundles in-memory handlers behind fault injectors and a
//! virtual clock. Several contexts built from the same `TestStores` share one
//! backend, which is how tests model independent processes.

use crate::clock::TokioClock;
use crate::faults::{FaultInjector, FaultyLeaseMap, FaultyRecordStore};
use holdfast_core::{HoldfastConfig, HoldfastResult, Value};
use holdfast_effects::{MemoryLeaseMap, MemoryRecordStore};
use holdfast_session::{SessionContext, SessionContextBuilder, StoreHandles};
use serde_json::json;
use std::sync::Arc;

/// Name of the store used by player fixtures
pub const PLAYERS: &str = "players";

/// Shared in-memory backend
#[derive(Clone)]
pub struct TestStores {
    /// Record documents and shards
    pub records: MemoryRecordStore,
    /// Transaction markers
    pub markers: MemoryRecordStore,
    /// Lock leases
    pub leases: MemoryLeaseMap,
    /// Clock driven by tokio time
    pub clock: Arc<TokioClock>,
    /// Faults for record and marker calls
    pub faults: FaultInjector,
    /// Faults for lease calls
    pub lease_faults: FaultInjector,
}

impl TestStores {
    /// Unbounded stores; call inside a tokio runtime
    pub fn new() -> Self {
        Self::with_records(MemoryRecordStore::new())
    }

    /// Record store rejecting entries above `limit` bytes
    pub fn with_entry_limit(limit: usize) -> Self {
        Self::with_records(MemoryRecordStore::with_max_value_bytes(limit))
    }

    fn with_records(records: MemoryRecordStore) -> Self {
        let clock = Arc::new(TokioClock::new());
        Self {
            records,
            markers: MemoryRecordStore::new(),
            leases: MemoryLeaseMap::new(clock.clone()),
            clock,
            faults: FaultInjector::new(),
            lease_faults: FaultInjector::new(),
        }
    }

    /// Handles as seen by a session, with fault injection in front
    pub fn handles(&self) -> StoreHandles {
        StoreHandles {
            records: Arc::new(FaultyRecordStore::new(
                self.records.clone(),
                self.faults.clone(),
            )),
            markers: Arc::new(FaultyRecordStore::new(
                self.markers.clone(),
                self.faults.clone(),
            )),
            leases: Arc::new(FaultyLeaseMap::new(
                self.leases.clone(),
                self.lease_faults.clone(),
            )),
            time: self.clock.clone(),
        }
    }

    /// Builder for a context over these stores with the testing config
    pub fn context_builder(&self, name: &str) -> SessionContextBuilder {
        SessionContext::builder(name, self.handles()).config(HoldfastConfig::for_testing())
    }
}

impl Default for TestStores {
    fn default() -> Self {
        Self::new()
    }
}

/// `{ "coins": 0, "inventory": {} }`
pub fn player_template() -> Value {
    Value::from(json!({"coins": 0, "inventory": {}}))
}

/// Valid players have numeric coins and a map inventory
pub fn player_schema(value: &Value) -> bool {
    value.get("coins").and_then(Value::as_f64).is_some()
        && value.get("inventory").is_some_and(Value::is_map)
}

/// Player context builder over `stores`
pub fn player_builder(stores: &TestStores) -> SessionContextBuilder {
    stores
        .context_builder(PLAYERS)
        .template(player_template())
        .schema(player_schema)
}

/// Player context over `stores` with the testing config
pub fn player_context(stores: &TestStores) -> HoldfastResult<SessionContext> {
    player_builder(stores).build()
}
