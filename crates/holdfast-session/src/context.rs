//! Session context
//!
//! Everything a session needs from its host is injected here: store handles,
//! the default template, the schema predicate, migration steps, change
//! callbacks and configuration. Nothing is looked up from process-wide state,
//! so two contexts over different backends can coexist in one process.

use holdfast_core::{
    HoldfastConfig, HoldfastError, HoldfastResult, Keyspace, LeaseMapEffects,
    PhysicalTimeEffects, RecordStoreEffects, Value,
};
use std::fmt;
use std::sync::Arc;

/// Schema predicate; `true` means the record is valid
pub type SchemaFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Change callback invoked with `(key, new, old)`
pub type ChangedCallback = Arc<dyn Fn(&str, &Value, Option<&Value>) + Send + Sync>;

type MigrateFn = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

/// One named step of the data migration chain
#[derive(Clone)]
pub struct MigrationStep {
    /// Step name, used in errors and logs
    pub name: String,
    apply: MigrateFn,
}

impl MigrationStep {
    /// Step `name` running `apply`
    pub fn new<F>(name: impl Into<String>, apply: F) -> Self
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            apply: Arc::new(apply),
        }
    }

    /// Run the step on `value`
    pub fn apply(&self, value: Value) -> HoldfastResult<Value> {
        (self.apply)(value).map_err(|message| HoldfastError::migration(&self.name, message))
    }
}

impl fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationStep").field("name", &self.name).finish()
    }
}

/// Remote stores and clock used by sessions
#[derive(Clone)]
pub struct StoreHandles {
    /// Record documents and shards
    pub records: Arc<dyn RecordStoreEffects>,
    /// Transaction markers
    pub markers: Arc<dyn RecordStoreEffects>,
    /// Lease map for locks
    pub leases: Arc<dyn LeaseMapEffects>,
    /// Clock for leases, retries and timers
    pub time: Arc<dyn PhysicalTimeEffects>,
}

/// Immutable configuration shared by every session of one logical store
#[derive(Clone)]
pub struct SessionContext {
    pub(crate) keyspace: Keyspace,
    pub(crate) template: Value,
    pub(crate) schema: SchemaFn,
    pub(crate) migrations: Vec<MigrationStep>,
    pub(crate) changed_callbacks: Vec<ChangedCallback>,
    pub(crate) stores: StoreHandles,
    pub(crate) config: HoldfastConfig,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("name", &self.keyspace.name())
            .field("migrations", &self.migrations)
            .field("changed_callbacks", &self.changed_callbacks.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    /// Start building a context for the store `name`
    pub fn builder(name: impl Into<String>, stores: StoreHandles) -> SessionContextBuilder {
        SessionContextBuilder::new(name, stores)
    }

    /// Store name
    pub fn name(&self) -> &str {
        self.keyspace.name()
    }

    /// Key derivation for this store
    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    /// Defaults for new and incomplete records
    pub fn template(&self) -> &Value {
        &self.template
    }

    /// Effective configuration
    pub fn config(&self) -> &HoldfastConfig {
        &self.config
    }

    /// Backends shared by every session
    pub fn stores(&self) -> &StoreHandles {
        &self.stores
    }

    /// Run the schema predicate, if any
    pub fn validate(&self, value: &Value) -> bool {
        (self.schema)(value)
    }

    /// Index one past the last migration step
    pub fn migration_version(&self) -> u32 {
        u32::try_from(self.migrations.len()).unwrap_or(u32::MAX)
    }

    /// Run the migration steps after `from` in order.
    ///
    /// Returns the migrated value and whether any step ran.
    pub fn migrate(&self, value: Value, from: u32) -> HoldfastResult<(Value, bool)> {
        let target = self.migration_version();
        if from > target {
            return Err(HoldfastError::migration(
                format!("v{from}"),
                format!("stored data is newer than the {target} known migration steps"),
            ));
        }
        let mut value = value;
        let start = usize::try_from(from).unwrap_or(usize::MAX);
        for step in self.migrations.iter().skip(start) {
            tracing::info!(store = %self.name(), step = %step.name, "Applying migration");
            value = step.apply(value)?;
        }
        Ok((value, from < target))
    }
}

/// Builder for [`SessionContext`]
pub struct SessionContextBuilder {
    name: String,
    stores: StoreHandles,
    template: Value,
    schema: Option<SchemaFn>,
    migrations: Vec<MigrationStep>,
    changed_callbacks: Vec<ChangedCallback>,
    config: HoldfastConfig,
}

impl SessionContextBuilder {
    fn new(name: impl Into<String>, stores: StoreHandles) -> Self {
        Self {
            name: name.into(),
            stores,
            template: Value::map(),
            schema: None,
            migrations: Vec::new(),
            changed_callbacks: Vec::new(),
            config: HoldfastConfig::default(),
        }
    }

    /// Defaults for fresh records and missing keys
    pub fn template(mut self, template: impl Into<Value>) -> Self {
        self.template = template.into();
        self
    }

    /// Reject values failing `schema`
    pub fn schema<F>(mut self, schema: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.schema = Some(Arc::new(schema));
        self
    }

    /// Append a migration step
    pub fn migration(mut self, step: MigrationStep) -> Self {
        self.migrations.push(step);
        self
    }

    /// Run `callback` after every accepted mutation
    pub fn on_changed<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &Value, Option<&Value>) + Send + Sync + 'static,
    {
        self.changed_callbacks.push(Arc::new(callback));
        self
    }

    /// Replace the default configuration
    pub fn config(mut self, config: HoldfastConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration and the template, then build
    pub fn build(self) -> HoldfastResult<SessionContext> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(HoldfastError::config(
                "store name must be non-empty and must not contain '/'",
            ));
        }
        self.config.validate()?;

        let schema: SchemaFn = match self.schema {
            Some(schema) => schema,
            None => Arc::new(|_: &Value| true),
        };
        // A fresh record is the template itself
        if !schema(&self.template) {
            return Err(HoldfastError::config("template does not satisfy the schema"));
        }

        Ok(SessionContext {
            keyspace: Keyspace::new(self.name),
            template: self.template,
            schema,
            migrations: self.migrations,
            changed_callbacks: self.changed_callbacks,
            stores: self.stores,
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use holdfast_effects::{MemoryLeaseMap, MemoryRecordStore, RealTimeHandler};
    use serde_json::json;

    fn stores() -> StoreHandles {
        let time: Arc<dyn PhysicalTimeEffects> = Arc::new(RealTimeHandler::new());
        StoreHandles {
            records: Arc::new(MemoryRecordStore::new()),
            markers: Arc::new(MemoryRecordStore::new()),
            leases: Arc::new(MemoryLeaseMap::new(time.clone())),
            time,
        }
    }

    #[test]
    fn template_must_pass_schema() {
        let err = SessionContext::builder("players", stores())
            .template(json!({"coins": "zero"}))
            .schema(|v| v.get("coins").and_then(Value::as_i64).is_some())
            .build()
            .unwrap_err();
        assert!(matches!(err, HoldfastError::Config { .. }));
    }

    #[test]
    fn migrations_run_from_stored_version() {
        let ctx = SessionContext::builder("players", stores())
            .migration(MigrationStep::new("add-coins", |mut v| {
                v.insert("coins", 0);
                Ok(v)
            }))
            .migration(MigrationStep::new("double-coins", |mut v| {
                let coins = v.get("coins").and_then(Value::as_i64).unwrap_or(0);
                v.insert("coins", coins * 2);
                Ok(v)
            }))
            .build()
            .unwrap();

        let (value, ran) = ctx.migrate(Value::from(json!({"coins": 5})), 1).unwrap();
        assert!(ran);
        assert_eq!(value, Value::from(json!({"coins": 10})));

        let (_, ran) = ctx.migrate(Value::map(), 2).unwrap();
        assert!(!ran);
    }

    #[test]
    fn newer_stored_version_is_refused() {
        let ctx = SessionContext::builder("players", stores()).build().unwrap();
        let err = ctx.migrate(Value::map(), 3).unwrap_err();
        assert!(matches!(err, HoldfastError::Migration { .. }));
    }

    #[test]
    fn failing_step_names_itself() {
        let ctx = SessionContext::builder("players", stores())
            .migration(MigrationStep::new("explode", |_| Err("boom".to_string())))
            .build()
            .unwrap();
        let err = ctx.migrate(Value::map(), 0).unwrap_err();
        assert_eq!(err, HoldfastError::migration("explode", "boom"));
    }
}
