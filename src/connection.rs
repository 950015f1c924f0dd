//! The shared connection object: engine pool, store registry, metric and
//! event definition lifecycle.
//!
//! A `Connection` is cheap to share behind an `Arc`. Workers get their own
//! engine handle transparently when the backend supports threading; the
//! embedded SQL backend shares a single handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;

use crate::config::{CattleConfig, EngineConfig};
use crate::engines::{StorageEngine, StorageTable, create_engine, engine_capabilities};
use crate::errors::{CdbError, Result};
use crate::models::{
    EventDefinition, EventSeriesType, MetricDefinition, merge_definitions, resolve_event_type,
};
use crate::signals::SignalHub;
use crate::stores::{
    ActivityStore, ConfigStore, EventStore, MetaDataStore, STORE_TABLES, TimeSeriesStore, now_ts,
};

/// Hard cap on live engine handles across all workers.
pub const MAX_WORKERS: usize = 1000;

pub(crate) struct EnginePool {
    engine_config: EngineConfig,
    read_only: bool,
    admin: bool,
    table_prefix: String,
    threading: bool,
    engines: Mutex<HashMap<String, Arc<dyn StorageEngine>>>,
}

impl EnginePool {
    pub(crate) fn new(
        engine_config: EngineConfig,
        read_only: bool,
        admin: bool,
        table_prefix: String,
        threading: bool,
    ) -> Self {
        Self {
            engine_config,
            read_only,
            admin,
            table_prefix,
            threading,
            engines: Mutex::new(HashMap::new()),
        }
    }

    /// Engine handle for the calling worker, created on first use.
    pub(crate) async fn engine(&self) -> Result<Arc<dyn StorageEngine>> {
        let worker = format!("{:?}", std::thread::current().id());
        self.engine_for(&worker).await
    }

    pub(crate) async fn engine_for(&self, worker: &str) -> Result<Arc<dyn StorageEngine>> {
        let slot = if self.threading { worker } else { "shared" };
        let mut engines = self.engines.lock().await;
        if let Some(engine) = engines.get(slot) {
            return Ok(engine.clone());
        }
        if engines.len() >= MAX_WORKERS {
            return Err(CdbError::TooManyWorkers(engines.len()));
        }
        let engine = create_engine(
            &self.engine_config,
            self.read_only,
            self.admin,
            &self.table_prefix,
        )
        .await?;
        tracing::info!(worker = slot, engines = engines.len() + 1, "created engine handle");
        engines.insert(slot.to_string(), engine.clone());
        Ok(engine)
    }

    pub(crate) async fn disconnect_all(&self) {
        let mut engines = self.engines.lock().await;
        for engine in engines.values() {
            engine.disconnect().await;
        }
        engines.clear();
    }
}

pub struct Connection {
    read_only: bool,
    admin: bool,
    pool: EnginePool,
    metrics: RwLock<Vec<MetricDefinition>>,
    events: RwLock<Vec<EventDefinition>>,
    initialised: AtomicBool,
    signals: SignalHub,
}

impl Connection {
    pub fn new(config: CattleConfig) -> Result<Self> {
        for metric in &config.metrics {
            metric.validate()?;
        }
        let threading = engine_capabilities(&config.engine).threading;
        Ok(Self {
            read_only: config.read_only,
            admin: config.admin,
            pool: EnginePool::new(
                config.engine,
                config.read_only,
                config.admin,
                config.table_prefix,
                threading,
            ),
            metrics: RwLock::new(config.metrics),
            events: RwLock::new(config.events),
            initialised: AtomicBool::new(false),
            signals: SignalHub::new(),
        })
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised.load(Ordering::Acquire)
    }

    pub fn signals(&self) -> &SignalHub {
        &self.signals
    }

    // ── Store accessors ──

    pub fn timeseries(&self) -> TimeSeriesStore<'_> {
        TimeSeriesStore { conn: self }
    }

    pub fn events(&self) -> EventStore<'_> {
        EventStore { conn: self }
    }

    pub fn activity(&self) -> ActivityStore<'_> {
        ActivityStore { conn: self }
    }

    pub fn metadata(&self) -> MetaDataStore<'_> {
        MetaDataStore { conn: self }
    }

    pub fn config_store(&self) -> ConfigStore<'_> {
        ConfigStore { conn: self }
    }

    // ── Engine access ──

    pub(crate) async fn engine(&self) -> Result<Arc<dyn StorageEngine>> {
        self.pool.engine().await
    }

    pub(crate) async fn table(&self, name: &str) -> Result<Box<dyn StorageTable>> {
        self.engine().await?.get_table(name)
    }

    // ── Definitions ──

    pub fn metric_definitions(&self) -> Vec<MetricDefinition> {
        self.metrics.read().unwrap().clone()
    }

    pub fn event_definitions(&self) -> Vec<EventDefinition> {
        self.events.read().unwrap().clone()
    }

    pub(crate) fn metric_by_name(&self, name: &str) -> Option<MetricDefinition> {
        self.metrics
            .read()
            .unwrap()
            .iter()
            .find(|m| m.name == name)
            .cloned()
    }

    pub(crate) fn metric_by_id(&self, id: &str) -> Option<MetricDefinition> {
        self.metrics
            .read()
            .unwrap()
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    pub(crate) fn resolve_event_type(&self, name: &str) -> EventSeriesType {
        resolve_event_type(&self.events.read().unwrap(), name)
    }

    /// Merge new metric definitions (replace by id), persist them and create
    /// the new column families.
    pub async fn add_metric_definitions(&self, definitions: Vec<MetricDefinition>) -> Result<()> {
        self.ensure_writable()?;
        for metric in &definitions {
            metric.validate()?;
        }
        let merged = {
            let mut metrics = self.metrics.write().unwrap();
            *metrics = merge_definitions(&metrics, &definitions, |m| m.id.as_str());
            metrics.clone()
        };
        let config = self.config_store();
        config.put("metrics", &merged).await?;
        config.put("last_change", &now_ts()).await?;
        if self.admin {
            let engine = self.engine().await?;
            for metric in &definitions {
                engine
                    .setup_column_family("timeseries", &metric.id, true)
                    .await?;
            }
        }
        Ok(())
    }

    /// Merge new event definitions (replace by name) and persist them.
    pub async fn add_event_definitions(&self, definitions: Vec<EventDefinition>) -> Result<()> {
        self.ensure_writable()?;
        let merged = {
            let mut events = self.events.write().unwrap();
            *events = merge_definitions(&events, &definitions, |e| e.name.as_str());
            events.clone()
        };
        let config = self.config_store();
        config.put("events", &merged).await?;
        config.put("last_change", &now_ts()).await?;
        Ok(())
    }

    // ── Guards ──

    pub(crate) fn ensure_initialised(&self) -> Result<()> {
        if !self.is_initialised() {
            return Err(CdbError::NotInitialised);
        }
        Ok(())
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        self.ensure_initialised()?;
        if self.read_only {
            return Err(CdbError::ReadOnly);
        }
        Ok(())
    }

    // ── Lifecycle ──

    /// Create all tables and column families, persist the definition lists
    /// and mark the database initialised. Fails with `AlreadyInitialised`
    /// when the marker exists and `force` is not set.
    pub async fn database_init(&self, force: bool) -> Result<()> {
        if self.read_only {
            return Err(CdbError::ReadOnly);
        }
        let engine = self.engine().await?;

        // the config table must exist before the marker can be checked
        engine.setup_table("config", true).await?;
        engine.setup_column_family("config", "c", true).await?;

        let config = self.config_store();
        let marker: Option<serde_json::Value> = config.get("database_init").await?;
        if marker.is_some() && !force {
            return Err(CdbError::AlreadyInitialised);
        }

        for spec in STORE_TABLES {
            engine.setup_table(spec.name, true).await?;
            for family in spec.families {
                engine.setup_column_family(spec.name, family, true).await?;
            }
        }
        for metric in self.metric_definitions() {
            engine
                .setup_column_family("timeseries", &metric.id, true)
                .await?;
        }

        config.put("metrics", &self.metric_definitions()).await?;
        config.put("events", &self.event_definitions()).await?;
        config
            .put("database_init", &serde_json::json!({ "ts": now_ts() }))
            .await?;
        config.put("last_change", &now_ts()).await?;

        self.initialised.store(true, Ordering::Release);
        tracing::info!("database initialised");
        Ok(())
    }

    /// Read the persisted definitions back and mark the connection
    /// initialised. Safe for read-only workers.
    pub async fn service_init(&self) -> Result<()> {
        let config = self.config_store();
        let metrics: Option<Vec<MetricDefinition>> = match config.get("metrics").await {
            Ok(value) => value,
            Err(CdbError::Backend(_)) => None,
            Err(e) => return Err(e),
        };
        let Some(metrics) = metrics else {
            return Err(CdbError::NotInitialised);
        };
        let events: Vec<EventDefinition> = config.get("events").await?.unwrap_or_default();

        *self.metrics.write().unwrap() = metrics;
        *self.events.write().unwrap() = events;
        self.initialised.store(true, Ordering::Release);
        tracing::info!("service initialised");
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.pool.disconnect_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetricType;
    use crate::series::{FloatTimeSeries, TimeSeries};
    use crate::stores::testutil;

    #[tokio::test]
    async fn test_database_init_twice_fails() {
        let conn = testutil::connect().await;
        let err = conn.database_init(false).await.unwrap_err();
        assert!(matches!(err, CdbError::AlreadyInitialised));
        conn.database_init(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_not_initialised_guard() {
        let conn = Connection::new(CattleConfig::sqlite_in_memory()).unwrap();
        let err = conn
            .timeseries()
            .get::<f32>("sensor1", &["ph"], 0, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, CdbError::NotInitialised));
    }

    #[tokio::test]
    async fn test_service_init_reads_definitions_back() {
        let conn = testutil::connect().await;
        conn.add_metric_definitions(vec![MetricDefinition::new(
            "flow",
            "flw",
            MetricType::FloatSeries,
            true,
        )])
        .await
        .unwrap();

        // wipe the in-memory lists, then restore them from the config table
        *conn.metrics.write().unwrap() = Vec::new();
        *conn.events.write().unwrap() = Vec::new();
        conn.service_init().await.unwrap();

        assert!(conn.metric_by_name("flow").is_some());
        assert!(conn.metric_by_name("ph").is_some());
        assert_eq!(conn.event_definitions().len(), testutil::test_events().len());
    }

    #[tokio::test]
    async fn test_service_init_on_empty_database() {
        let conn = Connection::new(CattleConfig::sqlite_in_memory()).unwrap();
        let err = conn.service_init().await.unwrap_err();
        assert!(matches!(err, CdbError::NotInitialised));
    }

    #[tokio::test]
    async fn test_definition_merge_replaces_and_appends() {
        let conn = testutil::connect().await;
        let before = conn.metric_definitions().len();
        conn.add_metric_definitions(vec![
            // replaces the existing "ph" definition by id
            MetricDefinition::new("ph_new", "ph", MetricType::FloatSeries, false),
            MetricDefinition::new("flow", "flw", MetricType::FloatSeries, true),
        ])
        .await
        .unwrap();
        let after = conn.metric_definitions();
        assert_eq!(after.len(), before + 1);
        assert_eq!(conn.metric_by_id("ph").unwrap().name, "ph_new");

        let last_change: Option<i64> = conn.config_store().get("last_change").await.unwrap();
        assert!(last_change.is_some());
    }

    #[tokio::test]
    async fn test_added_metric_is_usable() {
        let conn = testutil::connect().await;
        conn.add_metric_definitions(vec![MetricDefinition::new(
            "flow",
            "flw",
            MetricType::FloatSeries,
            true,
        )])
        .await
        .unwrap();
        let series = TimeSeries::with_points("dev42", "flow", [(1_577_836_800, 1.0f32)]).unwrap();
        conn.timeseries().insert(&series).await.unwrap();
        let back: FloatTimeSeries = conn
            .timeseries()
            .get_single("dev42", "flow", 1_577_836_800, 1_577_836_801)
            .await
            .unwrap();
        assert_eq!(back.len(), 1);
    }

    #[tokio::test]
    async fn test_read_only_shared_database() {
        let dir = tempfile::tempdir().unwrap();
        let sqlite = crate::config::SqliteOptions {
            data_dir: dir.path().to_string_lossy().to_string(),
            in_memory: false,
        };
        let mut writer_config = CattleConfig {
            engine: EngineConfig::Sqlite(sqlite.clone()),
            ..CattleConfig::default()
        };
        writer_config.metrics = testutil::test_metrics();
        let writer = Connection::new(writer_config).unwrap();
        writer.database_init(false).await.unwrap();
        let series = TimeSeries::with_points("dev42", "ph", [(1_577_836_800, 1.0f32)]).unwrap();
        writer.timeseries().insert(&series).await.unwrap();
        writer.disconnect().await;

        let reader_config = CattleConfig {
            engine: EngineConfig::Sqlite(sqlite),
            read_only: true,
            admin: false,
            ..CattleConfig::default()
        };
        let reader = Connection::new(reader_config).unwrap();
        reader.service_init().await.unwrap();
        assert!(reader.metric_by_name("ph").is_some());

        let back: FloatTimeSeries = reader
            .timeseries()
            .get_single("dev42", "ph", 1_577_836_800, 1_577_836_801)
            .await
            .unwrap();
        assert_eq!(back.len(), 1);

        let err = reader.timeseries().insert(&series).await.unwrap_err();
        assert!(matches!(err, CdbError::ReadOnly));
        let err = reader.database_init(false).await.unwrap_err();
        assert!(matches!(err, CdbError::ReadOnly));
    }

    #[tokio::test]
    async fn test_engine_pool_saturation() {
        let pool = EnginePool::new(
            CattleConfig::sqlite_in_memory().engine,
            false,
            true,
            "cdb".to_string(),
            true,
        );
        for i in 0..MAX_WORKERS {
            pool.engine_for(&format!("worker-{i}")).await.unwrap();
        }
        let err = pool.engine_for("one-too-many").await.unwrap_err();
        assert!(matches!(err, CdbError::TooManyWorkers(_)));
        // existing workers keep their handle
        pool.engine_for("worker-0").await.unwrap();
    }

    #[tokio::test]
    async fn test_non_threading_backend_shares_one_engine() {
        let pool = EnginePool::new(
            CattleConfig::sqlite_in_memory().engine,
            false,
            true,
            "cdb".to_string(),
            false,
        );
        let a = pool.engine_for("worker-a").await.unwrap();
        let b = pool.engine_for("worker-b").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
