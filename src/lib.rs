//! CattleDB: a time-series and event database on top of a wide-column
//! key-value store.
//!
//! Samples are bucketised into per-day (or per-month) rows under a
//! reverse-chronological row-key scheme, so "newest first" reads are plain
//! forward scans. Four stores (time series, events, activity counters,
//! metadata) share one table abstraction over pluggable storage engines;
//! the two reference backends are a ClickHouse cluster store and an
//! embedded SQLite file.
//!
//! ```no_run
//! use cattledb::{CattleConfig, Connection, FloatTimeSeries, TimeSeries};
//!
//! # async fn demo() -> cattledb::Result<()> {
//! let conn = Connection::new(CattleConfig::load("cattledb.toml")?)?;
//! conn.service_init().await?;
//!
//! let series: FloatTimeSeries =
//!     TimeSeries::with_points("sensor1", "temp", [(1_577_836_800, 21.5f32)])?;
//! conn.timeseries().insert(&series).await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod engines;
pub mod errors;
pub mod models;
pub mod proto;
pub mod series;
pub mod signals;
pub mod stores;
pub mod time;

pub use config::{CattleConfig, EngineConfig, setup_logging};
pub use connection::{Connection, MAX_WORKERS};
pub use errors::{CdbError, Result};
pub use models::{
    DeviceActivityItem, DictValue, EventDefinition, EventSeriesType, MetaDataItem,
    MetricDefinition, MetricType, ReaderActivityItem, RowUpsert,
};
pub use series::{
    AggregationFunction, AggregationSpan, AggregationValue, AnySeries, DictTimeSeries, EventList,
    FloatTimeSeries, RawPoint, TimeMode, TimeSeries,
};
pub use signals::{SignalHub, StoreMethod, StoreSignal};
pub use stores::{ActivityStore, ConfigStore, EventStore, MetaDataStore, TimeSeriesStore};
