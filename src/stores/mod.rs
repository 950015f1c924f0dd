//! Data stores sharing one table abstraction.
//!
//! Every public store operation checks initialisation (and the read-only
//! flag for mutations), talks to the backend through the calling worker's
//! engine handle, and emits a timed [`StoreSignal`] on the connection's hub.

pub mod activity;
pub mod config;
pub mod events;
pub mod metadata;
pub mod timeseries;

pub use activity::ActivityStore;
pub use config::ConfigStore;
pub use events::EventStore;
pub use metadata::MetaDataStore;
pub use timeseries::TimeSeriesStore;

use std::time::Instant;

use crate::connection::Connection;
use crate::errors::{CdbError, Result};
use crate::signals::{StoreMethod, StoreSignal};

/// Table and column families owned by one store.
pub struct TableSpec {
    pub name: &'static str,
    pub families: &'static [&'static str],
}

/// All tables created by `database_init`. Metric families are added on top
/// of the timeseries table's fixed families.
pub const STORE_TABLES: &[TableSpec] = &[
    TableSpec {
        name: "timeseries",
        families: &["_meta", "_v"],
    },
    TableSpec {
        name: "events",
        families: &["e"],
    },
    TableSpec {
        name: "activity",
        families: &["c"],
    },
    TableSpec {
        name: "metadata",
        families: &["p", "i"],
    },
    TableSpec {
        name: "config",
        families: &["c"],
    },
];

pub(crate) fn now_ts() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

pub(crate) fn guard_window(from_ts: i64, to_ts: i64, max_window: i64, what: &str) -> Result<()> {
    if from_ts > to_ts {
        return Err(CdbError::InvalidArgument(format!(
            "{what}: from_ts {from_ts} is after to_ts {to_ts}"
        )));
    }
    if to_ts - from_ts > max_window {
        return Err(CdbError::RangeTooLarge(format!(
            "{what}: window of {}s exceeds {max_window}s",
            to_ts - from_ts
        )));
    }
    Ok(())
}

pub(crate) fn emit(
    conn: &Connection,
    store: &'static str,
    method: StoreMethod,
    count: usize,
    row_keys: Vec<String>,
    started: Instant,
) {
    let timer_s = started.elapsed().as_secs_f64();
    tracing::debug!(store, method = %method, count, timer_s, "store operation");
    conn.signals().emit(StoreSignal {
        store,
        method,
        count,
        row_keys,
        timer_s,
    });
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Arc;

    use crate::config::CattleConfig;
    use crate::connection::Connection;
    use crate::models::{EventDefinition, MetricDefinition, MetricType};

    pub fn test_metrics() -> Vec<MetricDefinition> {
        vec![
            MetricDefinition::new("ph", "ph", MetricType::FloatSeries, true),
            MetricDefinition::new("temp", "tmp", MetricType::FloatSeries, true),
            MetricDefinition::new("act", "act", MetricType::FloatSeries, true),
            MetricDefinition::new("rawph", "rph", MetricType::FloatSeries, false),
            MetricDefinition::new("note", "not", MetricType::DictSeries, true),
        ]
    }

    pub fn test_events() -> Vec<EventDefinition> {
        vec![
            EventDefinition::daily("test_daily"),
            EventDefinition::monthly("test_monthly"),
            EventDefinition::monthly("test_monthly_*"),
        ]
    }

    /// A fully initialised connection over an in-memory database.
    pub async fn connect() -> Arc<Connection> {
        let mut config = CattleConfig::sqlite_in_memory();
        config.metrics = test_metrics();
        config.events = test_events();
        let conn = Arc::new(Connection::new(config).unwrap());
        conn.database_init(false).await.unwrap();
        conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_window() {
        assert!(guard_window(0, 10, 100, "get").is_ok());
        assert!(matches!(
            guard_window(10, 0, 100, "get").unwrap_err(),
            CdbError::InvalidArgument(_)
        ));
        assert!(matches!(
            guard_window(0, 200, 100, "get").unwrap_err(),
            CdbError::RangeTooLarge(_)
        ));
    }

    #[test]
    fn test_store_tables_cover_all_stores() {
        let names: Vec<&str> = STORE_TABLES.iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec!["timeseries", "events", "activity", "metadata", "config"]
        );
    }
}
