//! Event storage: daily and monthly buckets of heterogeneous JSON-like
//! values under the single family `e`.
//!
//! The definition list decides the bucketing per event name; `*`-suffixed
//! definitions are prefix patterns and the longest match wins, defaulting
//! to daily. Monthly rows carry an `m_` marker in front of the name so the
//! two shapes never collide.

use std::time::Instant;

use crate::connection::Connection;
use crate::engines::{ScanQuery, split_column};
use crate::errors::{CdbError, Result};
use crate::models::{DictValue, EventSeriesType, RowUpsert};
use crate::series::EventList;
use crate::signals::StoreMethod;
use crate::stores::{emit, guard_window, now_ts};
use crate::time::{SECONDS_DAY, iter_days, iter_months, reverse_day_key, reverse_month_key};

pub const TABLE: &str = "events";

pub const MAX_DAILY_WINDOW: i64 = 45 * SECONDS_DAY;
pub const MAX_MONTHLY_WINDOW: i64 = 4 * 365 * SECONDS_DAY;

/// Row-scan bound for last-event lookups, in bucket rows.
const LAST_EVENTS_SCAN_LIMIT: usize = 180;

const STORE: &str = "event";

pub struct EventStore<'a> {
    pub(crate) conn: &'a Connection,
}

impl EventStore<'_> {
    pub fn row_key(key: &str, name: &str, ts: i64, series_type: EventSeriesType) -> String {
        match series_type {
            EventSeriesType::Daily => format!("{}#{}#{}", key, name, reverse_day_key(ts)),
            EventSeriesType::Monthly => {
                format!("{}#m_{}#{}", key, name, reverse_month_key(ts))
            }
        }
    }

    fn row_prefix(key: &str, name: &str, series_type: EventSeriesType) -> String {
        match series_type {
            EventSeriesType::Daily => format!("{key}#{name}#"),
            EventSeriesType::Monthly => format!("{key}#m_{name}#"),
        }
    }

    fn bucket_keys(
        key: &str,
        name: &str,
        from_ts: i64,
        to_ts: i64,
        series_type: EventSeriesType,
    ) -> Vec<String> {
        match series_type {
            EventSeriesType::Daily => iter_days(from_ts, to_ts)
                .map(|ts| Self::row_key(key, name, ts, series_type))
                .collect(),
            EventSeriesType::Monthly => iter_months(from_ts, to_ts)
                .map(|ts| Self::row_key(key, name, ts, series_type))
                .collect(),
        }
    }

    fn guard(&self, from_ts: i64, to_ts: i64, series_type: EventSeriesType) -> Result<()> {
        match series_type {
            EventSeriesType::Daily => guard_window(from_ts, to_ts, MAX_DAILY_WINDOW, "get_events"),
            EventSeriesType::Monthly => {
                guard_window(from_ts, to_ts, MAX_MONTHLY_WINDOW, "get_events")
            }
        }
    }

    /// Write a whole event list into its bucket rows. Returns the event
    /// count.
    pub async fn insert_events(&self, events: &EventList) -> Result<usize> {
        self.conn.ensure_writable()?;
        if events.is_empty() {
            return Err(CdbError::InvalidArgument("empty event list".to_string()));
        }
        let series_type = self.conn.resolve_event_type(events.name());

        let started = Instant::now();
        let buckets = match series_type {
            EventSeriesType::Daily => events.daily_cells()?,
            EventSeriesType::Monthly => events.monthly_cells()?,
        };
        let mut upserts = Vec::with_capacity(buckets.len());
        for (bucket_ts, cells) in buckets {
            let mut upsert = RowUpsert::new(Self::row_key(
                events.key(),
                events.name(),
                bucket_ts,
                series_type,
            ));
            for (ts, bytes) in cells {
                upsert.cells.insert(format!("e:{ts}"), bytes);
            }
            upserts.push(upsert);
        }
        let row_keys: Vec<String> = upserts.iter().map(|u| u.row_key.clone()).collect();

        let table = self.conn.table(TABLE).await?;
        table.upsert_rows(&upserts).await?;

        emit(
            self.conn,
            STORE,
            StoreMethod::Put,
            row_keys.len(),
            row_keys,
            started,
        );
        Ok(events.len())
    }

    pub async fn insert_event(
        &self,
        key: &str,
        name: &str,
        ts: i64,
        data: DictValue,
    ) -> Result<usize> {
        let mut events = EventList::new(key, name)?;
        events.insert_point(ts, 0, data, false);
        self.insert_events(&events).await
    }

    pub async fn get_events(
        &self,
        key: &str,
        name: &str,
        from_ts: i64,
        to_ts: i64,
    ) -> Result<EventList> {
        self.conn.ensure_initialised()?;
        let series_type = self.conn.resolve_event_type(name);
        self.guard(from_ts, to_ts, series_type)?;

        let started = Instant::now();
        let row_keys = Self::bucket_keys(key, name, from_ts, to_ts, series_type);
        let table = self.conn.table(TABLE).await?;
        let rows = table
            .read_rows(&row_keys, Some(&["e".to_string()]))
            .await?;

        let mut events = EventList::new(key, name)?;
        for (_, cells) in &rows {
            for (column, bytes) in cells {
                let (_, qualifier) = split_column(column)?;
                let Ok(ts) = qualifier.parse::<i64>() else {
                    continue;
                };
                events.insert_cell(ts, bytes, false)?;
            }
        }
        events.trim_by_ts(from_ts, to_ts);

        emit(
            self.conn,
            STORE,
            StoreMethod::Get,
            row_keys.len(),
            row_keys,
            started,
        );
        Ok(events)
    }

    /// Up to `count` newest events, scanning backwards from `max_ts`.
    pub async fn get_last_events(
        &self,
        key: &str,
        name: &str,
        count: usize,
        min_ts: Option<i64>,
        max_ts: Option<i64>,
    ) -> Result<EventList> {
        self.conn.ensure_initialised()?;
        let series_type = self.conn.resolve_event_type(name);

        let started = Instant::now();
        let start_ts = max_ts.unwrap_or_else(|| now_ts() + SECONDS_DAY);
        let mut query = ScanQuery::from_start(Self::row_key(key, name, start_ts, series_type))
            .prefix(Self::row_prefix(key, name, series_type))
            .families(vec!["e".to_string()])
            .limit(LAST_EVENTS_SCAN_LIMIT.max(count));
        query.end_key = min_ts.map(|ts| Self::row_key(key, name, ts, series_type));

        let table = self.conn.table(TABLE).await?;
        let rows = table.scan_rows(&query).await?;

        let mut events = EventList::new(key, name)?;
        let mut row_keys = Vec::new();
        for (row_key, cells) in &rows {
            row_keys.push(row_key.clone());
            for (column, bytes) in cells {
                let (_, qualifier) = split_column(column)?;
                let Ok(ts) = qualifier.parse::<i64>() else {
                    continue;
                };
                events.insert_cell(ts, bytes, false)?;
            }
            if events.len() >= count {
                break;
            }
        }
        events.trim_by_ts(min_ts.unwrap_or(i64::MIN), max_ts.unwrap_or(i64::MAX));
        events.trim_newest(count);

        emit(
            self.conn,
            STORE,
            StoreMethod::Last,
            row_keys.len(),
            row_keys,
            started,
        );
        Ok(events)
    }

    pub async fn get_last_event(&self, key: &str, name: &str) -> Result<EventList> {
        self.get_last_events(key, name, 1, None, None).await
    }

    /// Delete all bucket rows overlapping the range. Returns the number of
    /// rows touched.
    pub async fn delete_events(
        &self,
        key: &str,
        name: &str,
        from_ts: i64,
        to_ts: i64,
    ) -> Result<usize> {
        self.conn.ensure_writable()?;
        if from_ts > to_ts {
            return Err(CdbError::InvalidArgument(
                "from_ts is after to_ts".to_string(),
            ));
        }
        let series_type = self.conn.resolve_event_type(name);

        let started = Instant::now();
        let row_keys = Self::bucket_keys(key, name, from_ts, to_ts, series_type);
        let table = self.conn.table(TABLE).await?;
        for row_key in &row_keys {
            table.delete_row(row_key, None).await?;
        }

        let count = row_keys.len();
        emit(
            self.conn,
            STORE,
            StoreMethod::Delete,
            count,
            row_keys,
            started,
        );
        Ok(count)
    }
}
