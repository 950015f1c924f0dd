//! Time-series storage over daily buckets and per-metric column families.
//!
//! Rows are `"{key}#{reverse_day}"`, cells `"{metric_id}:{ts}"` holding one
//! encoded point each. The reverse-day scheme makes "newest first" a forward
//! scan, so range endpoints are swapped: the scan starts at the row for
//! `to_ts` and ends at the row for `from_ts`.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::codec::{self, decode_cell};
use crate::connection::Connection;
use crate::engines::{ScanQuery, split_column};
use crate::errors::{CdbError, Result};
use crate::models::{MetricDefinition, MetricType};
use crate::series::{AnySeries, SeriesValue, TimeSeries};
use crate::signals::StoreMethod;
use crate::stores::{emit, guard_window, now_ts};
use crate::time::{SECONDS_DAY, iter_days, reverse_day_key};

pub const TABLE: &str = "timeseries";

/// A bit more than a year.
pub const MAX_GET_WINDOW: i64 = 400 * SECONDS_DAY;

const STORE: &str = "timeseries";

fn metric_tag(series_type: MetricType) -> u8 {
    match series_type {
        MetricType::FloatSeries => codec::TAG_FLOAT,
        MetricType::DictSeries => codec::TAG_DICT,
    }
}

pub struct TimeSeriesStore<'a> {
    pub(crate) conn: &'a Connection,
}

impl TimeSeriesStore<'_> {
    pub fn row_key(key: &str, ts: i64) -> String {
        format!("{}#{}", key, reverse_day_key(ts))
    }

    fn resolve_metric(&self, name: &str) -> Result<MetricDefinition> {
        self.conn
            .metric_by_name(name)
            .ok_or_else(|| CdbError::InvalidArgument(format!("metric {name} not known")))
    }

    fn resolve_typed_metric<V: SeriesValue>(&self, name: &str) -> Result<MetricDefinition> {
        let metric = self.resolve_metric(name)?;
        if metric_tag(metric.series_type) != V::TAG {
            return Err(CdbError::InvalidArgument(format!(
                "metric {name} has a different series type"
            )));
        }
        Ok(metric)
    }

    /// Write all points of a series into its daily bucket rows. Returns the
    /// point count.
    pub async fn insert<V: SeriesValue>(&self, series: &TimeSeries<V>) -> Result<usize> {
        self.conn.ensure_writable()?;
        if series.is_empty() {
            return Err(CdbError::InvalidArgument("empty series".to_string()));
        }
        let metric = self.resolve_typed_metric::<V>(series.metric())?;

        let started = Instant::now();
        let mut upserts = Vec::new();
        for (day, cells) in series.daily_cells()? {
            let mut upsert = crate::models::RowUpsert::new(Self::row_key(series.key(), day));
            for (ts, bytes) in cells {
                upsert.cells.insert(format!("{}:{}", metric.id, ts), bytes);
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
        Ok(series.len())
    }

    pub async fn insert_bulk<V: SeriesValue>(
        &self,
        series_list: &[TimeSeries<V>],
    ) -> Result<Vec<usize>> {
        let mut out = Vec::with_capacity(series_list.len());
        for series in series_list {
            out.push(self.insert(series).await?);
        }
        Ok(out)
    }

    /// Read the named metrics of one key over `[from_ts, to_ts]`.
    pub async fn get<V: SeriesValue>(
        &self,
        key: &str,
        metrics: &[&str],
        from_ts: i64,
        to_ts: i64,
    ) -> Result<Vec<TimeSeries<V>>> {
        self.conn.ensure_initialised()?;
        guard_window(from_ts, to_ts, MAX_GET_WINDOW, "get_timeseries")?;
        if metrics.is_empty() {
            return Err(CdbError::InvalidArgument("no metrics requested".to_string()));
        }
        let metric_objects = metrics
            .iter()
            .map(|m| self.resolve_typed_metric::<V>(m))
            .collect::<Result<Vec<_>>>()?;

        let started = Instant::now();
        // reverse keys invert the endpoints
        let query = ScanQuery::from_start(Self::row_key(key, to_ts))
            .end_key(Self::row_key(key, from_ts))
            .families(metric_objects.iter().map(|m| m.id.clone()).collect());
        let table = self.conn.table(TABLE).await?;
        let rows = table.scan_rows(&query).await?;

        let mut by_id: BTreeMap<&str, TimeSeries<V>> = BTreeMap::new();
        for m in &metric_objects {
            by_id.insert(m.id.as_str(), TimeSeries::new(key, m.name.as_str())?);
        }
        let row_keys: Vec<String> = rows.iter().map(|(k, _)| k.clone()).collect();
        // walk the scan newest-day-first in reverse so every point appends
        for (_, cells) in rows.iter().rev() {
            for (column, bytes) in cells {
                let (family, qualifier) = split_column(column)?;
                let Ok(ts) = qualifier.parse::<i64>() else {
                    continue;
                };
                if let Some(series) = by_id.get_mut(family) {
                    series.insert_cell(ts, bytes, false)?;
                }
            }
        }

        let mut out = Vec::with_capacity(metric_objects.len());
        for m in &metric_objects {
            let mut series = by_id.remove(m.id.as_str()).unwrap_or_else(|| {
                TimeSeries::new(key, m.name.as_str()).expect("validated above")
            });
            series.trim_by_ts(from_ts, to_ts);
            out.push(series);
        }

        emit(
            self.conn,
            STORE,
            StoreMethod::Get,
            row_keys.len(),
            row_keys,
            started,
        );
        Ok(out)
    }

    pub async fn get_single<V: SeriesValue>(
        &self,
        key: &str,
        metric: &str,
        from_ts: i64,
        to_ts: i64,
    ) -> Result<TimeSeries<V>> {
        let mut all = self.get(key, &[metric], from_ts, to_ts).await?;
        Ok(all.remove(0))
    }

    /// Newest point of one metric as a 0- or 1-point series.
    pub async fn get_last_value<V: SeriesValue>(
        &self,
        key: &str,
        metric: &str,
        min_ts: Option<i64>,
        max_ts: Option<i64>,
    ) -> Result<TimeSeries<V>> {
        self.conn.ensure_initialised()?;
        let metric = self.resolve_typed_metric::<V>(metric)?;

        let started = Instant::now();
        let start_key = Self::row_key(key, max_ts.unwrap_or_else(|| now_ts() + SECONDS_DAY));
        let end_key = min_ts.map(|ts| Self::row_key(key, ts));
        let prefix = format!("{key}#");

        let mut query = ScanQuery::from_start(start_key)
            .prefix(prefix)
            .families(vec![metric.id.clone()])
            .limit(1);
        query.end_key = end_key;

        let table = self.conn.table(TABLE).await?;
        let rows = table.scan_rows(&query).await?;

        let mut series = TimeSeries::new(key, metric.name.as_str())?;
        let mut row_keys = Vec::new();
        if let Some((row_key, cells)) = rows.into_iter().next() {
            row_keys.push(row_key);
            for (column, bytes) in &cells {
                let (_, qualifier) = split_column(column)?;
                let Ok(ts) = qualifier.parse::<i64>() else {
                    continue;
                };
                series.insert_cell(ts, bytes, false)?;
            }
        }
        series.trim_by_ts(min_ts.unwrap_or(i64::MIN), max_ts.unwrap_or(i64::MAX));
        series.trim_newest(1);

        emit(
            self.conn,
            STORE,
            StoreMethod::Last,
            row_keys.len(),
            row_keys,
            started,
        );
        Ok(series)
    }

    /// All series of one key, one per metric id encountered. Ids without a
    /// definition surface under their raw id.
    pub async fn get_all_metrics(
        &self,
        key: &str,
        from_ts: Option<i64>,
        to_ts: Option<i64>,
    ) -> Result<Vec<AnySeries>> {
        self.conn.ensure_initialised()?;
        if let (Some(from), Some(to)) = (from_ts, to_ts) {
            guard_window(from, to, MAX_GET_WINDOW, "get_all_metrics")?;
        }

        let started = Instant::now();
        let start_key = Self::row_key(key, to_ts.unwrap_or_else(|| now_ts() + SECONDS_DAY));
        let mut query = ScanQuery::from_start(start_key).prefix(format!("{key}#"));
        query.end_key = from_ts.map(|ts| Self::row_key(key, ts));

        let table = self.conn.table(TABLE).await?;
        let rows = table.scan_rows(&query).await?;
        let row_keys: Vec<String> = rows.iter().map(|(k, _)| k.clone()).collect();

        let mut by_id: BTreeMap<String, AnySeries> = BTreeMap::new();
        for (_, cells) in rows.iter().rev() {
            for (column, bytes) in cells {
                let (family, qualifier) = split_column(column)?;
                if family.starts_with('_') {
                    continue;
                }
                let Ok(ts) = qualifier.parse::<i64>() else {
                    continue;
                };
                let (ts_offset, value) = decode_cell(bytes)?;
                if !by_id.contains_key(family) {
                    let name = self
                        .conn
                        .metric_by_id(family)
                        .map(|m| m.name)
                        .unwrap_or_else(|| family.to_string());
                    by_id.insert(
                        family.to_string(),
                        AnySeries::empty_for_cell(key, &name, &value)?,
                    );
                }
                let series = by_id.get_mut(family).expect("inserted above");
                series.insert_decoded(ts, ts_offset, value)?;
            }
        }

        let mut out: Vec<AnySeries> = by_id.into_values().collect();
        let from = from_ts.unwrap_or(i64::MIN);
        let to = to_ts.unwrap_or(i64::MAX);
        for series in &mut out {
            series.trim_by_ts(from, to);
        }

        emit(
            self.conn,
            STORE,
            StoreMethod::Scan,
            row_keys.len(),
            row_keys,
            started,
        );
        Ok(out)
    }

    /// Delete the metrics' families from every day-bucket row in range.
    /// Refuses outright when any metric forbids deletion.
    pub async fn delete(
        &self,
        key: &str,
        metrics: &[&str],
        from_ts: i64,
        to_ts: i64,
    ) -> Result<usize> {
        self.conn.ensure_writable()?;
        if from_ts > to_ts {
            return Err(CdbError::InvalidArgument(
                "from_ts is after to_ts".to_string(),
            ));
        }
        let metric_objects = metrics
            .iter()
            .map(|m| self.resolve_metric(m))
            .collect::<Result<Vec<_>>>()?;
        for m in &metric_objects {
            if !m.delete_possible {
                return Err(CdbError::DeleteNotAllowed(m.name.clone()));
            }
        }
        let families: Vec<String> = metric_objects.iter().map(|m| m.id.clone()).collect();

        let started = Instant::now();
        let row_keys: Vec<String> = iter_days(from_ts, to_ts)
            .map(|day| Self::row_key(key, day))
            .collect();
        let table = self.conn.table(TABLE).await?;
        for row_key in &row_keys {
            table.delete_row(row_key, Some(&families)).await?;
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
