//! The in-memory time-series container.
//!
//! A `TimeSeries<V>` holds an ordered sequence of `(ts, ts_offset, value)`
//! points, unique and sorted by `ts`. The value type is either `f32` (float
//! series) or a JSON-valued map (dict series / events); both encode to the
//! cell layout in [`crate::codec`].

use chrono::{DateTime, FixedOffset};
use sha1::{Digest, Sha1};

use crate::codec::{self, CellValue};
use crate::errors::{CdbError, Result};
use crate::models::DictValue;
use crate::time::{
    day_left, day_right, hour_left, hour_right, month_left, month_right, ten_minute_left,
    ten_minute_right,
};

/// One sample: unix timestamp, informational UTC offset (seconds east), value.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPoint<V> {
    pub ts: i64,
    pub ts_offset: i32,
    pub value: V,
}

/// Value types storable in a series cell.
pub trait SeriesValue: Clone {
    const TAG: u8;

    fn encode_cell(&self, ts_offset: i32) -> Result<Vec<u8>>;
    fn decode_cell(bytes: &[u8]) -> Result<(i32, Self)>;
}

impl SeriesValue for f32 {
    const TAG: u8 = codec::TAG_FLOAT;

    fn encode_cell(&self, ts_offset: i32) -> Result<Vec<u8>> {
        Ok(codec::encode_float_cell(ts_offset, *self))
    }

    fn decode_cell(bytes: &[u8]) -> Result<(i32, Self)> {
        codec::decode_float_cell(bytes)
    }
}

impl SeriesValue for DictValue {
    const TAG: u8 = codec::TAG_DICT;

    fn encode_cell(&self, ts_offset: i32) -> Result<Vec<u8>> {
        codec::encode_dict_cell(ts_offset, self)
    }

    fn decode_cell(bytes: &[u8]) -> Result<(i32, Self)> {
        codec::decode_dict_cell(bytes)
    }
}

#[derive(Debug, Clone)]
pub struct TimeSeries<V> {
    key: String,
    metric: String,
    points: Vec<RawPoint<V>>,
}

pub type FloatTimeSeries = TimeSeries<f32>;
pub type DictTimeSeries = TimeSeries<DictValue>;
/// Event streams are dict series whose metric is called `name`.
pub type EventList = TimeSeries<DictValue>;

/// A decoded series of either value type, as surfaced by full-row scans.
#[derive(Debug, Clone)]
pub enum AnySeries {
    Float(FloatTimeSeries),
    Dict(DictTimeSeries),
}

impl AnySeries {
    pub fn key(&self) -> &str {
        match self {
            AnySeries::Float(s) => s.key(),
            AnySeries::Dict(s) => s.key(),
        }
    }

    pub fn metric(&self) -> &str {
        match self {
            AnySeries::Float(s) => s.metric(),
            AnySeries::Dict(s) => s.metric(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            AnySeries::Float(s) => s.len(),
            AnySeries::Dict(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> TimeSeries<V> {
    pub fn new(key: impl Into<String>, metric: impl Into<String>) -> Result<Self> {
        let key = key.into().to_lowercase();
        let metric = metric.into().to_lowercase();
        if key.len() < 3 {
            return Err(CdbError::InvalidArgument(format!(
                "key must be at least 3 chars: {key:?}"
            )));
        }
        if metric.len() < 2 {
            return Err(CdbError::InvalidArgument(format!(
                "metric must be at least 2 chars: {metric:?}"
            )));
        }
        Ok(Self {
            key,
            metric,
            points: Vec::new(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn ts_min(&self) -> Option<i64> {
        self.points.first().map(|p| p.ts)
    }

    pub fn ts_max(&self) -> Option<i64> {
        self.points.last().map(|p| p.ts)
    }

    pub fn first(&self) -> Option<&RawPoint<V>> {
        self.points.first()
    }

    pub fn last(&self) -> Option<&RawPoint<V>> {
        self.points.last()
    }

    /// Index of the first point with `ts >= given`.
    pub fn bisect_left(&self, ts: i64) -> usize {
        self.points.partition_point(|p| p.ts < ts)
    }

    /// Index after the last point with `ts <= given`.
    pub fn bisect_right(&self, ts: i64) -> usize {
        self.points.partition_point(|p| p.ts <= ts)
    }

    pub fn at_index(&self, index: usize) -> Option<&RawPoint<V>> {
        self.points.get(index)
    }

    pub fn at_ts(&self, ts: i64) -> Result<&RawPoint<V>> {
        self.points
            .get(self.index_of_ts(ts)?)
            .ok_or_else(|| CdbError::NotFound(format!("timestamp {ts}")))
    }

    pub fn index_of_ts(&self, ts: i64) -> Result<usize> {
        let idx = self.bisect_left(ts);
        match self.points.get(idx) {
            Some(p) if p.ts == ts => Ok(idx),
            _ => Err(CdbError::NotFound(format!("timestamp {ts}"))),
        }
    }

    /// Index of the point closest to `ts` (ties resolve to the earlier one).
    pub fn nearest_index_of_ts(&self, ts: i64) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        let idx = self.bisect_left(ts);
        if idx == 0 {
            return Some(0);
        }
        if idx == self.points.len() {
            return Some(idx - 1);
        }
        let before = self.points[idx - 1].ts;
        let after = self.points[idx].ts;
        if (ts - before).abs() <= (ts - after).abs() {
            Some(idx - 1)
        } else {
            Some(idx)
        }
    }

    /// Insert one point. Returns 1 when the series changed, 0 when a
    /// duplicate timestamp was dropped (`overwrite` replaces in place).
    pub fn insert_point(&mut self, ts: i64, ts_offset: i32, value: V, overwrite: bool) -> usize {
        let idx = self.bisect_left(ts);
        if let Some(p) = self.points.get_mut(idx) {
            if p.ts == ts {
                if overwrite {
                    p.ts_offset = ts_offset;
                    p.value = value;
                    return 1;
                }
                tracing::debug!(ts, key = %self.key, metric = %self.metric, "duplicate insert dropped");
                return 0;
            }
        }
        self.points.insert(
            idx,
            RawPoint {
                ts,
                ts_offset,
                value,
            },
        );
        1
    }

    /// Bulk insert of `(ts, value)` pairs with a zero offset.
    pub fn insert_points<I>(&mut self, points: I) -> usize
    where
        I: IntoIterator<Item = (i64, V)>,
    {
        points
            .into_iter()
            .map(|(ts, value)| self.insert_point(ts, 0, value, false))
            .sum()
    }

    /// Insert a point stamped with a zoned datetime; the timestamp and the
    /// local UTC offset are taken from the datetime.
    pub fn insert_from_datetime(&mut self, dt: DateTime<FixedOffset>, value: V) -> usize {
        self.insert_point(dt.timestamp(), dt.offset().local_minus_utc(), value, false)
    }

    pub fn remove_ts(&mut self, ts: i64) -> Result<RawPoint<V>> {
        let idx = self.index_of_ts(ts)?;
        Ok(self.points.remove(idx))
    }

    /// Keep only points with `min_ts <= ts <= max_ts`.
    pub fn trim_by_ts(&mut self, min_ts: i64, max_ts: i64) {
        let high = self.bisect_right(max_ts);
        self.points.truncate(high);
        let low = self.bisect_left(min_ts);
        self.points.drain(..low);
    }

    /// Retain only the `count` newest points.
    pub fn trim_newest(&mut self, count: usize) {
        if self.points.len() > count {
            self.points.drain(..self.points.len() - count);
        }
    }

    /// Retain only the `count` oldest points.
    pub fn trim_oldest(&mut self, count: usize) {
        self.points.truncate(count);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RawPoint<V>> {
        self.points.iter()
    }

    /// All points with `min_ts <= ts <= max_ts`.
    pub fn range(&self, min_ts: i64, max_ts: i64) -> &[RawPoint<V>] {
        &self.points[self.bisect_left(min_ts)..self.bisect_right(max_ts)]
    }

    /// Append a later series with the same identity.
    pub fn append_series(&mut self, other: TimeSeries<V>) -> Result<()> {
        if other.is_empty() {
            return Ok(());
        }
        if self.key != other.key || self.metric != other.metric {
            return Err(CdbError::InvalidArgument(format!(
                "cannot append {}.{} to {}.{}",
                other.key, other.metric, self.key, self.metric
            )));
        }
        if let (Some(max), Some(min)) = (self.ts_max(), other.ts_min()) {
            if max >= min {
                return Err(CdbError::InvalidArgument(
                    "appended series must start after the existing one".to_string(),
                ));
            }
        }
        self.points.extend(other.points);
        Ok(())
    }

    /// Series identity hash over `(key, metric, len, ts_min, ts_max)`.
    pub fn to_hash(&self) -> String {
        let s = format!(
            "{}.{}.{}.{}.{}",
            self.key,
            self.metric,
            self.len(),
            self.ts_min().unwrap_or(-1),
            self.ts_max().unwrap_or(-1)
        );
        let mut hasher = Sha1::new();
        hasher.update(s.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    fn buckets(&self, left: fn(i64) -> i64, right: fn(i64) -> i64, local: bool) -> BucketIter<'_, V> {
        BucketIter {
            points: &self.points,
            idx: 0,
            left,
            right,
            local,
        }
    }

    pub fn by_hour(&self) -> BucketIter<'_, V> {
        self.buckets(hour_left, hour_right, false)
    }

    pub fn by_hour_local(&self) -> BucketIter<'_, V> {
        self.buckets(hour_left, hour_right, true)
    }

    pub fn by_day(&self) -> BucketIter<'_, V> {
        self.buckets(day_left, day_right, false)
    }

    pub fn by_day_local(&self) -> BucketIter<'_, V> {
        self.buckets(day_left, day_right, true)
    }

    pub fn by_month(&self) -> BucketIter<'_, V> {
        self.buckets(month_left, month_right, false)
    }

    pub fn by_month_local(&self) -> BucketIter<'_, V> {
        self.buckets(month_left, month_right, true)
    }

    pub fn by_10min(&self) -> BucketIter<'_, V> {
        self.buckets(ten_minute_left, ten_minute_right, false)
    }

    pub fn by_10min_local(&self) -> BucketIter<'_, V> {
        self.buckets(ten_minute_left, ten_minute_right, true)
    }
}

impl<V: SeriesValue> TimeSeries<V> {
    pub fn with_points<I>(
        key: impl Into<String>,
        metric: impl Into<String>,
        points: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (i64, V)>,
    {
        let mut s = Self::new(key, metric)?;
        s.insert_points(points);
        Ok(s)
    }

    /// Insert a point from its encoded cell form.
    pub fn insert_cell(&mut self, ts: i64, bytes: &[u8], overwrite: bool) -> Result<usize> {
        let (ts_offset, value) = V::decode_cell(bytes)?;
        Ok(self.insert_point(ts, ts_offset, value, overwrite))
    }

    /// One `(day_left, [(ts, encoded_cell)])` batch per day bucket.
    pub fn daily_cells(&self) -> Result<Vec<(i64, Vec<(i64, Vec<u8>)>)>> {
        self.bucket_cells(self.by_day())
    }

    /// One `(month_left, [(ts, encoded_cell)])` batch per month bucket.
    pub fn monthly_cells(&self) -> Result<Vec<(i64, Vec<(i64, Vec<u8>)>)>> {
        self.bucket_cells(self.by_month())
    }

    fn bucket_cells(&self, it: BucketIter<'_, V>) -> Result<Vec<(i64, Vec<(i64, Vec<u8>)>)>> {
        let mut out = Vec::new();
        for (left, bucket) in it {
            let mut cells = Vec::with_capacity(bucket.len());
            for p in bucket {
                cells.push((p.ts, p.value.encode_cell(p.ts_offset)?));
            }
            out.push((left, cells));
        }
        Ok(out)
    }
}

impl<V> PartialEq for TimeSeries<V> {
    fn eq(&self, other: &Self) -> bool {
        self.to_hash() == other.to_hash()
    }
}

impl TimeSeries<DictValue> {
    /// For event streams the metric slot carries the event name.
    pub fn name(&self) -> &str {
        &self.metric
    }
}

impl AnySeries {
    /// Build an empty series of the type selected by a cell tag.
    pub fn empty_for_cell(key: &str, metric: &str, cell: &CellValue) -> Result<AnySeries> {
        Ok(match cell {
            CellValue::Float(_) => AnySeries::Float(TimeSeries::new(key, metric)?),
            CellValue::Dict(_) => AnySeries::Dict(TimeSeries::new(key, metric)?),
        })
    }

    pub fn insert_decoded(&mut self, ts: i64, ts_offset: i32, cell: CellValue) -> Result<usize> {
        match (self, cell) {
            (AnySeries::Float(s), CellValue::Float(v)) => {
                Ok(s.insert_point(ts, ts_offset, v, false))
            }
            (AnySeries::Dict(s), CellValue::Dict(v)) => Ok(s.insert_point(ts, ts_offset, v, false)),
            _ => Err(CdbError::CorruptCell(
                "mixed cell tags within one column family".to_string(),
            )),
        }
    }

    pub fn trim_by_ts(&mut self, min_ts: i64, max_ts: i64) {
        match self {
            AnySeries::Float(s) => s.trim_by_ts(min_ts, max_ts),
            AnySeries::Dict(s) => s.trim_by_ts(min_ts, max_ts),
        }
    }
}

/// Iterator over maximal runs of points sharing one bucket.
///
/// Yields `(bucket_left_edge, points)`. In local mode the bucket bounds are
/// derived from the wall-clock time (`ts + ts_offset`) of the first point in
/// the bucket, so a device's day boundary follows its own clock.
pub struct BucketIter<'a, V> {
    points: &'a [RawPoint<V>],
    idx: usize,
    left: fn(i64) -> i64,
    right: fn(i64) -> i64,
    local: bool,
}

impl<'a, V> Iterator for BucketIter<'a, V> {
    type Item = (i64, &'a [RawPoint<V>]);

    fn next(&mut self) -> Option<Self::Item> {
        let first = self.points.get(self.idx)?;
        let base = if self.local {
            first.ts + first.ts_offset as i64
        } else {
            first.ts
        };
        let lower = (self.left)(base);
        let upper = (self.right)(base);
        let mut end = self.idx;
        while let Some(p) = self.points.get(end) {
            let t = if self.local {
                p.ts + p.ts_offset as i64
            } else {
                p.ts
            };
            if t > upper || t < lower {
                break;
            }
            end += 1;
        }
        let bucket = &self.points[self.idx..end];
        self.idx = end;
        Some((lower, bucket))
    }
}

// ── Aggregation (float series only) ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationSpan {
    TenMin,
    Hourly,
    Daily,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationFunction {
    Sum,
    Count,
    Min,
    Max,
    /// max - min
    Amp,
    Mean,
    StdDev,
    Median,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeMode {
    Utc,
    Local,
}

/// Full per-bucket statistics produced by [`TimeSeries::aggregate_all`].
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationValue {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stdev: f64,
    pub median: f64,
}

fn agg_sum(values: &[f64]) -> f64 {
    values.iter().sum()
}

fn agg_min(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::INFINITY, f64::min)
}

fn agg_max(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

fn agg_mean(values: &[f64]) -> f64 {
    agg_sum(values) / values.len() as f64
}

/// Sample standard deviation; 0 for buckets with fewer than two points.
fn agg_stdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = agg_mean(values);
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Median with the midpoint of the two central values on even counts.
fn agg_median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

fn full_aggregation(values: &[f64]) -> AggregationValue {
    AggregationValue {
        count: values.len() as u64,
        sum: agg_sum(values),
        min: agg_min(values),
        max: agg_max(values),
        mean: agg_mean(values),
        stdev: agg_stdev(values),
        median: agg_median(values),
    }
}

impl TimeSeries<f32> {
    fn span_buckets(&self, span: AggregationSpan, mode: TimeMode) -> BucketIter<'_, f32> {
        match (span, mode) {
            (AggregationSpan::TenMin, TimeMode::Utc) => self.by_10min(),
            (AggregationSpan::TenMin, TimeMode::Local) => self.by_10min_local(),
            (AggregationSpan::Hourly, TimeMode::Utc) => self.by_hour(),
            (AggregationSpan::Hourly, TimeMode::Local) => self.by_hour_local(),
            (AggregationSpan::Daily, TimeMode::Utc) => self.by_day(),
            (AggregationSpan::Daily, TimeMode::Local) => self.by_day_local(),
        }
    }

    fn bucket_stamp(mode: TimeMode, lower: i64, first: &RawPoint<f32>) -> (i64, i32) {
        match mode {
            TimeMode::Utc => (lower, first.ts_offset),
            // the local left edge, shifted back into UTC by the offset of the
            // first point in the bucket
            TimeMode::Local => (lower - first.ts_offset as i64, first.ts_offset),
        }
    }

    /// One point per bucket, stamped with the bucket's left edge.
    pub fn aggregate(
        &self,
        span: AggregationSpan,
        function: AggregationFunction,
        mode: TimeMode,
    ) -> Vec<RawPoint<f64>> {
        let mut out = Vec::new();
        for (lower, bucket) in self.span_buckets(span, mode) {
            let values: Vec<f64> = bucket.iter().map(|p| p.value as f64).collect();
            let value = match function {
                AggregationFunction::Sum => agg_sum(&values),
                AggregationFunction::Count => values.len() as f64,
                AggregationFunction::Min => agg_min(&values),
                AggregationFunction::Max => agg_max(&values),
                AggregationFunction::Amp => agg_max(&values) - agg_min(&values),
                AggregationFunction::Mean => agg_mean(&values),
                AggregationFunction::StdDev => agg_stdev(&values),
                AggregationFunction::Median => agg_median(&values),
            };
            let (ts, ts_offset) = Self::bucket_stamp(mode, lower, &bucket[0]);
            out.push(RawPoint {
                ts,
                ts_offset,
                value,
            });
        }
        out
    }

    /// All seven statistics per bucket.
    pub fn aggregate_all(
        &self,
        span: AggregationSpan,
        mode: TimeMode,
    ) -> Vec<(i64, i32, AggregationValue)> {
        let mut out = Vec::new();
        for (lower, bucket) in self.span_buckets(span, mode) {
            let values: Vec<f64> = bucket.iter().map(|p| p.value as f64).collect();
            let (ts, ts_offset) = Self::bucket_stamp(mode, lower, &bucket[0]);
            out.push((ts, ts_offset, full_aggregation(&values)));
        }
        out
    }
}
