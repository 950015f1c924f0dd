//! Domain records: metric and event definitions, metadata items, activity
//! aggregation outputs and row upserts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{CdbError, Result};

/// Value type of dict series, event payloads and metadata entries.
pub type DictValue = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    FloatSeries,
    DictSeries,
}

/// A named, typed series. `id` is the column-family label, `name` the
/// user-facing handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub name: String,
    pub id: String,
    pub series_type: MetricType,
    pub delete_possible: bool,
}

impl MetricDefinition {
    pub fn new(
        name: impl Into<String>,
        id: impl Into<String>,
        series_type: MetricType,
        delete_possible: bool,
    ) -> Self {
        Self {
            name: name.into().to_lowercase(),
            id: id.into().to_lowercase(),
            series_type,
            delete_possible,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.len() < 2 {
            return Err(CdbError::InvalidArgument(format!(
                "metric name too short: {:?}",
                self.name
            )));
        }
        if self.id.len() < 2 || self.id.len() > 6 {
            return Err(CdbError::InvalidArgument(format!(
                "metric id must be 2-6 chars: {:?}",
                self.id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeriesType {
    Daily,
    Monthly,
}

/// Event stream definition. Names ending in `*` act as prefix patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDefinition {
    pub name: String,
    pub series_type: EventSeriesType,
}

impl EventDefinition {
    pub fn daily(name: impl Into<String>) -> Self {
        Self {
            name: name.into().to_lowercase(),
            series_type: EventSeriesType::Daily,
        }
    }

    pub fn monthly(name: impl Into<String>) -> Self {
        Self {
            name: name.into().to_lowercase(),
            series_type: EventSeriesType::Monthly,
        }
    }
}

/// Resolve an event name to daily or monthly bucketing: exact match wins,
/// then the longest matching `*` prefix pattern, defaulting to daily.
pub fn resolve_event_type(definitions: &[EventDefinition], name: &str) -> EventSeriesType {
    if let Some(d) = definitions.iter().find(|d| d.name == name) {
        return d.series_type;
    }
    definitions
        .iter()
        .filter_map(|d| {
            let prefix = d.name.strip_suffix('*')?;
            name.starts_with(prefix).then_some((prefix.len(), d.series_type))
        })
        .max_by_key(|(len, _)| *len)
        .map(|(_, t)| t)
        .unwrap_or(EventSeriesType::Daily)
}

/// Merge `incoming` into `existing`, replacing entries with an equal key and
/// appending the rest. Order of first appearance is preserved.
pub fn merge_definitions<T: Clone>(
    existing: &[T],
    incoming: &[T],
    key: impl Fn(&T) -> &str,
) -> Vec<T> {
    let mut merged: Vec<T> = existing.to_vec();
    for item in incoming {
        match merged.iter().position(|m| key(m) == key(item)) {
            Some(idx) => merged[idx] = item.clone(),
            None => merged.push(item.clone()),
        }
    }
    merged
}

/// One namespaced metadata entry.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaDataItem {
    pub object_name: String,
    pub object_id: String,
    pub key: String,
    pub data: DictValue,
}

impl MetaDataItem {
    pub fn new(
        object_name: impl Into<String>,
        object_id: impl Into<String>,
        key: impl Into<String>,
        data: DictValue,
    ) -> Self {
        Self {
            object_name: object_name.into(),
            object_id: object_id.into(),
            key: key.into(),
            data,
        }
    }
}

/// Devices seen by one reader in one day-hour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderActivityItem {
    /// "YYYYMMDDHH"
    pub day_hour: String,
    pub reader_id: String,
    pub device_ids: Vec<String>,
}

/// Summed counter of one device in one day-hour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceActivityItem {
    /// "YYYYMMDDHH"
    pub day_hour: String,
    pub device_id: String,
    pub counter: i64,
}

/// Per-row batch of `"family:qualifier" -> bytes` cell writes.
#[derive(Debug, Clone)]
pub struct RowUpsert {
    pub row_key: String,
    pub cells: BTreeMap<String, Vec<u8>>,
}

impl RowUpsert {
    pub fn new(row_key: impl Into<String>) -> Self {
        Self {
            row_key: row_key.into(),
            cells: BTreeMap::new(),
        }
    }

    pub fn cell(mut self, column: impl Into<String>, value: Vec<u8>) -> Self {
        self.cells.insert(column.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_validation() {
        let m = MetricDefinition::new("Temp", "TMP", MetricType::FloatSeries, true);
        assert_eq!(m.name, "temp");
        assert_eq!(m.id, "tmp");
        assert!(m.validate().is_ok());

        let bad = MetricDefinition::new("temp", "t", MetricType::FloatSeries, true);
        assert!(bad.validate().is_err());
        let bad = MetricDefinition::new("temp", "toolong7", MetricType::FloatSeries, true);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_merge_definitions_replaces_by_id() {
        let a = vec![
            MetricDefinition::new("ph", "ph", MetricType::FloatSeries, false),
            MetricDefinition::new("temp", "tmp", MetricType::FloatSeries, true),
        ];
        let b = vec![
            MetricDefinition::new("ph2", "ph", MetricType::FloatSeries, true),
            MetricDefinition::new("hum", "hum", MetricType::FloatSeries, true),
        ];
        let merged = merge_definitions(&a, &b, |m| m.id.as_str());
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].name, "ph2");
        assert!(merged[0].delete_possible);
        assert_eq!(merged[2].id, "hum");
    }

    #[test]
    fn test_event_resolution() {
        let defs = vec![
            EventDefinition::daily("test_daily"),
            EventDefinition::monthly("test_monthly"),
            EventDefinition::monthly("test_monthly_*"),
        ];
        assert_eq!(
            resolve_event_type(&defs, "test_daily"),
            EventSeriesType::Daily
        );
        assert_eq!(
            resolve_event_type(&defs, "test_monthly"),
            EventSeriesType::Monthly
        );
        assert_eq!(
            resolve_event_type(&defs, "test_monthly_2"),
            EventSeriesType::Monthly
        );
        assert_eq!(
            resolve_event_type(&defs, "unknown"),
            EventSeriesType::Daily
        );
    }

    #[test]
    fn test_definition_json_round_trip() {
        let defs = vec![
            MetricDefinition::new("ph", "ph", MetricType::FloatSeries, true),
            MetricDefinition::new("log", "log", MetricType::DictSeries, false),
        ];
        let encoded = serde_json::to_string(&defs).unwrap();
        let decoded: Vec<MetricDefinition> = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, defs);
    }
}
