//! Wire messages shared with the RPC facade.
//!
//! Series travel as three parallel arrays (`timestamps`,
//! `timestamp_offsets`, `values`); dict values are key/json-string pairs.
//! Conversions to and from the in-memory containers are exact round trips.

use prost::Message;

use crate::errors::{CdbError, Result};
use crate::models::{DictValue, MetaDataItem, ReaderActivityItem};
use crate::series;

#[derive(Clone, PartialEq, Message)]
pub struct Pair {
    #[prost(string, tag = "1")]
    pub key: String,
    /// JSON-encoded value.
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Dictionary {
    #[prost(message, repeated, tag = "1")]
    pub pairs: Vec<Pair>,
}

#[derive(Clone, PartialEq, Message)]
pub struct FloatTimeSeries {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub metric: String,
    #[prost(int64, repeated, tag = "3")]
    pub timestamps: Vec<i64>,
    #[prost(sint32, repeated, tag = "4")]
    pub timestamp_offsets: Vec<i32>,
    #[prost(float, repeated, tag = "5")]
    pub values: Vec<f32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DictTimeSeries {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub metric: String,
    #[prost(int64, repeated, tag = "3")]
    pub timestamps: Vec<i64>,
    #[prost(sint32, repeated, tag = "4")]
    pub timestamp_offsets: Vec<i32>,
    #[prost(message, repeated, tag = "5")]
    pub values: Vec<Dictionary>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EventSeries {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(int64, repeated, tag = "3")]
    pub timestamps: Vec<i64>,
    #[prost(sint32, repeated, tag = "4")]
    pub timestamp_offsets: Vec<i32>,
    #[prost(message, repeated, tag = "5")]
    pub values: Vec<Dictionary>,
}

#[derive(Clone, PartialEq, Message)]
pub struct MetaDataDict {
    #[prost(string, tag = "1")]
    pub object_name: String,
    #[prost(string, tag = "2")]
    pub object_id: String,
    #[prost(string, tag = "3")]
    pub key: String,
    #[prost(message, repeated, tag = "4")]
    pub pairs: Vec<Pair>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReaderActivity {
    #[prost(string, tag = "1")]
    pub day_hour: String,
    #[prost(string, tag = "2")]
    pub reader_id: String,
    #[prost(string, repeated, tag = "3")]
    pub device_ids: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceActivity {
    #[prost(string, tag = "1")]
    pub day_hour: String,
    #[prost(string, tag = "2")]
    pub device_id: String,
    #[prost(int64, tag = "3")]
    pub counter: i64,
}

fn dict_to_proto(d: &DictValue) -> Result<Dictionary> {
    let mut pairs = Vec::with_capacity(d.len());
    for (k, v) in d {
        pairs.push(Pair {
            key: k.clone(),
            value: serde_json::to_string(v)
                .map_err(|e| CdbError::InvalidArgument(format!("unserialisable value: {e}")))?,
        });
    }
    Ok(Dictionary { pairs })
}

fn dict_from_proto(d: &Dictionary) -> Result<DictValue> {
    let mut out = DictValue::new();
    for pair in &d.pairs {
        let value = serde_json::from_str(&pair.value)
            .map_err(|e| CdbError::InvalidArgument(format!("bad json in pair {}: {e}", pair.key)))?;
        out.insert(pair.key.clone(), value);
    }
    Ok(out)
}

fn decode<M: Message + Default>(bytes: &[u8]) -> Result<M> {
    M::decode(bytes).map_err(|e| CdbError::InvalidArgument(format!("bad proto message: {e}")))
}

impl series::FloatTimeSeries {
    pub fn to_proto(&self) -> FloatTimeSeries {
        let mut p = FloatTimeSeries {
            key: self.key().to_string(),
            metric: self.metric().to_string(),
            ..Default::default()
        };
        for point in self.iter() {
            p.timestamps.push(point.ts);
            p.timestamp_offsets.push(point.ts_offset);
            p.values.push(point.value);
        }
        p
    }

    pub fn from_proto(p: &FloatTimeSeries) -> Result<Self> {
        let mut s = Self::new(p.key.as_str(), p.metric.as_str())?;
        for ((ts, offset), value) in p
            .timestamps
            .iter()
            .zip(&p.timestamp_offsets)
            .zip(&p.values)
        {
            s.insert_point(*ts, *offset, *value, false);
        }
        Ok(s)
    }

    pub fn to_proto_bytes(&self) -> Vec<u8> {
        self.to_proto().encode_to_vec()
    }

    pub fn from_proto_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_proto(&decode(bytes)?)
    }
}

impl series::DictTimeSeries {
    pub fn to_proto(&self) -> Result<DictTimeSeries> {
        let mut p = DictTimeSeries {
            key: self.key().to_string(),
            metric: self.metric().to_string(),
            ..Default::default()
        };
        for point in self.iter() {
            p.timestamps.push(point.ts);
            p.timestamp_offsets.push(point.ts_offset);
            p.values.push(dict_to_proto(&point.value)?);
        }
        Ok(p)
    }

    pub fn from_proto(p: &DictTimeSeries) -> Result<Self> {
        let mut s = Self::new(p.key.as_str(), p.metric.as_str())?;
        for ((ts, offset), value) in p
            .timestamps
            .iter()
            .zip(&p.timestamp_offsets)
            .zip(&p.values)
        {
            s.insert_point(*ts, *offset, dict_from_proto(value)?, false);
        }
        Ok(s)
    }

    pub fn to_proto_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.to_proto()?.encode_to_vec())
    }

    pub fn from_proto_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_proto(&decode(bytes)?)
    }

    /// The same payload under the event-series message shape.
    pub fn to_event_proto(&self) -> Result<EventSeries> {
        let p = self.to_proto()?;
        Ok(EventSeries {
            key: p.key,
            name: p.metric,
            timestamps: p.timestamps,
            timestamp_offsets: p.timestamp_offsets,
            values: p.values,
        })
    }

    pub fn from_event_proto(p: &EventSeries) -> Result<Self> {
        Self::from_proto(&DictTimeSeries {
            key: p.key.clone(),
            metric: p.name.clone(),
            timestamps: p.timestamps.clone(),
            timestamp_offsets: p.timestamp_offsets.clone(),
            values: p.values.clone(),
        })
    }
}

impl MetaDataItem {
    pub fn to_proto(&self) -> Result<MetaDataDict> {
        Ok(MetaDataDict {
            object_name: self.object_name.clone(),
            object_id: self.object_id.clone(),
            key: self.key.clone(),
            pairs: dict_to_proto(&self.data)?.pairs,
        })
    }

    pub fn from_proto(p: &MetaDataDict) -> Result<Self> {
        Ok(MetaDataItem {
            object_name: p.object_name.clone(),
            object_id: p.object_id.clone(),
            key: p.key.clone(),
            data: dict_from_proto(&Dictionary {
                pairs: p.pairs.clone(),
            })?,
        })
    }
}

impl ReaderActivityItem {
    pub fn to_proto(&self) -> ReaderActivity {
        ReaderActivity {
            day_hour: self.day_hour.clone(),
            reader_id: self.reader_id.clone(),
            device_ids: self.device_ids.clone(),
        }
    }
}

impl crate::models::DeviceActivityItem {
    pub fn to_proto(&self) -> DeviceActivity {
        DeviceActivity {
            day_hour: self.day_hour.clone(),
            device_id: self.device_id.clone(),
            counter: self.counter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::TimeSeries;
    use serde_json::json;

    #[test]
    fn test_float_series_round_trip() {
        let mut s: series::FloatTimeSeries = TimeSeries::new("dev1", "tmp").unwrap();
        s.insert_point(100, 3600, 1.5, false);
        s.insert_point(200, -7200, -2.25, false);
        let bytes = s.to_proto_bytes();
        let restored = series::FloatTimeSeries::from_proto_bytes(&bytes).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.at_index(0).unwrap().ts, 100);
        assert_eq!(restored.at_index(0).unwrap().ts_offset, 3600);
        assert_eq!(restored.at_index(1).unwrap().ts_offset, -7200);
        assert_eq!(restored.at_index(1).unwrap().value, -2.25);
        assert_eq!(restored, s);
    }

    #[test]
    fn test_dict_series_round_trip() {
        let mut s: series::DictTimeSeries = TimeSeries::new("dev1", "upload").unwrap();
        let mut d = DictValue::new();
        d.insert("foo".to_string(), json!("bar"));
        d.insert("nested".to_string(), json!({"a": [1, 2, 3]}));
        s.insert_point(100, 0, d.clone(), false);
        let bytes = s.to_proto_bytes().unwrap();
        let restored = series::DictTimeSeries::from_proto_bytes(&bytes).unwrap();
        assert_eq!(restored.at_index(0).unwrap().value, d);
    }

    #[test]
    fn test_event_proto_shape() {
        let mut s: series::EventList = TimeSeries::new("dev1", "upload").unwrap();
        let mut d = DictValue::new();
        d.insert("foo".to_string(), json!(1));
        s.insert_point(100, 0, d, false);
        let p = s.to_event_proto().unwrap();
        assert_eq!(p.name, "upload");
        let restored = series::DictTimeSeries::from_event_proto(&p).unwrap();
        assert_eq!(restored.name(), "upload");
        assert_eq!(restored.len(), 1);
    }

    #[test]
    fn test_metadata_round_trip() {
        let mut d = DictValue::new();
        d.insert("city".to_string(), json!("berlin"));
        let item = MetaDataItem::new("org", "o17", "location", d);
        let p = item.to_proto().unwrap();
        let restored = MetaDataItem::from_proto(&p).unwrap();
        assert_eq!(restored, item);
    }
}
