//! Cell encoding shared by both storage backends.
//!
//! Time-series cells are `tag || int32-le offset || payload` where the payload
//! is a little-endian float32 (tag 1) or a msgpack map (tag 2). Activity
//! counters are bare big-endian int64 cells.

use crate::errors::{CdbError, Result};
use crate::models::DictValue;

pub const TAG_FLOAT: u8 = 1;
pub const TAG_DICT: u8 = 2;

pub const FLOAT_CELL_LEN: usize = 9;
const HEADER_LEN: usize = 5;

/// Decoded time-series cell payload.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Float(f32),
    Dict(DictValue),
}

pub fn encode_float_cell(ts_offset: i32, value: f32) -> Vec<u8> {
    let mut out = Vec::with_capacity(FLOAT_CELL_LEN);
    out.push(TAG_FLOAT);
    out.extend_from_slice(&ts_offset.to_le_bytes());
    out.extend_from_slice(&value.to_le_bytes());
    out
}

pub fn encode_dict_cell(ts_offset: i32, value: &DictValue) -> Result<Vec<u8>> {
    let packed = rmp_serde::to_vec(value)?;
    let mut out = Vec::with_capacity(HEADER_LEN + packed.len());
    out.push(TAG_DICT);
    out.extend_from_slice(&ts_offset.to_le_bytes());
    out.extend_from_slice(&packed);
    Ok(out)
}

fn split_header(bytes: &[u8]) -> Result<(u8, i32, &[u8])> {
    if bytes.len() < HEADER_LEN {
        return Err(CdbError::CorruptCell(format!(
            "truncated cell ({} bytes)",
            bytes.len()
        )));
    }
    let mut offset = [0u8; 4];
    offset.copy_from_slice(&bytes[1..HEADER_LEN]);
    Ok((bytes[0], i32::from_le_bytes(offset), &bytes[HEADER_LEN..]))
}

/// Decode a cell of either series type, dispatching on the tag byte.
pub fn decode_cell(bytes: &[u8]) -> Result<(i32, CellValue)> {
    let (tag, ts_offset, payload) = split_header(bytes)?;
    match tag {
        TAG_FLOAT => {
            if payload.len() != 4 {
                return Err(CdbError::CorruptCell(format!(
                    "float cell with {} payload bytes",
                    payload.len()
                )));
            }
            let mut v = [0u8; 4];
            v.copy_from_slice(payload);
            Ok((ts_offset, CellValue::Float(f32::from_le_bytes(v))))
        }
        TAG_DICT => {
            let value: DictValue = rmp_serde::from_slice(payload)?;
            Ok((ts_offset, CellValue::Dict(value)))
        }
        t => Err(CdbError::CorruptCell(format!("unknown cell tag {t}"))),
    }
}

/// Decode a cell that must be a float cell.
pub fn decode_float_cell(bytes: &[u8]) -> Result<(i32, f32)> {
    match decode_cell(bytes)? {
        (o, CellValue::Float(v)) => Ok((o, v)),
        (_, CellValue::Dict(_)) => Err(CdbError::CorruptCell(
            "expected float cell, found dict cell".to_string(),
        )),
    }
}

/// Decode a cell that must be a dict cell.
pub fn decode_dict_cell(bytes: &[u8]) -> Result<(i32, DictValue)> {
    match decode_cell(bytes)? {
        (o, CellValue::Dict(v)) => Ok((o, v)),
        (_, CellValue::Float(_)) => Err(CdbError::CorruptCell(
            "expected dict cell, found float cell".to_string(),
        )),
    }
}

pub fn encode_counter(value: i64) -> [u8; 8] {
    value.to_be_bytes()
}

pub fn decode_counter(bytes: &[u8]) -> Result<i64> {
    if bytes.len() != 8 {
        return Err(CdbError::CorruptCell(format!(
            "counter cell with {} bytes",
            bytes.len()
        )));
    }
    let mut v = [0u8; 8];
    v.copy_from_slice(bytes);
    Ok(i64::from_be_bytes(v))
}
