//! # Value Encoding for the Secondary Store
//!
//! Attributes are stored one row per attribute with typed columns, so the
//! cache stays queryable with plain SQL:
//!
//! ```text
//! attributes
//! ┌─────────┬──────┬────────┬──────┬───────────┬────────────┬────────────┬────────────┐
//! │ file_id │ name │ source │ kind │ int_value │ real_value │ text_value │ blob_value │
//! └─────────┴──────┴────────┴──────┴───────────┴────────────┴────────────┴────────────┘
//! ```
//!
//! Exactly one value column is set per row, chosen by `kind`
//! ([`ValueKind::as_raw`]). Date-times go into `int_value` as milliseconds
//! since the Unix epoch (sub-millisecond precision is dropped). Null values
//! are never written: an entity does not hold them.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDateTime};

use crate::error::{Error, Result};
use crate::value::{Value, ValueKind};

// =============================================================================
// Encoding
// =============================================================================

/// The column values for one attribute row.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedValue {
    pub kind: i64,
    pub int_value: Option<i64>,
    pub real_value: Option<f64>,
    pub text_value: Option<String>,
    pub blob_value: Option<Vec<u8>>,
}

impl EncodedValue {
    fn empty(kind: ValueKind) -> Self {
        Self {
            kind: kind.as_raw(),
            int_value: None,
            real_value: None,
            text_value: None,
            blob_value: None,
        }
    }
}

/// Splits a value into its typed columns.
pub fn encode_value(value: &Value) -> EncodedValue {
    let mut encoded = EncodedValue::empty(value.kind());
    match value {
        Value::Int(v) => encoded.int_value = *v,
        Value::Real(v) => encoded.real_value = *v,
        Value::String(v) => encoded.text_value = v.clone(),
        Value::DateTime(v) => encoded.int_value = v.map(datetime_to_ms),
        Value::Image(v) => encoded.blob_value = v.clone(),
    }
    encoded
}

// =============================================================================
// Decoding
// =============================================================================

/// Rebuilds a value from its typed columns.
///
/// # Errors
///
/// `Error::Schema` if the kind tag is unknown or the column for that kind is
/// empty, which means the row was not written by this crate.
pub fn decode_value(encoded: EncodedValue) -> Result<Value> {
    let kind = ValueKind::from_raw(encoded.kind)
        .ok_or_else(|| Error::Schema(format!("unknown value kind {}", encoded.kind)))?;

    let value = match kind {
        ValueKind::Int => encoded.int_value.map(Value::int),
        ValueKind::Real => encoded.real_value.map(|v| Value::Real(Some(v))),
        ValueKind::String => encoded.text_value.map(Value::string),
        ValueKind::DateTime => match encoded.int_value {
            Some(ms) => Some(Value::date_time(ms_to_datetime(ms)?)),
            None => None,
        },
        ValueKind::Image => encoded.blob_value.map(Value::image),
    };

    value.ok_or_else(|| Error::Schema(format!("missing payload for {kind:?} value")))
}

// =============================================================================
// Helper Functions
// =============================================================================

pub fn datetime_to_ms(value: NaiveDateTime) -> i64 {
    value.and_utc().timestamp_millis()
}

pub fn ms_to_datetime(ms: i64) -> Result<NaiveDateTime> {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| Error::Schema(format!("timestamp {ms} out of range")))
}

/// Returns the current time in milliseconds since Unix epoch.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(duration_to_ms)
        .unwrap_or(0)
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub fn duration_to_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// =============================================================================
// Tests
// =============================================================================
