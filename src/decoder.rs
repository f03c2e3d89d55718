//! Decoding of raw collector records into [`Reading`]s
//!
//! A record is one ASCII line of exactly five comma separated fields:
//!
//! ```text
//! cpu_usage,memory_usage,disk_io,network_usage,YYYY-MM-DD HH:MM:SS
//! ```
//!
//! Decoding is pure. The same bytes always produce the same reading or the
//! same [`DecodeError`] kind. An empty read is not a record at all: callers
//! see it as [`Decoded::PeerClosed`] so they can tell a closed connection
//! apart from garbage on the wire.

use chrono::NaiveDateTime;

use crate::{Reading, TIMESTAMP_FORMAT};

const FIELD_COUNT: usize = 5;

/// Outcome of decoding a single read from the collector stream
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Zero-length read, the peer closed the connection
    PeerClosed,

    /// A complete, validated reading
    Reading(Reading),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("record is not valid UTF-8")]
    NotUtf8,

    #[error("expected 5 fields, got {0}")]
    FieldCount(usize),

    #[error("field `{field}` is not a finite number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("field `{field}` is negative: {value}")]
    NegativeValue { field: &'static str, value: f64 },

    #[error("timestamp {0:?} is not formatted as YYYY-MM-DD HH:MM:SS")]
    InvalidTimestamp(String),
}

/// Decode the bytes of one read.
pub fn decode(bytes: &[u8]) -> Result<Decoded, DecodeError> {
    if bytes.is_empty() {
        return Ok(Decoded::PeerClosed);
    }

    let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::NotUtf8)?;
    decode_record(text).map(Decoded::Reading)
}

/// Decode one textual record. Surrounding whitespace (including the
/// trailing newline some collectors emit) is ignored.
pub fn decode_record(record: &str) -> Result<Reading, DecodeError> {
    let fields = record.trim().split(',').collect::<Vec<_>>();
    if fields.len() != FIELD_COUNT {
        return Err(DecodeError::FieldCount(fields.len()));
    }

    let timestamp = parse_timestamp(fields[4].trim())?;

    Ok(Reading {
        cpu_usage: parse_metric("cpu_usage", fields[0])?,
        memory_usage: parse_metric("memory_usage", fields[1])?,
        disk_io: parse_metric("disk_io", fields[2])?,
        network_usage: parse_metric("network_usage", fields[3])?,
        timestamp,
    })
}

/// chrono accepts unpadded fields, so the parsed value has to format back
/// to exactly the input.
fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, DecodeError> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .ok()
        .filter(|parsed| parsed.format(TIMESTAMP_FORMAT).to_string() == raw)
        .ok_or_else(|| DecodeError::InvalidTimestamp(raw.to_string()))
}

fn parse_metric(field: &'static str, raw: &str) -> Result<f64, DecodeError> {
    let raw = raw.trim();
    let value = raw
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| DecodeError::InvalidNumber {
            field,
            value: raw.to_string(),
        })?;

    if value < 0.0 {
        return Err(DecodeError::NegativeValue { field, value });
    }

    // normalise -0.0 so re-encoding never emits a sign
    Ok(value.abs())
}
