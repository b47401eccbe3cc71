//! Keyspace Snapshots
//!
//! A snapshot is the full keyspace at one point in time, transferred from a
//! master to a replica during a full resync. The transfer layer treats it as
//! an opaque blob; only a [`SnapshotFormat`] knows its layout.
//!
//! ## Default Format
//!
//! [`RespSnapshot`] writes a magic header followed by one RESP array holding
//! a `[key, value, ttl]` triple per entry:
//!
//! ```text
//! RELAYKV1*2\r\n
//!   *3\r\n$1\r\nx\r\n$1\r\n9\r\n$-1\r\n           no expiry
//!   *3\r\n$1\r\ns\r\n$3\r\nabc\r\n:59000\r\n      expires in 59 s
//! ```
//!
//! Expiry travels as remaining milliseconds because `Instant`s are local to
//! a process.

use crate::protocol::{parse_message, ParseError, RespValue};
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

/// One key in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub key: Bytes,
    pub value: Bytes,
    /// Remaining time to live at snapshot time, None if the key never expires
    pub ttl: Option<Duration>,
}

/// Errors produced while decoding a snapshot.
#[derive(Debug, Error, PartialEq)]
pub enum SnapshotError {
    #[error("missing snapshot header")]
    BadMagic,

    #[error("malformed snapshot: {0}")]
    Malformed(String),

    #[error("truncated snapshot")]
    Truncated,

    #[error("snapshot parse error: {0}")]
    Parse(#[from] ParseError),
}

/// Encodes and decodes whole-keyspace snapshots.
pub trait SnapshotFormat: Send + Sync {
    fn encode(&self, entries: &[SnapshotEntry]) -> Bytes;

    fn decode(&self, blob: &[u8]) -> Result<Vec<SnapshotEntry>, SnapshotError>;
}

/// The default snapshot format.
#[derive(Debug, Default, Clone, Copy)]
pub struct RespSnapshot;

impl RespSnapshot {
    pub const MAGIC: &'static [u8] = b"RELAYKV1";
}

impl SnapshotFormat for RespSnapshot {
    fn encode(&self, entries: &[SnapshotEntry]) -> Bytes {
        let body = RespValue::array(
            entries
                .iter()
                .map(|entry| {
                    let ttl = match entry.ttl {
                        // Keep a live key live: a sub-millisecond ttl rounds up.
                        Some(ttl) => RespValue::integer(ttl.as_millis().max(1) as i64),
                        None => RespValue::null(),
                    };
                    RespValue::array(vec![
                        RespValue::bulk_string(entry.key.clone()),
                        RespValue::bulk_string(entry.value.clone()),
                        ttl,
                    ])
                })
                .collect(),
        );

        let mut buf = Vec::from(Self::MAGIC);
        body.serialize_into(&mut buf);
        Bytes::from(buf)
    }

    fn decode(&self, blob: &[u8]) -> Result<Vec<SnapshotEntry>, SnapshotError> {
        let body = blob
            .strip_prefix(Self::MAGIC)
            .ok_or(SnapshotError::BadMagic)?;

        let (value, consumed) = parse_message(body)?.ok_or(SnapshotError::Truncated)?;
        if consumed != body.len() {
            return Err(SnapshotError::Malformed(format!(
                "{} trailing bytes",
                body.len() - consumed
            )));
        }

        let items = value
            .into_array()
            .ok_or_else(|| SnapshotError::Malformed("body is not an array".to_string()))?;

        items.into_iter().map(decode_entry).collect()
    }
}

fn decode_entry(item: RespValue) -> Result<SnapshotEntry, SnapshotError> {
    let fields = item
        .into_array()
        .ok_or_else(|| SnapshotError::Malformed("entry is not an array".to_string()))?;

    match <[RespValue; 3]>::try_from(fields) {
        Ok([RespValue::BulkString(key), RespValue::BulkString(value), ttl]) => {
            let ttl = match ttl {
                RespValue::Null => None,
                RespValue::Integer(ms) if ms >= 0 => Some(Duration::from_millis(ms as u64)),
                other => {
                    return Err(SnapshotError::Malformed(format!("invalid ttl {}", other)));
                }
            };
            Ok(SnapshotEntry { key, value, ttl })
        }
        _ => Err(SnapshotError::Malformed(
            "entry must be [key, value, ttl]".to_string(),
        )),
    }
}
