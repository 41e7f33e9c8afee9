//! Stored record types and time-bucketed key derivation.

use bincode::{Decode, Encode};
use bytes::Bytes;

use crate::core::{
    error::{Error, Result},
    id::Id,
};

/// A signed message certificate. Its identity is its signature: two records with the same
/// signature are the same record.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Record {
    #[bincode(with_serde)]
    pub signature: Bytes,
    /// Unix timestamp (seconds) the record is keyed on.
    pub timestamp: i64,
    #[bincode(with_serde)]
    pub payload: Bytes,
}

impl Record {
    pub fn new(signature: impl Into<Bytes>, timestamp: i64, payload: impl Into<Bytes>) -> Self {
        Self {
            signature: signature.into(),
            timestamp,
            payload: payload.into(),
        }
    }

    /// Derives the key this record is stored under for the given time bucket width.
    pub fn key(&self, bucket_secs: u64) -> Result<Id> {
        record_key(self.timestamp, bucket_secs)
    }
}

/// A request to soft-delete the record with the given signature.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct DeletionMarker {
    #[bincode(with_serde)]
    pub signature: Bytes,
    /// Timestamp of the record being deleted, used to derive the key.
    pub timestamp: i64,
}

impl DeletionMarker {
    pub fn for_record(record: &Record) -> Self {
        Self {
            signature: record.signature.clone(),
            timestamp: record.timestamp,
        }
    }

    pub fn key(&self, bucket_secs: u64) -> Result<Id> {
        record_key(self.timestamp, bucket_secs)
    }
}

/// A record as held by a storage backend, with its soft-delete flag.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredRecord {
    pub record: Record,
    pub deleted: bool,
}

/// An inclusive range of unix timestamps (seconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct TimeWindow {
    pub start: i64,
    pub end: i64,
}

impl TimeWindow {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        (self.start..=self.end).contains(&timestamp)
    }
}

/// Derives the key for a timestamp: the identifier of the start of its time bucket.
///
/// Fails for timestamps whose bucket start isn't representable, and for bucket widths beyond
/// `i64::MAX` seconds.
pub fn record_key(timestamp: i64, bucket_secs: u64) -> Result<Id> {
    let bucket_start = bucket_width(bucket_secs)
        .and_then(|width| bucket_floor(timestamp, width))
        .ok_or(Error::InvalidTimestamp(timestamp))?;

    Ok(Id::generate(&bucket_start.to_string()))
}

pub(crate) fn bucket_width(bucket_secs: u64) -> Option<i64> {
    i64::try_from(bucket_secs.max(1)).ok()
}

// The start of the bucket the timestamp falls in.
pub(crate) fn bucket_floor(timestamp: i64, width: i64) -> Option<i64> {
    timestamp.checked_div_euclid(width)?.checked_mul(width)
}
