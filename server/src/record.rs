use std::time::{SystemTime, UNIX_EPOCH};

use basalt_transport::{RecordId, ReplicateRecord};
use bytes::Bytes;

/// A single record version offered to a partition writer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordRef {
    pub id: RecordId,
    pub version: u64,
    /// Partition key value, order preserving.
    pub key: Bytes,
    pub data: Bytes,
    pub is_update: bool,
}

impl RecordRef {
    /// Build a record; a zero `version` is replaced with the current wall
    /// clock in microseconds.
    pub fn new(id: RecordId, version: u64, key: impl Into<Bytes>, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            version: if version == 0 { now_micros() } else { version },
            key: key.into(),
            data: data.into(),
            is_update: false,
        }
    }
}

impl From<ReplicateRecord> for RecordRef {
    fn from(r: ReplicateRecord) -> Self {
        Self::new(r.id, r.version, r.key, r.data)
    }
}

pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}
