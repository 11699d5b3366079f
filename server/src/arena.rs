//! In-memory write buffer of a partition.
//!
//! The arena keeps at most one live position per record id: inserting a
//! newer version marks the previous position as skipped instead of removing
//! it, so positions stay stable until the arena is flushed.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use basalt_transport::RecordId;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::index::LsmTableIndex;
use crate::record::RecordRef;
use crate::segment::{Segment, SegmentRecord, INDEX_EXTENSION, SEGMENT_EXTENSION};

#[derive(Clone, Copy, Debug)]
struct RecordVersion {
    version: u64,
    position: usize,
}

#[derive(Debug, Default)]
struct Inner {
    versions: HashMap<RecordId, RecordVersion>,
    records: Vec<RecordRef>,
    skiplist: Vec<bool>,
}

/// Result of flushing an arena to a segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WrittenSegment {
    pub records: u64,
    pub size_bytes: u64,
}

#[derive(Debug, Default)]
pub struct PartitionArena {
    inner: RwLock<Inner>,
}

impl PartitionArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer `record` unless an equal or newer version of it is already
    /// held. Returns whether the record was inserted.
    pub fn insert_record(&self, record: &RecordRef) -> bool {
        let mut inner = self.inner.write();
        let position = inner.records.len();

        if let Some(existing) = inner.versions.get(&record.id).copied() {
            if existing.version >= record.version {
                return false;
            }
            inner.skiplist[existing.position] = true;
        }

        inner.versions.insert(
            record.id,
            RecordVersion {
                version: record.version,
                position,
            },
        );
        inner.records.push(record.clone());
        inner.skiplist.push(false);
        true
    }

    /// Version held for `id`, or 0 if the arena has never seen it.
    pub fn fetch_record_version(&self, id: &RecordId) -> u64 {
        self.inner
            .read()
            .versions
            .get(id)
            .map(|v| v.version)
            .unwrap_or(0)
    }

    /// Number of buffered rows, superseded ones included.
    pub fn size(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Live (non-superseded) records in insertion order.
    pub fn live_records(&self) -> Vec<RecordRef> {
        let inner = self.inner.read();
        inner
            .records
            .iter()
            .zip(inner.skiplist.iter())
            .filter(|(_, skip)| !**skip)
            .map(|(record, _)| record.clone())
            .collect()
    }

    /// Flush to `<base>.cst` and `<base>.idx`, numbering rows from
    /// `start_sequence`.
    pub fn write_to_disk(&self, base: &Path, start_sequence: u64) -> Result<WrittenSegment> {
        let inner = self.inner.read();
        if inner.records.is_empty() {
            return Err(Error::runtime("partition arena is empty"));
        }

        let rows: Vec<SegmentRecord> = inner
            .records
            .iter()
            .zip(inner.skiplist.iter())
            .enumerate()
            .map(|(ix, (record, skip))| SegmentRecord {
                id: record.id,
                version: record.version,
                sequence: start_sequence + ix as u64,
                is_update: record.is_update,
                skip: *skip,
                key: record.key.clone(),
                data: record.data.clone(),
            })
            .collect();

        let size_bytes = Segment::at(base.with_extension(SEGMENT_EXTENSION)).write(&rows)?;

        let vmap: BTreeMap<RecordId, u64> = inner
            .versions
            .iter()
            .map(|(id, v)| (*id, v.version))
            .collect();
        LsmTableIndex::write(&vmap, base.with_extension(INDEX_EXTENSION))?;

        Ok(WrittenSegment {
            records: rows.len() as u64,
            size_bytes,
        })
    }
}
