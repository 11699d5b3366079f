//! An LSM segment is an immutable columnar file (`<name>.cst`) holding the
//! records flushed from one arena, or merged by one compaction.
//!
//! Alongside the record key and payload, every row carries the bookkeeping
//! columns `__lsm_id`, `__lsm_version`, `__lsm_sequence`, `__lsm_is_update`
//! and `__lsm_skip`. A skipped row was superseded inside the same segment
//! and must be ignored by readers.
//!
//! Segments are written to `<name>.cst.tmp` and renamed into place once the
//! footer is on disk, so a `.cst` file is always complete.

use std::fs;
use std::path::{Path, PathBuf};

use basalt_transport::arrow2::{
    array::{Array, BinaryArray, BooleanArray, FixedSizeBinaryArray, PrimitiveArray},
    chunk::Chunk,
    datatypes::{DataType, Field, Schema},
};
use basalt_transport::{
    downcast_column, RecordId, SegmentChunk, DATA_COLUMN, ID_COLUMN, ID_LEN, IS_UPDATE_COLUMN,
    KEY_COLUMN, SEQUENCE_COLUMN, SKIP_COLUMN, VERSION_COLUMN,
};
use bytes::Bytes;
use tracing::trace;

use crate::error::Result;

mod file;

use file::{SegmentFileReader, SegmentFileWriter};

pub const SEGMENT_EXTENSION: &str = "cst";
pub const INDEX_EXTENSION: &str = "idx";

/// Rows per IPC record batch.
const CHUNK_ROWS: usize = 8192;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentRecord {
    pub id: RecordId,
    pub version: u64,
    pub sequence: u64,
    pub is_update: bool,
    pub skip: bool,
    pub key: Bytes,
    pub data: Bytes,
}

impl SegmentRecord {
    pub fn size(&self) -> usize {
        ID_LEN + 16 + 2 + self.key.len() + self.data.len()
    }
}

pub fn schema() -> Schema {
    Schema::from(vec![
        Field::new(ID_COLUMN, DataType::FixedSizeBinary(ID_LEN), false),
        Field::new(VERSION_COLUMN, DataType::UInt64, false),
        Field::new(SEQUENCE_COLUMN, DataType::UInt64, false),
        Field::new(IS_UPDATE_COLUMN, DataType::Boolean, false),
        Field::new(SKIP_COLUMN, DataType::Boolean, false),
        Field::new(KEY_COLUMN, DataType::Binary, false),
        Field::new(DATA_COLUMN, DataType::Binary, false),
    ])
}

fn to_chunk(records: &[SegmentRecord]) -> Result<SegmentChunk> {
    let ids: Vec<u8> = records.iter().flat_map(|r| r.id.0).collect();
    let is_update: Vec<bool> = records.iter().map(|r| r.is_update).collect();
    let skip: Vec<bool> = records.iter().map(|r| r.skip).collect();

    Ok(Chunk::try_new(vec![
        FixedSizeBinaryArray::new(DataType::FixedSizeBinary(ID_LEN), ids.into(), None).boxed(),
        PrimitiveArray::<u64>::from_vec(records.iter().map(|r| r.version).collect()).boxed(),
        PrimitiveArray::<u64>::from_vec(records.iter().map(|r| r.sequence).collect()).boxed(),
        BooleanArray::from_slice(is_update).boxed(),
        BooleanArray::from_slice(skip).boxed(),
        BinaryArray::<i32>::from_iter_values(records.iter().map(|r| r.key.as_ref())).boxed(),
        BinaryArray::<i32>::from_iter_values(records.iter().map(|r| r.data.as_ref())).boxed(),
    ])?)
}

fn from_chunk(chunk: &SegmentChunk) -> Result<Vec<SegmentRecord>> {
    let ids = downcast_column::<FixedSizeBinaryArray>(chunk, 0, ID_COLUMN)?;
    let versions = downcast_column::<PrimitiveArray<u64>>(chunk, 1, VERSION_COLUMN)?;
    let sequences = downcast_column::<PrimitiveArray<u64>>(chunk, 2, SEQUENCE_COLUMN)?;
    let is_update = downcast_column::<BooleanArray>(chunk, 3, IS_UPDATE_COLUMN)?;
    let skip = downcast_column::<BooleanArray>(chunk, 4, SKIP_COLUMN)?;
    let keys = downcast_column::<BinaryArray<i32>>(chunk, 5, KEY_COLUMN)?;
    let data = downcast_column::<BinaryArray<i32>>(chunk, 6, DATA_COLUMN)?;

    (0..chunk.len())
        .map(|ix| {
            Ok(SegmentRecord {
                id: RecordId::from_slice(ids.value(ix))?,
                version: versions.value(ix),
                sequence: sequences.value(ix),
                is_update: is_update.value(ix),
                skip: skip.value(ix),
                key: Bytes::copy_from_slice(keys.value(ix)),
                data: Bytes::copy_from_slice(data.value(ix)),
            })
        })
        .collect()
}

/// A `.cst` file on disk.
#[derive(Clone, Debug)]
pub struct Segment {
    path: PathBuf,
}

impl Segment {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write all records and return the size of the finished file.
    pub fn write(&self, records: &[SegmentRecord]) -> Result<u64> {
        let mut writer = SegmentFileWriter::begin(&self.path, &schema())?;
        for batch in records.chunks(CHUNK_ROWS) {
            writer.append(to_chunk(batch)?)?;
        }
        let committed = writer.commit()?;
        trace!(
            "wrote {} rows in {} batches ({} bytes) to {:?}",
            committed.rows,
            committed.batches,
            committed.bytes,
            self.path
        );
        Ok(committed.bytes)
    }

    /// Iterate the segment one record batch at a time.
    pub fn iter(&self) -> Result<impl Iterator<Item = Result<Vec<SegmentRecord>>>> {
        let reader = SegmentFileReader::open(&self.path, &schema())?;
        Ok(reader.map(|chunk| chunk.and_then(|c| from_chunk(&c))))
    }

    pub fn read_all(&self) -> Result<Vec<SegmentRecord>> {
        let mut records = vec![];
        for batch in self.iter()? {
            records.extend(batch?);
        }
        Ok(records)
    }

    pub fn size(&self) -> Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }
}
