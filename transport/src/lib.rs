use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use arrow2::{
    array::{Array, BinaryArray, FixedSizeBinaryArray, PrimitiveArray},
    chunk::Chunk,
    datatypes::{DataType, Field},
    io::ipc::{read, write},
};
pub use arrow2::{self, datatypes::Schema as ArrowSchema, error::Error as ArrowError};
use bytes::Bytes;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use thiserror::Error;

pub mod cluster;
pub mod metadata;

pub use cluster::*;
pub use metadata::*;

pub const ID_LEN: usize = 20;

pub const ID_COLUMN: &str = "__lsm_id";
pub const VERSION_COLUMN: &str = "__lsm_version";
pub const SEQUENCE_COLUMN: &str = "__lsm_sequence";
pub const IS_UPDATE_COLUMN: &str = "__lsm_is_update";
pub const SKIP_COLUMN: &str = "__lsm_skip";
pub const KEY_COLUMN: &str = "key";
pub const DATA_COLUMN: &str = "data";

pub const CONTENT_TYPE_ARROW: &str = "application/vnd.apache.arrow.file";
pub const CONTENT_TYPE_JSON: &str = "application/json";

pub type SegmentChunk = Chunk<Box<dyn Array>>;

#[derive(Error, Debug)]
pub enum IdError {
    #[error("expected {ID_LEN} bytes, got {0}")]
    Length(usize),
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),
    #[error("column {0} must be '{1}'")]
    BadColumn(usize, &'static str),
    #[error("expected {0} columns, got {1}")]
    ColumnCount(usize, usize),
    #[error("invalid record id: {0}")]
    Id(#[from] IdError),
}

macro_rules! sha1_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub [u8; ID_LEN]);

        impl $name {
            /// SHA-1 of the provided bytes.
            pub fn hash(data: impl AsRef<[u8]>) -> Self {
                Self(Sha1::digest(data.as_ref()).into())
            }

            pub fn random() -> Self {
                Self(rand::random())
            }

            pub fn from_slice(bytes: &[u8]) -> Result<Self, IdError> {
                <[u8; ID_LEN]>::try_from(bytes)
                    .map(Self)
                    .map_err(|_| IdError::Length(bytes.len()))
            }

            pub fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut out = [0u8; ID_LEN];
                hex::decode_to_slice(s, &mut out)?;
                Ok(Self(out))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }
    };
}

sha1_id!(
    /// Identifies one partition of a table, unique within that table.
    PartitionId
);
sha1_id!(
    /// Content hash identifying a record across all of its versions.
    RecordId
);
sha1_id!(
    /// Identifies a cluster metadata transaction.
    TransactionId
);
sha1_id!(
    /// A position on the replication ring, or the stable identity of a replica.
    Token
);

impl PartitionId {
    /// Partition identifier for an explicit partition key of a table.
    pub fn for_key(table: &str, key: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(table.as_bytes());
        hasher.update(b"~");
        hasher.update(key.as_ref());
        Self(hasher.finalize().into())
    }
}

/// Serializes byte strings (keyrange bounds, keys) as lowercase hex.
pub mod hex_bytes {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(de::Error::custom)
    }
}

/// Addresses the partition a replication batch is written to.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicateQuery {
    pub namespace: String,
    pub table: String,
    pub partition: PartitionId,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Replicated {
    pub inserted: usize,
}

/// One record version as it travels between replicas.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicateRecord {
    pub id: RecordId,
    pub version: u64,
    pub key: Bytes,
    pub data: Bytes,
}

impl ReplicateRecord {
    pub fn size(&self) -> usize {
        ID_LEN + 8 + self.key.len() + self.data.len()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: u16,
    pub message: String,
}

pub fn replicate_schema() -> ArrowSchema {
    ArrowSchema::from(vec![
        Field::new(ID_COLUMN, DataType::FixedSizeBinary(ID_LEN), false),
        Field::new(VERSION_COLUMN, DataType::UInt64, false),
        Field::new(KEY_COLUMN, DataType::Binary, false),
        Field::new(DATA_COLUMN, DataType::Binary, false),
    ])
}

/// Encodes a replication batch as an Arrow IPC file.
pub fn encode_records(records: &[ReplicateRecord]) -> Result<Vec<u8>, ArrowError> {
    let ids: Vec<u8> = records.iter().flat_map(|r| r.id.0).collect();
    let chunk = Chunk::try_new(vec![
        FixedSizeBinaryArray::new(DataType::FixedSizeBinary(ID_LEN), ids.into(), None).boxed(),
        PrimitiveArray::<u64>::from_vec(records.iter().map(|r| r.version).collect()).boxed(),
        BinaryArray::<i32>::from_iter_values(records.iter().map(|r| r.key.as_ref())).boxed(),
        BinaryArray::<i32>::from_iter_values(records.iter().map(|r| r.data.as_ref())).boxed(),
    ])?;

    let mut buf = Cursor::new(vec![]);
    {
        let options = write::WriteOptions { compression: None };
        let mut writer = write::FileWriter::try_new(&mut buf, replicate_schema(), None, options)?;
        writer.write(&chunk, None)?;
        writer.finish()?;
    }

    Ok(buf.into_inner())
}

pub fn downcast_column<'a, T: Array + 'static>(
    chunk: &'a SegmentChunk,
    ix: usize,
    name: &'static str,
) -> Result<&'a T, ChunkError> {
    chunk
        .arrays()
        .get(ix)
        .and_then(|arr| arr.as_any().downcast_ref::<T>())
        .ok_or(ChunkError::BadColumn(ix, name))
}

/// Inverse of [encode_records].
pub fn decode_records(bytes: &[u8]) -> Result<Vec<ReplicateRecord>, ChunkError> {
    let mut cursor = Cursor::new(bytes);
    let metadata = read::read_file_metadata(&mut cursor)?;
    let expected = replicate_schema().fields.len();
    if metadata.schema.fields.len() != expected {
        return Err(ChunkError::ColumnCount(
            expected,
            metadata.schema.fields.len(),
        ));
    }

    let reader = read::FileReader::new(cursor, metadata, None, None);
    let mut records = vec![];
    for chunk in reader {
        let chunk = chunk?;
        let ids = downcast_column::<FixedSizeBinaryArray>(&chunk, 0, ID_COLUMN)?;
        let versions = downcast_column::<PrimitiveArray<u64>>(&chunk, 1, VERSION_COLUMN)?;
        let keys = downcast_column::<BinaryArray<i32>>(&chunk, 2, KEY_COLUMN)?;
        let data = downcast_column::<BinaryArray<i32>>(&chunk, 3, DATA_COLUMN)?;

        for ix in 0..chunk.len() {
            records.push(ReplicateRecord {
                id: RecordId::from_slice(ids.value(ix))?,
                version: versions.value(ix),
                key: Bytes::copy_from_slice(keys.value(ix)),
                data: Bytes::copy_from_slice(data.value(ix)),
            });
        }
    }

    Ok(records)
}
