//! Persisted partition state and its `_snapshot` file.
//!
//! The file starts with an 8 byte header (`BSLT`, then the format version as
//! a little-endian u32) followed by the JSON encoded [`PartitionState`]. It
//! is always replaced atomically: written to `_snapshot.tmp`, synced, then
//! renamed over the previous file.

use std::fs;
use std::io::Write;
use std::path::Path;

use basalt_transport::{
    hex_bytes, DiscoveryCode, PartitionId, ReplicationTarget, StorageKind, Token, TransactionId,
};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

pub const SNAPSHOT_FILENAME: &str = "_snapshot";
const SNAPSHOT_MAGIC: &[u8; 4] = b"BSLT";
const SNAPSHOT_VERSION: u32 = 1;

/// One on-disk segment (`<filename>.cst` and `<filename>.idx`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LsmTableRef {
    pub filename: String,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub size_bytes: u64,
    pub has_skiplist: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaOffset {
    pub replica_id: Token,
    /// Last sequence known to be stored on the replica.
    pub offset: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationState {
    /// Partition uuid the offsets were recorded for.
    pub uuid: Uuid,
    pub replicas: Vec<ReplicaOffset>,
}

impl ReplicationState {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            replicas: vec![],
        }
    }

    pub fn offset(&self, replica_id: &Token) -> u64 {
        self.replicas
            .iter()
            .find(|r| &r.replica_id == replica_id)
            .map(|r| r.offset)
            .unwrap_or(0)
    }

    pub fn set_offset(&mut self, replica_id: Token, offset: u64) {
        match self.replicas.iter_mut().find(|r| r.replica_id == replica_id) {
            Some(r) => r.offset = offset,
            None => self.replicas.push(ReplicaOffset { replica_id, offset }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionState {
    pub namespace: String,
    pub table_key: String,
    pub partition_id: PartitionId,
    pub uuid: Uuid,
    #[serde(with = "hex_bytes", default)]
    pub keyrange_begin: Vec<u8>,
    #[serde(with = "hex_bytes", default)]
    pub keyrange_end: Vec<u8>,
    pub lifecycle_state: DiscoveryCode,
    #[serde(default)]
    pub is_splitting: bool,
    #[serde(default)]
    pub split_partition_ids: Vec<PartitionId>,
    #[serde(default)]
    pub storage: StorageKind,
    #[serde(default)]
    pub table_generation: u64,
    #[serde(default)]
    pub lsm_tables: Vec<LsmTableRef>,
    /// Sequence of the last committed record.
    #[serde(default)]
    pub lsm_sequence: u64,
    #[serde(default)]
    pub last_metadata_txnid: Option<TransactionId>,
    #[serde(default)]
    pub last_metadata_txnseq: u64,
    #[serde(default)]
    pub replication_targets: Vec<ReplicationTarget>,
    #[serde(default)]
    pub has_joining_servers: bool,
    #[serde(default)]
    pub replication_state: ReplicationState,
}

impl PartitionState {
    pub fn new(namespace: &str, table_key: &str, partition_id: PartitionId) -> Self {
        let uuid = Uuid::new_v4();
        Self {
            namespace: namespace.to_string(),
            table_key: table_key.to_string(),
            partition_id,
            uuid,
            keyrange_begin: vec![],
            keyrange_end: vec![],
            lifecycle_state: DiscoveryCode::Serve,
            is_splitting: false,
            split_partition_ids: vec![],
            storage: StorageKind::Lsm,
            table_generation: 0,
            lsm_tables: vec![],
            lsm_sequence: 0,
            last_metadata_txnid: None,
            last_metadata_txnseq: 0,
            replication_targets: vec![],
            has_joining_servers: false,
            replication_state: ReplicationState::new(uuid),
        }
    }

    /// Replication offsets recorded for an older incarnation of this
    /// partition are meaningless.
    pub fn replication_state(&self) -> ReplicationState {
        if self.replication_state.uuid == self.uuid {
            self.replication_state.clone()
        } else {
            ReplicationState::new(self.uuid)
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(512);
        out.extend_from_slice(SNAPSHOT_MAGIC);
        out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        serde_json::to_writer(&mut out, self)?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 || &bytes[..4] != SNAPSHOT_MAGIC {
            return Err(Error::runtime("invalid partition snapshot header"));
        }
        let version = LittleEndian::read_u32(&bytes[4..8]);
        if version != SNAPSHOT_VERSION {
            return Err(Error::runtime(format!(
                "unsupported partition snapshot version {version}"
            )));
        }
        Ok(serde_json::from_slice(&bytes[8..])?)
    }

    /// Atomically replace `<dir>/_snapshot`.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        let path = dir.join(SNAPSHOT_FILENAME);
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&self.encode()?)?;
        file.sync_all()?;
        drop(file);
        fs::rename(tmp, path)?;
        Ok(())
    }

    pub fn read_from(dir: &Path) -> Result<Self> {
        Self::decode(&fs::read(dir.join(SNAPSHOT_FILENAME))?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    fn state() -> PartitionState {
        let mut state = PartitionState::new("acme", "events", PartitionId([3; 20]));
        state.keyrange_begin = b"a".to_vec();
        state.keyrange_end = b"m".to_vec();
        state.lsm_tables = vec![
            LsmTableRef {
                filename: "00aa11bb22cc33dd".to_string(),
                first_sequence: 1,
                last_sequence: 10,
                size_bytes: 1234,
                has_skiplist: true,
            },
            LsmTableRef {
                filename: "99ff88ee77dd66cc".to_string(),
                first_sequence: 11,
                last_sequence: 12,
                size_bytes: 80,
                has_skiplist: true,
            },
        ];
        state.lsm_sequence = 12;
        state.last_metadata_txnid = Some(TransactionId([7; 20]));
        state.last_metadata_txnseq = 4;
        state.replication_state.set_offset(Token([1; 20]), 10);
        state
    }

    #[test]
    fn encode_decode() -> anyhow::Result<()> {
        let state = state();
        assert_eq!(PartitionState::decode(&state.encode()?)?, state);
        Ok(())
    }

    #[test]
    fn bad_header() {
        assert!(PartitionState::decode(b"nope").is_err());
        assert!(PartitionState::decode(b"BSLT\x09\x00\x00\x00{}").is_err());
    }

    #[test]
    fn write_and_read() -> anyhow::Result<()> {
        let root = tempdir()?;
        let state = state();
        state.write_to(root.path())?;
        assert!(!root.path().join("_snapshot.tmp").exists());
        assert_eq!(PartitionState::read_from(root.path())?, state);
        Ok(())
    }

    #[test]
    fn stale_replication_state_is_reset() {
        let mut state = state();
        assert_eq!(state.replication_state().offset(&Token([1; 20])), 10);

        state.uuid = Uuid::new_v4();
        let repl = state.replication_state();
        assert_eq!(repl.uuid, state.uuid);
        assert_eq!(repl.offset(&Token([1; 20])), 0);
    }
}
