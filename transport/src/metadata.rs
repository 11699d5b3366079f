//! Partition discovery and metadata operations exchanged with the cluster
//! coordinator.

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{hex_bytes, PartitionId, Token, TransactionId};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscoveryCode {
    #[default]
    Unknown,
    Load,
    Serve,
    Unload,
}

/// A server that should hold (a keyrange of) a partition.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTarget {
    pub server_id: String,
    pub placement_id: u64,
    pub partition_id: PartitionId,
    #[serde(with = "hex_bytes", default)]
    pub keyrange_begin: Vec<u8>,
    #[serde(with = "hex_bytes", default)]
    pub keyrange_end: Vec<u8>,
    #[serde(default)]
    pub legacy_token: Option<Token>,
    #[serde(default)]
    pub is_joining: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub namespace: String,
    pub table: String,
    pub min_txnseq: u64,
    pub partition_id: PartitionId,
    #[serde(with = "hex_bytes", default)]
    pub keyrange_begin: Vec<u8>,
    #[serde(with = "hex_bytes", default)]
    pub keyrange_end: Vec<u8>,
    pub lookup_by_id: bool,
    pub requester_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub code: DiscoveryCode,
    pub txnid: TransactionId,
    pub txnseq: u64,
    #[serde(with = "hex_bytes", default)]
    pub keyrange_begin: Vec<u8>,
    #[serde(with = "hex_bytes", default)]
    pub keyrange_end: Vec<u8>,
    #[serde(default)]
    pub replication_targets: Vec<ReplicationTarget>,
    #[serde(default)]
    pub is_splitting: bool,
    #[serde(default)]
    pub split_partition_ids: Vec<PartitionId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetadataOperation {
    SplitPartition {
        partition_id: PartitionId,
        #[serde(with = "hex_bytes")]
        split_point: Vec<u8>,
        split_partition_id_low: PartitionId,
        split_partition_id_high: PartitionId,
        split_servers_low: Vec<String>,
        split_servers_high: Vec<String>,
        finalize_immediately: bool,
    },
    FinalizeSplit {
        partition_id: PartitionId,
    },
    JoinServer {
        partition_id: PartitionId,
        server_id: String,
    },
    FinalizeJoin {
        partition_id: PartitionId,
        server_id: String,
        placement_id: u64,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataOperationEnvelope {
    pub namespace: String,
    pub table: String,
    pub input_txnid: Option<TransactionId>,
    pub output_txnid: TransactionId,
    pub operation: MetadataOperation,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataOperationResult {
    pub txnid: TransactionId,
    pub txnseq: u64,
}
