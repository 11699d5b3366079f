//! Partition placement: the coordinator interface, its http and in-process
//! implementations, and server allocation.
//!
//! Placement changes are metadata transactions. Each one is validated against
//! the table's current transaction id, bumps the table's transaction sequence
//! and, on the master, is published through the table definition so that
//! every node notices it on its next config sync.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use basalt_client::Client;
use basalt_transport::{
    hex_bytes, DiscoveryCode, DiscoveryRequest, DiscoveryResponse, MetadataOperation,
    MetadataOperationEnvelope, MetadataOperationResult, PartitionId, ReplicationTarget,
    ServerStatus, TransactionId,
};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config_directory::{ClusterView, ConfigDirectoryMaster};
use crate::error::{Error, Result};

#[async_trait]
pub trait MetadataCoordinator: Send + Sync + fmt::Debug {
    async fn discover(&self, request: DiscoveryRequest) -> Result<DiscoveryResponse>;

    async fn perform_operation(
        &self,
        envelope: MetadataOperationEnvelope,
    ) -> Result<MetadataOperationResult>;
}

/// Coordinator reached over http.
#[derive(Clone, Debug)]
pub struct HttpCoordinator {
    client: Client,
}

impl HttpCoordinator {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MetadataCoordinator for HttpCoordinator {
    async fn discover(&self, request: DiscoveryRequest) -> Result<DiscoveryResponse> {
        Ok(self.client.discover(&request).await?)
    }

    async fn perform_operation(
        &self,
        envelope: MetadataOperationEnvelope,
    ) -> Result<MetadataOperationResult> {
        Ok(self.client.perform_metadata_operation(&envelope).await?)
    }
}

/// Picks servers for new partition placements.
#[derive(Clone, Debug)]
pub struct ServerAllocator {
    cluster: ClusterView,
}

impl ServerAllocator {
    pub fn new(cluster: ClusterView) -> Self {
        Self { cluster }
    }

    fn live_servers(&self) -> Vec<String> {
        self.cluster
            .load()
            .servers
            .iter()
            .filter(|s| s.status == ServerStatus::Up)
            .map(|s| s.server_id.clone())
            .collect()
    }

    /// Number of copies a new placement gets: the cluster's replication
    /// factor, capped at the number of live servers.
    pub fn replication_factor(&self) -> usize {
        let rf = self.cluster.load().replication_factor;
        rf.min(self.live_servers().len()).max(1)
    }

    /// `n` distinct live servers not in `exclude`, in random order.
    pub fn allocate_servers(&self, n: usize, exclude: &[String]) -> Result<Vec<String>> {
        let mut servers: Vec<_> = self
            .live_servers()
            .into_iter()
            .filter(|s| !exclude.contains(s))
            .collect();
        if servers.len() < n {
            return Err(Error::runtime(format!(
                "not enough live servers: need {n}, have {}",
                servers.len()
            )));
        }
        servers.shuffle(&mut rand::thread_rng());
        servers.truncate(n);
        Ok(servers)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlacement {
    #[serde(with = "hex_bytes", default)]
    pub keyrange_begin: Vec<u8>,
    #[serde(with = "hex_bytes", default)]
    pub keyrange_end: Vec<u8>,
    pub code: DiscoveryCode,
    pub targets: Vec<ReplicationTarget>,
    #[serde(default)]
    pub is_splitting: bool,
    #[serde(default)]
    pub split_partition_ids: Vec<PartitionId>,
}

/// Placement of every partition of one table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub txnid: Option<TransactionId>,
    pub txnseq: u64,
    pub partitions: BTreeMap<PartitionId, PartitionPlacement>,
}

impl TableMetadata {
    fn placement_mut(&mut self, partition_id: &PartitionId) -> Result<&mut PartitionPlacement> {
        self.partitions
            .get_mut(partition_id)
            .ok_or_else(|| Error::NotFound(format!("partition {partition_id}")))
    }

    fn targets_for(
        partition_id: PartitionId,
        servers: &[String],
        begin: &[u8],
        end: &[u8],
    ) -> Vec<ReplicationTarget> {
        servers
            .iter()
            .map(|server_id| ReplicationTarget {
                server_id: server_id.clone(),
                placement_id: rand::random(),
                partition_id,
                keyrange_begin: begin.to_vec(),
                keyrange_end: end.to_vec(),
                legacy_token: None,
                is_joining: false,
            })
            .collect()
    }

    fn finalize_split(&mut self, partition_id: &PartitionId) -> Result<()> {
        let parent = self.placement_mut(partition_id)?;
        if !parent.is_splitting {
            return Err(Error::IllegalState(format!(
                "partition {partition_id} is not splitting"
            )));
        }
        parent.is_splitting = false;
        parent.code = DiscoveryCode::Unload;
        for child in parent.split_partition_ids.clone() {
            self.placement_mut(&child)?.code = DiscoveryCode::Serve;
        }
        Ok(())
    }

    fn apply(&mut self, operation: &MetadataOperation) -> Result<()> {
        match operation {
            MetadataOperation::SplitPartition {
                partition_id,
                split_point,
                split_partition_id_low,
                split_partition_id_high,
                split_servers_low,
                split_servers_high,
                finalize_immediately,
            } => {
                let parent = self.placement_mut(partition_id)?;
                if parent.is_splitting {
                    return Err(Error::IllegalState(format!(
                        "partition {partition_id} is already splitting"
                    )));
                }
                let (begin, end) = (parent.keyrange_begin.clone(), parent.keyrange_end.clone());
                if split_point.as_slice() <= begin.as_slice()
                    || (!end.is_empty() && split_point.as_slice() >= end.as_slice())
                {
                    return Err(Error::IllegalArgument(
                        "split point outside of partition keyrange".to_string(),
                    ));
                }

                parent.is_splitting = true;
                parent.split_partition_ids = vec![*split_partition_id_low, *split_partition_id_high];

                let low = PartitionPlacement {
                    keyrange_begin: begin.clone(),
                    keyrange_end: split_point.clone(),
                    code: DiscoveryCode::Load,
                    targets: Self::targets_for(
                        *split_partition_id_low,
                        split_servers_low,
                        &begin,
                        split_point,
                    ),
                    ..Default::default()
                };
                let high = PartitionPlacement {
                    keyrange_begin: split_point.clone(),
                    keyrange_end: end.clone(),
                    code: DiscoveryCode::Load,
                    targets: Self::targets_for(
                        *split_partition_id_high,
                        split_servers_high,
                        split_point,
                        &end,
                    ),
                    ..Default::default()
                };
                self.partitions.insert(*split_partition_id_low, low);
                self.partitions.insert(*split_partition_id_high, high);

                if *finalize_immediately {
                    self.finalize_split(partition_id)?;
                }
            }
            MetadataOperation::FinalizeSplit { partition_id } => self.finalize_split(partition_id)?,
            MetadataOperation::JoinServer {
                partition_id,
                server_id,
            } => {
                let placement = self.placement_mut(partition_id)?;
                let mut target = Self::targets_for(
                    *partition_id,
                    std::slice::from_ref(server_id),
                    &placement.keyrange_begin,
                    &placement.keyrange_end,
                )
                .remove(0);
                target.is_joining = true;
                placement.targets.push(target);
            }
            MetadataOperation::FinalizeJoin {
                partition_id,
                server_id,
                placement_id,
            } => {
                let target = self
                    .placement_mut(partition_id)?
                    .targets
                    .iter_mut()
                    .find(|t| &t.server_id == server_id && t.placement_id == *placement_id)
                    .ok_or_else(|| {
                        Error::NotFound(format!("joining server {server_id} of {partition_id}"))
                    })?;
                target.is_joining = false;
            }
        }
        Ok(())
    }

    fn response(&self, partition_id: &PartitionId, requester_id: &str) -> DiscoveryResponse {
        let Some(placement) = self.partitions.get(partition_id) else {
            return DiscoveryResponse {
                code: DiscoveryCode::Unknown,
                txnid: self.txnid.unwrap_or_default(),
                txnseq: self.txnseq,
                ..Default::default()
            };
        };

        let mut targets = placement.targets.clone();
        if placement.is_splitting {
            for child in &placement.split_partition_ids {
                if let Some(child) = self.partitions.get(child) {
                    targets.extend(child.targets.iter().cloned());
                }
            }
        }

        let assigned = placement
            .targets
            .iter()
            .any(|t| t.server_id == requester_id);

        DiscoveryResponse {
            code: if assigned {
                placement.code
            } else {
                DiscoveryCode::Unload
            },
            txnid: self.txnid.unwrap_or_default(),
            txnseq: self.txnseq,
            keyrange_begin: placement.keyrange_begin.clone(),
            keyrange_end: placement.keyrange_end.clone(),
            replication_targets: targets,
            is_splitting: placement.is_splitting,
            split_partition_ids: placement.split_partition_ids.clone(),
        }
    }
}

/// Coordinator running inside the master process. Placements are kept in
/// memory and written through to the master database when one is attached.
#[derive(Debug)]
pub struct LocalCoordinator {
    allocator: ServerAllocator,
    tables: Mutex<HashMap<(String, String), TableMetadata>>,
    master: Option<Arc<ConfigDirectoryMaster>>,
}

impl LocalCoordinator {
    pub fn new(cluster: ClusterView) -> Self {
        Self {
            allocator: ServerAllocator::new(cluster),
            tables: Mutex::new(HashMap::new()),
            master: None,
        }
    }

    pub async fn with_master(cluster: ClusterView, master: Arc<ConfigDirectoryMaster>) -> Result<Self> {
        let tables = master
            .load_metadata()
            .await?
            .into_iter()
            .map(|(ns, table, md)| ((ns, table), md))
            .collect();
        Ok(Self {
            allocator: ServerAllocator::new(cluster),
            tables: Mutex::new(tables),
            master: Some(master),
        })
    }

    async fn persist(&self, namespace: &str, table: &str, metadata: &TableMetadata) -> Result<()> {
        match &self.master {
            Some(master) => master.store_metadata(namespace, table, metadata).await,
            None => Ok(()),
        }
    }

    /// Place an unknown partition on the requester plus enough other live
    /// servers to reach the replication factor.
    fn assign(&self, request: &DiscoveryRequest) -> Result<PartitionPlacement> {
        let requester = vec![request.requester_id.clone()];
        let others = self
            .allocator
            .replication_factor()
            .saturating_sub(1)
            .min(self.allocator.live_servers().len().saturating_sub(1));
        let servers: Vec<String> = requester
            .iter()
            .cloned()
            .chain(self.allocator.allocate_servers(others, &requester)?)
            .collect();

        Ok(PartitionPlacement {
            keyrange_begin: request.keyrange_begin.clone(),
            keyrange_end: request.keyrange_end.clone(),
            code: DiscoveryCode::Serve,
            targets: TableMetadata::targets_for(
                request.partition_id,
                &servers,
                &request.keyrange_begin,
                &request.keyrange_end,
            ),
            ..Default::default()
        })
    }
}

#[async_trait]
impl MetadataCoordinator for LocalCoordinator {
    async fn discover(&self, request: DiscoveryRequest) -> Result<DiscoveryResponse> {
        let mut tables = self.tables.lock().await;
        let metadata = tables
            .entry((request.namespace.clone(), request.table.clone()))
            .or_default();

        if !metadata.partitions.contains_key(&request.partition_id) {
            let placement = self.assign(&request)?;
            info!(
                "assigned {}/{}/{} to {:?}",
                request.namespace,
                request.table,
                request.partition_id,
                placement
                    .targets
                    .iter()
                    .map(|t| t.server_id.as_str())
                    .collect::<Vec<_>>()
            );
            metadata.partitions.insert(request.partition_id, placement);
            let snapshot = metadata.clone();
            self.persist(&request.namespace, &request.table, &snapshot)
                .await?;
        }

        let metadata = &tables[&(request.namespace.clone(), request.table.clone())];
        Ok(metadata.response(&request.partition_id, &request.requester_id))
    }

    async fn perform_operation(
        &self,
        envelope: MetadataOperationEnvelope,
    ) -> Result<MetadataOperationResult> {
        let mut tables = self.tables.lock().await;
        let key = (envelope.namespace.clone(), envelope.table.clone());
        let current = tables.get(&key).cloned().unwrap_or_default();

        if current.txnid.unwrap_or_default() != envelope.input_txnid.unwrap_or_default() {
            return Err(Error::ConcurrentModification(format!(
                "{}/{}: metadata transaction {} is not current",
                envelope.namespace,
                envelope.table,
                envelope.input_txnid.unwrap_or_default()
            )));
        }

        let mut next = current;
        next.apply(&envelope.operation)?;
        next.txnid = Some(envelope.output_txnid);
        next.txnseq += 1;

        if let Some(master) = &self.master {
            master
                .commit_metadata_txn(
                    &envelope.namespace,
                    &envelope.table,
                    &next,
                    envelope.output_txnid,
                    next.txnseq,
                )
                .await?;
        }

        debug!(
            "{}/{}: applied {:?} as transaction {}",
            envelope.namespace, envelope.table, envelope.operation, next.txnseq
        );
        let result = MetadataOperationResult {
            txnid: envelope.output_txnid,
            txnseq: next.txnseq,
        };
        tables.insert(key, next);
        Ok(result)
    }
}
