//! Replication of one partition to its replicas.
//!
//! Each remote replica has an offset in the partition's
//! [`ReplicationState`]: the last sequence it is known to hold. A pass sends
//! every committed row above that offset, in batches, and advances the
//! offset only once the whole range was accepted.

use std::collections::BTreeSet;
use std::sync::Arc;

use basalt_client::Client;
use basalt_transport::{
    DiscoveryCode, DiscoveryRequest, MetadataOperation, MetadataOperationEnvelope, PartitionId,
    Partitioner, ReplicateQuery, ReplicateRecord, Token, TransactionId,
};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::partition::{Partition, PartitionContext};
use crate::reader::{KeyRange, PartitionReader};
use crate::snapshot::PartitionSnapshot;
use crate::state::ReplicationState;

/// A server that should hold (a keyrange of) the partition's rows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Replica {
    /// Identity the replica's offset is recorded under.
    pub unique_id: Token,
    pub server_id: String,
    pub addr: String,
    /// Partition the rows are written to on the replica. Differs from the
    /// source partition for split targets.
    pub partition_id: PartitionId,
    pub keyrange: KeyRange,
    pub placement_id: u64,
    pub is_local: bool,
    pub is_joining: bool,
}

pub struct PartitionReplication {
    partition: Arc<Partition>,
    max_batch_rows: usize,
    max_batch_bytes: usize,
}

impl PartitionReplication {
    pub fn new(partition: Arc<Partition>) -> Self {
        Self {
            partition,
            max_batch_rows: 8192,
            max_batch_bytes: 50 * 1024 * 1024,
        }
    }

    pub fn with_batch_limits(mut self, rows: usize, bytes: usize) -> Self {
        self.max_batch_rows = rows.max(1);
        self.max_batch_bytes = bytes.max(1);
        self
    }

    fn ctx(&self) -> &PartitionContext {
        self.partition.context()
    }

    /// Replicas of the partition. Placement targets assigned by the metadata
    /// coordinator take precedence over the replication scheme.
    pub fn replicas(&self) -> Vec<Replica> {
        let snapshot = self.partition.snapshot();
        let key = self.partition.key();
        let ctx = self.ctx();

        if snapshot.state.replication_targets.is_empty() {
            return ctx
                .scheme
                .replicas_for(&key.partition_id)
                .into_iter()
                .map(|r| Replica {
                    unique_id: r.unique_id,
                    server_id: r.name,
                    addr: r.addr,
                    partition_id: key.partition_id,
                    keyrange: KeyRange::default(),
                    placement_id: 0,
                    is_local: r.is_local,
                    is_joining: false,
                })
                .collect();
        }

        let cluster = ctx.cluster.load();
        snapshot
            .state
            .replication_targets
            .iter()
            .map(|t| Replica {
                unique_id: t.legacy_token.unwrap_or_else(|| {
                    Token::hash(format!("{}~{}", t.server_id, t.placement_id))
                }),
                server_id: t.server_id.clone(),
                addr: cluster
                    .server(&t.server_id)
                    .map(|s| s.addr.clone())
                    .unwrap_or_default(),
                partition_id: t.partition_id,
                keyrange: KeyRange::new(t.keyrange_begin.clone(), t.keyrange_end.clone()),
                placement_id: t.placement_id,
                is_local: t.server_id == ctx.server_id && t.partition_id == key.partition_id,
                is_joining: t.is_joining,
            })
            .collect()
    }

    fn has_pending_metadata(&self, snapshot: &PartitionSnapshot) -> bool {
        let table = self.partition.table();
        table.partitioner != Partitioner::Fixed
            && table.metadata_txnseq > snapshot.state.last_metadata_txnseq
    }

    pub fn needs_replication(&self) -> bool {
        if self.partition.is_generation_superseded() {
            return false;
        }

        let snapshot = self.partition.snapshot();
        if self.has_pending_metadata(&snapshot)
            || self.partition.is_splitting()
            || snapshot.state.has_joining_servers
        {
            return true;
        }

        let state = snapshot.state.replication_state();
        let head = snapshot.state.lsm_sequence;
        self.replicas()
            .iter()
            .filter(|r| !r.is_local)
            .any(|r| state.offset(&r.unique_id) < head)
    }

    /// Remote replicas of this partition holding every committed row.
    pub fn num_full_remote_copies(&self) -> usize {
        let snapshot = self.partition.snapshot();
        let state = snapshot.state.replication_state();
        let partition_id = self.partition.key().partition_id;
        self.replicas()
            .iter()
            .filter(|r| !r.is_local && r.partition_id == partition_id)
            .filter(|r| state.offset(&r.unique_id) >= snapshot.state.lsm_sequence)
            .count()
    }

    /// Whether the local copy may be deleted: it is no longer assigned here,
    /// holds nothing uncommitted and every replica has all of its rows.
    pub fn should_drop(&self) -> bool {
        let snapshot = self.partition.snapshot();
        let unassigned = snapshot.state.lifecycle_state == DiscoveryCode::Unload
            || self.partition.is_generation_superseded();

        unassigned
            && snapshot.arenas_empty()
            && !self.needs_replication()
            && !self.replicas().is_empty()
    }

    /// One replication pass. Returns false if any replica could not be
    /// brought up to date; progress of the others is kept.
    pub async fn replicate(&self) -> bool {
        match self.try_replicate().await {
            Ok(success) => success,
            Err(e) => {
                error!("{}: replication failed: {e}", self.partition.key());
                self.ctx().metrics.replication_failure.increment(1);
                false
            }
        }
    }

    async fn try_replicate(&self) -> Result<bool> {
        self.apply_pending_metadata().await?;

        let writer = self.partition.get_writer();
        let snapshot = self.partition.snapshot();
        let head = snapshot.state.lsm_sequence;
        let mut state = writer.fetch_replication_state();
        let mut dirty = false;
        let mut success = true;

        for replica in self.replicas().iter().filter(|r| !r.is_local) {
            let offset = state.offset(&replica.unique_id);
            if offset >= head {
                continue;
            }

            match self.replicate_to(&snapshot, replica, offset).await {
                Ok(sent) => {
                    debug!(
                        "{}: replicated {sent} records to {} ({offset} => {head})",
                        self.partition.key(),
                        replica.addr
                    );
                    state.set_offset(replica.unique_id, head);
                    dirty = true;
                    self.ctx().metrics.replication_success.increment(1);
                }
                Err(e) => {
                    warn!(
                        "{}: replication to {} ({}) failed: {e}",
                        self.partition.key(),
                        replica.server_id,
                        replica.addr
                    );
                    success = false;
                    self.ctx().metrics.replication_failure.increment(1);
                }
            }
        }

        if dirty {
            writer.commit_replication_state(state.clone())?;
        }

        if success {
            self.finalize_joins(&snapshot, &state).await?;
            self.finalize_split(&snapshot, &state).await?;
        }
        Ok(success)
    }

    /// Push every committed row above `offset` inside the replica's
    /// keyrange. Returns the number of rows sent.
    pub async fn replicate_to(
        &self,
        snapshot: &Arc<PartitionSnapshot>,
        replica: &Replica,
        offset: u64,
    ) -> Result<usize> {
        let client = Client::for_addr(&replica.addr)?;
        let query = ReplicateQuery {
            namespace: self.partition.key().namespace.clone(),
            table: self.partition.key().table.clone(),
            partition: replica.partition_id,
        };

        let reader = PartitionReader::new(snapshot.clone(), self.ctx().index_cache.clone());
        let mut batch: Vec<ReplicateRecord> = vec![];
        let mut batch_bytes = 0;
        let mut sent = 0;

        for table in reader.tables_after(offset) {
            let snapshot = snapshot.clone();
            let index_cache = self.ctx().index_cache.clone();
            let keyrange = replica.keyrange.clone();
            let rows = tokio::task::spawn_blocking(move || {
                let mut rows = vec![];
                PartitionReader::new(snapshot, index_cache).fetch_table_records(
                    &table,
                    offset,
                    &keyrange,
                    |row| {
                        rows.push(ReplicateRecord {
                            id: row.id,
                            version: row.version,
                            key: row.key,
                            data: row.data,
                        });
                        Ok(())
                    },
                )?;
                Ok::<_, Error>(rows)
            })
            .await
            .map_err(|e| Error::runtime(e.to_string()))??;

            for row in rows {
                batch_bytes += row.size();
                batch.push(row);
                if batch.len() >= self.max_batch_rows || batch_bytes >= self.max_batch_bytes {
                    sent += self.send(&client, &query, &mut batch).await?;
                    batch_bytes = 0;
                }
            }
        }

        if !batch.is_empty() {
            sent += self.send(&client, &query, &mut batch).await?;
        }
        self.ctx().metrics.replicated_records.increment(sent as u64);
        Ok(sent)
    }

    async fn send(
        &self,
        client: &Client,
        query: &ReplicateQuery,
        batch: &mut Vec<ReplicateRecord>,
    ) -> Result<usize> {
        client.replicate(query, batch).await?;
        let n = batch.len();
        batch.clear();
        Ok(n)
    }

    /// Bring the partition's placement up to the table's latest metadata
    /// transaction.
    async fn apply_pending_metadata(&self) -> Result<()> {
        let snapshot = self.partition.snapshot();
        if !self.has_pending_metadata(&snapshot) {
            return Ok(());
        }

        let key = self.partition.key();
        let table = self.partition.table();
        let response = self
            .ctx()
            .coordinator
            .discover(DiscoveryRequest {
                namespace: key.namespace.clone(),
                table: key.table.clone(),
                min_txnseq: table.metadata_txnseq,
                partition_id: key.partition_id,
                keyrange_begin: snapshot.state.keyrange_begin.clone(),
                keyrange_end: snapshot.state.keyrange_end.clone(),
                lookup_by_id: true,
                requester_id: self.ctx().server_id.clone(),
            })
            .await?;

        if response.txnseq < table.metadata_txnseq {
            return Err(Error::runtime(format!(
                "metadata of {key} did not converge: at {}, expected {}",
                response.txnseq, table.metadata_txnseq
            )));
        }

        let legacy = self.ctx().scheme.replicas_for(&key.partition_id);
        self.partition
            .get_writer()
            .apply_metadata_change(&response, &legacy)
    }

    async fn submit(
        &self,
        snapshot: &PartitionSnapshot,
        operation: MetadataOperation,
    ) -> Result<()> {
        let key = self.partition.key();
        let envelope = MetadataOperationEnvelope {
            namespace: key.namespace.clone(),
            table: key.table.clone(),
            input_txnid: snapshot.state.last_metadata_txnid,
            output_txnid: TransactionId::random(),
            operation,
        };
        match self.ctx().coordinator.perform_operation(envelope).await {
            Ok(result) => {
                info!("{key}: metadata transaction {} submitted", result.txnseq);
                Ok(())
            }
            // someone else got there first, the next sync brings the result
            Err(Error::ConcurrentModification(e)) => {
                debug!("{key}: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn finalize_joins(&self, snapshot: &PartitionSnapshot, state: &ReplicationState) -> Result<()> {
        let head = snapshot.state.lsm_sequence;
        let partition_id = self.partition.key().partition_id;
        for replica in self.replicas() {
            if !replica.is_joining || replica.is_local || replica.partition_id != partition_id {
                continue;
            }
            if state.offset(&replica.unique_id) < head {
                continue;
            }

            info!(
                "{}: {} caught up, finalizing join",
                self.partition.key(),
                replica.server_id
            );
            self.submit(
                snapshot,
                MetadataOperation::FinalizeJoin {
                    partition_id,
                    server_id: replica.server_id.clone(),
                    placement_id: replica.placement_id,
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Finalize a split once a majority of each new partition's targets hold
    /// every row of their keyrange.
    async fn finalize_split(&self, snapshot: &PartitionSnapshot, state: &ReplicationState) -> Result<()> {
        if !snapshot.state.is_splitting || snapshot.state.split_partition_ids.is_empty() {
            return Ok(());
        }

        let head = snapshot.state.lsm_sequence;
        let replicas = self.replicas();
        let children: BTreeSet<PartitionId> =
            snapshot.state.split_partition_ids.iter().copied().collect();

        for child in &children {
            let targets: Vec<&Replica> = replicas
                .iter()
                .filter(|r| &r.partition_id == child)
                .collect();
            let caught_up = targets
                .iter()
                .filter(|r| state.offset(&r.unique_id) >= head)
                .count();
            if targets.is_empty() || caught_up < targets.len() / 2 + 1 {
                debug!(
                    "{}: split target {child} has {caught_up}/{} copies",
                    self.partition.key(),
                    targets.len()
                );
                return Ok(());
            }
        }

        info!("{}: split targets caught up, finalizing split", self.partition.key());
        self.submit(
            snapshot,
            MetadataOperation::FinalizeSplit {
                partition_id: self.partition.key().partition_id,
            },
        )
        .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::metadata::LocalCoordinator;
    use crate::partition::test::{cluster, context_with, key, record, table};
    use crate::partition::{Config, Partition};
    use crate::replication::scheme::ReplicationScheme;
    use basalt_transport::{DiscoveryResponse, ReplicationTarget};
    use httptest::{
        cycle,
        matchers::request,
        responders::status_code,
        Expectation, Server,
    };
    use test_log::test;

    fn created() -> impl httptest::responders::Responder {
        status_code(201).body(r#"{"inserted":0}"#)
    }

    fn fixed_partition(
        root: &std::path::Path,
        replicas: &[String],
    ) -> anyhow::Result<Arc<Partition>> {
        let ctx = context_with(
            root,
            Config::default(),
            Arc::new(LocalCoordinator::new(cluster())),
            ReplicationScheme::fixed("local:1", replicas),
        );
        Ok(Partition::create(ctx, key(1), table(), None)?)
    }

    #[test(tokio::test)]
    async fn replicas_converge_after_failure() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let b = Server::run();
        let c = Server::run();
        b.expect(
            Expectation::matching(request::method_path("POST", "/tsdb/replicate"))
                .times(1)
                .respond_with(created()),
        );
        c.expect(
            Expectation::matching(request::method_path("POST", "/tsdb/replicate"))
                .times(2)
                .respond_with(cycle![status_code(503), created()]),
        );

        let replicas = vec![
            "local:1".to_string(),
            b.addr().to_string(),
            c.addr().to_string(),
        ];
        let partition = fixed_partition(root.path(), &replicas)?;
        let writer = partition.get_writer();
        writer.insert_records(&(0..10).map(|i| record(i, 1)).collect::<Vec<_>>())?;
        assert!(writer.commit()?);
        assert_eq!(partition.snapshot().state.lsm_sequence, 10);
        assert_eq!(partition.snapshot().state.lsm_tables.len(), 1);

        let replication = PartitionReplication::new(partition.clone());
        let targets = replication.replicas();
        assert_eq!(targets.iter().filter(|r| r.is_local).count(), 1);
        assert!(replication.needs_replication());

        assert!(!replication.replicate().await);
        let state = writer.fetch_replication_state();
        assert_eq!(state.offset(&targets[1].unique_id), 10);
        assert_eq!(state.offset(&targets[2].unique_id), 0);
        assert!(replication.needs_replication());
        assert_eq!(replication.num_full_remote_copies(), 1);

        assert!(replication.replicate().await);
        let state = writer.fetch_replication_state();
        assert_eq!(state.offset(&targets[2].unique_id), 10);
        assert!(!replication.needs_replication());
        assert_eq!(replication.num_full_remote_copies(), 2);
        Ok(())
    }

    #[test(tokio::test)]
    async fn batches_are_bounded() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let b = Server::run();
        b.expect(
            Expectation::matching(request::method_path("POST", "/tsdb/replicate"))
                .times(3)
                .respond_with(created()),
        );

        let partition =
            fixed_partition(root.path(), &["local:1".to_string(), b.addr().to_string()])?;
        let writer = partition.get_writer();
        writer.insert_records(&(0..10).map(|i| record(i, 1)).collect::<Vec<_>>())?;
        writer.commit()?;

        let replication = PartitionReplication::new(partition.clone()).with_batch_limits(4, usize::MAX);
        let target = replication.replicas().remove(1);
        let sent = replication
            .replicate_to(&partition.snapshot(), &target, 0)
            .await?;
        assert_eq!(sent, 10);
        Ok(())
    }

    #[test(tokio::test)]
    async fn only_rows_after_offset_are_sent() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let b = Server::run();
        b.expect(
            Expectation::matching(request::method_path("POST", "/tsdb/replicate"))
                .times(1)
                .respond_with(created()),
        );

        let partition =
            fixed_partition(root.path(), &["local:1".to_string(), b.addr().to_string()])?;
        let writer = partition.get_writer();
        writer.insert_records(&(0..6).map(|i| record(i, 1)).collect::<Vec<_>>())?;
        writer.commit()?;
        writer.insert_records(&(6..10).map(|i| record(i, 1)).collect::<Vec<_>>())?;
        writer.commit()?;

        let replication = PartitionReplication::new(partition.clone());
        let target = replication.replicas().remove(1);
        let sent = replication
            .replicate_to(&partition.snapshot(), &target, 6)
            .await?;
        assert_eq!(sent, 4);
        Ok(())
    }

    #[test(tokio::test)]
    async fn standalone_never_needs_replication() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let ctx = context_with(
            root.path(),
            Config::default(),
            Arc::new(LocalCoordinator::new(cluster())),
            ReplicationScheme::Standalone,
        );
        let partition = Partition::create(ctx, key(1), table(), None)?;
        partition.get_writer().insert_records(&[record(1, 1)])?;
        partition.get_writer().commit()?;

        let replication = PartitionReplication::new(partition);
        assert!(!replication.needs_replication());
        assert!(replication.replicate().await);
        assert!(!replication.should_drop());
        Ok(())
    }

    #[test(tokio::test)]
    async fn unloaded_partitions_drop_once_replicated() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let partition = fixed_partition(root.path(), &["local:1".to_string()])?;
        let writer = partition.get_writer();
        writer.insert_records(&[record(1, 1), record(2, 1)])?;
        writer.commit()?;

        writer.apply_metadata_change(
            &DiscoveryResponse {
                code: DiscoveryCode::Unload,
                txnseq: 1,
                replication_targets: vec![ReplicationTarget {
                    server_id: "b".to_string(),
                    placement_id: 7,
                    partition_id: partition.key().partition_id,
                    ..Default::default()
                }],
                ..Default::default()
            },
            &[],
        )?;

        let replication = PartitionReplication::new(partition.clone());
        assert!(replication.needs_replication());
        assert!(!replication.should_drop());

        let target = replication.replicas().remove(0);
        assert_eq!(target.unique_id, Token::hash("b~7"));
        let mut state = writer.fetch_replication_state();
        state.set_offset(target.unique_id, 2);
        writer.commit_replication_state(state)?;

        assert!(!replication.needs_replication());
        assert!(replication.should_drop());
        Ok(())
    }
}
