//! Writers of a partition, one per storage kind.
//!
//! The [`LsmPartitionWriter`] buffers records in the snapshot's head arena,
//! flushes the arena into a new segment on [`commit`](LsmPartitionWriter::commit),
//! merges segments on [`compact`](LsmPartitionWriter::compact) and asks the
//! metadata coordinator to split the partition once it grows too large.
//!
//! Locks are taken in the order commit, write. Compaction and split never
//! wait for each other: a second caller sees the operation as busy.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use basalt_transport::{
    DiscoveryCode, DiscoveryResponse, MetadataOperation, MetadataOperationEnvelope,
    PartitionId, Partitioner, RecordId, TransactionId,
};
use parking_lot::{Mutex, MutexGuard};
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

use crate::arena::PartitionArena;
use crate::compaction::{segment_filename, CompactionStrategy, SimpleCompactionStrategy};
use crate::error::{Error, Result};
use crate::partition::{Partition, PartitionChangeNotification, PartitionContext};
use crate::reader::PartitionReader;
use crate::record::RecordRef;
use crate::replication::scheme::ReplicaRef;
use crate::snapshot::{PartitionKey, PartitionSnapshot, PartitionSnapshotRef};
use crate::state::{LsmTableRef, ReplicationState};

/// Write capability of a partition, selected by its storage kind when the
/// partition is opened.
#[derive(Clone, Debug)]
pub enum PartitionWriter {
    Lsm(Arc<LsmPartitionWriter>),
}

impl PartitionWriter {
    pub fn insert_records(&self, records: &[RecordRef]) -> Result<HashSet<RecordId>> {
        match self {
            Self::Lsm(w) => w.insert_records(records),
        }
    }

    pub fn commit(&self) -> Result<bool> {
        match self {
            Self::Lsm(w) => w.commit(),
        }
    }

    pub fn compact(&self) -> Result<bool> {
        match self {
            Self::Lsm(w) => w.compact(),
        }
    }

    pub async fn split(&self) -> Result<()> {
        match self {
            Self::Lsm(w) => w.split().await,
        }
    }

    pub fn apply_metadata_change(
        &self,
        discovery: &DiscoveryResponse,
        legacy_replicas: &[ReplicaRef],
    ) -> Result<()> {
        match self {
            Self::Lsm(w) => w.apply_metadata_change(discovery, legacy_replicas),
        }
    }

    pub fn fetch_replication_state(&self) -> ReplicationState {
        match self {
            Self::Lsm(w) => w.fetch_replication_state(),
        }
    }

    pub fn commit_replication_state(&self, state: ReplicationState) -> Result<()> {
        match self {
            Self::Lsm(w) => w.commit_replication_state(state),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        match self {
            Self::Lsm(w) => w.lock(),
        }
    }

    pub fn freeze(&self) {
        match self {
            Self::Lsm(w) => w.freeze(),
        }
    }

    pub fn is_frozen(&self) -> bool {
        match self {
            Self::Lsm(w) => w.is_frozen(),
        }
    }
}

pub struct LsmPartitionWriter {
    partition: Weak<Partition>,
    key: PartitionKey,
    head: Arc<PartitionSnapshotRef>,
    ctx: Arc<PartitionContext>,
    strategy: Box<dyn CompactionStrategy>,
    write_lock: Mutex<()>,
    commit_lock: Mutex<()>,
    compaction_lock: Mutex<()>,
    split_lock: tokio::sync::Mutex<()>,
    frozen: AtomicBool,
}

impl std::fmt::Debug for LsmPartitionWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsmPartitionWriter")
            .field("key", &self.key)
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

impl LsmPartitionWriter {
    pub fn new(
        partition: Weak<Partition>,
        key: PartitionKey,
        head: Arc<PartitionSnapshotRef>,
        ctx: Arc<PartitionContext>,
    ) -> Self {
        let strategy = SimpleCompactionStrategy::new(
            ctx.data_dir.join(key.rel_path()),
            ctx.index_cache.clone(),
            ctx.config.compaction.clone(),
        );
        Self {
            partition,
            key,
            head,
            strategy: Box::new(strategy),
            ctx,
            write_lock: Mutex::new(()),
            commit_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
            split_lock: tokio::sync::Mutex::new(()),
            frozen: AtomicBool::new(false),
        }
    }

    /// Highest version known for each record, looking at the head arena,
    /// then the compacting arena, then the segments from newest to oldest.
    /// Ids never seen before are absent from the result.
    fn fetch_record_versions(
        &self,
        snapshot: &PartitionSnapshot,
        records: &[RecordRef],
    ) -> Result<HashMap<RecordId, u64>> {
        let mut versions = HashMap::with_capacity(records.len());
        let mut unresolved = HashMap::new();

        for record in records {
            let mut version = snapshot.head_arena.fetch_record_version(&record.id);
            if version == 0 {
                if let Some(arena) = &snapshot.compacting_arena {
                    version = arena.fetch_record_version(&record.id);
                }
            }
            if version > 0 {
                versions.insert(record.id, version);
            } else {
                unresolved.insert(record.id, 0);
            }
        }

        for table in snapshot.state.lsm_tables.iter().rev() {
            if unresolved.is_empty() {
                break;
            }
            let index = self.ctx.index_cache.lookup(snapshot.index_path(table))?;
            index.lookup(&mut unresolved);
            unresolved.retain(|id, version| {
                if *version > 0 {
                    versions.insert(*id, *version);
                    false
                } else {
                    true
                }
            });
        }

        Ok(versions)
    }

    /// Insert every record that is newer than the version already stored.
    /// Returns the ids that were inserted.
    pub fn insert_records(&self, records: &[RecordRef]) -> Result<HashSet<RecordId>> {
        let (inserted, snapshot) = {
            let _guard = self.write_lock.lock();
            if self.is_frozen() {
                return Err(Error::IllegalState(format!("partition {} is frozen", self.key)));
            }

            let snapshot = self.head.get_snapshot();
            let versions = self.fetch_record_versions(&snapshot, records)?;

            let mut inserted = HashSet::new();
            for record in records {
                if record.version <= versions.get(&record.id).copied().unwrap_or(0) {
                    continue;
                }
                if snapshot.head_arena.insert_record(record) {
                    inserted.insert(record.id);
                }
            }
            (inserted, snapshot)
        };

        self.ctx.metrics.records_inserted.increment(inserted.len() as u64);
        self.ctx
            .metrics
            .records_skipped
            .increment((records.len() - inserted.len()) as u64);
        trace!(
            "{}: inserted {} of {} records",
            self.key,
            inserted.len(),
            records.len()
        );

        if snapshot.head_arena.size() > self.ctx.config.commit_max_rows {
            self.commit()?;
        }
        if self
            .strategy
            .needs_urgent_compaction(&self.head.get_snapshot().state.lsm_tables)
        {
            self.compact()?;
        }

        Ok(inserted)
    }

    /// Flush the head arena into a new segment. Returns whether anything was
    /// written.
    pub fn commit(&self) -> Result<bool> {
        let _commit = self.commit_lock.lock();
        let start = Instant::now();

        let snapshot = {
            let _guard = self.write_lock.lock();
            let current = self.head.get_snapshot();
            // a compacting arena left over from a failed flush is retried first
            if current.compacting_arena.is_none() {
                if current.head_arena.is_empty() {
                    return Ok(false);
                }
                let mut next = (*current).clone();
                next.compacting_arena = Some(next.head_arena.clone());
                next.head_arena = Arc::new(PartitionArena::new());
                self.head.set_snapshot(next);
            }
            self.head.get_snapshot()
        };

        let Some(arena) = snapshot.compacting_arena.clone() else {
            return Ok(false);
        };

        let filename = segment_filename();
        let first_sequence = snapshot.state.lsm_sequence + 1;
        let written = arena.write_to_disk(&snapshot.table_base(&filename), first_sequence)?;
        let table = LsmTableRef {
            filename,
            first_sequence,
            last_sequence: first_sequence + written.records - 1,
            size_bytes: written.size_bytes,
            has_skiplist: true,
        };

        let published = {
            let _guard = self.write_lock.lock();
            let mut next = (*self.head.get_snapshot()).clone();
            next.state.lsm_tables.push(table.clone());
            next.state.lsm_sequence += written.records;
            next.compacting_arena = None;
            next.write_to_disk()?;
            self.head.set_snapshot(next);
            self.head.get_snapshot()
        };

        let elapsed = start.elapsed();
        self.ctx.metrics.commits.increment(1);
        self.ctx.metrics.commit_ms.record(elapsed.as_secs_f64() * 1000.0);
        debug!(
            "{}: committed {} records to {} (sequence {}..={}) in {elapsed:?}",
            self.key, written.records, table.filename, table.first_sequence, table.last_sequence
        );

        self.notify(published);
        if self.needs_split() {
            self.schedule_split();
        }
        Ok(true)
    }

    /// Merge segments if the compaction strategy asks for it. Returns
    /// immediately when another compaction is running.
    pub fn compact(&self) -> Result<bool> {
        let Some(_compaction) = self.compaction_lock.try_lock() else {
            trace!("{}: compaction already running", self.key);
            return Ok(false);
        };

        let committed = self.commit()?;
        let snapshot = self.head.get_snapshot();
        let input = snapshot.state.lsm_tables.clone();
        if !self.strategy.needs_compaction(&input) {
            return Ok(committed);
        }

        let mut output = vec![];
        if !self.strategy.compact(&input, &mut output)? {
            return Ok(committed);
        }

        let published = {
            let _guard = self.write_lock.lock();
            let current = self.head.get_snapshot();
            if !current.state.lsm_tables.starts_with(&input) {
                self.ctx.metrics.compaction_races.increment(1);
                self.ctx.tracker.delete_files(&snapshot.table_files(&output))?;
                return Err(Error::ConcurrentModification(format!(
                    "segments of {} changed during compaction",
                    self.key
                )));
            }

            let mut next = (*current).clone();
            next.state.lsm_tables = output
                .iter()
                .chain(current.state.lsm_tables[input.len()..].iter())
                .cloned()
                .collect();
            next.write_to_disk()?;
            self.head.set_snapshot(next);
            self.head.get_snapshot()
        };

        self.ctx.tracker.delete_files(&snapshot.table_files(&input))?;
        for table in &input {
            self.ctx.index_cache.flush(snapshot.index_path(table));
        }
        self.ctx.metrics.compactions.increment(1);
        info!(
            "{}: compacted {} segments into {}",
            self.key,
            input.len(),
            output.len()
        );

        self.notify(published);
        if self.needs_split() {
            self.schedule_split();
        }
        Ok(true)
    }

    pub fn needs_split(&self) -> bool {
        let Some(partition) = self.partition.upgrade() else {
            return false;
        };
        let snapshot = self.head.get_snapshot();
        partition.table().partitioner != Partitioner::Fixed
            && snapshot.state.lifecycle_state == DiscoveryCode::Serve
            && !partition.is_splitting()
            && snapshot.total_disk_size() > self.ctx.config.split_threshold.as_u64()
    }

    fn schedule_split(&self) {
        let Some(partition) = self.partition.upgrade() else {
            return;
        };
        let Ok(runtime) = Handle::try_current() else {
            debug!("{}: no runtime to split on", self.key);
            return;
        };

        runtime.spawn(async move {
            match partition.get_writer().split().await {
                Ok(()) | Err(Error::AlreadyRunning(_)) => {}
                Err(e) => warn!("{}: split failed: {e}", partition.key()),
            }
        });
    }

    /// Submit a split of this partition at its median key. The split takes
    /// effect locally once the resulting metadata transaction is applied.
    pub async fn split(&self) -> Result<()> {
        let Ok(_split) = self.split_lock.try_lock() else {
            return Err(Error::AlreadyRunning(format!("split of {}", self.key)));
        };

        let snapshot = self.head.get_snapshot();
        if snapshot.state.lifecycle_state != DiscoveryCode::Serve {
            return Err(Error::IllegalArgument(format!(
                "can't split {} in state {}",
                self.key, snapshot.state.lifecycle_state
            )));
        }

        let reader = PartitionReader::new(snapshot.clone(), self.ctx.index_cache.clone());
        let split_point = tokio::task::spawn_blocking(move || reader.find_median_key())
            .await
            .map_err(|e| Error::runtime(e.to_string()))??;

        let copies = self.ctx.allocator.replication_factor();
        let split_servers_low = self.ctx.allocator.allocate_servers(copies, &[])?;
        let split_servers_high = self.ctx.allocator.allocate_servers(copies, &[])?;

        info!(
            "{}: splitting at {} onto {split_servers_low:?} / {split_servers_high:?}",
            self.key,
            hex::encode(&split_point)
        );

        let envelope = MetadataOperationEnvelope {
            namespace: self.key.namespace.clone(),
            table: self.key.table.clone(),
            input_txnid: snapshot.state.last_metadata_txnid,
            output_txnid: TransactionId::random(),
            operation: MetadataOperation::SplitPartition {
                partition_id: self.key.partition_id,
                split_point,
                split_partition_id_low: PartitionId::random(),
                split_partition_id_high: PartitionId::random(),
                split_servers_low,
                split_servers_high,
                finalize_immediately: false,
            },
        };

        let result = self.ctx.coordinator.perform_operation(envelope).await?;
        self.ctx.metrics.splits_submitted.increment(1);
        info!(
            "{}: split submitted as metadata transaction {} ({})",
            self.key, result.txnseq, result.txnid
        );
        Ok(())
    }

    /// Apply a newer placement of this partition. Targets without a legacy
    /// token inherit the identity of the scheme replica on the same server,
    /// so offsets recorded before the placement existed stay valid.
    pub fn apply_metadata_change(
        &self,
        discovery: &DiscoveryResponse,
        legacy_replicas: &[ReplicaRef],
    ) -> Result<()> {
        let published = {
            let _guard = self.write_lock.lock();
            let current = self.head.get_snapshot();
            if discovery.txnseq <= current.state.last_metadata_txnseq {
                return Err(Error::ConcurrentModification(format!(
                    "{}: metadata transaction {} is not newer than {}",
                    self.key, discovery.txnseq, current.state.last_metadata_txnseq
                )));
            }

            let mut next = (*current).clone();
            let state = &mut next.state;
            state.lifecycle_state = discovery.code;
            state.keyrange_begin = discovery.keyrange_begin.clone();
            state.keyrange_end = discovery.keyrange_end.clone();
            state.last_metadata_txnid = Some(discovery.txnid);
            state.last_metadata_txnseq = discovery.txnseq;
            state.is_splitting = discovery.is_splitting;
            state.split_partition_ids = discovery.split_partition_ids.clone();
            state.replication_targets = discovery
                .replication_targets
                .iter()
                .cloned()
                .map(|mut target| {
                    if target.legacy_token.is_none() && target.partition_id == self.key.partition_id {
                        target.legacy_token = legacy_replicas
                            .iter()
                            .find(|r| r.name == target.server_id)
                            .map(|r| r.unique_id);
                    }
                    target
                })
                .collect();
            state.has_joining_servers = state.replication_targets.iter().any(|t| t.is_joining);

            next.write_to_disk()?;
            self.head.set_snapshot(next);
            self.head.get_snapshot()
        };

        info!(
            "{}: applied metadata transaction {} ({}), now {}",
            self.key, discovery.txnseq, discovery.txnid, discovery.code
        );
        self.notify(published);
        Ok(())
    }

    pub fn fetch_replication_state(&self) -> ReplicationState {
        self.head.get_snapshot().state.replication_state()
    }

    pub fn commit_replication_state(&self, state: ReplicationState) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut next = (*self.head.get_snapshot()).clone();
        next.state.replication_state = state;
        next.write_to_disk()?;
        self.head.set_snapshot(next);
        Ok(())
    }

    /// Exclusive access against inserts and metadata changes.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock()
    }

    /// Refuse every further insert. Callers hold [`lock`](Self::lock).
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    fn notify(&self, snapshot: Arc<PartitionSnapshot>) {
        if let Some(partition) = self.partition.upgrade() {
            self.ctx.publish(PartitionChangeNotification {
                partition,
                snapshot,
            });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::metadata::{LocalCoordinator, MetadataCoordinator};
    use crate::partition::test::{cluster, context, context_with, key, partition, record, table};
    use crate::partition::Config;
    use crate::replication::scheme::ReplicationScheme;
    use crate::compaction;
    use async_trait::async_trait;
    use basalt_transport::{DiscoveryRequest, MetadataOperationResult, ReplicationTarget, Token};
    use bytesize::ByteSize;
    use std::sync::atomic::AtomicUsize;
    use test_log::test;
    use tokio::sync::Notify;

    fn lsm(partition: &Partition) -> Arc<LsmPartitionWriter> {
        let PartitionWriter::Lsm(writer) = partition.get_writer();
        writer
    }

    #[test]
    fn inserts_keep_newest_version() -> anyhow::Result<()> {
        let (_root, partition) = partition(Config::default())?;
        let writer = partition.get_writer();

        assert_eq!(writer.insert_records(&[record(1, 2)])?.len(), 1);
        assert!(writer.insert_records(&[record(1, 1)])?.is_empty());
        assert!(writer.insert_records(&[record(1, 2)])?.is_empty());
        writer.commit()?;

        // older versions are rejected against segments too
        assert!(writer.insert_records(&[record(1, 1)])?.is_empty());
        assert_eq!(writer.insert_records(&[record(1, 3), record(2, 1)])?.len(), 2);

        let reader = partition.get_reader();
        let versions: Vec<u64> = reader
            .snapshot()
            .head_arena
            .live_records()
            .iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(versions, vec![3, 1]);
        Ok(())
    }

    #[test]
    fn commit_advances_sequence() -> anyhow::Result<()> {
        let (_root, partition) = partition(Config::default())?;
        let writer = partition.get_writer();

        assert!(!writer.commit()?);

        writer.insert_records(&(0..10).map(|i| record(i, 1)).collect::<Vec<_>>())?;
        assert!(writer.commit()?);
        let snapshot = partition.snapshot();
        assert_eq!(snapshot.state.lsm_sequence, 10);
        assert_eq!(snapshot.state.lsm_tables.len(), 1);
        assert_eq!(snapshot.state.lsm_tables[0].first_sequence, 1);
        assert_eq!(snapshot.state.lsm_tables[0].last_sequence, 10);
        assert!(snapshot.compacting_arena.is_none());
        assert!(snapshot.segment_path(&snapshot.state.lsm_tables[0]).exists());

        let mut last = snapshot.state.lsm_sequence;
        for round in 0..3 {
            writer.insert_records(&[record(100 + round, 1), record(200 + round, 1)])?;
            assert!(writer.commit()?);
            let sequence = partition.snapshot().state.lsm_sequence;
            assert!(sequence > last);
            last = sequence;
        }
        assert_eq!(last, 16);
        Ok(())
    }

    #[test]
    fn large_inserts_commit_synchronously() -> anyhow::Result<()> {
        let (_root, partition) = partition(Config {
            commit_max_rows: 4,
            ..Default::default()
        })?;
        partition
            .get_writer()
            .insert_records(&(0..5).map(|i| record(i, 1)).collect::<Vec<_>>())?;
        assert_eq!(partition.snapshot().state.lsm_sequence, 5);
        assert!(partition.snapshot().head_arena.is_empty());
        Ok(())
    }

    #[test]
    fn compaction_keeps_records_and_sequence() -> anyhow::Result<()> {
        let (_root, partition) = partition(Config {
            compaction: compaction::Config {
                soft_limit: 3,
                hard_limit: 100,
            },
            ..Default::default()
        })?;
        let writer = partition.get_writer();

        for round in 0..3u64 {
            writer.insert_records(&[record(1, round + 1), record(10 + round, 1)])?;
            writer.commit()?;
        }
        let before = partition.get_reader().list_records()?;
        let old = partition.snapshot();
        assert_eq!(old.state.lsm_tables.len(), 3);

        assert!(writer.compact()?);
        let after = partition.snapshot();
        assert_eq!(after.state.lsm_tables.len(), 1);
        assert_eq!(after.state.lsm_sequence, old.state.lsm_sequence);
        assert_eq!(partition.get_reader().list_records()?, before);

        // old segments are trashed but stay readable while referenced
        let tracker = &partition.context().tracker;
        let first = old.table_files(&old.state.lsm_tables[..1]);
        assert!(tracker.is_referenced(&first[0]));
        assert!(old.segment_path(&old.state.lsm_tables[0]).exists());
        drop(old);
        assert!(!tracker.is_referenced(&first[0]));
        Ok(())
    }

    #[test]
    fn frozen_writers_refuse_inserts() -> anyhow::Result<()> {
        let (_root, partition) = partition(Config::default())?;
        let writer = partition.get_writer();
        {
            let _guard = writer.lock();
            writer.freeze();
        }
        assert!(matches!(
            writer.insert_records(&[record(1, 1)]),
            Err(Error::IllegalState(_))
        ));
        Ok(())
    }

    #[test]
    fn metadata_changes_must_be_newer() -> anyhow::Result<()> {
        let (_root, partition) = partition(Config::default())?;
        let writer = partition.get_writer();
        let legacy = vec![ReplicaRef {
            unique_id: Token([7; 20]),
            addr: "b:9175".to_string(),
            name: "b".to_string(),
            is_local: false,
        }];

        let discovery = DiscoveryResponse {
            code: DiscoveryCode::Serve,
            txnid: TransactionId::random(),
            txnseq: 2,
            replication_targets: vec![ReplicationTarget {
                server_id: "b".to_string(),
                partition_id: partition.key().partition_id,
                ..Default::default()
            }],
            ..Default::default()
        };
        writer.apply_metadata_change(&discovery, &legacy)?;
        let state = &partition.snapshot().state;
        assert_eq!(state.last_metadata_txnseq, 2);
        assert_eq!(state.replication_targets[0].legacy_token, Some(Token([7; 20])));

        assert!(matches!(
            writer.apply_metadata_change(&discovery, &legacy),
            Err(Error::ConcurrentModification(_))
        ));
        Ok(())
    }

    #[test(tokio::test)]
    async fn split_requires_serve() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let ctx = context(root.path(), Config::default());
        let discovery = DiscoveryResponse {
            code: DiscoveryCode::Load,
            txnseq: 1,
            ..Default::default()
        };
        let partition = Partition::create(ctx, key(1), table(), Some(&discovery))?;
        assert!(matches!(
            partition.get_writer().split().await,
            Err(Error::IllegalArgument(_))
        ));
        Ok(())
    }

    #[test(tokio::test)]
    async fn split_needs_two_keys() -> anyhow::Result<()> {
        let (_root, partition) = partition(Config::default())?;
        let writer = partition.get_writer();
        writer.insert_records(&[record(1, 1)])?;
        writer.commit()?;
        assert!(matches!(writer.split().await, Err(Error::Runtime(_))));
        Ok(())
    }

    /// Holds every metadata operation until released.
    #[derive(Debug)]
    struct BlockingCoordinator {
        inner: LocalCoordinator,
        entered: Notify,
        release: Notify,
        operations: AtomicUsize,
    }

    #[async_trait]
    impl MetadataCoordinator for BlockingCoordinator {
        async fn discover(&self, request: DiscoveryRequest) -> Result<DiscoveryResponse> {
            self.inner.discover(request).await
        }

        async fn perform_operation(
            &self,
            envelope: MetadataOperationEnvelope,
        ) -> Result<MetadataOperationResult> {
            self.operations.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.perform_operation(envelope).await
        }
    }

    #[test(tokio::test)]
    async fn concurrent_split_is_already_running() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let coordinator = Arc::new(BlockingCoordinator {
            inner: LocalCoordinator::new(cluster()),
            entered: Notify::new(),
            release: Notify::new(),
            operations: AtomicUsize::new(0),
        });
        let ctx = context_with(
            root.path(),
            Config::default(),
            coordinator.clone(),
            ReplicationScheme::Standalone,
        );

        let discovery = coordinator
            .discover(DiscoveryRequest {
                namespace: "acme".to_string(),
                table: "events".to_string(),
                partition_id: key(1).partition_id,
                lookup_by_id: true,
                requester_id: "local".to_string(),
                ..Default::default()
            })
            .await?;
        assert_eq!(discovery.code, DiscoveryCode::Serve);

        let partition = Partition::create(ctx, key(1), table(), Some(&discovery))?;
        let writer = lsm(&partition);
        writer.insert_records(&(0..10).map(|i| record(i, 1)).collect::<Vec<_>>())?;
        writer.commit()?;

        let first = tokio::spawn({
            let writer = writer.clone();
            async move { writer.split().await }
        });
        coordinator.entered.notified().await;

        assert!(matches!(writer.split().await, Err(Error::AlreadyRunning(_))));

        coordinator.release.notify_one();
        first.await??;
        assert_eq!(coordinator.operations.load(Ordering::SeqCst), 1);

        // the split is only visible once the new placement is applied
        assert!(!partition.is_splitting());
        let placement = coordinator
            .discover(DiscoveryRequest {
                namespace: "acme".to_string(),
                table: "events".to_string(),
                partition_id: key(1).partition_id,
                lookup_by_id: true,
                requester_id: "local".to_string(),
                ..Default::default()
            })
            .await?;
        assert!(placement.is_splitting);
        writer.apply_metadata_change(&placement, &[])?;
        assert!(partition.is_splitting());
        assert!(!writer.needs_split());
        Ok(())
    }

    #[test]
    fn split_threshold() -> anyhow::Result<()> {
        let (_root, partition) = partition(Config {
            split_threshold: ByteSize::b(1),
            ..Default::default()
        })?;
        let writer = lsm(&partition);
        assert!(!writer.needs_split());
        writer.insert_records(&[record(1, 1), record(2, 1)])?;
        // no runtime: the split is not scheduled, only detected
        writer.commit()?;
        assert!(writer.needs_split());
        Ok(())
    }
}
