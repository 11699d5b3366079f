//! A `Partition` is one independently replicated shard of a table.
//!
//! It owns the chain of [`PartitionSnapshot`]s published through its
//! [`PartitionSnapshotRef`] and the writer for its storage kind. Partitions
//! are created from a discovery response, or reopened from the `_snapshot`
//! file in their directory, and live until they are dropped by the
//! [`PartitionMap`](crate::partition_map::PartitionMap).

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use basalt_transport::{hex_bytes, DiscoveryCode, DiscoveryResponse, PartitionId, StorageKind, TableDefinition};
use bytesize::ByteSize;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::compaction;
use crate::config_directory::ClusterView;
use crate::error::{Error, Result};
use crate::file_tracker::FileTracker;
use crate::index::IndexCache;
use crate::metadata::{MetadataCoordinator, ServerAllocator};
use crate::metrics::StorageMetrics;
use crate::reader::PartitionReader;
use crate::replication::scheme::ReplicationScheme;
use crate::snapshot::{PartitionKey, PartitionSnapshot, PartitionSnapshotRef};
use crate::state::PartitionState;
use crate::writer::{LsmPartitionWriter, PartitionWriter};

pub const TRASH_DIR: &str = "trash";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Commit the head arena synchronously once it holds this many rows.
    pub commit_max_rows: usize,
    /// Submit a split once the partition's segments exceed this size.
    pub split_threshold: ByteSize,
    pub compaction: compaction::Config,
    pub mmap_indexes: bool,
    /// How often buffered rows are committed and segments compacted in the
    /// background.
    #[serde(with = "humantime_serde")]
    pub commit_interval: Duration,
    pub compaction_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            commit_max_rows: 8192,
            split_threshold: ByteSize::mb(512),
            compaction: compaction::Config::default(),
            mmap_indexes: true,
            commit_interval: Duration::from_secs(1),
            compaction_workers: 2,
        }
    }
}

/// Published whenever a partition is created or its snapshot changes.
#[derive(Clone, Debug)]
pub struct PartitionChangeNotification {
    pub partition: Arc<Partition>,
    pub snapshot: Arc<PartitionSnapshot>,
}

type ChangeCallback = Arc<dyn Fn(&PartitionChangeNotification) + Send + Sync>;

/// Everything partitions of one process share.
pub struct PartitionContext {
    pub data_dir: PathBuf,
    pub server_id: String,
    pub config: Config,
    pub tracker: Arc<FileTracker>,
    pub index_cache: Arc<IndexCache>,
    pub metrics: StorageMetrics,
    pub coordinator: Arc<dyn MetadataCoordinator>,
    pub allocator: ServerAllocator,
    pub scheme: Arc<ReplicationScheme>,
    pub cluster: ClusterView,
    listeners: Mutex<Vec<ChangeCallback>>,
}

impl std::fmt::Debug for PartitionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionContext")
            .field("data_dir", &self.data_dir)
            .field("server_id", &self.server_id)
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

impl PartitionContext {
    pub fn new(
        data_dir: PathBuf,
        server_id: &str,
        config: Config,
        coordinator: Arc<dyn MetadataCoordinator>,
        scheme: Arc<ReplicationScheme>,
        cluster: ClusterView,
        metrics: StorageMetrics,
    ) -> Result<Self> {
        fs::create_dir_all(&data_dir)?;
        let tracker = Arc::new(FileTracker::new(data_dir.join(TRASH_DIR))?);
        Ok(Self {
            index_cache: Arc::new(IndexCache::new(config.mmap_indexes)),
            allocator: ServerAllocator::new(cluster.clone()),
            data_dir,
            server_id: server_id.to_string(),
            config,
            tracker,
            metrics,
            coordinator,
            scheme,
            cluster,
            listeners: Mutex::new(vec![]),
        })
    }

    pub fn subscribe(&self, f: impl Fn(&PartitionChangeNotification) + Send + Sync + 'static) {
        self.listeners.lock().push(Arc::new(f));
    }

    pub fn publish(&self, change: PartitionChangeNotification) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener(&change);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub namespace: String,
    pub table: String,
    pub partition_id: PartitionId,
    pub lifecycle_state: DiscoveryCode,
    #[serde(with = "hex_bytes")]
    pub keyrange_begin: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub keyrange_end: Vec<u8>,
    pub lsm_sequence: u64,
    pub lsm_tables: usize,
    pub disk_size: u64,
    pub is_splitting: bool,
    pub is_frozen: bool,
}

pub struct Partition {
    key: PartitionKey,
    head: Arc<PartitionSnapshotRef>,
    table: ArcSwap<TableDefinition>,
    writer: PartitionWriter,
    ctx: Arc<PartitionContext>,
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition").field("key", &self.key).finish()
    }
}

impl Partition {
    /// Create a new partition directory and its initial snapshot.
    pub fn create(
        ctx: Arc<PartitionContext>,
        key: PartitionKey,
        table: TableDefinition,
        discovery: Option<&DiscoveryResponse>,
    ) -> Result<Arc<Self>> {
        let mut state = PartitionState::new(&key.namespace, &key.table, key.partition_id);
        state.storage = table.storage;
        state.table_generation = table.generation;
        if let Some(d) = discovery {
            state.lifecycle_state = d.code;
            state.keyrange_begin = d.keyrange_begin.clone();
            state.keyrange_end = d.keyrange_end.clone();
            state.last_metadata_txnid = Some(d.txnid);
            state.last_metadata_txnseq = d.txnseq;
            state.replication_targets = d.replication_targets.clone();
            state.has_joining_servers = d.replication_targets.iter().any(|t| t.is_joining);
            state.is_splitting = d.is_splitting;
            state.split_partition_ids = d.split_partition_ids.clone();
        }

        let snapshot = PartitionSnapshot::new(key.clone(), state, &ctx.data_dir);
        fs::create_dir_all(&snapshot.base_path)?;
        snapshot.write_to_disk()?;
        debug!("created partition {key} in {:?}", snapshot.base_path);

        Self::open_snapshot(ctx, snapshot, table)
    }

    /// Reopen a partition from its `_snapshot` file.
    pub fn reopen(
        ctx: Arc<PartitionContext>,
        key: PartitionKey,
        table: TableDefinition,
    ) -> Result<Arc<Self>> {
        let base_path = ctx.data_dir.join(key.rel_path());
        let state = PartitionState::read_from(&base_path)?;

        for entry in fs::read_dir(&base_path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                trace!("removing leftover {path:?}");
                fs::remove_file(path)?;
            }
        }

        let snapshot = PartitionSnapshot::new(key, state, &ctx.data_dir);
        Self::open_snapshot(ctx, snapshot, table)
    }

    fn open_snapshot(
        ctx: Arc<PartitionContext>,
        snapshot: PartitionSnapshot,
        table: TableDefinition,
    ) -> Result<Arc<Self>> {
        match snapshot.state.storage {
            StorageKind::Lsm => {}
            other => return Err(Error::NotImplemented(format!("{other} storage"))),
        }

        let key = snapshot.key.clone();
        let head = Arc::new(PartitionSnapshotRef::new(snapshot, ctx.tracker.clone()));
        Ok(Arc::new_cyclic(|partition| Self {
            writer: PartitionWriter::Lsm(Arc::new(LsmPartitionWriter::new(
                partition.clone(),
                key.clone(),
                head.clone(),
                ctx.clone(),
            ))),
            key,
            head,
            table: ArcSwap::from_pointee(table),
            ctx,
        }))
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    pub fn context(&self) -> &Arc<PartitionContext> {
        &self.ctx
    }

    pub fn snapshot(&self) -> Arc<PartitionSnapshot> {
        self.head.get_snapshot()
    }

    pub fn get_writer(&self) -> PartitionWriter {
        self.writer.clone()
    }

    pub fn get_reader(&self) -> PartitionReader {
        PartitionReader::new(self.snapshot(), self.ctx.index_cache.clone())
    }

    pub fn table(&self) -> Arc<TableDefinition> {
        self.table.load_full()
    }

    pub fn set_table(&self, table: TableDefinition) {
        self.table.store(Arc::new(table));
    }

    /// True while the partition is being split, either flagged explicitly or
    /// implied by replication targets covering more than one keyrange.
    pub fn is_splitting(&self) -> bool {
        let snapshot = self.snapshot();
        let state = &snapshot.state;
        if state.is_splitting {
            return true;
        }
        let bounds: BTreeSet<&[u8]> = state
            .replication_targets
            .iter()
            .flat_map(|t| [t.keyrange_begin.as_slice(), t.keyrange_end.as_slice()])
            .collect();
        bounds.len() > 2
    }

    pub fn total_disk_size(&self) -> u64 {
        self.snapshot().total_disk_size()
    }

    /// Whether the table this partition belongs to was recreated since.
    pub fn is_generation_superseded(&self) -> bool {
        self.table().generation > self.snapshot().state.table_generation
    }

    pub fn info(&self) -> PartitionInfo {
        let snapshot = self.snapshot();
        PartitionInfo {
            namespace: self.key.namespace.clone(),
            table: self.key.table.clone(),
            partition_id: self.key.partition_id,
            lifecycle_state: snapshot.state.lifecycle_state,
            keyrange_begin: snapshot.state.keyrange_begin.clone(),
            keyrange_end: snapshot.state.keyrange_end.clone(),
            lsm_sequence: snapshot.state.lsm_sequence,
            lsm_tables: snapshot.state.lsm_tables.len(),
            disk_size: snapshot.total_disk_size(),
            is_splitting: self.is_splitting(),
            is_frozen: self.writer.is_frozen(),
        }
    }
}
