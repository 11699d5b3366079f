//! Immutable views of a partition.
//!
//! Every mutation clones the current [`PartitionSnapshot`], changes the clone
//! and publishes it through the partition's [`PartitionSnapshotRef`]. Readers
//! load the current snapshot once and work against it without further
//! locking; the files it names stay on disk for as long as it is alive.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use basalt_transport::PartitionId;

use crate::arena::PartitionArena;
use crate::error::Result;
use crate::file_tracker::{FileRefs, FileTracker};
use crate::segment::{INDEX_EXTENSION, SEGMENT_EXTENSION};
use crate::state::{LsmTableRef, PartitionState};

/// Addresses one partition of one table.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub namespace: String,
    pub table: String,
    pub partition_id: PartitionId,
}

impl PartitionKey {
    pub fn new(namespace: &str, table: &str, partition_id: PartitionId) -> Self {
        Self {
            namespace: namespace.to_string(),
            table: table.to_string(),
            partition_id,
        }
    }

    /// Directory of the partition, relative to the data directory.
    pub fn rel_path(&self) -> PathBuf {
        PathBuf::from(&self.namespace)
            .join(&self.table)
            .join(self.partition_id.to_string())
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.table, self.partition_id)
    }
}

#[derive(Debug)]
pub struct PartitionSnapshot {
    pub key: PartitionKey,
    pub state: PartitionState,
    /// Absolute partition directory.
    pub base_path: PathBuf,
    /// Partition directory relative to the data directory.
    pub rel_path: PathBuf,
    pub head_arena: Arc<PartitionArena>,
    pub compacting_arena: Option<Arc<PartitionArena>>,
    refs: Option<FileRefs>,
}

impl Clone for PartitionSnapshot {
    /// Shallow copy sharing the arenas. File references are taken again when
    /// the copy is published.
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            state: self.state.clone(),
            base_path: self.base_path.clone(),
            rel_path: self.rel_path.clone(),
            head_arena: self.head_arena.clone(),
            compacting_arena: self.compacting_arena.clone(),
            refs: None,
        }
    }
}

impl PartitionSnapshot {
    pub fn new(key: PartitionKey, state: PartitionState, data_dir: &Path) -> Self {
        let rel_path = key.rel_path();
        Self {
            key,
            state,
            base_path: data_dir.join(&rel_path),
            rel_path,
            head_arena: Arc::new(PartitionArena::new()),
            compacting_arena: None,
            refs: None,
        }
    }

    /// Absolute path of a segment without extension.
    pub fn table_base(&self, filename: &str) -> PathBuf {
        self.base_path.join(filename)
    }

    pub fn segment_path(&self, table: &LsmTableRef) -> PathBuf {
        self.table_base(&table.filename)
            .with_extension(SEGMENT_EXTENSION)
    }

    pub fn index_path(&self, table: &LsmTableRef) -> PathBuf {
        self.table_base(&table.filename).with_extension(INDEX_EXTENSION)
    }

    /// Data-dir relative names of both files of each table.
    pub fn table_files<'a>(
        &self,
        tables: impl IntoIterator<Item = &'a LsmTableRef>,
    ) -> Vec<PathBuf> {
        tables
            .into_iter()
            .flat_map(|t| {
                let base = self.rel_path.join(&t.filename);
                [
                    base.with_extension(SEGMENT_EXTENSION),
                    base.with_extension(INDEX_EXTENSION),
                ]
            })
            .collect()
    }

    pub fn files(&self) -> Vec<PathBuf> {
        self.table_files(&self.state.lsm_tables)
    }

    pub fn write_to_disk(&self) -> Result<()> {
        self.state.write_to(&self.base_path)
    }

    pub fn total_disk_size(&self) -> u64 {
        self.state.lsm_tables.iter().map(|t| t.size_bytes).sum()
    }

    pub fn arenas_empty(&self) -> bool {
        self.head_arena.is_empty()
            && self
                .compacting_arena
                .as_ref()
                .map(|a| a.is_empty())
                .unwrap_or(true)
    }
}

/// Atomically swappable handle on the current snapshot of a partition.
#[derive(Debug)]
pub struct PartitionSnapshotRef {
    head: ArcSwap<PartitionSnapshot>,
    tracker: Arc<FileTracker>,
}

impl PartitionSnapshotRef {
    pub fn new(snapshot: PartitionSnapshot, tracker: Arc<FileTracker>) -> Self {
        let snapshot = Self::track(snapshot, &tracker);
        Self {
            head: ArcSwap::from_pointee(snapshot),
            tracker,
        }
    }

    fn track(mut snapshot: PartitionSnapshot, tracker: &Arc<FileTracker>) -> PartitionSnapshot {
        snapshot.refs = Some(FileRefs::new(tracker.clone(), snapshot.files()));
        snapshot
    }

    pub fn get_snapshot(&self) -> Arc<PartitionSnapshot> {
        self.head.load_full()
    }

    pub fn set_snapshot(&self, snapshot: PartitionSnapshot) {
        let snapshot = Self::track(snapshot, &self.tracker);
        self.head.store(Arc::new(snapshot));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    fn table(name: &str) -> LsmTableRef {
        LsmTableRef {
            filename: name.to_string(),
            first_sequence: 1,
            last_sequence: 1,
            size_bytes: 10,
            has_skiplist: true,
        }
    }

    #[test]
    fn readers_keep_files_alive() -> anyhow::Result<()> {
        let root = tempdir()?;
        let tracker = Arc::new(FileTracker::new(root.path().join("trash"))?);
        let key = PartitionKey::new("ns", "t", PartitionId([1; 20]));
        let mut state = PartitionState::new("ns", "t", key.partition_id);
        state.lsm_tables.push(table("a"));

        let sref = PartitionSnapshotRef::new(
            PartitionSnapshot::new(key.clone(), state, root.path()),
            tracker.clone(),
        );
        let a_file = key.rel_path().join("a.cst");
        assert!(tracker.is_referenced(&a_file));

        let reader = sref.get_snapshot();
        let mut next = (*reader).clone();
        next.state.lsm_tables = vec![table("b")];
        sref.set_snapshot(next);

        assert!(tracker.is_referenced(&a_file));
        assert!(tracker.is_referenced(key.rel_path().join("b.idx")));

        drop(reader);
        assert!(!tracker.is_referenced(&a_file));
        assert_eq!(sref.get_snapshot().state.lsm_tables, vec![table("b")]);
        Ok(())
    }

    #[test]
    fn clones_share_arenas() {
        let key = PartitionKey::new("ns", "t", PartitionId([2; 20]));
        let snap = PartitionSnapshot::new(
            key.clone(),
            PartitionState::new("ns", "t", key.partition_id),
            Path::new("/data"),
        );
        let copy = snap.clone();
        assert!(Arc::ptr_eq(&snap.head_arena, &copy.head_arena));
        assert_eq!(
            copy.base_path,
            Path::new("/data/ns/t").join(key.partition_id.to_string())
        );
        assert!(snap.arenas_empty());
    }
}
