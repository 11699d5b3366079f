//! Read access to one consistent snapshot of a partition.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use basalt_transport::RecordId;

use crate::arena::PartitionArena;
use crate::error::{Error, Result};
use crate::index::IndexCache;
use crate::segment::{Segment, SegmentRecord};
use crate::snapshot::PartitionSnapshot;
use crate::state::LsmTableRef;

/// Half-open `[begin, end)` key interval. An empty bound is unbounded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyRange {
    pub begin: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    pub fn new(begin: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            begin: begin.into(),
            end: end.into(),
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.begin.as_slice() && (self.end.is_empty() || key < self.end.as_slice())
    }
}

pub struct PartitionReader {
    snapshot: Arc<PartitionSnapshot>,
    index_cache: Arc<IndexCache>,
}

impl PartitionReader {
    pub fn new(snapshot: Arc<PartitionSnapshot>, index_cache: Arc<IndexCache>) -> Self {
        Self {
            snapshot,
            index_cache,
        }
    }

    pub fn snapshot(&self) -> &PartitionSnapshot {
        &self.snapshot
    }

    fn segment(&self, table: &LsmTableRef) -> Segment {
        Segment::at(self.snapshot.segment_path(table))
    }

    /// Newest version of every record in the partition, arenas included.
    fn versions(&self) -> Result<HashMap<RecordId, u64>> {
        let mut versions = HashMap::new();
        for table in &self.snapshot.state.lsm_tables {
            let index = self.index_cache.lookup(self.snapshot.index_path(table))?;
            for (id, version) in index.iter() {
                let v = versions.entry(id).or_insert(version);
                *v = (*v).max(version);
            }
        }
        for arena in self.arenas() {
            for record in arena.live_records() {
                let v = versions.entry(record.id).or_insert(record.version);
                *v = (*v).max(record.version);
            }
        }
        Ok(versions)
    }

    fn arenas(&self) -> impl Iterator<Item = &PartitionArena> {
        self.snapshot
            .compacting_arena
            .iter()
            .map(|a| a.as_ref())
            .chain(std::iter::once(self.snapshot.head_arena.as_ref()))
    }

    /// Ids of all records visible in this snapshot.
    pub fn list_records(&self) -> Result<BTreeSet<RecordId>> {
        Ok(self.versions()?.into_keys().collect())
    }

    /// Committed tables holding rows after `after_sequence`, oldest first.
    pub fn tables_after(&self, after_sequence: u64) -> Vec<LsmTableRef> {
        self.snapshot
            .state
            .lsm_tables
            .iter()
            .filter(|t| t.last_sequence > after_sequence)
            .cloned()
            .collect()
    }

    /// Visit the non-skipped rows of `table` with a sequence above
    /// `after_sequence` and a key inside `keyrange`.
    pub fn fetch_table_records(
        &self,
        table: &LsmTableRef,
        after_sequence: u64,
        keyrange: &KeyRange,
        mut visitor: impl FnMut(SegmentRecord) -> Result<()>,
    ) -> Result<()> {
        for batch in self.segment(table).iter()? {
            for row in batch? {
                if row.skip || row.sequence <= after_sequence || !keyrange.contains(&row.key) {
                    continue;
                }
                visitor(row)?;
            }
        }
        Ok(())
    }

    /// Visit every committed row after `after_sequence` in sequence order.
    pub fn fetch_records(
        &self,
        after_sequence: u64,
        keyrange: &KeyRange,
        mut visitor: impl FnMut(SegmentRecord) -> Result<()>,
    ) -> Result<()> {
        for table in self.tables_after(after_sequence) {
            self.fetch_table_records(&table, after_sequence, keyrange, &mut visitor)?;
        }
        Ok(())
    }

    /// A key splitting the live records into two non-empty halves, as close
    /// to the median as possible.
    pub fn find_median_key(&self) -> Result<Vec<u8>> {
        let versions = self.versions()?;
        let mut keys: Vec<Vec<u8>> = Vec::with_capacity(versions.len());

        for table in &self.snapshot.state.lsm_tables {
            self.fetch_table_records(table, 0, &KeyRange::default(), |row| {
                if versions.get(&row.id) == Some(&row.version) {
                    keys.push(row.key.to_vec());
                }
                Ok(())
            })?;
        }
        for arena in self.arenas() {
            keys.extend(
                arena
                    .live_records()
                    .into_iter()
                    .filter(|r| versions.get(&r.id) == Some(&r.version))
                    .map(|r| r.key.to_vec()),
            );
        }

        keys.sort();
        keys.dedup();
        match keys.len() {
            0 | 1 => Err(Error::runtime("no suitable split point found")),
            n => Ok(keys[n / 2].clone()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::file_tracker::FileTracker;
    use crate::record::RecordRef;
    use crate::snapshot::{PartitionKey, PartitionSnapshotRef};
    use crate::state::PartitionState;
    use basalt_transport::PartitionId;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn record(id: u8, version: u64, key: &str) -> RecordRef {
        RecordRef {
            id: RecordId([id; 20]),
            version,
            key: Bytes::from(key.to_string()),
            data: Bytes::from_static(b"x"),
            is_update: false,
        }
    }

    #[test]
    fn keyrange() {
        let all = KeyRange::default();
        assert!(all.contains(b""));
        assert!(all.contains(b"zzz"));

        let r = KeyRange::new(b"b".to_vec(), b"d".to_vec());
        assert!(!r.contains(b"a"));
        assert!(r.contains(b"b"));
        assert!(r.contains(b"cz"));
        assert!(!r.contains(b"d"));
    }

    #[test]
    fn reads_tables_and_arenas() -> anyhow::Result<()> {
        let root = tempdir()?;
        let tracker = Arc::new(FileTracker::new(root.path().join("trash"))?);
        let key = PartitionKey::new("ns", "t", PartitionId([1; 20]));
        let mut snap = PartitionSnapshot::new(
            key.clone(),
            PartitionState::new("ns", "t", key.partition_id),
            root.path(),
        );
        std::fs::create_dir_all(&snap.base_path)?;

        let arena = PartitionArena::new();
        arena.insert_record(&record(1, 1, "a"));
        arena.insert_record(&record(2, 1, "b"));
        arena.insert_record(&record(3, 1, "c"));
        let written = arena.write_to_disk(&snap.table_base("t0"), 1)?;
        snap.state.lsm_tables.push(LsmTableRef {
            filename: "t0".to_string(),
            first_sequence: 1,
            last_sequence: written.records,
            size_bytes: written.size_bytes,
            has_skiplist: true,
        });
        snap.state.lsm_sequence = written.records;
        snap.head_arena.insert_record(&record(4, 1, "d"));

        let sref = PartitionSnapshotRef::new(snap, tracker);
        let reader = PartitionReader::new(sref.get_snapshot(), Arc::new(IndexCache::new(false)));

        assert_eq!(reader.list_records()?.len(), 4);

        let mut seen = vec![];
        reader.fetch_records(1, &KeyRange::default(), |r| {
            seen.push(r.sequence);
            Ok(())
        })?;
        assert_eq!(seen, vec![2, 3]);

        let mut keys = vec![];
        reader.fetch_records(0, &KeyRange::new(b"b".to_vec(), vec![]), |r| {
            keys.push(r.key);
            Ok(())
        })?;
        assert_eq!(keys, vec![Bytes::from("b"), Bytes::from("c")]);
        assert!(reader.tables_after(3).is_empty());

        assert_eq!(reader.find_median_key()?, b"c".to_vec());
        Ok(())
    }

    #[test]
    fn single_key_cannot_be_split() -> anyhow::Result<()> {
        let root = tempdir()?;
        let tracker = Arc::new(FileTracker::new(root.path().join("trash"))?);
        let key = PartitionKey::new("ns", "t", PartitionId([1; 20]));
        let snap = PartitionSnapshot::new(
            key.clone(),
            PartitionState::new("ns", "t", key.partition_id),
            root.path(),
        );
        snap.head_arena.insert_record(&record(1, 1, "same"));
        snap.head_arena.insert_record(&record(2, 1, "same"));

        let sref = PartitionSnapshotRef::new(snap, tracker);
        let reader = PartitionReader::new(sref.get_snapshot(), Arc::new(IndexCache::new(false)));
        assert!(matches!(reader.find_median_key(), Err(Error::Runtime(_))));
        Ok(())
    }

    #[test]
    fn superseded_keys_do_not_move_the_median() -> anyhow::Result<()> {
        let root = tempdir()?;
        let tracker = Arc::new(FileTracker::new(root.path().join("trash"))?);
        let key = PartitionKey::new("ns", "t", PartitionId([1; 20]));
        let mut snap = PartitionSnapshot::new(
            key.clone(),
            PartitionState::new("ns", "t", key.partition_id),
            root.path(),
        );

        let compacting = PartitionArena::new();
        for (id, k) in [(1, "a"), (2, "b"), (3, "c"), (4, "d")] {
            compacting.insert_record(&record(id, 1, k));
        }
        snap.compacting_arena = Some(Arc::new(compacting));
        for (id, k) in [(1, "x"), (2, "y"), (3, "z")] {
            snap.head_arena.insert_record(&record(id, 2, k));
        }

        let sref = PartitionSnapshotRef::new(snap, tracker);
        let reader = PartitionReader::new(sref.get_snapshot(), Arc::new(IndexCache::new(false)));
        assert_eq!(reader.list_records()?.len(), 4);
        // live keys are d, x, y, z
        assert_eq!(reader.find_median_key()?, b"y".to_vec());
        Ok(())
    }
}
