use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use basalt_transport::RecordId;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::index::{IndexCache, LsmTableIndex};
use crate::segment::{Segment, SegmentRecord, INDEX_EXTENSION, SEGMENT_EXTENSION};
use crate::state::LsmTableRef;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub soft_limit: usize,
    pub hard_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            soft_limit: 3,
            hard_limit: 8,
        }
    }
}

/// Decides when and how the segments of a partition are merged.
pub trait CompactionStrategy: Send + Sync + std::fmt::Debug {
    fn needs_compaction(&self, tables: &[LsmTableRef]) -> bool;

    /// Writers stop accepting records while this holds.
    fn needs_urgent_compaction(&self, tables: &[LsmTableRef]) -> bool;

    /// Merge `input` into `output`. Returns false if there was nothing worth
    /// merging, in which case `output` is untouched.
    fn compact(&self, input: &[LsmTableRef], output: &mut Vec<LsmTableRef>) -> Result<bool>;
}

pub fn segment_filename() -> String {
    hex::encode(rand::random::<u64>().to_be_bytes())
}

/// Merges every segment into one once their count reaches the soft limit.
#[derive(Debug)]
pub struct SimpleCompactionStrategy {
    base_path: PathBuf,
    index_cache: Arc<IndexCache>,
    config: Config,
}

impl SimpleCompactionStrategy {
    pub fn new(base_path: PathBuf, index_cache: Arc<IndexCache>, config: Config) -> Self {
        Self {
            base_path,
            index_cache,
            config,
        }
    }

    fn base(&self, table: &LsmTableRef) -> PathBuf {
        self.base_path.join(&table.filename)
    }
}

impl CompactionStrategy for SimpleCompactionStrategy {
    fn needs_compaction(&self, tables: &[LsmTableRef]) -> bool {
        tables.len() >= self.config.soft_limit.max(2)
    }

    fn needs_urgent_compaction(&self, tables: &[LsmTableRef]) -> bool {
        tables.len() >= self.config.hard_limit
    }

    /// Merge the whole of `input` into one table. The writer hands over
    /// every table older than the head, so the full list is the oldest
    /// contiguous run.
    fn compact(&self, input: &[LsmTableRef], output: &mut Vec<LsmTableRef>) -> Result<bool> {
        let (Some(first), Some(last)) = (input.first(), input.last()) else {
            return Ok(false);
        };
        if input.len() < 2 {
            return Ok(false);
        }

        // newest version of each id, later tables take precedence
        let mut versions = BTreeMap::<RecordId, u64>::new();
        for table in input.iter().rev() {
            let index = self
                .index_cache
                .lookup(self.base(table).with_extension(INDEX_EXTENSION))?;
            for (id, version) in index.iter() {
                versions.entry(id).or_insert(version);
            }
        }

        let mut written = HashSet::with_capacity(versions.len());
        let mut rows: Vec<SegmentRecord> = vec![];
        for table in input {
            let segment = Segment::at(self.base(table).with_extension(SEGMENT_EXTENSION));
            for batch in segment.iter()? {
                for row in batch? {
                    if row.skip || versions.get(&row.id) != Some(&row.version) {
                        continue;
                    }
                    if written.insert(row.id) {
                        rows.push(row);
                    }
                }
            }
        }
        versions.retain(|id, _| written.contains(id));

        let filename = segment_filename();
        let base = self.base_path.join(&filename);
        let size_bytes = Segment::at(base.with_extension(SEGMENT_EXTENSION)).write(&rows)?;
        LsmTableIndex::write(&versions, base.with_extension(INDEX_EXTENSION))?;

        debug!(
            "compacted {} tables ({} rows) into {filename}",
            input.len(),
            rows.len()
        );

        output.clear();
        output.push(LsmTableRef {
            filename,
            first_sequence: first.first_sequence,
            last_sequence: last.last_sequence,
            size_bytes,
            has_skiplist: true,
        });
        Ok(true)
    }
}
