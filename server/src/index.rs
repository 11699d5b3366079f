//! Per-segment `record id -> version` index (`<name>.idx`).
//!
//! The file is a sorted array of fixed 28 byte slots: the 20 byte record id
//! followed by the version as a little-endian u64. Lookups binary-search the
//! slots, either from memory or from a read-only memory map.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use basalt_transport::{RecordId, ID_LEN};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use memmap2::Mmap;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::{Error, Result};

pub const SLOT_SIZE: usize = ID_LEN + 8;

enum IndexData {
    Memory(Vec<u8>),
    Mapped(Mmap),
}

impl AsRef<[u8]> for IndexData {
    fn as_ref(&self) -> &[u8] {
        match self {
            Self::Memory(v) => v,
            Self::Mapped(m) => m,
        }
    }
}

pub struct LsmTableIndex {
    data: IndexData,
}

impl std::fmt::Debug for LsmTableIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsmTableIndex")
            .field("slots", &self.len())
            .finish()
    }
}

impl LsmTableIndex {
    /// Write `map` as an index file. The map's ordering is the on-disk order.
    pub fn write(map: &BTreeMap<RecordId, u64>, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("idx.tmp");

        let file = fs::File::create(&tmp)?;
        let mut out = BufWriter::new(file);
        for (id, version) in map {
            out.write_all(id.as_bytes())?;
            out.write_u64::<LittleEndian>(*version)?;
        }
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;

        trace!("wrote {} index slots to {path:?}", map.len());
        Ok(())
    }

    pub fn open(path: impl AsRef<Path>, mmap: bool) -> Result<Self> {
        let path = path.as_ref();
        let data = if mmap {
            let file = fs::File::open(path)?;
            // SAFETY: index files are immutable once renamed into place.
            IndexData::Mapped(unsafe { Mmap::map(&file)? })
        } else {
            IndexData::Memory(fs::read(path)?)
        };

        if data.as_ref().len() % SLOT_SIZE != 0 {
            return Err(Error::runtime(format!(
                "corrupt index {path:?}: size {} is not a multiple of {SLOT_SIZE}",
                data.as_ref().len()
            )));
        }

        Ok(Self { data })
    }

    pub fn len(&self) -> usize {
        self.data.as_ref().len() / SLOT_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, ix: usize) -> (&[u8], u64) {
        let slot = &self.data.as_ref()[ix * SLOT_SIZE..(ix + 1) * SLOT_SIZE];
        (&slot[..ID_LEN], LittleEndian::read_u64(&slot[ID_LEN..]))
    }

    /// Version stored for `id`, if present.
    pub fn get(&self, id: &RecordId) -> Option<u64> {
        let (mut lo, mut hi) = (0, self.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (slot_id, version) = self.slot(mid);
            match slot_id.cmp(id.as_bytes().as_slice()) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(version),
            }
        }
        None
    }

    /// For every id in `versions` that is present in the index, replace its
    /// value with the indexed version. Absent ids are left untouched.
    pub fn lookup(&self, versions: &mut HashMap<RecordId, u64>) {
        for (id, version) in versions.iter_mut() {
            if let Some(found) = self.get(id) {
                *version = found;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (RecordId, u64)> + '_ {
        (0..self.len()).filter_map(|ix| {
            let (id, version) = self.slot(ix);
            RecordId::from_slice(id).ok().map(|id| (id, version))
        })
    }
}

/// Opened indexes, shared by every writer and reader of the process.
#[derive(Debug)]
pub struct IndexCache {
    mmap: bool,
    indexes: Mutex<HashMap<PathBuf, Arc<LsmTableIndex>>>,
}

impl IndexCache {
    pub fn new(mmap: bool) -> Self {
        Self {
            mmap,
            indexes: Mutex::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, path: impl AsRef<Path>) -> Result<Arc<LsmTableIndex>> {
        let path = path.as_ref();
        if let Some(index) = self.indexes.lock().get(path) {
            return Ok(index.clone());
        }

        let index = Arc::new(LsmTableIndex::open(path, self.mmap)?);
        Ok(self
            .indexes
            .lock()
            .entry(path.to_path_buf())
            .or_insert(index)
            .clone())
    }

    pub fn flush(&self, path: impl AsRef<Path>) {
        self.indexes.lock().remove(path.as_ref());
    }

    /// Drop every cached index under `dir`.
    pub fn flush_dir(&self, dir: impl AsRef<Path>) {
        let dir = dir.as_ref();
        self.indexes.lock().retain(|path, _| !path.starts_with(dir));
    }
}
