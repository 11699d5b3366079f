//! Reference counts for partition files, and the trash links that defer
//! their deletion until no snapshot refers to them anymore.
//!
//! Paths handed to the tracker are relative to the data directory.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::Result;

pub const TRASH_LINK_EXTENSION: &str = "trash";

#[derive(Debug)]
pub struct FileTracker {
    trash_dir: PathBuf,
    refs: Mutex<HashMap<PathBuf, usize>>,
}

impl FileTracker {
    pub fn new(trash_dir: impl Into<PathBuf>) -> Result<Self> {
        let trash_dir = trash_dir.into();
        fs::create_dir_all(&trash_dir)?;
        Ok(Self {
            trash_dir,
            refs: Mutex::new(HashMap::new()),
        })
    }

    pub fn trash_dir(&self) -> &Path {
        &self.trash_dir
    }

    pub fn increment_refcount<P: AsRef<Path>>(&self, files: &[P]) {
        let mut refs = self.refs.lock();
        for file in files {
            *refs.entry(file.as_ref().to_path_buf()).or_default() += 1;
        }
    }

    pub fn decrement_refcount<P: AsRef<Path>>(&self, files: &[P]) {
        let mut refs = self.refs.lock();
        for file in files {
            let file = file.as_ref();
            match refs.get_mut(file) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    refs.remove(file);
                }
                None => debug!("refcount underflow for {file:?}"),
            }
        }
    }

    /// True if `path`, or any file below it when `path` is a directory, is
    /// held by a live snapshot.
    pub fn is_referenced(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        self.refs
            .lock()
            .keys()
            .any(|file| file == path || file.starts_with(path))
    }

    /// Schedule files (or whole directories) for deletion. Nothing is unlinked
    /// here; a trash link listing the paths is written for the garbage
    /// collector.
    pub fn delete_files<P: AsRef<Path>>(&self, files: &[P]) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }

        let name = format!("{}.{TRASH_LINK_EXTENSION}", hex::encode(rand::random::<[u8; 16]>()));
        let link = self.trash_dir.join(name);
        let tmp = link.with_extension("tmp");

        let mut out = fs::File::create(&tmp)?;
        for file in files {
            trace!("trash {:?}", file.as_ref());
            writeln!(out, "{}", file.as_ref().display())?;
        }
        out.sync_all()?;
        drop(out);
        fs::rename(tmp, &link)?;

        debug!("wrote trash link {link:?} ({} paths)", files.len());
        Ok(())
    }

    pub fn delete_file(&self, file: impl AsRef<Path>) -> Result<()> {
        self.delete_files(&[file])
    }
}

/// Holds a reference on a set of files for as long as it lives.
#[derive(Debug)]
pub struct FileRefs {
    tracker: Arc<FileTracker>,
    files: Vec<PathBuf>,
}

impl FileRefs {
    pub fn new(tracker: Arc<FileTracker>, files: Vec<PathBuf>) -> Self {
        tracker.increment_refcount(&files);
        Self { tracker, files }
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}

impl Drop for FileRefs {
    fn drop(&mut self) {
        self.tracker.decrement_refcount(&self.files);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn refcounts() -> anyhow::Result<()> {
        let root = tempdir()?;
        let tracker = Arc::new(FileTracker::new(root.path().join("trash"))?);

        let a = FileRefs::new(
            tracker.clone(),
            vec![PathBuf::from("ns/t/p/a.cst"), PathBuf::from("ns/t/p/a.idx")],
        );
        let b = FileRefs::new(tracker.clone(), vec![PathBuf::from("ns/t/p/a.cst")]);

        assert!(tracker.is_referenced("ns/t/p/a.cst"));
        assert!(tracker.is_referenced("ns/t/p"));
        assert!(!tracker.is_referenced("ns/t/q"));

        drop(a);
        assert!(tracker.is_referenced("ns/t/p/a.cst"));
        assert!(!tracker.is_referenced("ns/t/p/a.idx"));

        drop(b);
        assert!(!tracker.is_referenced("ns/t/p"));
        Ok(())
    }

    #[test]
    fn trash_links() -> anyhow::Result<()> {
        let root = tempdir()?;
        let tracker = FileTracker::new(root.path().join("trash"))?;

        tracker.delete_files::<&str>(&[])?;
        tracker.delete_files(&["ns/t/p/a.cst", "ns/t/p/a.idx"])?;

        let links: Vec<_> = fs::read_dir(tracker.trash_dir())?
            .map(|e| e.map(|e| e.path()))
            .collect::<std::io::Result<_>>()?;
        assert_eq!(links.len(), 1);
        assert_eq!(
            links[0].extension().and_then(|e| e.to_str()),
            Some(TRASH_LINK_EXTENSION)
        );
        assert_eq!(
            fs::read_to_string(&links[0])?,
            "ns/t/p/a.cst\nns/t/p/a.idx\n"
        );
        Ok(())
    }
}
