//! Empties the trash: removes the paths listed in trash links once the
//! [FileTracker] reports them unreferenced, and forgets cached indexes of
//! the removed files.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time;
use tokio_stream::{wrappers::IntervalStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::file_tracker::{FileTracker, TRASH_LINK_EXTENSION};
use crate::index::IndexCache;
use crate::metrics::StorageMetrics;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Never delete anything, only log what would be deleted.
    Disabled,
    /// Only on explicit [GarbageCollector::run_gc] calls.
    Manual,
    #[default]
    Automatic,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: Mode,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
pub struct GarbageCollector {
    config: Config,
    data_dir: PathBuf,
    tracker: Arc<FileTracker>,
    index_cache: Arc<IndexCache>,
    metrics: StorageMetrics,
}

impl GarbageCollector {
    pub fn new(
        config: Config,
        data_dir: impl Into<PathBuf>,
        tracker: Arc<FileTracker>,
        index_cache: Arc<IndexCache>,
        metrics: StorageMetrics,
    ) -> Self {
        Self {
            config,
            data_dir: data_dir.into(),
            tracker,
            index_cache,
            metrics,
        }
    }

    pub fn run_gc(&self) -> Result<()> {
        debug!("running garbage collector");
        self.empty_trash()
    }

    /// Process every trash link. A link is only removed after all of its
    /// paths have been deleted.
    pub fn empty_trash(&self) -> Result<()> {
        let mut links = vec![];
        for entry in fs::read_dir(self.tracker.trash_dir())? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(TRASH_LINK_EXTENSION) {
                links.push(path);
            }
        }
        links.sort();

        for link in links {
            let contents = fs::read_to_string(&link)?;
            let mut complete = true;

            for line in contents.lines().filter(|l| !l.is_empty()) {
                let relative = Path::new(line);
                if relative.is_absolute() {
                    warn!("invalid trash link entry in {link:?}: {line}");
                    continue;
                }

                if self.tracker.is_referenced(relative) {
                    complete = false;
                    break;
                }

                let full = self.data_dir.join(relative);
                if !full.exists() {
                    continue;
                }

                self.remove(&full)?;
            }

            if complete {
                self.remove(&link)?;
            }
        }

        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<()> {
        if self.config.mode == Mode::Disabled {
            debug!("gc disabled, not deleting {path:?}");
            return Ok(());
        }

        debug!("deleting {path:?}");
        if path.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }
        self.index_cache.flush_dir(path);
        self.metrics.trash_deleted.increment(1);
        Ok(())
    }

    /// Runs the collector on its interval until cancelled. Only active in
    /// [Mode::Automatic].
    pub async fn run(self: Arc<Self>, stop: CancellationToken) {
        if self.config.mode != Mode::Automatic {
            return;
        }

        let mut ticks = IntervalStream::new(time::interval(self.config.interval));
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                tick = ticks.next() => {
                    if tick.is_none() {
                        break;
                    }
                    let gc = self.clone();
                    match tokio::task::spawn_blocking(move || gc.run_gc()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!("error in garbage collection: {e}"),
                        Err(e) => error!("garbage collection task failed: {e}"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::file_tracker::FileRefs;
    use crate::index::LsmTableIndex;
    use basalt_transport::RecordId;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn setup(mode: Mode) -> anyhow::Result<(tempfile::TempDir, Arc<FileTracker>, GarbageCollector)> {
        let root = tempdir()?;
        let tracker = Arc::new(FileTracker::new(root.path().join("trash"))?);
        let gc = GarbageCollector::new(
            Config {
                mode,
                ..Config::default()
            },
            root.path(),
            tracker.clone(),
            Arc::new(IndexCache::new(false)),
            StorageMetrics::new(),
        );
        Ok((root, tracker, gc))
    }

    #[test]
    fn referenced_files_survive() -> anyhow::Result<()> {
        let (root, tracker, gc) = setup(Mode::Manual)?;
        fs::create_dir_all(root.path().join("ns/p"))?;
        fs::write(root.path().join("ns/p/a.cst"), b"a")?;
        fs::write(root.path().join("ns/p/b.cst"), b"b")?;

        let held = FileRefs::new(tracker.clone(), vec![PathBuf::from("ns/p/a.cst")]);
        tracker.delete_files(&["ns/p/a.cst"])?;
        tracker.delete_files(&["ns/p/b.cst"])?;

        gc.run_gc()?;
        assert!(root.path().join("ns/p/a.cst").exists());
        assert!(!root.path().join("ns/p/b.cst").exists());
        assert_eq!(fs::read_dir(tracker.trash_dir())?.count(), 1);

        drop(held);
        gc.run_gc()?;
        assert!(!root.path().join("ns/p/a.cst").exists());
        assert_eq!(fs::read_dir(tracker.trash_dir())?.count(), 0);
        Ok(())
    }

    #[test]
    fn directories_are_removed() -> anyhow::Result<()> {
        let (root, tracker, gc) = setup(Mode::Manual)?;
        fs::create_dir_all(root.path().join("ns/p"))?;
        fs::write(root.path().join("ns/p/_snapshot"), b"s")?;

        tracker.delete_file("ns/p")?;
        gc.run_gc()?;
        assert!(!root.path().join("ns/p").exists());
        Ok(())
    }

    #[test]
    fn disabled_keeps_everything() -> anyhow::Result<()> {
        let (root, tracker, gc) = setup(Mode::Disabled)?;
        fs::write(root.path().join("x.cst"), b"x")?;

        tracker.delete_file("x.cst")?;
        gc.run_gc()?;
        assert!(root.path().join("x.cst").exists());
        assert_eq!(fs::read_dir(tracker.trash_dir())?.count(), 1);
        Ok(())
    }

    #[test]
    fn removed_indexes_leave_the_cache() -> anyhow::Result<()> {
        let (root, tracker, gc) = setup(Mode::Manual)?;
        fs::create_dir_all(root.path().join("ns/p"))?;
        let path = root.path().join("ns/p/a.idx");
        LsmTableIndex::write(&BTreeMap::from([(RecordId([1; 20]), 3)]), &path)?;

        let held = FileRefs::new(tracker.clone(), vec![PathBuf::from("ns/p/a.idx")]);
        tracker.delete_file("ns/p/a.idx")?;
        // a reader on an old snapshot opens the index after it was trashed
        assert_eq!(gc.index_cache.lookup(&path)?.get(&RecordId([1; 20])), Some(3));

        drop(held);
        gc.run_gc()?;
        assert!(!path.exists());
        assert!(gc.index_cache.lookup(&path).is_err());
        Ok(())
    }
}
