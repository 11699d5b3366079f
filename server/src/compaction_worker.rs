//! Periodically commits buffered rows and compacts segments of every open
//! partition.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::time;
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::error::Error;
use crate::partition::Partition;
use crate::partition_map::PartitionMap;

#[derive(Debug)]
pub struct CompactionWorker {
    map: Arc<PartitionMap>,
    interval: Duration,
    concurrency: usize,
}

impl CompactionWorker {
    pub fn new(map: Arc<PartitionMap>) -> Self {
        let config = &map.context().config;
        Self {
            interval: config.commit_interval,
            concurrency: config.compaction_workers.max(1),
            map,
        }
    }

    pub async fn run(self, stop: CancellationToken) {
        let mut ticks = time::interval(self.interval);
        ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let worker = &self;
        IntervalStream::new(ticks)
            .take_until(stop.cancelled())
            .for_each(|_| async move { worker.run_once().await })
            .await;
        debug!("compaction worker stopped");
    }

    /// One pass over all open partitions.
    pub async fn run_once(&self) {
        stream::iter(self.map.list_local_partitions())
            .for_each_concurrent(self.concurrency, |partition| async move {
                compact(partition).await;
            })
            .await;
    }
}

async fn compact(partition: Arc<Partition>) {
    let writer = partition.get_writer();
    if writer.is_frozen() {
        return;
    }

    let key = partition.key().clone();
    match tokio::task::spawn_blocking(move || writer.compact()).await {
        Ok(Ok(true)) => trace!("{key}: committed"),
        Ok(Ok(false)) => {}
        Ok(Err(Error::ConcurrentModification(e))) => debug!("{key}: {e}, retrying next pass"),
        Ok(Err(e)) => error!("{key}: compaction failed: {e}"),
        Err(e) => error!("{key}: compaction task failed: {e}"),
    }
}
