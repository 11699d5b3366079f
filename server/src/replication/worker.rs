//! Background replication of every local partition.
//!
//! Partitions are queued by the time they become eligible for a pass. A
//! change notification queues its partition after the cork delay, and a
//! partition already waiting keeps its earlier slot, so a burst of commits
//! results in a single pass. Splitting partitions skip the cork, and tables
//! with replication disabled are never queued.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::StorageMetrics;
use crate::partition::Partition;
use crate::partition_map::PartitionMap;
use crate::snapshot::PartitionKey;

use super::{Config, PartitionReplication};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationInfo {
    pub partition: String,
    pub running: bool,
    /// Milliseconds until the next pass, zero if overdue.
    pub next_attempt_ms: u64,
}

#[derive(Default)]
struct Queue {
    by_time: BTreeMap<(Instant, PartitionKey), Arc<Partition>>,
    scheduled: HashMap<PartitionKey, Instant>,
    running: HashSet<PartitionKey>,
}

enum Next {
    Ready(Arc<Partition>),
    At(Instant),
    Idle,
}

impl Queue {
    fn len(&self) -> usize {
        self.scheduled.len()
    }

    fn push(&mut self, partition: Arc<Partition>, at: Instant) {
        let key = partition.key().clone();
        if let Some(existing) = self.scheduled.get(&key) {
            if *existing <= at {
                return;
            }
            self.by_time.remove(&(*existing, key.clone()));
        }
        self.scheduled.insert(key.clone(), at);
        self.by_time.insert((at, key), partition);
    }

    /// Earliest eligible partition that is not being replicated already.
    fn pop(&mut self, now: Instant) -> Next {
        let mut waiting = None;
        let mut ready = None;
        for (at, key) in self.by_time.keys() {
            if self.running.contains(key) {
                continue;
            }
            if *at <= now {
                ready = Some((*at, key.clone()));
            } else {
                waiting = Some(*at);
            }
            break;
        }

        match (ready, waiting) {
            (Some(slot), _) => {
                let Some(partition) = self.by_time.remove(&slot) else {
                    return Next::Idle;
                };
                self.scheduled.remove(&slot.1);
                self.running.insert(slot.1);
                Next::Ready(partition)
            }
            (None, Some(at)) => Next::At(at),
            (None, None) => Next::Idle,
        }
    }
}

pub struct ReplicationWorker {
    config: Config,
    map: Arc<PartitionMap>,
    queue: Mutex<Queue>,
    wakeup: Notify,
    metrics: StorageMetrics,
}

impl std::fmt::Debug for ReplicationWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationWorker")
            .field("config", &self.config)
            .field("queued", &self.queue.lock().len())
            .finish()
    }
}

impl ReplicationWorker {
    /// Create the worker and subscribe it to the map's change notifications.
    pub fn new(config: Config, map: Arc<PartitionMap>) -> Arc<Self> {
        let worker = Arc::new(Self {
            metrics: map.context().metrics.clone(),
            config,
            map,
            queue: Mutex::new(Queue::default()),
            wakeup: Notify::new(),
        });

        let weak: Weak<Self> = Arc::downgrade(&worker);
        worker.map.subscribe(move |change| {
            if let Some(worker) = weak.upgrade() {
                worker.enqueue(change.partition.clone(), worker.config.cork);
            }
        });
        worker
    }

    pub fn enqueue(&self, partition: Arc<Partition>, delay: Duration) {
        if partition.table().disable_replication {
            return;
        }
        let delay = if partition.is_splitting() {
            Duration::ZERO
        } else {
            delay
        };
        let len = {
            let mut queue = self.queue.lock();
            queue.push(partition, Instant::now() + delay);
            queue.len()
        };
        self.metrics.replication_queue.set(len as f64);
        self.wakeup.notify_one();
    }

    /// Queue every open partition for an immediate check.
    pub fn enqueue_all(&self) {
        for partition in self.map.list_local_partitions() {
            self.enqueue(partition, Duration::ZERO);
        }
    }

    pub fn status(&self) -> Vec<ReplicationInfo> {
        let now = Instant::now();
        let queue = self.queue.lock();
        let mut infos: Vec<ReplicationInfo> = queue
            .running
            .iter()
            .map(|key| ReplicationInfo {
                partition: key.to_string(),
                running: true,
                next_attempt_ms: 0,
            })
            .collect();
        infos.extend(queue.by_time.keys().map(|(at, key)| ReplicationInfo {
            partition: key.to_string(),
            running: false,
            next_attempt_ms: at.saturating_duration_since(now).as_millis() as u64,
        }));
        infos
    }

    /// Spawn the configured number of worker tasks.
    pub fn start(self: &Arc<Self>, stop: CancellationToken) -> Vec<JoinHandle<()>> {
        info!("starting {} replication workers", self.config.workers);
        self.enqueue_all();
        (0..self.config.workers.max(1))
            .map(|ix| {
                let worker = self.clone();
                let stop = stop.clone();
                tokio::spawn(async move { worker.run(ix, stop).await })
            })
            .collect()
    }

    async fn run(self: Arc<Self>, ix: usize, stop: CancellationToken) {
        debug!("replication worker {ix} started");
        loop {
            let next = self.queue.lock().pop(Instant::now());
            match next {
                Next::Ready(partition) => {
                    self.process(&partition).await;
                    self.queue.lock().running.remove(partition.key());
                    continue;
                }
                Next::At(at) => {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = self.wakeup.notified() => {}
                        _ = time::sleep_until(at) => {}
                    }
                }
                Next::Idle => {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = self.wakeup.notified() => {}
                    }
                }
            }
            if stop.is_cancelled() {
                break;
            }
        }
        debug!("replication worker {ix} stopped");
    }

    /// One replication pass over `partition`, then decide when it needs the
    /// next one or whether the local copy can go.
    pub async fn process(&self, partition: &Arc<Partition>) {
        let replication = PartitionReplication::new(partition.clone()).with_batch_limits(
            self.config.max_batch_rows,
            self.config.max_batch_bytes.as_u64() as usize,
        );

        if partition.is_generation_superseded() {
            if let Err(e) = self.map.drop_partition(partition).await {
                error!("failed to drop partition {}: {e}", partition.key());
            }
            return;
        }

        let success = !replication.needs_replication() || replication.replicate().await;
        if !success {
            warn!(
                "replication of {} failed, retrying in {:?}",
                partition.key(),
                self.config.retry_delay
            );
            self.enqueue(partition.clone(), self.config.retry_delay);
            return;
        }

        if replication.needs_replication() {
            self.enqueue(partition.clone(), Duration::ZERO);
        } else if replication.should_drop() {
            match self.map.drop_local_partition(partition).await {
                Ok(true) => {}
                Ok(false) => self.enqueue(partition.clone(), self.config.retry_delay),
                Err(e) => {
                    error!("failed to drop partition {}: {e}", partition.key());
                    self.enqueue(partition.clone(), self.config.retry_delay);
                }
            }
        }
        self.metrics
            .replication_queue
            .set(self.queue.lock().len() as f64);
    }
}
