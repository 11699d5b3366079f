use std::net::SocketAddr;

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 9000)),
        }
    }
}

pub fn start_metrics(config: Config) {
    PrometheusBuilder::new()
        .with_http_listener(config.bind)
        .add_global_label("system", "basalt")
        .install()
        .expect("failed to install Prometheus recorder");
}

/// Handles for every storage metric, created once per process (or per test)
/// and handed to the components that report them.
#[derive(Clone)]
pub struct StorageMetrics {
    pub records_inserted: Counter,
    pub records_skipped: Counter,
    pub commits: Counter,
    pub commit_ms: Histogram,
    pub compactions: Counter,
    pub compaction_races: Counter,
    pub splits_submitted: Counter,
    pub partitions_loaded: Gauge,
    pub partitions_dropped: Counter,
    pub replication_success: Counter,
    pub replication_failure: Counter,
    pub replicated_records: Counter,
    pub replication_queue: Gauge,
    pub config_syncs: Counter,
    pub trash_deleted: Counter,
}

impl StorageMetrics {
    pub fn new() -> Self {
        Self {
            records_inserted: counter!("lsm_records_inserted"),
            records_skipped: counter!("lsm_records_skipped"),
            commits: counter!("lsm_commits"),
            commit_ms: histogram!("lsm_commit_ms"),
            compactions: counter!("lsm_compactions"),
            compaction_races: counter!("lsm_compaction_races"),
            splits_submitted: counter!("lsm_splits_submitted"),
            partitions_loaded: gauge!("partitions_loaded"),
            partitions_dropped: counter!("partitions_dropped"),
            replication_success: counter!("replication_success"),
            replication_failure: counter!("replication_failure"),
            replicated_records: counter!("replicated_records"),
            replication_queue: gauge!("replication_queue_length"),
            config_syncs: counter!("config_directory_syncs"),
            trash_deleted: counter!("gc_trash_deleted"),
        }
    }
}

impl Default for StorageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StorageMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageMetrics").finish_non_exhaustive()
    }
}
