//! Pushes committed records of every local partition to its other replicas.

use std::time::Duration;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};

pub mod partition;
pub mod scheme;
pub mod worker;

pub use partition::{PartitionReplication, Replica};
pub use scheme::{ReplicaRef, ReplicationScheme, SchemeConfig};
pub use worker::{ReplicationInfo, ReplicationWorker};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub enabled: bool,
    pub workers: usize,
    /// Writes to the same partition within this window share one pass.
    #[serde(with = "humantime_serde")]
    pub cork: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    pub max_batch_rows: usize,
    pub max_batch_bytes: ByteSize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 4,
            cork: Duration::from_millis(500),
            retry_delay: Duration::from_secs(30),
            max_batch_rows: 8192,
            max_batch_bytes: ByteSize::mb(50),
        }
    }
}
