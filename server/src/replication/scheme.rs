//! Which servers hold a copy of a partition.

use basalt_transport::{PartitionId, ServerStatus, Token};
use serde::{Deserialize, Serialize};

use crate::config_directory::ClusterView;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SchemeConfig {
    #[default]
    Standalone,
    /// Every partition lives on every one of `replicas` (`host:port`).
    Fixed { replicas: Vec<String> },
    /// Consistent hash ring over the cluster config's server tokens.
    Dht,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaRef {
    /// Stable identity the replication offsets are recorded under.
    pub unique_id: Token,
    pub addr: String,
    pub name: String,
    pub is_local: bool,
}

#[derive(Debug)]
pub enum ReplicationScheme {
    Standalone,
    Fixed {
        local_addr: String,
        replicas: Vec<ReplicaRef>,
    },
    Dht {
        server_id: String,
        cluster: ClusterView,
    },
}

impl ReplicationScheme {
    pub fn new(config: &SchemeConfig, server_id: &str, local_addr: &str, cluster: ClusterView) -> Self {
        match config {
            SchemeConfig::Standalone => Self::Standalone,
            SchemeConfig::Fixed { replicas } => Self::fixed(local_addr, replicas),
            SchemeConfig::Dht => Self::Dht {
                server_id: server_id.to_string(),
                cluster,
            },
        }
    }

    pub fn fixed(local_addr: &str, replicas: &[String]) -> Self {
        Self::Fixed {
            local_addr: local_addr.to_string(),
            replicas: replicas
                .iter()
                .map(|addr| ReplicaRef {
                    unique_id: Token::hash(addr),
                    addr: addr.clone(),
                    name: addr.clone(),
                    is_local: addr == local_addr,
                })
                .collect(),
        }
    }

    pub fn replicas_for(&self, key: &PartitionId) -> Vec<ReplicaRef> {
        match self {
            Self::Standalone => vec![],
            Self::Fixed { replicas, .. } => replicas.clone(),
            Self::Dht { server_id, cluster } => {
                let cluster = cluster.load();

                let mut ring: Vec<(&Token, usize)> = cluster
                    .servers
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.status == ServerStatus::Up)
                    .flat_map(|(ix, s)| s.sha1_tokens.iter().map(move |t| (t, ix)))
                    .collect();
                ring.sort();

                let start = ring.partition_point(|(token, _)| token.as_bytes() <= key.as_bytes());
                let mut seen = vec![];
                let mut replicas = vec![];
                for (token, ix) in ring[start..].iter().chain(ring[..start].iter()) {
                    if replicas.len() >= cluster.dht_num_copies {
                        break;
                    }
                    if seen.contains(ix) {
                        continue;
                    }
                    seen.push(*ix);

                    let server = &cluster.servers[*ix];
                    replicas.push(ReplicaRef {
                        unique_id: **token,
                        addr: server.addr.clone(),
                        name: server.server_id.clone(),
                        is_local: &server.server_id == server_id,
                    });
                }
                replicas
            }
        }
    }

    pub fn has_local_replica(&self, key: &PartitionId) -> bool {
        match self {
            Self::Standalone => true,
            Self::Fixed { local_addr, replicas } => replicas.iter().any(|r| &r.addr == local_addr),
            Self::Dht { .. } => self.replicas_for(key).iter().any(|r| r.is_local),
        }
    }

    /// Remote copies required before a local copy may be dropped.
    pub fn min_num_copies(&self) -> usize {
        match self {
            // nothing to drop to
            Self::Standalone => 1,
            Self::Fixed { replicas, .. } => replicas.len(),
            Self::Dht { cluster, .. } => cluster.load().dht_num_copies,
        }
    }
}
