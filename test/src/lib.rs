//! Deterministic fixtures shared by basalt tests.

use basalt_transport::{
    ClusterConfig, Partitioner, RecordId, ReplicateRecord, ServerConfig, ServerStatus,
    TableDefinition,
};
use bytes::Bytes;
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Record `ix` at `version`. Ids and keys are stable across calls, so the
/// same `ix` always addresses the same logical record.
pub fn record(ix: u64, version: u64) -> ReplicateRecord {
    ReplicateRecord {
        id: RecordId::hash(ix.to_be_bytes()),
        version,
        key: Bytes::from(format!("key-{ix:08}")),
        data: Bytes::from(format!("{{\"ix\":{ix},\"version\":{version}}}")),
    }
}

/// `count` records with ids `0..count`, all at `version`.
pub fn records(count: u64, version: u64) -> Vec<ReplicateRecord> {
    (0..count).map(|ix| record(ix, version)).collect()
}

/// Records with seeded random payloads of up to `max_data` bytes.
pub fn random_records(seed: u64, count: u64, max_data: usize) -> Vec<ReplicateRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|ix| {
            let len = rng.gen_range(0..=max_data);
            let data: Vec<u8> = (0..len).map(|_| rng.gen_range(b'a'..=b'z')).collect();
            ReplicateRecord {
                data: Bytes::from(data),
                ..record(ix, rng.gen_range(1..1_000_000))
            }
        })
        .collect()
}

pub fn table_definition(customer: &str, table: &str) -> TableDefinition {
    TableDefinition {
        customer: customer.to_string(),
        table_name: table.to_string(),
        version: 1,
        partitioner: Partitioner::Fixed,
        schema: Some(r#"{"columns":[{"name":"ix","type":"uint64"}]}"#.to_string()),
        ..Default::default()
    }
}

/// Cluster config listing `servers` as `(server_id, addr)`, all up.
pub fn cluster_config(version: u64, servers: &[(&str, &str)]) -> ClusterConfig {
    ClusterConfig {
        version,
        replication_factor: servers.len().max(1),
        dht_num_copies: servers.len().max(1),
        servers: servers
            .iter()
            .map(|(server_id, addr)| ServerConfig {
                server_id: server_id.to_string(),
                addr: addr.to_string(),
                status: ServerStatus::Up,
                sha1_tokens: vec![],
            })
            .collect(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn records_are_stable() {
        assert_eq!(record(3, 1).id, records(5, 2)[3].id);
        assert_eq!(random_records(7, 10, 64), random_records(7, 10, 64));
    }
}
