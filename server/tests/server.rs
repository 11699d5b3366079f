use std::time::Duration;

use anyhow::Result;
use basalt_client::{Client, ReplicateQuery};
use basalt_server::partition::PartitionInfo;
use basalt_server::replication::SchemeConfig;
use basalt_server::test::TestServer;
use basalt_server::{partition, replication, Config};
use basalt_transport::{
    DiscoveryCode, DiscoveryRequest, PartitionId, Partitioner, CONTENT_TYPE_ARROW,
};
use reqwest::StatusCode;
use tracing_subscriber::{fmt, EnvFilter};

const NAMESPACE: &str = "acme";
const TABLE: &str = "events";

fn init_logging() {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok(); // called multiple times, so ignore errors
}

fn fast_config() -> Config {
    Config {
        partition: partition::Config {
            commit_interval: Duration::from_millis(50),
            ..Default::default()
        },
        replication: replication::Config {
            cork: Duration::from_millis(10),
            retry_delay: Duration::from_millis(200),
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn setup_with_config(config: Config) -> Result<(Client, TestServer)> {
    init_logging();
    let server = TestServer::new_with_config(config).await?;
    let client = server.client()?;
    Ok((client, server))
}

/// Define the test table on the server's master and wait until the
/// server's own config directory has picked it up.
async fn define_table(client: &Client, server: &TestServer) -> Result<()> {
    client
        .update_table_definition(&basalt_test::table_definition(NAMESPACE, TABLE))
        .await?;
    eventually(|| async { server.basalt.partitions.table(NAMESPACE, TABLE).is_some() }).await
}

async fn eventually<F, Fut>(mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    anyhow::bail!("condition not reached in time")
}

async fn partitions(server: &TestServer) -> Result<Vec<PartitionInfo>> {
    Ok(reqwest::get(format!("{}/partitions", server.base()))
        .await?
        .json()
        .await?)
}

fn query(partition: PartitionId) -> ReplicateQuery {
    ReplicateQuery {
        namespace: NAMESPACE.to_string(),
        table: TABLE.to_string(),
        partition,
    }
}

#[tokio::test]
async fn healthcheck() -> Result<()> {
    let (client, _server) = setup_with_config(Config::default()).await?;
    assert!(client.healthcheck().await?);
    Ok(())
}

#[tokio::test]
async fn replicated_records_are_committed() -> Result<()> {
    let (client, server) = setup_with_config(fast_config()).await?;
    define_table(&client, &server).await?;

    let partition = PartitionId::for_key(TABLE, "shard-0");
    let records = basalt_test::records(10, 1);
    assert_eq!(client.replicate(&query(partition), &records).await?.inserted, 10);
    // same versions again are not newer
    assert_eq!(client.replicate(&query(partition), &records).await?.inserted, 0);
    assert_eq!(
        client
            .replicate(&query(partition), &basalt_test::records(3, 2))
            .await?
            .inserted,
        3
    );

    eventually(|| async {
        partitions(&server)
            .await
            .map(|ps| ps.len() == 1 && ps[0].lsm_sequence == 13)
            .unwrap_or(false)
    })
    .await?;

    let infos = partitions(&server).await?;
    assert_eq!(infos[0].partition_id, partition);
    assert_eq!(infos[0].lifecycle_state, DiscoveryCode::Serve);
    assert!(!infos[0].is_frozen);
    Ok(())
}

#[tokio::test]
async fn unknown_tables_are_not_found() -> Result<()> {
    let (client, _server) = setup_with_config(Config::default()).await?;

    let err = client
        .replicate(&query(PartitionId::random()), &basalt_test::records(1, 1))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
    Ok(())
}

#[tokio::test]
async fn replicate_requires_arrow() -> Result<()> {
    let (_client, server) = setup_with_config(Config::default()).await?;

    let resp = reqwest::Client::new()
        .post(format!(
            "{}/tsdb/replicate?namespace={NAMESPACE}&table={TABLE}&partition={}",
            server.base(),
            PartitionId::random()
        ))
        .header("content-type", "application/json")
        .body("[]")
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = reqwest::Client::new()
        .post(format!("{}/tsdb/replicate", server.base()))
        .header("content-type", CONTENT_TYPE_ARROW)
        .body(vec![1u8, 2, 3])
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn oversized_batches_are_rejected() -> Result<()> {
    let mut config = Config::default();
    config.http.max_request_bytes = 1024;
    let (client, server) = setup_with_config(config).await?;
    define_table(&client, &server).await?;

    let err = client
        .replicate(
            &query(PartitionId::random()),
            &basalt_test::random_records(1, 20, 256),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::PAYLOAD_TOO_LARGE));
    Ok(())
}

#[tokio::test]
async fn master_versions_must_advance() -> Result<()> {
    let (client, _server) = setup_with_config(Config::default()).await?;

    let config = basalt_test::cluster_config(1, &[("local", "127.0.0.1:1")]);
    client.update_cluster_config(&config).await?;
    assert_eq!(client.fetch_cluster_config().await?, config);

    let err = client.update_cluster_config(&config).await.unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::CONFLICT));

    let heads = client.fetch_heads().await?;
    assert_eq!(heads.get("cluster"), Some(&1));
    Ok(())
}

#[tokio::test]
async fn invalid_table_definitions_are_rejected() -> Result<()> {
    let (client, _server) = setup_with_config(Config::default()).await?;

    let mut table = basalt_test::table_definition(NAMESPACE, "no spaces allowed");
    let err = client.update_table_definition(&table).await.unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::BAD_REQUEST));

    table.table_name = TABLE.to_string();
    table.schema = None;
    let err = client.update_table_definition(&table).await.unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::BAD_REQUEST));

    let err = client.fetch_table_definition(NAMESPACE, TABLE).await.unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
    Ok(())
}

#[tokio::test]
async fn discovery_places_new_partitions_on_the_requester() -> Result<()> {
    let (client, _server) = setup_with_config(Config::default()).await?;
    let partition_id = PartitionId::random();

    let response = client
        .discover(&DiscoveryRequest {
            namespace: NAMESPACE.to_string(),
            table: TABLE.to_string(),
            partition_id,
            requester_id: "local".to_string(),
            ..Default::default()
        })
        .await?;
    assert_eq!(response.code, DiscoveryCode::Serve);
    assert_eq!(response.replication_targets.len(), 1);
    assert_eq!(response.replication_targets[0].server_id, "local");
    assert_eq!(response.replication_targets[0].partition_id, partition_id);
    Ok(())
}

#[tokio::test]
async fn followers_replicate_to_fixed_replicas() -> Result<()> {
    let (b_client, b) = setup_with_config(fast_config()).await?;
    define_table(&b_client, &b).await?;

    let (a_client, a) = setup_with_config(Config {
        scheme: SchemeConfig::Fixed {
            replicas: vec![b.host()],
        },
        ..fast_config()
    })
    .await?;
    define_table(&a_client, &a).await?;

    let partition = PartitionId::for_key(TABLE, "shard-1");
    let records = basalt_test::random_records(42, 25, 64);
    assert_eq!(a_client.replicate(&query(partition), &records).await?.inserted, 25);

    eventually(|| async {
        partitions(&b)
            .await
            .map(|ps| ps.len() == 1 && ps[0].lsm_sequence == 25)
            .unwrap_or(false)
    })
    .await?;

    let replicated = b.basalt.partitions.list_local_partitions();
    let ids = replicated[0].get_reader().list_records()?;
    assert_eq!(ids.len(), 25);
    Ok(())
}
