//! HTTP surface of a node: replication ingest, metadata coordination, the
//! config master endpoints and a few status pages.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, FromRef, State},
    response::Json,
    routing::{get, post},
    Router,
};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, error, info, Instrument};

use basalt_transport::{
    ClusterConfig, CustomerConfig, DiscoveryRequest, DiscoveryResponse, Heads,
    MetadataOperationEnvelope, MetadataOperationResult, ReplicateQuery, Replicated,
    TableDefinition, UserConfig,
};

use crate::axum_util::{query::Query, response::Response};
use crate::config_directory::ConfigDirectoryMaster;
use crate::error::Error;
use crate::partition::PartitionInfo;
use crate::record::RecordRef;
use crate::replication::ReplicationInfo;
use crate::Basalt;

mod chunk;
pub(crate) mod error;

use self::chunk::ReplicateRequest;
use self::error::ErrorReply;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: SocketAddr,
    pub max_request_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], basalt_client::DEFAULT_BASALT_PORT)),
            max_request_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Clone)]
struct AppState {
    config: Config,
    basalt: Arc<Basalt>,
}

impl FromRef<AppState> for Config {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}

type Reply<T> = Result<Json<T>, ErrorReply>;

fn router(state: AppState) -> Router {
    let max_request_bytes = state.config.max_request_bytes;
    Router::new()
        .route("/ok", get(healthcheck))
        .route("/tsdb/replicate", post(replicate))
        .route("/metadata/discover", post(discover))
        .route("/metadata/operation", post(perform_operation))
        .route("/master/heads", get(master_heads))
        .route(
            "/master/cluster_config",
            get(get_cluster_config).post(update_cluster_config),
        )
        .route(
            "/master/customer_config",
            get(get_customer_config).post(update_customer_config),
        )
        .route(
            "/master/table_definition",
            get(get_table_definition).post(update_table_definition),
        )
        .route("/master/user", get(get_user).post(update_user))
        .route("/partitions", get(list_partitions))
        .route("/replication", get(replication_status))
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .with_state(state)
}

pub async fn bind(config: &Config) -> std::io::Result<TcpListener> {
    TcpListener::bind(config.bind).await
}

/// Serve on `listener`. Returns a shutdown trigger and the server future.
pub fn serve(
    listener: TcpListener,
    config: Config,
    basalt: Arc<Basalt>,
) -> anyhow::Result<(oneshot::Sender<()>, BoxFuture<'static, ()>)> {
    let addr = listener.local_addr()?;
    let app = router(AppState { config, basalt });

    let (end_tx, end_rx) = oneshot::channel::<()>();
    let span = tracing::info_span!("http", ?addr);
    info!(parent: &span, "listening on http://{}", addr);

    let server = async move {
        let shutdown = async move {
            end_rx.await.ok();
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("http server failed: {e}");
        }
        debug!("http server stopped");
    }
    .instrument(span)
    .boxed();

    Ok((end_tx, server))
}

async fn healthcheck() -> Json<serde_json::Value> {
    Json(json!({"ok": "true"}))
}

async fn replicate(
    State(state): State<AppState>,
    Query(query): Query<ReplicateQuery>,
    ReplicateRequest(records): ReplicateRequest,
) -> Result<Response<Replicated>, ErrorReply> {
    let partition = state
        .basalt
        .partitions
        .find_or_create_partition(&query.namespace, &query.table, query.partition)
        .await?;

    debug!(
        "replicate: {} records into {}",
        records.len(),
        partition.key()
    );
    let records: Vec<RecordRef> = records.into_iter().map(RecordRef::from).collect();
    let writer = partition.get_writer();
    let inserted = tokio::task::spawn_blocking(move || writer.insert_records(&records))
        .await
        .map_err(|e| Error::runtime(e.to_string()))??;

    Ok(Response::created(Replicated {
        inserted: inserted.len(),
    }))
}

async fn discover(
    State(state): State<AppState>,
    Json(request): Json<DiscoveryRequest>,
) -> Reply<DiscoveryResponse> {
    Ok(Json(state.basalt.coordinator.discover(request).await?))
}

async fn perform_operation(
    State(state): State<AppState>,
    Json(envelope): Json<MetadataOperationEnvelope>,
) -> Reply<MetadataOperationResult> {
    Ok(Json(
        state.basalt.coordinator.perform_operation(envelope).await?,
    ))
}

fn master(state: &AppState) -> Result<&Arc<ConfigDirectoryMaster>, ErrorReply> {
    state.basalt.master.as_ref().ok_or(ErrorReply::NotMaster)
}

#[derive(Debug, Deserialize)]
struct CustomerParams {
    customer: String,
}

#[derive(Debug, Deserialize)]
struct TableParams {
    customer: String,
    table: String,
}

#[derive(Debug, Deserialize)]
struct UserParams {
    userid: String,
}

async fn master_heads(State(state): State<AppState>) -> Reply<Heads> {
    Ok(Json(master(&state)?.heads().await?))
}

async fn get_cluster_config(State(state): State<AppState>) -> Reply<ClusterConfig> {
    Ok(Json(master(&state)?.cluster_config().await?))
}

async fn update_cluster_config(
    State(state): State<AppState>,
    Json(config): Json<ClusterConfig>,
) -> Result<Response<ClusterConfig>, ErrorReply> {
    master(&state)?.update_cluster_config(&config).await?;
    Ok(Response::ok(config))
}

async fn get_customer_config(
    State(state): State<AppState>,
    Query(params): Query<CustomerParams>,
) -> Reply<CustomerConfig> {
    Ok(Json(master(&state)?.customer_config(&params.customer).await?))
}

async fn update_customer_config(
    State(state): State<AppState>,
    Json(config): Json<CustomerConfig>,
) -> Result<Response<CustomerConfig>, ErrorReply> {
    master(&state)?.update_customer_config(&config).await?;
    Ok(Response::ok(config))
}

async fn get_table_definition(
    State(state): State<AppState>,
    Query(params): Query<TableParams>,
) -> Reply<TableDefinition> {
    Ok(Json(
        master(&state)?
            .table_definition(&params.customer, &params.table)
            .await?,
    ))
}

async fn update_table_definition(
    State(state): State<AppState>,
    Json(table): Json<TableDefinition>,
) -> Result<Response<TableDefinition>, ErrorReply> {
    master(&state)?.update_table_definition(&table).await?;
    Ok(Response::ok(table))
}

async fn get_user(
    State(state): State<AppState>,
    Query(params): Query<UserParams>,
) -> Reply<UserConfig> {
    Ok(Json(master(&state)?.user(&params.userid).await?))
}

async fn update_user(
    State(state): State<AppState>,
    Json(user): Json<UserConfig>,
) -> Result<Response<UserConfig>, ErrorReply> {
    master(&state)?.update_user(&user).await?;
    Ok(Response::ok(user))
}

async fn list_partitions(State(state): State<AppState>) -> Json<Vec<PartitionInfo>> {
    let mut infos: Vec<PartitionInfo> = state
        .basalt
        .partitions
        .list_local_partitions()
        .iter()
        .map(|p| p.info())
        .collect();
    infos.sort_by(|a, b| {
        (&a.namespace, &a.table, a.partition_id).cmp(&(&b.namespace, &b.table, b.partition_id))
    });
    Json(infos)
}

async fn replication_status(State(state): State<AppState>) -> Json<Vec<ReplicationInfo>> {
    Json(
        state
            .basalt
            .replication
            .as_ref()
            .map(|worker| worker.status())
            .unwrap_or_default(),
    )
}
