//! basalt storage node: partitioned LSM tables, replication between
//! replicas, and the cluster config directory.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use futures::{future, stream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::SignalStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use basalt_client::Client;

mod axum_util;
pub mod arena;
pub mod compaction;
pub mod compaction_worker;
pub mod config;
pub mod config_directory;
mod db;
pub mod error;
pub mod file_tracker;
pub mod gc;
pub mod http;
pub mod index;
pub mod metadata;
pub mod metrics;
pub mod partition;
pub mod partition_map;
pub mod reader;
pub mod record;
pub mod replication;
pub mod segment;
pub mod snapshot;
pub mod state;
pub mod writer;

pub use crate::config::BasaltConfig as Config;

use crate::compaction_worker::CompactionWorker;
use crate::config_directory::{ConfigDirectory, ConfigDirectoryMaster, ConfigSource};
use crate::gc::GarbageCollector;
use crate::metadata::{HttpCoordinator, LocalCoordinator, MetadataCoordinator};
use crate::metrics::StorageMetrics;
use crate::partition::PartitionContext;
use crate::partition_map::PartitionMap;
use crate::replication::{ReplicationScheme, ReplicationWorker};

pub const CONFIG_DB: &str = "config.db";
pub const MASTER_DB: &str = "master.db";

/// Future that resolves when an exit signal (SIGINT / SIGTERM / SIGQUIT) is
/// received.
pub fn exit_signal<'a>() -> future::BoxFuture<'a, ()> {
    use future::FutureExt;
    use stream::StreamExt;

    fn signal_stream(k: SignalKind) -> impl stream::Stream<Item = ()> {
        match signal(k) {
            Ok(s) => SignalStream::new(s).boxed(),
            Err(e) => {
                error!("cannot listen for {k:?}: {e}");
                stream::pending().boxed()
            }
        }
    }

    let signal_stream = stream::select_all(vec![
        signal_stream(SignalKind::interrupt()),
        signal_stream(SignalKind::terminate()),
        signal_stream(SignalKind::quit()),
    ]);

    signal_stream.into_future().map(|_| ()).boxed()
}

/// Every long-lived component of one node.
#[derive(Debug)]
pub struct Basalt {
    pub config: Config,
    pub metrics: StorageMetrics,
    pub master: Option<Arc<ConfigDirectoryMaster>>,
    pub config_directory: Arc<ConfigDirectory>,
    pub coordinator: Arc<dyn MetadataCoordinator>,
    pub partitions: Arc<PartitionMap>,
    pub replication: Option<Arc<ReplicationWorker>>,
    pub gc: Arc<GarbageCollector>,
}

impl Basalt {
    /// Open every store under `config.data_path` and wire the components
    /// together. `addr` is where this node's http server listens.
    pub async fn open(config: Config, addr: SocketAddr) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_path)
            .with_context(|| format!("creating {:?}", config.data_path))?;
        let metrics = StorageMetrics::new();

        let master = if config.master.enabled {
            let master = ConfigDirectoryMaster::open(&config.data_path.join(MASTER_DB)).await?;
            info!("running as config master");
            Some(Arc::new(master))
        } else {
            None
        };
        let master_client = match &config.config_directory.master_url {
            Some(url) => Some(Client::new(url)?),
            None => None,
        };

        let source: Arc<dyn ConfigSource> = match (&master, &master_client) {
            (Some(master), _) => master.clone(),
            (None, Some(client)) => Arc::new(client.clone()),
            (None, None) => anyhow::bail!("config_directory.master_url is required unless master.enabled is set"),
        };
        let config_directory = Arc::new(
            ConfigDirectory::open(
                &config.data_path.join(CONFIG_DB),
                source,
                &config.config_directory.topics,
                metrics.clone(),
            )
            .await?,
        );
        config_directory
            .start(config.config_directory.startup_timeout)
            .await
            .context("initial config sync")?;
        let cluster = config_directory.cluster_view();

        let coordinator: Arc<dyn MetadataCoordinator> = match (&master, master_client) {
            (Some(master), _) => {
                Arc::new(LocalCoordinator::with_master(cluster.clone(), master.clone()).await?)
            }
            (None, Some(client)) => Arc::new(HttpCoordinator::new(client)),
            (None, None) => anyhow::bail!("no metadata coordinator configured"),
        };

        let local_addr = advertised_addr(&config, addr, &cluster.load());
        info!("advertising {local_addr} as {}", config.server_id);
        let scheme = Arc::new(ReplicationScheme::new(
            &config.scheme,
            &config.server_id,
            &local_addr,
            cluster.clone(),
        ));

        let ctx = Arc::new(PartitionContext::new(
            config.data_path.clone(),
            &config.server_id,
            config.partition.clone(),
            coordinator.clone(),
            scheme,
            cluster,
            metrics.clone(),
        )?);
        let gc = Arc::new(GarbageCollector::new(
            config.gc.clone(),
            config.data_path.clone(),
            ctx.tracker.clone(),
            ctx.index_cache.clone(),
            metrics.clone(),
        ));

        let partitions = PartitionMap::open(ctx).await?;
        for table in config_directory.list_tables() {
            partitions.configure_table(table);
        }

        let replication = config
            .replication
            .enabled
            .then(|| ReplicationWorker::new(config.replication.clone(), partitions.clone()));

        {
            let partitions = partitions.clone();
            let replication = replication.clone();
            config_directory.on_table_definition_change(move |table| {
                for partition in partitions.configure_table(table.clone()) {
                    if let Some(worker) = &replication {
                        worker.enqueue(partition, std::time::Duration::ZERO);
                    }
                }
            });
        }

        Ok(Arc::new(Self {
            config,
            metrics,
            master,
            config_directory,
            coordinator,
            partitions,
            replication,
            gc,
        }))
    }

    /// Spawn the background tasks: config watcher, replication workers,
    /// compaction and garbage collection.
    pub fn start(self: &Arc<Self>, stop: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![self
            .config_directory
            .clone()
            .start_watcher(self.config.config_directory.poll_interval, stop.clone())];

        if let Some(worker) = &self.replication {
            tasks.extend(worker.start(stop.clone()));
        }

        let compaction = CompactionWorker::new(self.partitions.clone());
        tasks.push(tokio::spawn(compaction.run(stop.clone())));
        tasks.push(tokio::spawn(self.gc.clone().run(stop)));
        tasks
    }
}

/// The address other nodes reach this one at: its entry in the cluster
/// config if there is one, else the bound address.
fn advertised_addr(
    config: &Config,
    addr: SocketAddr,
    cluster: &basalt_transport::ClusterConfig,
) -> String {
    if let Some(server) = cluster.server(&config.server_id) {
        return server.addr.clone();
    }
    if addr.ip().is_unspecified() {
        warn!(
            "{} is not in the cluster config and bound to {addr}; advertising localhost",
            config.server_id
        );
        return format!("127.0.0.1:{}", addr.port());
    }
    addr.to_string()
}

/// Async task that runs the full basalt server stack from a user-provided
/// [Config].
///
/// Attempts a clean shutdown when the provided `stop` signal is received (i.e.
/// [exit_signal]).
pub async fn task_from_config(
    config: Config,
    stop: future::BoxFuture<'_, ()>,
) -> anyhow::Result<()> {
    let listener = http::bind(&config.http).await?;
    let addr = listener.local_addr()?;
    let basalt = Basalt::open(config.clone(), addr).await?;

    let token = CancellationToken::new();
    let handles = basalt.start(token.clone());
    let (end_tx, server) = http::serve(listener, config.http.clone(), basalt.clone())?;

    future::select(stop, server).await;

    info!("shutting down");
    end_tx.send(()).ok();
    token.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            error!("background task failed: {e}");
        }
    }
    Ok(())
}
