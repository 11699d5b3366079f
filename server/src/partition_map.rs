//! The partition map indexes every partition stored on this server.
//!
//! Partitions are registered in an sqlite index when created and opened
//! lazily: the first lookup of a partition (or the background load started
//! by [`PartitionMap::open`]) reads its snapshot from disk.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use basalt_transport::{
    DiscoveryCode, DiscoveryRequest, DiscoveryResponse, PartitionId, Partitioner, TableDefinition,
};
use parking_lot::{Mutex, RwLock};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::db;
use crate::error::{Error, Result};
use crate::partition::{Partition, PartitionChangeNotification, PartitionContext};
use crate::replication::PartitionReplication;
use crate::snapshot::PartitionKey;

pub const INDEX_FILENAME: &str = "partitions.db";

type PartitionCell = Arc<OnceCell<Arc<Partition>>>;

pub struct PartitionMap {
    ctx: Arc<PartitionContext>,
    pool: SqlitePool,
    tables: RwLock<HashMap<(String, String), TableDefinition>>,
    partitions: Mutex<HashMap<PartitionKey, PartitionCell>>,
    create_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for PartitionMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionMap")
            .field("data_dir", &self.ctx.data_dir)
            .field("partitions", &self.partitions.lock().len())
            .finish()
    }
}

impl PartitionMap {
    /// Open the index in the data directory and start loading every
    /// partition it lists in the background.
    pub async fn open(ctx: Arc<PartitionContext>) -> Result<Arc<Self>> {
        let pool = db::open(&ctx.data_dir.join(INDEX_FILENAME), &db::PARTITIONS).await?;

        let rows = sqlx::query("SELECT namespace, partition_id, table_name FROM partitions")
            .fetch_all(&pool)
            .await?;
        let mut partitions = HashMap::new();
        for row in rows {
            let namespace: String = row.get("namespace");
            let table: String = row.get("table_name");
            let partition_id: String = row.get("partition_id");
            let partition_id = PartitionId::from_str(&partition_id)?;
            partitions.insert(
                PartitionKey::new(&namespace, &table, partition_id),
                Arc::new(OnceCell::new()),
            );
        }
        info!("partition index lists {} partitions", partitions.len());

        let map = Arc::new(Self {
            ctx,
            pool,
            tables: RwLock::new(HashMap::new()),
            partitions: Mutex::new(partitions),
            create_lock: tokio::sync::Mutex::new(()),
        });
        map.clone().start_loading();
        Ok(map)
    }

    fn start_loading(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let pending: Vec<(PartitionKey, PartitionCell)> = self
                .partitions
                .lock()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            for (key, cell) in pending {
                if let Err(e) = self.load(&key, &cell).await {
                    error!("failed to load partition {key}: {e}");
                }
            }
            debug!("background partition load finished");
        })
    }

    pub fn context(&self) -> &Arc<PartitionContext> {
        &self.ctx
    }

    fn table_or_placeholder(&self, key: &PartitionKey) -> TableDefinition {
        self.tables
            .read()
            .get(&(key.namespace.clone(), key.table.clone()))
            .cloned()
            .unwrap_or_else(|| TableDefinition {
                customer: key.namespace.clone(),
                table_name: key.table.clone(),
                ..Default::default()
            })
    }

    pub fn table(&self, namespace: &str, table: &str) -> Option<TableDefinition> {
        self.tables
            .read()
            .get(&(namespace.to_string(), table.to_string()))
            .cloned()
    }

    async fn load(&self, key: &PartitionKey, cell: &PartitionCell) -> Result<Arc<Partition>> {
        let mut loaded = false;
        let partition = cell
            .get_or_try_init(|| async {
                let ctx = self.ctx.clone();
                let table = self.table_or_placeholder(key);
                let key = key.clone();
                let partition =
                    tokio::task::spawn_blocking(move || Partition::reopen(ctx, key, table))
                        .await
                        .map_err(|e| Error::runtime(e.to_string()))??;
                loaded = true;
                Ok::<_, Error>(partition)
            })
            .await?
            .clone();

        if loaded {
            debug!("loaded partition {key}");
            self.ctx.metrics.partitions_loaded.increment(1.0);
            self.ctx.publish(PartitionChangeNotification {
                snapshot: partition.snapshot(),
                partition: partition.clone(),
            });
        }
        Ok(partition)
    }

    pub async fn find_partition(&self, key: &PartitionKey) -> Result<Option<Arc<Partition>>> {
        let cell = self.partitions.lock().get(key).cloned();
        match cell {
            Some(cell) => Ok(Some(self.load(key, &cell).await?)),
            None => Ok(None),
        }
    }

    /// Look up a partition, creating it if this server is assigned to it.
    pub async fn find_or_create_partition(
        &self,
        namespace: &str,
        table: &str,
        partition_id: PartitionId,
    ) -> Result<Arc<Partition>> {
        let key = PartitionKey::new(namespace, table, partition_id);
        if let Some(partition) = self.find_partition(&key).await? {
            return Ok(partition);
        }

        let _create = self.create_lock.lock().await;
        if let Some(partition) = self.find_partition(&key).await? {
            return Ok(partition);
        }

        let definition = self
            .table(namespace, table)
            .ok_or_else(|| Error::NotFound(format!("table {namespace}/{table}")))?;

        let discovery = if definition.partitioner == Partitioner::Fixed {
            None
        } else {
            Some(self.discover(&key, &definition).await?)
        };

        let ctx = self.ctx.clone();
        let partition = tokio::task::spawn_blocking({
            let key = key.clone();
            move || Partition::create(ctx, key, definition, discovery.as_ref())
        })
        .await
        .map_err(|e| Error::runtime(e.to_string()))??;

        sqlx::query(
            "
            INSERT INTO partitions(namespace, partition_id, table_name) VALUES(?1, ?2, ?3)
            ON CONFLICT(namespace, partition_id) DO NOTHING;
        ",
        )
        .bind(namespace)
        .bind(partition_id.to_string())
        .bind(table)
        .execute(&self.pool)
        .await?;

        self.partitions
            .lock()
            .insert(key.clone(), Arc::new(OnceCell::new_with(Some(partition.clone()))));
        self.ctx.metrics.partitions_loaded.increment(1.0);
        info!("created partition {key}");

        self.ctx.publish(PartitionChangeNotification {
            snapshot: partition.snapshot(),
            partition: partition.clone(),
        });
        Ok(partition)
    }

    async fn discover(
        &self,
        key: &PartitionKey,
        definition: &TableDefinition,
    ) -> Result<DiscoveryResponse> {
        let response = self
            .ctx
            .coordinator
            .discover(DiscoveryRequest {
                namespace: key.namespace.clone(),
                table: key.table.clone(),
                min_txnseq: definition.metadata_txnseq,
                partition_id: key.partition_id,
                lookup_by_id: true,
                requester_id: self.ctx.server_id.clone(),
                ..Default::default()
            })
            .await?;

        match response.code {
            DiscoveryCode::Load | DiscoveryCode::Serve => Ok(response),
            code => Err(Error::runtime(format!(
                "partition {key} is not assigned to this server ({code})"
            ))),
        }
    }

    /// Partitions currently open on this server.
    pub fn list_local_partitions(&self) -> Vec<Arc<Partition>> {
        self.partitions
            .lock()
            .values()
            .filter_map(|cell| cell.get().cloned())
            .collect()
    }

    /// Record a table definition. Returns the open partitions of the table
    /// whose placement is behind the table's metadata transaction.
    pub fn configure_table(&self, definition: TableDefinition) -> Vec<Arc<Partition>> {
        let name = (definition.customer.clone(), definition.table_name.clone());
        let mut affected = vec![];
        for partition in self.list_local_partitions() {
            let key = partition.key();
            if key.namespace != name.0 || key.table != name.1 {
                continue;
            }
            if definition.metadata_txnseq > partition.snapshot().state.last_metadata_txnseq
                || definition.generation > partition.snapshot().state.table_generation
            {
                affected.push(partition.clone());
            }
            partition.set_table(definition.clone());
        }

        debug!(
            "configured table {}/{} (version {}, {} partitions affected)",
            name.0,
            name.1,
            definition.version,
            affected.len()
        );
        self.tables.write().insert(name, definition);
        affected
    }

    /// Drop a partition this server no longer needs, if every replica holds
    /// its rows. Returns false, leaving the partition untouched, otherwise.
    pub async fn drop_local_partition(&self, partition: &Arc<Partition>) -> Result<bool> {
        {
            let writer = partition.get_writer();
            let _guard = writer.lock();
            if !PartitionReplication::new(partition.clone()).should_drop() {
                warn!("refusing to drop partition {}", partition.key());
                return Ok(false);
            }
            writer.freeze();
        }

        self.remove(partition.key()).await?;
        Ok(true)
    }

    /// Drop a partition of a table that was recreated since.
    pub async fn drop_partition(&self, partition: &Arc<Partition>) -> Result<()> {
        {
            let writer = partition.get_writer();
            let _guard = writer.lock();
            if !partition.is_generation_superseded() {
                return Err(Error::IllegalState(format!(
                    "partition {} belongs to the current generation of its table",
                    partition.key()
                )));
            }
            writer.freeze();
        }

        self.remove(partition.key()).await
    }

    async fn remove(&self, key: &PartitionKey) -> Result<()> {
        self.partitions.lock().remove(key);
        sqlx::query("DELETE FROM partitions WHERE namespace = ?1 AND partition_id = ?2")
            .bind(&key.namespace)
            .bind(key.partition_id.to_string())
            .execute(&self.pool)
            .await?;

        self.ctx
            .index_cache
            .flush_dir(self.ctx.data_dir.join(key.rel_path()));
        self.ctx.tracker.delete_file(key.rel_path())?;

        self.ctx.metrics.partitions_dropped.increment(1);
        self.ctx.metrics.partitions_loaded.decrement(1.0);
        info!("dropped partition {key}");
        Ok(())
    }

    pub fn subscribe(&self, f: impl Fn(&PartitionChangeNotification) + Send + Sync + 'static) {
        self.ctx.subscribe(f)
    }
}

/// Whether `path` holds a partition index.
pub fn index_exists(data_dir: &Path) -> bool {
    data_dir.join(INDEX_FILENAME).exists()
}
