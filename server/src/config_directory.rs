//! Local follower cache of the cluster configuration.
//!
//! Objects are fetched from a [`ConfigSource`] (the master over http, or the
//! master itself on the master node), persisted in a local sqlite database
//! and mirrored in memory for synchronous queries. The version column of each
//! cached row is the head version that `sync` compares against the master's
//! heads.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use basalt_client::Client;
use basalt_transport::{
    ClusterConfig, CustomerConfig, Heads, ServerConfig, TableDefinition, UserConfig, Versioned,
    CLUSTER_OBJECT, CUSTOMERS_PREFIX, TABLES_PREFIX, USERS_PREFIX,
};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::db;
use crate::error::{Error, Result};
use crate::metrics::StorageMetrics;

pub mod master;

pub use master::ConfigDirectoryMaster;

/// Shared, atomically updated view of the cluster config.
pub type ClusterView = Arc<ArcSwap<ClusterConfig>>;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base url of the config master. Unset on a master node.
    pub master_url: Option<String>,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,
    pub topics: Vec<ConfigTopic>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            master_url: None,
            poll_interval: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(60),
            topics: ConfigTopic::all().to_vec(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigTopic {
    Cluster,
    Customers,
    Tables,
    Users,
}

impl ConfigTopic {
    pub fn all() -> [Self; 4] {
        [Self::Cluster, Self::Customers, Self::Tables, Self::Users]
    }
}

/// A config object name, parsed.
#[derive(Clone, Debug, PartialEq, Eq)]
enum ObjectName {
    Cluster,
    Customer(String),
    Table(String, String),
    User(String),
}

impl ObjectName {
    fn parse(name: &str) -> Option<Self> {
        if name == CLUSTER_OBJECT {
            return Some(Self::Cluster);
        }
        if let Some(customer) = name.strip_prefix(CUSTOMERS_PREFIX) {
            return Some(Self::Customer(customer.to_string()));
        }
        if let Some(rest) = name.strip_prefix(TABLES_PREFIX) {
            let (customer, table) = rest.split_once('/')?;
            return Some(Self::Table(customer.to_string(), table.to_string()));
        }
        name.strip_prefix(USERS_PREFIX)
            .map(|userid| Self::User(userid.to_string()))
    }

    fn topic(&self) -> ConfigTopic {
        match self {
            Self::Cluster => ConfigTopic::Cluster,
            Self::Customer(_) => ConfigTopic::Customers,
            Self::Table(..) => ConfigTopic::Tables,
            Self::User(_) => ConfigTopic::Users,
        }
    }
}

/// Where authoritative config comes from.
#[async_trait]
pub trait ConfigSource: Send + Sync + fmt::Debug {
    async fn heads(&self) -> Result<Heads>;
    async fn cluster_config(&self) -> Result<ClusterConfig>;
    async fn customer_config(&self, customer: &str) -> Result<CustomerConfig>;
    async fn table_definition(&self, customer: &str, table: &str) -> Result<TableDefinition>;
    async fn user(&self, userid: &str) -> Result<UserConfig>;

    async fn update_cluster_config(&self, config: &ClusterConfig) -> Result<()>;
    async fn update_customer_config(&self, config: &CustomerConfig) -> Result<()>;
    async fn update_table_definition(&self, table: &TableDefinition) -> Result<()>;
    async fn update_user(&self, user: &UserConfig) -> Result<()>;
}

#[async_trait]
impl ConfigSource for Client {
    async fn heads(&self) -> Result<Heads> {
        Ok(self.fetch_heads().await?)
    }

    async fn cluster_config(&self) -> Result<ClusterConfig> {
        Ok(self.fetch_cluster_config().await?)
    }

    async fn customer_config(&self, customer: &str) -> Result<CustomerConfig> {
        Ok(self.fetch_customer_config(customer).await?)
    }

    async fn table_definition(&self, customer: &str, table: &str) -> Result<TableDefinition> {
        Ok(self.fetch_table_definition(customer, table).await?)
    }

    async fn user(&self, userid: &str) -> Result<UserConfig> {
        Ok(self.fetch_user(userid).await?)
    }

    async fn update_cluster_config(&self, config: &ClusterConfig) -> Result<()> {
        Client::update_cluster_config(self, config).await?;
        Ok(())
    }

    async fn update_customer_config(&self, config: &CustomerConfig) -> Result<()> {
        Client::update_customer_config(self, config).await?;
        Ok(())
    }

    async fn update_table_definition(&self, table: &TableDefinition) -> Result<()> {
        Client::update_table_definition(self, table).await?;
        Ok(())
    }

    async fn update_user(&self, user: &UserConfig) -> Result<()> {
        Client::update_user(self, user).await?;
        Ok(())
    }
}

#[async_trait]
impl ConfigSource for ConfigDirectoryMaster {
    async fn heads(&self) -> Result<Heads> {
        ConfigDirectoryMaster::heads(self).await
    }

    async fn cluster_config(&self) -> Result<ClusterConfig> {
        ConfigDirectoryMaster::cluster_config(self).await
    }

    async fn customer_config(&self, customer: &str) -> Result<CustomerConfig> {
        ConfigDirectoryMaster::customer_config(self, customer).await
    }

    async fn table_definition(&self, customer: &str, table: &str) -> Result<TableDefinition> {
        ConfigDirectoryMaster::table_definition(self, customer, table).await
    }

    async fn user(&self, userid: &str) -> Result<UserConfig> {
        ConfigDirectoryMaster::user(self, userid).await
    }

    async fn update_cluster_config(&self, config: &ClusterConfig) -> Result<()> {
        ConfigDirectoryMaster::update_cluster_config(self, config).await
    }

    async fn update_customer_config(&self, config: &CustomerConfig) -> Result<()> {
        ConfigDirectoryMaster::update_customer_config(self, config).await
    }

    async fn update_table_definition(&self, table: &TableDefinition) -> Result<()> {
        ConfigDirectoryMaster::update_table_definition(self, table).await
    }

    async fn update_user(&self, user: &UserConfig) -> Result<()> {
        ConfigDirectoryMaster::update_user(self, user).await
    }
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    cluster: Vec<Callback<ClusterConfig>>,
    customers: Vec<Callback<CustomerConfig>>,
    tables: Vec<Callback<TableDefinition>>,
    users: Vec<Callback<UserConfig>>,
}

#[derive(Default)]
struct Cached {
    customers: HashMap<String, CustomerConfig>,
    tables: HashMap<(String, String), TableDefinition>,
    users: HashMap<String, UserConfig>,
}

pub struct ConfigDirectory {
    pool: SqlitePool,
    source: Arc<dyn ConfigSource>,
    topics: HashSet<ConfigTopic>,
    cluster: ClusterView,
    cached: RwLock<Cached>,
    callbacks: Mutex<Callbacks>,
    sync_lock: tokio::sync::Mutex<()>,
    metrics: StorageMetrics,
}

impl fmt::Debug for ConfigDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigDirectory")
            .field("source", &self.source)
            .field("topics", &self.topics)
            .field("cluster_version", &self.cluster.load().version)
            .finish_non_exhaustive()
    }
}

fn decode<T: DeserializeOwned>(value: &str) -> Result<T> {
    Ok(serde_json::from_str(value)?)
}

impl ConfigDirectory {
    /// Open the cache at `path` and load everything it already holds.
    pub async fn open(
        path: &Path,
        source: Arc<dyn ConfigSource>,
        topics: &[ConfigTopic],
        metrics: StorageMetrics,
    ) -> Result<Self> {
        let pool = db::open(path, &db::CONFIG).await?;
        let dir = Self {
            pool,
            source,
            topics: topics.iter().copied().collect(),
            cluster: Arc::new(ArcSwap::from_pointee(ClusterConfig::default())),
            cached: RwLock::new(Cached::default()),
            callbacks: Mutex::new(Callbacks::default()),
            sync_lock: tokio::sync::Mutex::new(()),
            metrics,
        };
        dir.load().await?;
        Ok(dir)
    }

    async fn load(&self) -> Result<()> {
        let rows = sqlx::query("SELECT key, value FROM config")
            .fetch_all(&self.pool)
            .await?;

        let mut cached = Cached::default();
        for row in rows {
            let key: String = row.get("key");
            let value: String = row.get("value");
            let name = ObjectName::parse(&key);
            if let Some(name) = &name {
                if !self.topics.contains(&name.topic()) {
                    trace!("skipping cached {key}, topic disabled");
                    continue;
                }
            }
            match name {
                Some(ObjectName::Cluster) => self.cluster.store(Arc::new(decode(&value)?)),
                Some(ObjectName::Customer(c)) => {
                    cached.customers.insert(c, decode(&value)?);
                }
                Some(ObjectName::Table(c, t)) => {
                    cached.tables.insert((c, t), decode(&value)?);
                }
                Some(ObjectName::User(u)) => {
                    cached.users.insert(u, decode(&value)?);
                }
                None => warn!("ignoring unknown config object {key}"),
            }
        }

        debug!(
            "loaded {} tables, {} customers, {} users from config cache",
            cached.tables.len(),
            cached.customers.len(),
            cached.users.len()
        );
        *self.cached.write() = cached;
        Ok(())
    }

    /// Versions of every locally cached object.
    pub fn local_heads(&self) -> Heads {
        let cached = self.cached.read();
        let mut heads = Heads::new();
        let cluster = self.cluster.load();
        if cluster.version > 0 {
            heads.insert(cluster.object_name(), cluster.version);
        }
        for c in cached.customers.values() {
            heads.insert(c.object_name(), c.version);
        }
        for t in cached.tables.values() {
            heads.insert(t.object_name(), t.version);
        }
        for u in cached.users.values() {
            heads.insert(u.object_name(), u.version);
        }
        heads
    }

    fn cached_version(&self, name: &ObjectName) -> u64 {
        let cached = self.cached.read();
        match name {
            ObjectName::Cluster => Some(self.cluster.load().version),
            ObjectName::Customer(c) => cached.customers.get(c).map(|c| c.version),
            ObjectName::Table(c, t) => cached.tables.get(&(c.clone(), t.clone())).map(|t| t.version),
            ObjectName::User(u) => cached.users.get(u).map(|u| u.version),
        }
        .unwrap_or(0)
    }

    async fn store<T: Versioned + Serialize>(&self, object: &T) -> Result<()> {
        let name = object.object_name();
        let current = ObjectName::parse(&name)
            .map(|n| self.cached_version(&n))
            .unwrap_or(0);
        if object.version() < current {
            return Err(Error::runtime(format!(
                "refusing to commit outdated version of {name}: {} < {current}",
                object.version()
            )));
        }

        sqlx::query(
            "
            INSERT INTO config(key, value, version) VALUES(?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value=excluded.value,
                version=excluded.version;
        ",
        )
        .bind(&name)
        .bind(serde_json::to_string(object)?)
        .bind(object.version() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn commit_cluster_config(&self, config: ClusterConfig) -> Result<()> {
        self.store(&config).await?;
        self.cluster.store(Arc::new(config.clone()));
        let callbacks = self.callbacks.lock().cluster.clone();
        callbacks.iter().for_each(|cb| cb(&config));
        Ok(())
    }

    pub async fn commit_customer_config(&self, config: CustomerConfig) -> Result<()> {
        self.store(&config).await?;
        self.cached
            .write()
            .customers
            .insert(config.customer.clone(), config.clone());
        let callbacks = self.callbacks.lock().customers.clone();
        callbacks.iter().for_each(|cb| cb(&config));
        Ok(())
    }

    pub async fn commit_table_definition(&self, table: TableDefinition) -> Result<()> {
        self.store(&table).await?;
        self.cached.write().tables.insert(
            (table.customer.clone(), table.table_name.clone()),
            table.clone(),
        );
        let callbacks = self.callbacks.lock().tables.clone();
        callbacks.iter().for_each(|cb| cb(&table));
        Ok(())
    }

    pub async fn commit_user(&self, user: UserConfig) -> Result<()> {
        self.store(&user).await?;
        self.cached
            .write()
            .users
            .insert(user.userid.clone(), user.clone());
        let callbacks = self.callbacks.lock().users.clone();
        callbacks.iter().for_each(|cb| cb(&user));
        Ok(())
    }

    /// Fetch every object whose master head is ahead of the local copy.
    pub async fn sync(&self) -> Result<usize> {
        let _lock = self.sync_lock.lock().await;
        let heads = self.source.heads().await?;

        let mut updated = 0;
        for (object, version) in heads {
            let Some(name) = ObjectName::parse(&object) else {
                warn!("master announced unknown object {object}");
                continue;
            };
            if !self.topics.contains(&name.topic()) || self.cached_version(&name) >= version {
                continue;
            }

            debug!("syncing {object} to version {version}");
            match name {
                ObjectName::Cluster => {
                    let config = self.source.cluster_config().await?;
                    self.commit_cluster_config(config).await?
                }
                ObjectName::Customer(c) => {
                    let config = self.source.customer_config(&c).await?;
                    self.commit_customer_config(config).await?
                }
                ObjectName::Table(c, t) => {
                    let table = self.source.table_definition(&c, &t).await?;
                    self.commit_table_definition(table).await?
                }
                ObjectName::User(u) => {
                    let user = self.source.user(&u).await?;
                    self.commit_user(user).await?
                }
            }
            updated += 1;
        }

        self.metrics.config_syncs.increment(1);
        if updated > 0 {
            info!("config directory synced {updated} objects");
        }
        Ok(updated)
    }

    /// Initial sync, retried with exponential back-off until `timeout`.
    pub async fn start(&self, timeout: Duration) -> Result<()> {
        let policy = ExponentialBackoff {
            max_elapsed_time: Some(timeout),
            ..Default::default()
        };
        backoff::future::retry(policy, || async {
            self.sync().await.map_err(|e| {
                warn!("initial config sync failed: {e}");
                backoff::Error::transient(e)
            })
        })
        .await?;
        Ok(())
    }

    /// Poll the master every `interval` until `stop` is cancelled.
    pub fn start_watcher(
        self: Arc<Self>,
        interval: Duration,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticks.tick() => {
                        if let Err(e) = self.sync().await {
                            warn!("config directory sync failed: {e}");
                        }
                    }
                }
            }
            debug!("config watcher stopped");
        })
    }

    pub async fn update_cluster_config(&self, config: ClusterConfig) -> Result<()> {
        self.source.update_cluster_config(&config).await?;
        self.commit_cluster_config(config).await
    }

    pub async fn update_customer_config(&self, config: CustomerConfig) -> Result<()> {
        self.source.update_customer_config(&config).await?;
        self.commit_customer_config(config).await
    }

    pub async fn update_table_definition(&self, table: TableDefinition) -> Result<()> {
        self.source.update_table_definition(&table).await?;
        self.commit_table_definition(table).await
    }

    pub async fn update_user(&self, user: UserConfig) -> Result<()> {
        self.source.update_user(&user).await?;
        self.commit_user(user).await
    }

    pub fn cluster_view(&self) -> ClusterView {
        self.cluster.clone()
    }

    pub fn cluster_config(&self) -> Arc<ClusterConfig> {
        self.cluster.load_full()
    }

    pub fn customer_config(&self, customer: &str) -> Option<CustomerConfig> {
        self.cached.read().customers.get(customer).cloned()
    }

    pub fn table_config(&self, customer: &str, table: &str) -> Option<TableDefinition> {
        self.cached
            .read()
            .tables
            .get(&(customer.to_string(), table.to_string()))
            .cloned()
    }

    pub fn list_tables(&self) -> Vec<TableDefinition> {
        let mut tables: Vec<_> = self.cached.read().tables.values().cloned().collect();
        tables.sort_by(|a, b| (&a.customer, &a.table_name).cmp(&(&b.customer, &b.table_name)));
        tables
    }

    pub fn user(&self, userid: &str) -> Option<UserConfig> {
        self.cached.read().users.get(userid).cloned()
    }

    pub fn list_servers(&self) -> Vec<ServerConfig> {
        self.cluster.load().servers.clone()
    }

    pub fn server(&self, server_id: &str) -> Option<ServerConfig> {
        self.cluster.load().server(server_id).cloned()
    }

    pub fn on_cluster_config_change(&self, f: impl Fn(&ClusterConfig) + Send + Sync + 'static) {
        self.callbacks.lock().cluster.push(Arc::new(f));
    }

    pub fn on_customer_config_change(&self, f: impl Fn(&CustomerConfig) + Send + Sync + 'static) {
        self.callbacks.lock().customers.push(Arc::new(f));
    }

    pub fn on_table_definition_change(
        &self,
        f: impl Fn(&TableDefinition) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().tables.push(Arc::new(f));
    }

    pub fn on_user_change(&self, f: impl Fn(&UserConfig) + Send + Sync + 'static) {
        self.callbacks.lock().users.push(Arc::new(f));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use basalt_transport::ServerStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_log::test;

    async fn setup(root: &Path) -> anyhow::Result<(Arc<ConfigDirectoryMaster>, ConfigDirectory)> {
        let master = Arc::new(ConfigDirectoryMaster::open(&root.join("master.db")).await?);
        let dir = ConfigDirectory::open(
            &root.join("config.db"),
            master.clone(),
            &ConfigTopic::all(),
            StorageMetrics::new(),
        )
        .await?;
        Ok((master, dir))
    }

    fn table(version: u64) -> TableDefinition {
        TableDefinition {
            customer: "acme".to_string(),
            table_name: "events".to_string(),
            version,
            schema: Some("{}".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn object_names() {
        assert_eq!(ObjectName::parse("cluster"), Some(ObjectName::Cluster));
        assert_eq!(
            ObjectName::parse("tables/acme/events"),
            Some(ObjectName::Table("acme".to_string(), "events".to_string()))
        );
        assert_eq!(ObjectName::parse("tables/acme"), None);
        assert_eq!(
            ObjectName::parse("users/u1"),
            Some(ObjectName::User("u1".to_string()))
        );
        assert_eq!(ObjectName::parse("bogus"), None);
    }

    #[test(tokio::test)]
    async fn sync_fetches_changed_objects() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let (master, dir) = setup(root.path()).await?;

        let tables_seen = Arc::new(AtomicUsize::new(0));
        let seen = tables_seen.clone();
        dir.on_table_definition_change(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        master.update_table_definition(&table(1)).await?;
        master
            .update_cluster_config(&ClusterConfig {
                version: 1,
                servers: vec![ServerConfig {
                    server_id: "a".to_string(),
                    addr: "127.0.0.1:1".to_string(),
                    status: ServerStatus::Up,
                    sha1_tokens: vec![],
                }],
                ..Default::default()
            })
            .await?;

        assert_eq!(dir.sync().await?, 2);
        assert_eq!(dir.sync().await?, 0);
        assert_eq!(tables_seen.load(Ordering::SeqCst), 1);
        assert_eq!(dir.table_config("acme", "events").map(|t| t.version), Some(1));
        assert_eq!(dir.list_servers().len(), 1);
        assert!(dir.server("a").is_some());

        master.update_table_definition(&table(2)).await?;
        assert_eq!(dir.sync().await?, 1);
        assert_eq!(tables_seen.load(Ordering::SeqCst), 2);
        assert_eq!(dir.local_heads(), master.heads().await?);
        Ok(())
    }

    #[test(tokio::test)]
    async fn cache_survives_reopen() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        {
            let (_master, dir) = setup(root.path()).await?;
            dir.update_table_definition(table(1)).await?;
        }
        let (_master, dir) = setup(root.path()).await?;
        assert_eq!(dir.list_tables(), vec![table(1)]);
        Ok(())
    }

    #[test(tokio::test)]
    async fn outdated_versions_are_refused() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let (_master, dir) = setup(root.path()).await?;
        dir.update_table_definition(table(1)).await?;
        dir.update_table_definition(table(2)).await?;

        assert!(matches!(
            dir.commit_table_definition(table(1)).await,
            Err(Error::Runtime(_))
        ));
        assert!(matches!(
            dir.update_table_definition(table(2)).await,
            Err(Error::ConcurrentModification(_))
        ));
        Ok(())
    }

    #[test(tokio::test)]
    async fn disabled_topics_are_skipped() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let master = Arc::new(ConfigDirectoryMaster::open(&root.path().join("master.db")).await?);
        let dir = ConfigDirectory::open(
            &root.path().join("config.db"),
            master.clone(),
            &[ConfigTopic::Cluster],
            StorageMetrics::new(),
        )
        .await?;

        master.update_table_definition(&table(1)).await?;
        assert_eq!(dir.sync().await?, 0);
        assert!(dir.table_config("acme", "events").is_none());
        Ok(())
    }

    #[test(tokio::test)]
    async fn disabled_topics_are_not_loaded() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        {
            let (_master, dir) = setup(root.path()).await?;
            dir.commit_table_definition(table(1)).await?;
        }

        let master = Arc::new(ConfigDirectoryMaster::open(&root.path().join("master.db")).await?);
        let dir = ConfigDirectory::open(
            &root.path().join("config.db"),
            master,
            &[ConfigTopic::Cluster],
            StorageMetrics::new(),
        )
        .await?;
        assert!(dir.table_config("acme", "events").is_none());
        assert!(dir.list_tables().is_empty());
        Ok(())
    }
}
