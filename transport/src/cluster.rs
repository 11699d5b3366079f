//! Cluster-wide configuration objects served by the config master and
//! cached by every node.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{Token, TransactionId};

/// Latest version of every config object, keyed by object name
/// (`cluster`, `customers/<ns>`, `tables/<ns>/<table>`, `users/<id>`).
pub type Heads = BTreeMap<String, u64>;

pub const CLUSTER_OBJECT: &str = "cluster";
pub const CUSTOMERS_PREFIX: &str = "customers/";
pub const TABLES_PREFIX: &str = "tables/";
pub const USERS_PREFIX: &str = "users/";

pub fn customer_object(customer: &str) -> String {
    format!("{CUSTOMERS_PREFIX}{customer}")
}

pub fn table_object(customer: &str, table: &str) -> String {
    format!("{TABLES_PREFIX}{customer}/{table}")
}

pub fn user_object(userid: &str) -> String {
    format!("{USERS_PREFIX}{userid}")
}

/// A versioned config object.
pub trait Versioned {
    fn version(&self) -> u64;
    fn object_name(&self) -> String;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStatus {
    #[default]
    Up,
    Down,
    Leaving,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server_id: String,
    /// `host:port` of the server's http listener.
    pub addr: String,
    #[serde(default)]
    pub status: ServerStatus,
    #[serde(default)]
    pub sha1_tokens: Vec<Token>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub version: u64,
    #[serde(default = "ClusterConfig::default_copies")]
    pub dht_num_copies: usize,
    #[serde(default = "ClusterConfig::default_copies")]
    pub replication_factor: usize,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl ClusterConfig {
    fn default_copies() -> usize {
        3
    }

    pub fn server(&self, server_id: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.server_id == server_id)
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            version: 0,
            dht_num_copies: Self::default_copies(),
            replication_factor: Self::default_copies(),
            servers: vec![],
        }
    }
}

impl Versioned for ClusterConfig {
    fn version(&self) -> u64 {
        self.version
    }

    fn object_name(&self) -> String {
        CLUSTER_OBJECT.to_string()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerConfig {
    pub customer: String,
    pub version: u64,
    #[serde(default)]
    pub replication_disabled: bool,
}

impl Versioned for CustomerConfig {
    fn version(&self) -> u64 {
        self.version
    }

    fn object_name(&self) -> String {
        customer_object(&self.customer)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Partitioner {
    /// A fixed set of shards, never discovered through the coordinator.
    Fixed,
    #[default]
    TimeWindow,
    Uint64,
    String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageKind {
    #[default]
    Lsm,
    Log,
    Static,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub customer: String,
    pub table_name: String,
    pub version: u64,
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub partitioner: Partitioner,
    #[serde(default)]
    pub storage: StorageKind,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub metadata_txnid: Option<TransactionId>,
    #[serde(default)]
    pub metadata_txnseq: u64,
    /// Keep partitions of this table on the node that wrote them.
    #[serde(default)]
    pub disable_replication: bool,
}

impl Versioned for TableDefinition {
    fn version(&self) -> u64 {
        self.version
    }

    fn object_name(&self) -> String {
        table_object(&self.customer, &self.table_name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    pub userid: String,
    pub customer: String,
    pub version: u64,
}

impl Versioned for UserConfig {
    fn version(&self) -> u64 {
        self.version
    }

    fn object_name(&self) -> String {
        user_object(&self.userid)
    }
}
