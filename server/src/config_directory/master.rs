//! The authoritative copy of the cluster configuration.
//!
//! Every object carries a version; an update is only accepted when it is
//! exactly one past the stored version, so concurrent writers cannot
//! silently overwrite each other.

use std::path::Path;

use basalt_transport::{
    table_object, ClusterConfig, CustomerConfig, Heads, TableDefinition, TransactionId,
    UserConfig, Versioned, CLUSTER_OBJECT,
};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::Row;
use tracing::{debug, info};

use crate::db;
use crate::error::{Error, Result};
use crate::metadata::TableMetadata;

#[derive(Debug)]
pub struct ConfigDirectoryMaster {
    pool: SqlitePool,
    table_name: Regex,
}

impl ConfigDirectoryMaster {
    pub async fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            pool: db::open(path, &db::MASTER).await?,
            table_name: Regex::new("^[A-Za-z0-9_.-]+$")
                .map_err(|e| Error::runtime(e.to_string()))?,
        })
    }

    pub async fn heads(&self) -> Result<Heads> {
        let rows = sqlx::query("SELECT name, version FROM objects")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("name"), row.get::<i64, _>("version") as u64))
            .collect())
    }

    async fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let mut conn = self.pool.acquire().await?;
        get_in(&mut conn, name).await
    }

    async fn update<T: Versioned + Serialize>(&self, object: &T) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        update_in(&mut tx, object).await?;
        tx.commit().await?;

        debug!(
            "master: {} is now at version {}",
            object.object_name(),
            object.version()
        );
        Ok(())
    }

    /// The cluster config, or an empty version 0 config if none was stored.
    pub async fn cluster_config(&self) -> Result<ClusterConfig> {
        Ok(self.get(CLUSTER_OBJECT).await?.unwrap_or_default())
    }

    pub async fn customer_config(&self, customer: &str) -> Result<CustomerConfig> {
        let name = basalt_transport::customer_object(customer);
        self.get(&name).await?.ok_or(Error::NotFound(name))
    }

    pub async fn table_definition(&self, customer: &str, table: &str) -> Result<TableDefinition> {
        let name = table_object(customer, table);
        self.get(&name).await?.ok_or(Error::NotFound(name))
    }

    pub async fn user(&self, userid: &str) -> Result<UserConfig> {
        let name = basalt_transport::user_object(userid);
        self.get(&name).await?.ok_or(Error::NotFound(name))
    }

    pub async fn update_cluster_config(&self, config: &ClusterConfig) -> Result<()> {
        self.update(config).await
    }

    pub async fn update_customer_config(&self, config: &CustomerConfig) -> Result<()> {
        self.update(config).await
    }

    pub async fn update_table_definition(&self, table: &TableDefinition) -> Result<()> {
        if !self.table_name.is_match(&table.table_name) {
            return Err(Error::IllegalArgument(format!(
                "invalid table name: {:?}",
                table.table_name
            )));
        }
        if table.schema.as_deref().map(str::is_empty).unwrap_or(true) {
            return Err(Error::IllegalArgument(format!(
                "table {} has no schema",
                table.table_name
            )));
        }
        self.update(table).await
    }

    pub async fn update_user(&self, user: &UserConfig) -> Result<()> {
        self.update(user).await
    }

    /// Store the placements produced by metadata transaction `txnseq` and
    /// record the transaction in the table definition so followers see it
    /// on their next sync. Both writes commit together or not at all.
    pub async fn commit_metadata_txn(
        &self,
        customer: &str,
        table: &str,
        metadata: &TableMetadata,
        txnid: TransactionId,
        txnseq: u64,
    ) -> Result<()> {
        let name = table_object(customer, table);
        let mut tx = self.pool.begin().await?;

        let mut td: TableDefinition = get_in(&mut tx, &name)
            .await?
            .ok_or_else(|| Error::NotFound(name.clone()))?;
        td.metadata_txnid = Some(txnid);
        td.metadata_txnseq = txnseq;
        td.version += 1;
        update_in(&mut tx, &td).await?;
        store_metadata_in(&mut tx, customer, table, metadata).await?;
        tx.commit().await?;

        info!("master: {customer}/{table} metadata transaction {txnseq} ({txnid})");
        Ok(())
    }

    pub async fn load_metadata(&self) -> Result<Vec<(String, String, TableMetadata)>> {
        let rows = sqlx::query("SELECT namespace, table_name, value FROM metadata")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let value: String = row.get("value");
                Ok((
                    row.get("namespace"),
                    row.get("table_name"),
                    serde_json::from_str(&value)?,
                ))
            })
            .collect()
    }

    pub async fn store_metadata(
        &self,
        namespace: &str,
        table: &str,
        metadata: &TableMetadata,
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        store_metadata_in(&mut conn, namespace, table, metadata).await
    }
}

async fn get_in<T: DeserializeOwned>(conn: &mut SqliteConnection, name: &str) -> Result<Option<T>> {
    let value: Option<String> = sqlx::query("SELECT value FROM objects WHERE name = ?1")
        .bind(name)
        .map(|row: sqlx::sqlite::SqliteRow| row.get("value"))
        .fetch_optional(&mut *conn)
        .await?;
    value
        .map(|v| serde_json::from_str(&v).map_err(Into::into))
        .transpose()
}

async fn update_in<T: Versioned + Serialize>(conn: &mut SqliteConnection, object: &T) -> Result<()> {
    let name = object.object_name();
    let current: Option<i64> = sqlx::query("SELECT version FROM objects WHERE name = ?1")
        .bind(&name)
        .map(|row: sqlx::sqlite::SqliteRow| row.get("version"))
        .fetch_optional(&mut *conn)
        .await?;
    let expected = current.unwrap_or(0) as u64 + 1;
    if object.version() != expected {
        return Err(Error::ConcurrentModification(format!(
            "{name}: expected version {expected}, got {}",
            object.version()
        )));
    }

    sqlx::query(
        "
        INSERT INTO objects(name, value, version) VALUES(?1, ?2, ?3)
        ON CONFLICT(name) DO UPDATE SET
            value=excluded.value,
            version=excluded.version;
    ",
    )
    .bind(&name)
    .bind(serde_json::to_string(object)?)
    .bind(object.version() as i64)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn store_metadata_in(
    conn: &mut SqliteConnection,
    namespace: &str,
    table: &str,
    metadata: &TableMetadata,
) -> Result<()> {
    sqlx::query(
        "
        INSERT INTO metadata(namespace, table_name, value) VALUES(?1, ?2, ?3)
        ON CONFLICT(namespace, table_name) DO UPDATE SET value=excluded.value;
    ",
    )
    .bind(namespace)
    .bind(table)
    .bind(serde_json::to_string(metadata)?)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
