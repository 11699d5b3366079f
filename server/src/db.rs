//! SQLite pools backing the partition index, the config cache and the config
//! master.

use std::path::Path;
use std::str::FromStr;

use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::debug;

use crate::error::{Error, Result};

pub(crate) static PARTITIONS: Migrator = sqlx::migrate!("./migrations/partitions");
pub(crate) static CONFIG: Migrator = sqlx::migrate!("./migrations/config");
pub(crate) static MASTER: Migrator = sqlx::migrate!("./migrations/master");

pub(crate) async fn open(path: &Path, migrator: &Migrator) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        if !parent.is_dir() {
            return Err(Error::NotFound(format!(
                "data directory '{}'",
                parent.display()
            )));
        }
    }

    let url = format!("sqlite://{}", path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .connect_with(SqliteConnectOptions::from_str(&url)?.create_if_missing(true))
        .await?;

    migrator
        .run(&pool)
        .await
        .map_err(|e| Error::runtime(format!("migration of {path:?} failed: {e}")))?;
    debug!("opened {path:?}");
    Ok(pool)
}
