use anyhow::Result;
use config::{Config, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

use crate::replication::SchemeConfig;
use crate::{config_directory, gc, http, metrics, partition, replication};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Run the config master and the metadata coordinator in this process.
    pub enabled: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BasaltConfig {
    pub data_path: PathBuf,
    pub server_id: String,

    pub http: http::Config,
    pub partition: partition::Config,
    pub replication: replication::Config,
    pub scheme: SchemeConfig,
    pub config_directory: config_directory::Config,
    pub master: MasterConfig,
    pub gc: gc::Config,
    pub metrics: metrics::Config,
}

impl Default for BasaltConfig {
    fn default() -> Self {
        BasaltConfig {
            data_path: PathBuf::from("./data"),
            server_id: "local".to_string(),

            http: http::Config::default(),
            partition: partition::Config::default(),
            replication: replication::Config::default(),
            scheme: SchemeConfig::default(),
            config_directory: config_directory::Config::default(),
            master: MasterConfig::default(),
            gc: gc::Config::default(),
            metrics: metrics::Config::default(),
        }
    }
}

impl BasaltConfig {
    pub fn to_string_pretty(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

pub fn binary_config() -> Result<BasaltConfig> {
    let config = Config::builder()
        .add_source(File::with_name("/etc/basalt.yaml").required(false))
        .add_source(File::with_name("./basalt.yaml").required(false))
        .add_source(File::with_name("/etc/basalt.toml").required(false))
        .add_source(File::with_name("./basalt.toml").required(false))
        .add_source(
            config::Environment::with_prefix("BASALT")
                .try_parsing(true)
                .separator("__"),
        )
        .build()?;

    let config: BasaltConfig = config.try_deserialize()?;

    for line in config.to_string_pretty()?.lines() {
        info!("{}", line);
    }

    Ok(config)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn defaults_survive_toml() -> anyhow::Result<()> {
        let config = BasaltConfig::default();
        let parsed: BasaltConfig = toml::from_str(&config.to_string_pretty()?)?;
        assert_eq!(parsed.server_id, "local");
        assert_eq!(parsed.replication.cork, Duration::from_millis(500));
        assert_eq!(parsed.http.bind, config.http.bind);
        Ok(())
    }

    #[test]
    fn partial_sections() -> anyhow::Result<()> {
        let parsed: BasaltConfig = toml::from_str(
            r#"
            server_id = "node-2"

            [replication]
            retry_delay = "5s"

            [scheme]
            kind = "fixed"
            replicas = ["10.0.0.1:9175", "10.0.0.2:9175"]

            [master]
            enabled = true
            "#,
        )?;
        assert_eq!(parsed.server_id, "node-2");
        assert_eq!(parsed.replication.retry_delay, Duration::from_secs(5));
        assert_eq!(parsed.replication.workers, 4);
        assert!(parsed.master.enabled);
        assert!(matches!(
            parsed.scheme,
            SchemeConfig::Fixed { ref replicas } if replicas.len() == 2
        ));
        Ok(())
    }
}
