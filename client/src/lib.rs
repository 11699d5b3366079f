//! General-use client library for talking to basalt nodes: record
//! replication, metadata discovery, and the config directory master.
use std::str::FromStr;

pub use basalt_transport::{
    ArrowError, ClusterConfig, CustomerConfig, DiscoveryRequest, DiscoveryResponse, Heads,
    MetadataOperationEnvelope, MetadataOperationResult, ReplicateQuery, ReplicateRecord,
    Replicated, TableDefinition, UserConfig, CONTENT_TYPE_ARROW,
};
use reqwest::{
    header::{CONTENT_LENGTH, CONTENT_TYPE},
    RequestBuilder, Response, StatusCode, Url,
};
use serde::Serialize;
use thiserror::Error;
use tracing::trace;

/// Client errors
#[derive(Debug, Error)]
pub enum Error {
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("Error sending request: {0}")]
    SendingRequest(reqwest::Error),
    #[error("Error from server: {0}")]
    Server(reqwest::Error),
    #[error("Error deserializing server response: {0}")]
    Deserialize(reqwest::Error),
    #[error("Unexpected status {0}: {1}")]
    UnexpectedStatus(StatusCode, String),
    #[error("Error encoding request: {0}")]
    ArrowSerialize(ArrowError),
}

impl Error {
    /// HTTP status of the server response, if the server answered at all.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Server(e) => e.status(),
            Self::UnexpectedStatus(status, _) => Some(*status),
            _ => None,
        }
    }
}

/// basalt client. Creation options:
/// ```
/// use basalt_client::Client;
///
/// // Client pointed at 'localhost:9175'.
/// let client = Client::default();
///
/// // Client pointed at an alternate URL.
/// let client = Client::new("http://basalt-2.internal:9175");
/// ```
#[derive(Clone, Debug)]
pub struct Client {
    server_url: Url,
    http_client: reqwest::Client,
}

pub const DEFAULT_BASALT_PORT: u16 = 9175;

pub fn localhost() -> Url {
    format!("http://localhost:{DEFAULT_BASALT_PORT}")
        .parse()
        .expect("unexpected URL parse failure")
}

impl Default for Client {
    fn default() -> Client {
        Client {
            server_url: localhost(),
            http_client: reqwest::Client::new(),
        }
    }
}

impl From<Url> for Client {
    fn from(orig: Url) -> Client {
        Client {
            server_url: orig,
            http_client: reqwest::Client::new(),
        }
    }
}

impl FromStr for Client {
    type Err = url::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Client {
            server_url: s.parse()?,
            http_client: reqwest::Client::new(),
        })
    }
}

// send request to server and perform basic error handling
async fn process_request(r: RequestBuilder) -> Result<Response, Error> {
    r.send()
        .await
        .map_err(Error::SendingRequest)?
        .error_for_status()
        .map_err(Error::Server)
}

// process request and deserialize JSON response
async fn process_deserialize_request<T>(r: RequestBuilder) -> Result<T, Error>
where
    T: for<'de> serde::de::Deserialize<'de>,
{
    process_request(r)
        .await?
        .json::<T>()
        .await
        .map_err(Error::Deserialize)
}

#[derive(Serialize)]
struct CustomerParams<'a> {
    customer: &'a str,
}

#[derive(Serialize)]
struct TableParams<'a> {
    customer: &'a str,
    table: &'a str,
}

#[derive(Serialize)]
struct UserParams<'a> {
    userid: &'a str,
}

impl Client {
    /// Create a new [Client] targeting the provided URL.
    pub fn new(url: &str) -> Result<Self, Error> {
        Ok(url.parse()?)
    }

    /// Create a [Client] for a peer known by its `host:port` address.
    pub fn for_addr(addr: &str) -> Result<Self, Error> {
        Self::new(&format!("http://{addr}"))
    }

    pub fn url(&self) -> &Url {
        &self.server_url
    }

    /// Returns true if the server answers its health check.
    pub async fn healthcheck(&self) -> Result<bool, Error> {
        let response = process_request(self.http_client.get(self.server_url.join("ok")?)).await?;
        Ok(response.status().is_success())
    }

    /// Push a batch of records into a partition on this server. Anything but
    /// `201 Created` is treated as a failure of the whole batch.
    pub async fn replicate(
        &self,
        query: &ReplicateQuery,
        records: &[ReplicateRecord],
    ) -> Result<Replicated, Error> {
        let bytes = basalt_transport::encode_records(records).map_err(Error::ArrowSerialize)?;
        trace!(
            "replicating {} records ({} bytes) to {}",
            records.len(),
            bytes.len(),
            self.server_url
        );

        let response = self
            .http_client
            .post(self.server_url.join("tsdb/replicate")?)
            .query(query)
            .header(CONTENT_TYPE, CONTENT_TYPE_ARROW)
            .header(CONTENT_LENGTH, bytes.len())
            .body(bytes)
            .send()
            .await
            .map_err(Error::SendingRequest)?;

        let status = response.status();
        if status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UnexpectedStatus(status, body));
        }

        response.json().await.map_err(Error::Deserialize)
    }

    /// Ask the metadata coordinator where a partition lives.
    pub async fn discover(&self, request: &DiscoveryRequest) -> Result<DiscoveryResponse, Error> {
        process_deserialize_request(
            self.http_client
                .post(self.server_url.join("metadata/discover")?)
                .json(request),
        )
        .await
    }

    /// Submit a metadata operation (split, join, ...) to the coordinator.
    pub async fn perform_metadata_operation(
        &self,
        envelope: &MetadataOperationEnvelope,
    ) -> Result<MetadataOperationResult, Error> {
        process_deserialize_request(
            self.http_client
                .post(self.server_url.join("metadata/operation")?)
                .json(envelope),
        )
        .await
    }

    /// Latest version of every object held by the config master.
    pub async fn fetch_heads(&self) -> Result<Heads, Error> {
        process_deserialize_request(self.http_client.get(self.server_url.join("master/heads")?))
            .await
    }

    pub async fn fetch_cluster_config(&self) -> Result<ClusterConfig, Error> {
        process_deserialize_request(
            self.http_client
                .get(self.server_url.join("master/cluster_config")?),
        )
        .await
    }

    pub async fn fetch_customer_config(&self, customer: &str) -> Result<CustomerConfig, Error> {
        process_deserialize_request(
            self.http_client
                .get(self.server_url.join("master/customer_config")?)
                .query(&CustomerParams { customer }),
        )
        .await
    }

    pub async fn fetch_table_definition(
        &self,
        customer: &str,
        table: &str,
    ) -> Result<TableDefinition, Error> {
        process_deserialize_request(
            self.http_client
                .get(self.server_url.join("master/table_definition")?)
                .query(&TableParams { customer, table }),
        )
        .await
    }

    pub async fn fetch_user(&self, userid: &str) -> Result<UserConfig, Error> {
        process_deserialize_request(
            self.http_client
                .get(self.server_url.join("master/user")?)
                .query(&UserParams { userid }),
        )
        .await
    }

    /// Update the cluster config on the master. The master only accepts the
    /// update if `config.version` is exactly one past its current version.
    pub async fn update_cluster_config(&self, config: &ClusterConfig) -> Result<ClusterConfig, Error> {
        process_deserialize_request(
            self.http_client
                .post(self.server_url.join("master/cluster_config")?)
                .json(config),
        )
        .await
    }

    pub async fn update_customer_config(
        &self,
        config: &CustomerConfig,
    ) -> Result<CustomerConfig, Error> {
        process_deserialize_request(
            self.http_client
                .post(self.server_url.join("master/customer_config")?)
                .json(config),
        )
        .await
    }

    pub async fn update_table_definition(
        &self,
        table: &TableDefinition,
    ) -> Result<TableDefinition, Error> {
        process_deserialize_request(
            self.http_client
                .post(self.server_url.join("master/table_definition")?)
                .json(table),
        )
        .await
    }

    pub async fn update_user(&self, user: &UserConfig) -> Result<UserConfig, Error> {
        process_deserialize_request(
            self.http_client
                .post(self.server_url.join("master/user")?)
                .json(user),
        )
        .await
    }
}
