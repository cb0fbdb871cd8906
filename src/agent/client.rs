//! Node agent client
//!
//! One short-lived HTTP client per logical operation. Idle pooling is off
//! so dropping the connection closes the socket, and every call runs under
//! the caller's deadline.

use super::protocol::{
    routes, AgentFailure, CleanPathBody, CreatePrimitiveBody, CreateSnapshotBody,
    DeleteSnapshotBody, ExpandPrimitiveBody, ListLogicalVolumesBody, PrimitiveTarget,
    SetQuotaBody, TagsBody,
};
use crate::domain::ports::{NodeAgent, NodeConnector};
use crate::domain::volume::{CreateOptions, Primitive, PrimitiveRef};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Client Configuration
// =============================================================================

/// Configuration for node agent connections
#[derive(Debug, Clone)]
pub struct AgentClientConfig {
    /// URL scheme of the agent endpoint
    pub scheme: String,
    /// Deadline for each call on a connection
    pub call_timeout: Duration,
}

impl Default for AgentClientConfig {
    fn default() -> Self {
        Self {
            scheme: "http".into(),
            call_timeout: Duration::from_secs(9),
        }
    }
}

/// `address` with `default_port` appended when it names no port
///
/// Accepts `host`, `host:port`, bare IPv4 or IPv6 addresses and
/// `[v6]:port`. A bare IPv6 address gets bracketed.
pub fn with_default_port(address: &str, default_port: u16) -> String {
    if address.parse::<SocketAddr>().is_ok() {
        return address.to_string();
    }
    let bare = address.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return SocketAddr::new(ip, default_port).to_string();
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => {
            address.to_string()
        }
        _ => format!("{}:{}", address, default_port),
    }
}

// =============================================================================
// Connector
// =============================================================================

/// [`NodeConnector`] speaking the agent protocol over HTTP
pub struct HttpNodeConnector {
    config: AgentClientConfig,
}

impl HttpNodeConnector {
    pub fn new(config: AgentClientConfig) -> Arc<Self> {
        Arc::new(Self { config })
    }
}

#[async_trait]
impl NodeConnector for HttpNodeConnector {
    async fn connect(&self, address: &str, timeout: Duration) -> Result<Box<dyn NodeAgent>> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| Error::Internal(format!("building agent client: {}", e)))?;

        let connection = AgentConnection {
            client,
            base: format!("{}://{}", self.config.scheme, address),
            address: address.to_string(),
            call_timeout: self.config.call_timeout,
        };

        let health = connection.client.get(connection.url(routes::HEALTH)).send();
        match tokio::time::timeout(timeout, health).await {
            Err(_) => {
                return Err(Error::unavailable(
                    address,
                    format!("no answer within {:?}", timeout),
                ))
            }
            Ok(Err(e)) => return Err(Error::unavailable(address, e.to_string())),
            Ok(Ok(response)) if !response.status().is_success() => {
                return Err(Error::unavailable(
                    address,
                    format!("health probe returned {}", response.status()),
                ))
            }
            Ok(Ok(_)) => {}
        }

        debug!("Connected to node agent at {}", address);
        Ok(Box::new(connection))
    }
}

// =============================================================================
// Connection
// =============================================================================

/// Open connection to one node agent
pub struct AgentConnection {
    client: reqwest::Client,
    base: String,
    address: String,
    call_timeout: Duration,
}

impl AgentConnection {
    fn url(&self, route: &str) -> String {
        format!("{}{}", self.base, route)
    }

    async fn call<B, R>(&self, route: &str, body: &B) -> Result<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let exchange = async {
            let response = self
                .client
                .post(self.url(route))
                .json(body)
                .send()
                .await
                .map_err(|e| Error::unavailable(self.address.as_str(), e.to_string()))?;

            let status = response.status();
            if status.is_success() {
                return response.json::<R>().await.map_err(|e| {
                    Error::Internal(format!("decoding {} reply from {}: {}", route, self.address, e))
                });
            }

            let failure = response.json::<AgentFailure>().await.map_err(|e| {
                Error::Internal(format!(
                    "agent {} answered {} with an unreadable body: {}",
                    self.address, status, e
                ))
            })?;
            Err(failure.into_error(&self.address))
        };

        tokio::time::timeout(self.call_timeout, exchange)
            .await
            .map_err(|_| {
                Error::unavailable(
                    self.address.as_str(),
                    format!("{} exceeded deadline of {:?}", route, self.call_timeout),
                )
            })?
    }
}

#[async_trait]
impl NodeAgent for AgentConnection {
    async fn get_primitive(&self, target: &PrimitiveRef) -> Result<Option<Primitive>> {
        self.call(
            routes::GET_PRIMITIVE,
            &PrimitiveTarget {
                target: target.clone(),
            },
        )
        .await
    }

    async fn create_primitive(
        &self,
        target: &PrimitiveRef,
        options: &CreateOptions,
    ) -> Result<Primitive> {
        self.call(
            routes::CREATE_PRIMITIVE,
            &CreatePrimitiveBody {
                target: target.clone(),
                options: options.clone(),
            },
        )
        .await
    }

    async fn delete_primitive(&self, target: &PrimitiveRef) -> Result<()> {
        self.call(
            routes::DELETE_PRIMITIVE,
            &PrimitiveTarget {
                target: target.clone(),
            },
        )
        .await
    }

    async fn expand_primitive(&self, target: &PrimitiveRef, size_bytes: u64) -> Result<()> {
        self.call(
            routes::EXPAND_PRIMITIVE,
            &ExpandPrimitiveBody {
                target: target.clone(),
                size_bytes,
            },
        )
        .await
    }

    async fn list_logical_volumes(&self, vg: &str) -> Result<Vec<Primitive>> {
        self.call(
            routes::LIST_LOGICAL_VOLUMES,
            &ListLogicalVolumesBody { vg: vg.to_string() },
        )
        .await
    }

    async fn create_snapshot(
        &self,
        vg: &str,
        name: &str,
        source: &str,
        size_bytes: u64,
    ) -> Result<Primitive> {
        self.call(
            routes::CREATE_SNAPSHOT,
            &CreateSnapshotBody {
                vg: vg.to_string(),
                name: name.to_string(),
                source: source.to_string(),
                size_bytes,
            },
        )
        .await
    }

    async fn delete_snapshot(&self, vg: &str, name: &str) -> Result<()> {
        self.call(
            routes::DELETE_SNAPSHOT,
            &DeleteSnapshotBody {
                vg: vg.to_string(),
                name: name.to_string(),
            },
        )
        .await
    }

    async fn add_tags(&self, target: &PrimitiveRef, tags: &[String]) -> Result<()> {
        self.call(
            routes::ADD_TAGS,
            &TagsBody {
                target: target.clone(),
                tags: tags.to_vec(),
            },
        )
        .await
    }

    async fn remove_tags(&self, target: &PrimitiveRef, tags: &[String]) -> Result<()> {
        self.call(
            routes::REMOVE_TAGS,
            &TagsBody {
                target: target.clone(),
                tags: tags.to_vec(),
            },
        )
        .await
    }

    async fn set_quota(&self, path: &str, soft_kib: u64, hard_kib: u64) -> Result<()> {
        self.call(
            routes::SET_QUOTA,
            &SetQuotaBody {
                path: path.to_string(),
                soft_kib,
                hard_kib,
            },
        )
        .await
    }

    async fn clean_path(&self, path: &str) -> Result<()> {
        self.call(
            routes::CLEAN_PATH,
            &CleanPathBody {
                path: path.to_string(),
            },
        )
        .await
    }

    fn close(self: Box<Self>) {
        debug!("Closing node agent connection to {}", self.address);
    }
}
