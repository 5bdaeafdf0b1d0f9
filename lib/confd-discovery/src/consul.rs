//! Consul agent discovery backend.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use confd_error::{generic_error, GenericError};
use serde::{de::DeserializeOwned, Deserialize};
use serde_with::{serde_as, DefaultOnNull};
use snafu::ResultExt as _;
use tracing::trace;

use crate::{
    backend::{Malformed, Unreachable},
    DiscoveryBackend, DiscoveryError, NodeIdentity, RegistrySnapshot, ServiceRecord,
};

/// Default address of the local Consul agent.
pub const DEFAULT_CONSUL_ADDRESS: &str = "http://127.0.0.1:8500";

const TOKEN_HEADER: &str = "X-Consul-Token";

#[serde_as]
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    service: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    port: u16,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    tags: Vec<String>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    meta: BTreeMap<String, String>,
}

impl From<AgentService> for ServiceRecord {
    fn from(service: AgentService) -> Self {
        Self {
            id: service.id,
            name: service.service,
            address: service.address,
            port: service.port,
            tags: service.tags,
            meta: service.meta,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentSelf {
    config: AgentSelfConfig,
    member: AgentSelfMember,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentSelfConfig {
    node_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentSelfMember {
    addr: String,
}

/// Discovery backend backed by the local Consul agent's HTTP API.
///
/// Services come from `/v1/agent/services` and the node identity from `/v1/agent/self`.
pub struct ConsulAgentBackend {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ConsulAgentBackend {
    /// Creates a new `ConsulAgentBackend` talking to the agent at `base_url`.
    ///
    /// # Errors
    ///
    /// If the HTTP client cannot be built, an error is returned.
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self, GenericError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| generic_error!("Failed to build Consul HTTP client: {}", e))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, DiscoveryError> {
        let url = format!("{}{}", self.base_url, path);
        trace!(%url, "Querying Consul agent.");

        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }

        let response = request
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(GenericError::from)
            .context(Unreachable { url: url.clone() })?;
        let body = response
            .bytes()
            .await
            .map_err(GenericError::from)
            .context(Unreachable { url: url.clone() })?;

        serde_json::from_slice(&body).context(Malformed { url })
    }
}

#[async_trait]
impl DiscoveryBackend for ConsulAgentBackend {
    async fn list_services(&self) -> Result<RegistrySnapshot, DiscoveryError> {
        let services = self.get_json::<BTreeMap<String, AgentService>>("/v1/agent/services").await?;
        Ok(services.into_values().map(ServiceRecord::from).collect())
    }

    async fn self_info(&self) -> Result<NodeIdentity, DiscoveryError> {
        let agent = self.get_json::<AgentSelf>("/v1/agent/self").await?;
        Ok(NodeIdentity {
            name: agent.config.node_name,
            address: agent.member.addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::{http::HeaderMap, routing::get, Router};
    use tokio::net::TcpListener;

    use super::*;

    const SERVICES: &str = r#"{
        "web-1": {"ID": "web-1", "Service": "web-php-fpm", "Tags": null, "Meta": null, "Address": "10.0.0.1", "Port": 9000},
        "api-1": {"ID": "api-1", "Service": "api-go-expvar", "Tags": ["v2"], "Meta": {"team": "core"}, "Address": "", "Port": 8080}
    }"#;

    const AGENT_SELF: &str = r#"{
        "Config": {"NodeName": "node-7", "Datacenter": "dc1"},
        "Member": {"Name": "node-7", "Addr": "10.0.0.7", "Port": 8301}
    }"#;

    async fn spawn_agent(router: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        addr
    }

    fn backend(addr: SocketAddr, token: Option<&str>) -> ConsulAgentBackend {
        ConsulAgentBackend::new(
            format!("http://{}/", addr),
            token.map(str::to_string),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn lists_services() {
        let addr = spawn_agent(Router::new().route("/v1/agent/services", get(|| async { SERVICES }))).await;

        let snapshot = backend(addr, None).list_services().await.unwrap();
        assert_eq!(snapshot.len(), 2);

        let web = snapshot.get("web-1").unwrap();
        assert_eq!(web.name, "web-php-fpm");
        assert_eq!(web.address, "10.0.0.1");
        assert_eq!(web.port, 9000);
        assert!(web.tags.is_empty());
        assert!(web.meta.is_empty());

        let api = snapshot.get("api-1").unwrap();
        assert_eq!(api.tags, vec!["v2".to_string()]);
        assert_eq!(api.meta.get("team").map(String::as_str), Some("core"));
        assert_eq!(api.address, "");
    }

    #[tokio::test]
    async fn reads_node_identity() {
        let addr = spawn_agent(Router::new().route("/v1/agent/self", get(|| async { AGENT_SELF }))).await;

        let node = backend(addr, None).self_info().await.unwrap();
        assert_eq!(
            node,
            NodeIdentity {
                name: "node-7".to_string(),
                address: "10.0.0.7".to_string()
            }
        );
    }

    #[tokio::test]
    async fn sends_token() {
        let router = Router::new().route(
            "/v1/agent/services",
            get(|headers: HeaderMap| async move {
                match headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
                    Some("s3cr3t") => (axum::http::StatusCode::OK, "{}"),
                    _ => (axum::http::StatusCode::FORBIDDEN, "ACL not found"),
                }
            }),
        );
        let addr = spawn_agent(router).await;

        assert!(backend(addr, Some("s3cr3t")).list_services().await.unwrap().is_empty());
        assert!(matches!(
            backend(addr, None).list_services().await,
            Err(DiscoveryError::Unreachable { .. })
        ));
    }

    #[tokio::test]
    async fn malformed_body() {
        let addr = spawn_agent(Router::new().route("/v1/agent/services", get(|| async { "[1, 2" }))).await;

        assert!(matches!(
            backend(addr, None).list_services().await,
            Err(DiscoveryError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_agent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(matches!(
            backend(addr, None).self_info().await,
            Err(DiscoveryError::Unreachable { .. })
        ));
    }
}
