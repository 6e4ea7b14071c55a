//! Client for the broker's control REST API.

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::error::{Result, TunnelError};
use crate::protocol::{TunnelId, TunnelProtocol};

/// A tunnel as allocated by the broker. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelDescriptor {
    pub id: TunnelId,
    pub protocol: TunnelProtocol,
    pub local_host: String,
    pub local_port: u16,
    pub public_address: String,
}

impl TunnelDescriptor {
    /// Public address with a scheme prefix, for display
    pub fn public_url(&self) -> String {
        if self.public_address.contains("://") {
            self.public_address.clone()
        } else {
            format!("{}://{}", self.protocol.scheme(), self.public_address)
        }
    }
}

/// Tunnel registration as seen by the lifecycle controller
pub trait Broker {
    async fn create_tunnel(
        &self,
        protocol: TunnelProtocol,
        local_host: &str,
        local_port: u16,
    ) -> Result<TunnelDescriptor>;

    async fn stop_tunnel(&self, id: &TunnelId) -> Result<()>;

    /// WebSocket URL of the session channel for `id`
    fn channel_url(&self, id: &TunnelId) -> Result<Url>;

    /// Bearer credential presented during the channel handshake
    fn token(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct CreateTunnelRequest<'a> {
    protocol: TunnelProtocol,
    local_host: &'a str,
    local_port: u16,
}

#[derive(Debug, Deserialize)]
struct CreateTunnelResponse {
    tunnel_id: String,
    #[serde(alias = "url", alias = "public_url")]
    public_address: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(alias = "error")]
    message: Option<String>,
}

pub struct ControlClient {
    http: Client,
    server: Url,
    token: String,
}

impl ControlClient {
    pub fn new(server: &str, token: String) -> Result<Self> {
        let server = Url::parse(server)
            .map_err(|e| TunnelError::Protocol(format!("Invalid server URL '{}': {}", server, e)))?;

        Ok(Self {
            http: Client::new(),
            server,
            token,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.server.clone();
        url.path_segments_mut()
            .map_err(|_| TunnelError::Protocol(format!("Server URL cannot be a base: {}", self.server)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

impl Broker for ControlClient {
    async fn create_tunnel(
        &self,
        protocol: TunnelProtocol,
        local_host: &str,
        local_port: u16,
    ) -> Result<TunnelDescriptor> {
        let url = self.endpoint(&["tunnel", "create"])?;
        debug!("POST {}", url);

        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&CreateTunnelRequest {
                protocol,
                local_host,
                local_port,
            })
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(TunnelError::Auth);
        }
        if !status.is_success() {
            return Err(broker_error(status, resp).await);
        }

        let body: CreateTunnelResponse = resp.json().await.map_err(|e| {
            TunnelError::Protocol(format!("Unexpected create-tunnel response: {}", e))
        })?;

        info!("Tunnel {} created at {}", body.tunnel_id, body.public_address);

        Ok(TunnelDescriptor {
            id: TunnelId(body.tunnel_id),
            protocol,
            local_host: local_host.to_string(),
            local_port,
            public_address: body.public_address,
        })
    }

    async fn stop_tunnel(&self, id: &TunnelId) -> Result<()> {
        let url = self.endpoint(&["tunnel", &id.0])?;
        debug!("DELETE {}", url);

        let resp = self.http.delete(url).bearer_auth(&self.token).send().await?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(TunnelError::Auth);
        }
        if !status.is_success() {
            return Err(broker_error(status, resp).await);
        }

        info!("Tunnel {} stopped", id);
        Ok(())
    }

    fn channel_url(&self, id: &TunnelId) -> Result<Url> {
        let mut url = self.endpoint(&["ws", "tunnel", &id.0])?;
        let scheme = if self.server.scheme() == "https" {
            "wss"
        } else {
            "ws"
        };
        url.set_scheme(scheme)
            .map_err(|_| TunnelError::Protocol(format!("Cannot derive channel URL from {}", self.server)))?;
        Ok(url)
    }

    fn token(&self) -> &str {
        &self.token
    }
}

async fn broker_error(status: StatusCode, resp: reqwest::Response) -> TunnelError {
    let text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .and_then(|b| b.message)
        .or_else(|| (!text.trim().is_empty()).then(|| text.trim().to_string()))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("Unknown error")
                .to_string()
        });

    TunnelError::Broker {
        status: status.as_u16(),
        message,
    }
}
