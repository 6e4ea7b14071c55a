//! HTTP tunnel handler: replays relayed requests against the local service.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::session::{FrameHandler, FrameSender};
use crate::error::{Result, TunnelError};
use crate::protocol::{HeaderField, RelayedRequest, RelayedResponse};

/// Headers that only make sense on a single hop
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

pub struct HttpRelay {
    client: Client,
    local_host: String,
    local_port: u16,
    timeout: Duration,
    sender: FrameSender,
    tasks: TaskTracker,
}

impl HttpRelay {
    pub fn new(
        local_host: &str,
        local_port: u16,
        timeout: Duration,
        sender: FrameSender,
        tasks: TaskTracker,
    ) -> Result<Self> {
        // Redirects are the local service's answer, not ours to follow
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self {
            client,
            local_host: local_host.to_string(),
            local_port,
            timeout,
            sender,
            tasks,
        })
    }
}

impl FrameHandler for HttpRelay {
    async fn on_frame(&mut self, payload: serde_json::Value) {
        let request: RelayedRequest = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("Ignoring malformed request frame: {}", e);
                return;
            }
        };

        debug!(
            correlation_id = %request.correlation_id,
            "{} {} -> {}:{}",
            request.method,
            request.path,
            self.local_host,
            self.local_port
        );

        let client = self.client.clone();
        let local_host = self.local_host.clone();
        let local_port = self.local_port;
        let timeout = self.timeout;
        let sender = self.sender.clone();

        self.tasks.spawn(async move {
            let response = relay_request(&client, &local_host, local_port, timeout, request).await;
            let correlation_id = response.correlation_id.clone();
            if let Err(e) = sender.send_payload(&response).await {
                warn!(correlation_id = %correlation_id, "Dropping response: {}", e);
            }
        });
    }
}

/// Run one request against the local service. Failures become synthetic
/// responses for this request only.
pub async fn relay_request(
    client: &Client,
    local_host: &str,
    local_port: u16,
    timeout: Duration,
    request: RelayedRequest,
) -> RelayedResponse {
    let start = Instant::now();
    let correlation_id = request.correlation_id.clone();
    let method = request.method.clone();
    let path = request.path.clone();

    let body = match request.body_bytes() {
        Ok(body) => body,
        Err(e) => {
            warn!("{} {} -> undecodable body: {}", method, path, e);
            let response = RelayedResponse::synthetic(
                correlation_id,
                400,
                &format!("Bad Request: body is not valid base64: {}", e),
            );
            log_request(&method, &path, response.status, start);
            return response;
        }
    };

    let outcome = tokio::time::timeout(
        timeout,
        forward_http_request(client, local_host, local_port, request, body),
    )
    .await;

    let response = match outcome {
        Ok(Ok((status, headers, body))) => {
            RelayedResponse::new(correlation_id, status, headers, body)
        }
        Ok(Err(e)) => {
            warn!("{} {} -> error: {}", method, path, e);
            RelayedResponse::synthetic(correlation_id, 502, &format!("Bad Gateway: {}", e))
        }
        Err(_) => {
            warn!("{} {} -> timed out after {:?}", method, path, timeout);
            RelayedResponse::synthetic(
                correlation_id,
                504,
                &format!("Gateway Timeout: no response within {:?}", timeout),
            )
        }
    };

    log_request(&method, &path, response.status, start);
    response
}

fn log_request(method: &str, path: &str, status: u16, start: Instant) {
    info!(
        "{} {} -> {} ({} ms)",
        method,
        path,
        status,
        start.elapsed().as_millis()
    );
}

/// Forward an HTTP request to the local service
async fn forward_http_request(
    client: &Client,
    local_host: &str,
    local_port: u16,
    request: RelayedRequest,
    body: Option<Vec<u8>>,
) -> Result<(u16, HashMap<String, HeaderField>, Option<Vec<u8>>)> {
    let path = if request.path.starts_with('/') {
        request.path
    } else {
        format!("/{}", request.path)
    };
    let url = format!("http://{}:{}{}", local_host, local_port, path);

    let method = reqwest::Method::from_str(&request.method)
        .map_err(|e| TunnelError::LocalService(format!("invalid method: {}", e)))?;
    let mut builder = client.request(method, &url);

    // Add headers (skip hop-by-hop headers; reqwest sets Host itself)
    let mut header_map = HeaderMap::with_capacity(request.headers.len());
    for (name, value) in request.headers {
        let name_lower = name.to_lowercase();
        if is_hop_by_hop(&name_lower) || name_lower == "host" {
            continue;
        }

        if let (Ok(header_name), Ok(header_value)) =
            (HeaderName::from_str(&name), HeaderValue::from_str(&value))
        {
            header_map.insert(header_name, header_value);
        }
    }
    builder = builder.headers(header_map);

    if let Some(body_data) = body {
        builder = builder.body(body_data);
    }

    let response = builder
        .send()
        .await
        .map_err(|e| TunnelError::LocalService(e.to_string()))?;

    let status = response.status().as_u16();

    let mut headers: HashMap<String, HeaderField> = HashMap::new();
    for (name, value) in response.headers() {
        let name = name.as_str().to_lowercase();
        if is_hop_by_hop(&name) {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        match headers.entry(name) {
            // Cookie attributes contain commas, so cookies are never folded
            Entry::Occupied(mut entry) if entry.key() == "set-cookie" => {
                entry.get_mut().push(value)
            }
            Entry::Occupied(mut entry) => entry.get_mut().fold(value),
            Entry::Vacant(entry) => {
                entry.insert(HeaderField::from(value));
            }
        }
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| TunnelError::LocalService(e.to_string()))?;
    let body = if body.is_empty() {
        None
    } else {
        Some(body.to_vec())
    };

    Ok((status, headers, body))
}
