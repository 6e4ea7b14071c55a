use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::{ConnectionId, CorrelationId};

/// Kind of local service being exposed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProtocol {
    Http,
    Tcp,
}

impl TunnelProtocol {
    /// Scheme prefix used when showing the public address
    pub fn scheme(&self) -> &'static str {
        match self {
            TunnelProtocol::Http => "http",
            TunnelProtocol::Tcp => "tcp",
        }
    }
}

impl fmt::Display for TunnelProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

impl FromStr for TunnelProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(TunnelProtocol::Http),
            "tcp" => Ok(TunnelProtocol::Tcp),
            other => Err(format!("unsupported protocol '{}', expected http or tcp", other)),
        }
    }
}

/// Envelope of every message on the session channel.
///
/// The session only looks at `type`; payloads stay opaque JSON until the
/// protocol-specific handler decodes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Data { payload: serde_json::Value },
    Error { message: String },
}

impl Frame {
    pub fn data<T: Serialize>(payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Frame::Data {
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// HTTP request relayed by the broker (broker -> client)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayedRequest {
    pub correlation_id: CorrelationId,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_encoding: Option<String>,
}

impl RelayedRequest {
    pub fn body_bytes(&self) -> Result<Option<Vec<u8>>, base64::DecodeError> {
        decode_body(self.body.as_deref(), self.body_encoding.as_deref())
    }
}

/// One response header. Values that cannot be comma-folded, like
/// `set-cookie`, are kept as a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderField {
    One(String),
    Many(Vec<String>),
}

impl HeaderField {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderField::One(value) => Some(value),
            HeaderField::Many(_) => None,
        }
    }

    /// Append a repeated value as `a, b`
    pub fn fold(&mut self, value: &str) {
        match self {
            HeaderField::One(existing) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            HeaderField::Many(values) => values.push(value.to_string()),
        }
    }

    /// Append a repeated value as a separate entry
    pub fn push(&mut self, value: &str) {
        match self {
            HeaderField::One(existing) => {
                *self = HeaderField::Many(vec![std::mem::take(existing), value.to_string()]);
            }
            HeaderField::Many(values) => values.push(value.to_string()),
        }
    }
}

impl From<&str> for HeaderField {
    fn from(value: &str) -> Self {
        HeaderField::One(value.to_string())
    }
}

/// Response for a relayed request (client -> broker)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayedResponse {
    pub correlation_id: CorrelationId,
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, HeaderField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_encoding: Option<String>,
}

impl RelayedResponse {
    pub fn new(
        correlation_id: CorrelationId,
        status: u16,
        headers: HashMap<String, HeaderField>,
        body: Option<Vec<u8>>,
    ) -> Self {
        let (body, body_encoding) = encode_body(body);
        RelayedResponse {
            correlation_id,
            status,
            headers,
            body,
            body_encoding,
        }
    }

    /// Plain-text response generated by the relay itself
    pub fn synthetic(correlation_id: CorrelationId, status: u16, message: &str) -> Self {
        let headers = HashMap::from([("content-type".to_string(), HeaderField::from("text/plain"))]);
        Self::new(
            correlation_id,
            status,
            headers,
            Some(message.as_bytes().to_vec()),
        )
    }

    pub fn body_bytes(&self) -> Result<Option<Vec<u8>>, base64::DecodeError> {
        decode_body(self.body.as_deref(), self.body_encoding.as_deref())
    }
}

/// TCP stream events, in both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TcpEvent {
    /// Broker accepted a public connection; dial the local service
    Open { connection_id: ConnectionId },
    /// Local service accepted the dial
    Connected { connection_id: ConnectionId },
    /// A chunk of bytes, base64 encoded
    Data {
        connection_id: ConnectionId,
        data: String,
    },
    /// Sender is done writing (half-close)
    End { connection_id: ConnectionId },
    /// Connection torn down in both directions
    Close {
        connection_id: ConnectionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl TcpEvent {
    pub fn data(connection_id: &ConnectionId, bytes: &[u8]) -> Self {
        TcpEvent::Data {
            connection_id: connection_id.clone(),
            data: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes),
        }
    }

    pub fn close(connection_id: &ConnectionId, reason: &str) -> Self {
        TcpEvent::Close {
            connection_id: connection_id.clone(),
            reason: Some(reason.to_string()),
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        match self {
            TcpEvent::Open { connection_id }
            | TcpEvent::Connected { connection_id }
            | TcpEvent::Data { connection_id, .. }
            | TcpEvent::End { connection_id }
            | TcpEvent::Close { connection_id, .. } => connection_id,
        }
    }
}

fn encode_body(body: Option<Vec<u8>>) -> (Option<String>, Option<String>) {
    match body {
        None => (None, None),
        Some(data) if data.is_empty() => (Some(String::new()), None),
        Some(data) => match String::from_utf8(data) {
            Ok(s) => (Some(s), None),
            Err(e) => {
                // Binary data, encode as base64
                let encoded = base64::Engine::encode(
                    &base64::engine::general_purpose::STANDARD,
                    e.as_bytes(),
                );
                (Some(encoded), Some("base64".to_string()))
            }
        },
    }
}

pub fn decode_body(
    body: Option<&str>,
    encoding: Option<&str>,
) -> Result<Option<Vec<u8>>, base64::DecodeError> {
    let Some(body) = body else {
        return Ok(None);
    };

    match encoding {
        Some("base64") => {
            base64::Engine::decode(&base64::engine::general_purpose::STANDARD, body).map(Some)
        }
        _ => Ok(Some(body.as_bytes().to_vec())),
    }
}
