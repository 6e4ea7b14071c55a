use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error(
        "Invalid or expired API token. Update it with: hixtunnel auth --token <YOUR_API_TOKEN>"
    )]
    Auth,

    #[error("Broker rejected the request ({status}): {message}")]
    Broker { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Local service error: {0}")]
    LocalService(String),

    #[error("Session closed: {reason}")]
    SessionClosed { reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Only transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TunnelError::Network(_))
    }
}

impl From<reqwest::Error> for TunnelError {
    fn from(e: reqwest::Error) -> Self {
        TunnelError::Network(e.to_string())
    }
}

impl From<tungstenite::Error> for TunnelError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::Http(response)
                if response.status() == http::StatusCode::UNAUTHORIZED
                    || response.status() == http::StatusCode::FORBIDDEN =>
            {
                TunnelError::Auth
            }
            other => TunnelError::Network(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;
