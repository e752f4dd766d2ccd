//! Error taxonomy for the sync client.

use tokio_tungstenite::tungstenite;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Transport-level failure. Retried by the reconnect scheduler.
    #[error("network error: {0}")]
    Network(String),

    /// Credentials rejected or no usable cursor could be obtained.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A response did not have the expected shape.
    #[error("unexpected response: {0}")]
    Validation(String),

    /// One payload or delta entry could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),

    /// Local setup problem (bad header value, unreadable appstate).
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Authentication(_) => "authentication",
            Self::Validation(_) => "validation",
            Self::Parse(_) => "parse",
            Self::Config(_) => "config",
        }
    }

    /// Whether the reconnect scheduler should try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Self::Authentication(format!("http request rejected ({status})"));
            }
        }
        if err.is_decode() {
            return Self::Validation(err.to_string());
        }
        Self::Network(err.to_string())
    }

    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        match &err {
            tungstenite::Error::Http(response) => {
                let status = response.status();
                if status.as_u16() == 401 || status.as_u16() == 403 {
                    Self::Authentication(format!("edge refused upgrade ({status})"))
                } else {
                    Self::Network(format!("edge upgrade failed ({status})"))
                }
            }
            _ => Self::Network(err.to_string()),
        }
    }
}

impl From<mqtt_wire::CodecError> for SyncError {
    fn from(err: mqtt_wire::CodecError) -> Self {
        Self::Network(format!("mqtt stream corrupted: {err}"))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}
