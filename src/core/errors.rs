use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Order rejected: {0}")]
    Order(String),

    #[error("Rate limit exhausted: {0}")]
    RateLimit(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("JSON parsing error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::core::config::ConfigError),
}

impl ClientError {
    /// Whether the failure is tied to the current connection rather than to
    /// the request that observed it. Connection-scoped failures drive a
    /// reconnect; request-level errors surface to the caller as-is.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Framing(_))
    }
}
