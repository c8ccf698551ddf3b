use thiserror::Error;

/// Fatal at startup; any of these abort the process before the first network call.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("{0} could not be parsed: {1}")]
    InvalidVar(&'static str, String),

    #[error("API secret is not valid base64: {0}")]
    InvalidSecret(#[from] base64::DecodeError),
}

/// Errors returned by the exchange client (C1).
///
/// The `kind`-level split matters more than the message: callers (mainly the
/// retry policy and the liquidation engine) branch on variant, never on the
/// message text.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("authentication rejected by exchange: {0}")]
    Authentication(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected by exchange: {0}")]
    BusinessRejection(String),

    #[error("submission outcome unknown (network failure after send): {0}")]
    AmbiguousSubmission(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("could not decode exchange response: {0}")]
    Decode(String),
}

impl ExchangeError {
    /// Whether the retry policy (§4.1) should attempt this call again.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExchangeError::Transient(_) => true,
            ExchangeError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ExchangeError::BusinessRejection(msg) => msg.to_ascii_lowercase().contains("invalid nonce"),
            _ => false,
        }
    }
}

/// Errors surfaced by the balance feed (C3).
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("could not decode feed message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("subscription rejected (transient): {0}")]
    TransientSubscription(String),

    #[error("subscription rejected (permanent): {0}")]
    PermanentSubscription(String),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}
