/// Failure of the push transport for a run (connect, read, or unexpected close).
///
/// Transport errors are never fatal: the connection retries with backoff.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The transport could not be opened.
    #[error("connect failed: {0}")]
    Connect(String),
    /// Reading from an open transport failed.
    #[error("stream read failed: {0}")]
    Stream(String),
    /// The producer closed the stream before sending `done`.
    #[error("stream closed by producer")]
    Closed,
}

impl TransportError {
    /// Creates a connect-time error.
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect(message.into())
    }

    /// Creates a read-time error.
    pub fn stream(message: impl Into<String>) -> Self {
        Self::Stream(message.into())
    }
}

/// A single inbound message could not be turned into a [`crate::RunEvent`].
///
/// The message is dropped; the stream continues.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid envelope JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error("envelope has no type")]
    MissingType,
    #[error("unknown event type: {0}")]
    UnknownType(String),
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Error returned by a run event handler. Logged by the dispatcher, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("handler error: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Record storage failure. Persistence is best-effort, so callers log and drop these.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("config error: {0}")]
pub struct ConfigError(pub String);

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
