/// Errors returned by a `MessageSource` before they are normalized for the
/// public task session API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// Upstream answered with an application-level failure (HTTP status, auth, etc.).
    #[error("upstream error: {message}")]
    Upstream {
        message: String,
        status_code: Option<u16>,
    },
    /// Transport or stream I/O failed.
    #[error("transport error: {message}")]
    Transport { message: String },
    /// A payload could not be decoded into the wire contract.
    #[error("malformed event: {message}")]
    Malformed { message: String },
}

impl SourceError {
    /// Creates an upstream-level error.
    pub fn upstream(message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self::Upstream {
            message: message.into(),
            status_code,
        }
    }

    /// Creates a transport-level error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a malformed-payload error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    /// Malformed payloads are skipped by stream consumers instead of ending
    /// the stream.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }

    /// Returns the human-readable message for this error.
    pub fn message(&self) -> &str {
        match self {
            Self::Upstream { message, .. }
            | Self::Transport { message }
            | Self::Malformed { message } => message,
        }
    }
}

/// Top-level error type for the public task stream API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Invalid session or source configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid caller input.
    #[error("validation error: {0}")]
    Validation(String),
    /// Upstream failure surfaced outside a stream.
    #[error(transparent)]
    Source(SourceError),
    /// An optimistic send was never confirmed by the server.
    #[error("send failed ({local_id}): {reason}")]
    SendFailed { local_id: uuid::Uuid, reason: String },
    /// Operation was abandoned with its scope.
    #[error("cancelled")]
    Cancelled,
    /// The task session event loop is no longer running.
    #[error("task session closed")]
    Closed,
}

impl From<SourceError> for StreamError {
    fn from(value: SourceError) -> Self {
        StreamError::Source(value)
    }
}
