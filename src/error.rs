use std::io;
use thiserror::Error;
use tracing::Level;

/// Application-wide error types
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to reach backend {backend}: {source}")]
    Transport {
        backend: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out during {stage} with backend {backend}")]
    TransportTimeout { backend: String, stage: &'static str },

    #[error("invalid data from backend {backend}: {source}")]
    ProtocolDecode {
        backend: String,
        #[source]
        source: io::Error,
    },

    #[error("no server with MOTD passthrough enabled")]
    NoPassthroughConfigured,

    #[error("MOTD passthrough request timed out")]
    MotdTimeout,

    #[error("config validation failed: {0}")]
    ConfigInvalid(String),

    #[error("failed to persist config: {0}")]
    ConfigPersistFailed(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Returns true if the error indicates a refused connection, either via an
/// `io::Error` with `ConnectionRefused` anywhere in its chain or via a
/// "connection refused" substring in any message of the chain.
pub fn is_connection_refused(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        if e.to_string().to_lowercase().contains("connection refused") {
            return true;
        }
        current = e.source();
    }
    false
}

/// Log level hint for an upstream dial failure. The proxy periodically tries
/// backends that may be intentionally down; refused connections log at debug
/// to keep that quiet. The caller chooses how to emit.
pub fn dial_log_level(err: &(dyn std::error::Error + 'static)) -> Level {
    if is_connection_refused(err) {
        Level::DEBUG
    } else {
        Level::INFO
    }
}
