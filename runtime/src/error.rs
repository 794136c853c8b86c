//! Error types for the runtime subsystems.
//!
//! Each subsystem surfaces a small `thiserror` enum; the CLI and proxy server
//! wrap them in `anyhow` at the edge.

/// Failure to obtain any response from the network.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("network request failed: {0}")]
    Transport(String),

    #[error("network request timed out after {0} ms")]
    Timeout(u64),

    #[error("invalid request url: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for NetworkError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(0)
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Persistent cache store failures.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("cache database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("cache entry encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("cache store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Request resolution failed and no fallback applied.
#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Embed content could not be fetched.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ContentError {
    #[error("HTTP {0}")]
    Status(u16),

    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// Telemetry transmission failures. Never shown to users.
#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("beacon rejected by the platform")]
    BeaconRejected,

    #[error("telemetry endpoint answered HTTP {0}")]
    Status(u16),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("telemetry encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("offline queue unavailable: {0}")]
    Queue(String),
}
