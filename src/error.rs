use thiserror::Error;

/// Main error type for the bucket trim subsystem
#[derive(Error, Debug)]
pub enum TrimError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Watch/notify errors
    #[error("Subscription error: {0}")]
    Subscription(#[from] StoreError),

    // Wire errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // State machine errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for TrimError
pub type Result<T> = std::result::Result<T, TrimError>;

/// Errors reported by the backing object store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("watch not connected: cookie {0}")]
    NotConnected(u64),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("{0}")]
    Other(String),
}

/// Errors raised while decoding peer messages
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("{message} compat {compat} is newer than supported version {supported}")]
    UnsupportedVersion {
        message: &'static str,
        compat: u8,
        supported: u8,
    },

    #[error("malformed message: {0}")]
    Malformed(String),
}

impl ProtocolError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        ProtocolError::Malformed(reason.into())
    }
}
