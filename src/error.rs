//! Unified error type for the sinkproxy core.
//!
//! Every subsystem (C1-C11 in the design doc) returns `core::Result<T>`.
//! Component-local detail nests inside a variant here rather than leaking
//! its own error enum across a module boundary.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("invalid bind address: {0}")]
    InvalidBindAddress(String),
    #[error("invalid upstream server: {0}")]
    InvalidUpstreamServer(String),
    #[error("invalid cache size: {0}")]
    InvalidCacheSize(String),
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
    #[error("preference parse error: {0}")]
    ParseError(String),
}

#[derive(Debug, Clone, Error)]
pub enum CoreError {
    // --- C1 wire codec ---
    #[error("malformed DNS packet: {0}")]
    MalformedPacket(String),

    // --- C2 rule store ---
    #[error("rule store unavailable: {0}")]
    StorageUnavailable(String),
    #[error("rule store corrupt: {0}")]
    StorageCorrupt(String),

    // --- C3 rule-set cache ---
    #[error("cache disk IO error: {0}")]
    CacheIoError(String),

    // --- C4 format parsers ---
    #[error("parse error at {line_or_field}: {message}")]
    ParseError {
        line_or_field: String,
        message: String,
    },

    // --- C5 fetcher ---
    #[error("fetch failed (transport={transport:?}, status={status:?}): {message}")]
    FetchFailed {
        transport: Option<String>,
        status: Option<u16>,
        message: String,
    },

    // --- C7 manifest resolver ---
    #[error("manifest not found: {0}")]
    ManifestNotFound(String),
    #[error("circular manifest dependency at {0}")]
    ManifestCircularDependency(String),
    #[error("manifest validation error: {0}")]
    ManifestValidation(String),
    #[error("invalid manifest condition: {0}")]
    ManifestInvalidCondition(String),

    // --- C8 interface binder / retry ---
    #[error("no satisfied network interface available")]
    InterfaceUnavailable,
    #[error("exhausted retry budget after {attempts} attempts")]
    ExhaustedRetries { attempts: u32 },

    // --- cross-cutting ---
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation timed out")]
    Timeout,
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io(err.to_string())
    }
}
