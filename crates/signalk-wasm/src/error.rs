//! Plugin runtime error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("invalid manifest: {0}")]
    ManifestInvalid(String),

    #[error("binary load error: {0}")]
    BinaryLoad(String),

    #[error("memory access out of bounds: ptr={ptr} len={len} memory size={size}")]
    MemoryAccess { ptr: u64, len: u64, size: u64 },

    #[error("capability denied: {0}")]
    CapabilityDenied(String),

    #[error("plugin protocol error: {0}")]
    Protocol(String),

    #[error("command not allowed: {0}")]
    CommandNotAllowed(String),

    #[error("handler not implemented: {0}")]
    HandlerNotImplemented(String),

    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("plugin already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("plugin {plugin} trapped: {message}")]
    Trap { plugin: String, message: String },

    #[error("execution timeout: plugin {0} exceeded fuel limit")]
    FuelExhausted(String),

    #[error("memory limit exceeded: plugin {0}")]
    MemoryExceeded(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("socket error: {0}")]
    Socket(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("semver error: {0}")]
    Semver(#[from] semver::Error),
}

impl PluginError {
    /// Guest faults that leave the instance unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PluginError::Trap { .. } | PluginError::FuelExhausted(_) | PluginError::MemoryExceeded(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PluginError>;
