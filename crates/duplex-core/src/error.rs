//! Error types for the duplex protocol core

use crate::iu::IuId;
use thiserror::Error;

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the incremental-unit protocol, the dialogue history and
/// configuration loading.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Missing or contradictory parameters. Fatal at setup, never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A programming error against the IU lifecycle (confirming a revoked unit,
    /// touching another stage's unit, committing out of clause order).
    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Unknown incremental unit {0}")]
    UnknownIu(IuId),

    #[error("Config load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("TOML render error: {0}")]
    Toml(#[from] toml::ser::Error),
}

impl CoreError {
    /// Configuration errors stop the session; everything else is scoped to a turn.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::Config(_) | CoreError::ConfigLoad(_))
    }
}
