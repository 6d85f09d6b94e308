//! Typed error hierarchy for the agent broker.
//!
//! Four enums cover the layers of the service:
//! - `SendError` — a single connection handle refused a payload
//! - `RegistryError` — lookup and delivery failures reported by the registry
//! - `ProtocolError` — command building and agent message parsing
//! - `BrokerError` — server startup and configuration failures

use thiserror::Error;

/// Failure of one connection handle to accept an outbound payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("connection is closed")]
    Closed,

    #[error("outbound queue is full")]
    Full,
}

/// Errors returned by the agent registry.
///
/// Both variants describe the same failure class: the agent cannot be reached
/// right now. `get` reports `NotFound`; `send_to` collapses every cause into
/// `NotAvailable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("agent not found")]
    NotFound,

    #[error("agent not available")]
    NotAvailable,
}

/// Errors from the agent wire protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid command payload")]
    InvalidCommand,

    #[error("unsupported message type")]
    UnsupportedMessage,

    #[error("invalid agent message: {0}")]
    Malformed(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Errors from the broker server and its configuration.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Failed to read config file at {path}: {source}")]
    ConfigRead {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[source] toml::de::Error),

    #[error("Invalid value '{value}' for {key}")]
    InvalidEnv { key: String, value: String },

    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
