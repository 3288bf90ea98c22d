//! Error types for pairing-core operations.
//!
//! Most public pairing operations never surface these: session and relay
//! calls recover locally and log. They are returned by the storage layer,
//! join-URL parsing and configuration loading.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    // ─────────────────────────────────────────────────────────────────────
    // Storage Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Storage error: {context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Storage lock poisoned: {0}")]
    Poisoned(&'static str),

    // ─────────────────────────────────────────────────────────────────────
    // Join URL Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid join URL: {0}")]
    InvalidJoinUrl(String),

    #[error("Join URL is missing the `{0}` parameter")]
    MissingCredential(&'static str),

    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration malformed: {path}: {details}")]
    Config { path: PathBuf, details: String },
}

impl PairingError {
    pub(crate) fn storage(context: impl Into<String>, source: std::io::Error) -> Self {
        PairingError::Storage {
            context: context.into(),
            source,
        }
    }
}

/// Convenience type alias for Results using PairingError.
pub type Result<T> = std::result::Result<T, PairingError>;
