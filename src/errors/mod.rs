//! # Error Handling
//!
//! This module provides error handling for the sidelock sidecar.
//! It defines custom error types using `thiserror` shared across the
//! resource parser, the store client and the lifecycle engine.

use thiserror::Error;

/// Custom result type for sidelock operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the sidelock sidecar
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors (flags, auth file, observability setup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid resource descriptor or failed semantic validation
    #[error("Invalid resource: {0}")]
    Resource(String),

    /// Authentication against the secret store failed
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The secret store rejected or failed a request
    #[error("Store error: {0}")]
    Store(String),

    /// Network transport errors talking to the store
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Template rendering errors
    #[error("Template error: {0}")]
    Template(#[from] tera::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create a new resource error
    pub fn resource<S: Into<String>>(message: S) -> Self {
        Self::Resource(message.into())
    }

    /// Create a new authentication error
    pub fn auth<S: Into<String>>(message: S) -> Self {
        Self::Auth(message.into())
    }

    /// Create a new store error
    pub fn store<S: Into<String>>(message: S) -> Self {
        Self::Store(message.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Whether the error means the store credential is gone for good.
    ///
    /// Once the store answers with the "missing client token" family of
    /// errors the token cannot be recovered by retrying; the process has
    /// to terminate and be restarted with fresh credentials.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Store(message) | Error::Auth(message) => {
                message.contains("missing client token")
            }
            _ => false,
        }
    }
}
