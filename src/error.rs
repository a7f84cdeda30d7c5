// src/error.rs

//! Unified error handling for feedhub.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Result type alias for feedhub operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization failed
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// Repository query or transaction failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Upstream answered, but not with something usable
    #[error("Upstream error for {source_id}: {message}")]
    Upstream { source_id: String, message: String },

    /// Fetch exceeded its per-call timeout
    #[error("Fetch for {source_id} timed out after {secs}s")]
    Timeout { source_id: String, secs: u64 },

    /// Circuit breaker rejected the call without invoking it
    #[error("Circuit breaker open for {source_id}")]
    BreakerOpen { source_id: String },

    /// Feed requested for a source that is not configured
    #[error("Unknown source: {0}")]
    UnknownSource(String),

    /// Feed document could not be rendered
    #[error("Render error: {0}")]
    Render(String),

    /// Operation refused because the scheduler is stopping
    #[error("Scheduler is shut down")]
    ShuttingDown,

    /// A task panicked; the panic was contained
    #[error("Task panicked: {0}")]
    Panicked(String),

    /// Error produced once by a coalesced call and handed to every waiter
    #[error(transparent)]
    Shared(Arc<AppError>),
}

impl AppError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create an upstream error with the source it came from.
    pub fn upstream(source_id: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Upstream {
            source_id: source_id.into(),
            message: message.to_string(),
        }
    }

    /// Create a render error.
    pub fn render(message: impl fmt::Display) -> Self {
        Self::Render(message.to_string())
    }

    /// Whether this error is a breaker short-circuit, looking through shared wrappers.
    pub fn is_breaker_open(&self) -> bool {
        match self {
            Self::BreakerOpen { .. } => true,
            Self::Shared(inner) => inner.is_breaker_open(),
            _ => false,
        }
    }

    /// Convert a caught panic payload into an error.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::Panicked(panic_message(payload.as_ref()))
    }
}

/// Message carried by a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
