//! Server error types.

use thiserror::Error;

/// Errors from configuring or starting the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding or serving failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded.
    #[error("config error: {0}")]
    Config(Box<figment::Error>),

    /// The metrics recorder could not be installed.
    #[error("metrics error: {0}")]
    Metrics(String),
}

impl From<figment::Error> for ServerError {
    fn from(e: figment::Error) -> Self {
        Self::Config(Box::new(e))
    }
}

/// Result alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
