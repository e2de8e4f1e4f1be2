//! Error handling for the router executable

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("svcbus error: {0}")]
    Svcbus(#[from] svcbus_core::SvcbusError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Router did not start listening within {0} ms")]
    StartTimeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for router operations
pub type Result<T> = std::result::Result<T, RouterError>;

impl From<anyhow::Error> for RouterError {
    fn from(err: anyhow::Error) -> Self {
        RouterError::Config(err.to_string())
    }
}
