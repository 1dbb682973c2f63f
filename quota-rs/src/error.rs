use thiserror::Error;

#[derive(Error, Debug)]
pub enum QuotaError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] sqlx::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl QuotaError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        QuotaError::InvalidArgument(msg.into())
    }
}

impl From<config::ConfigError> for QuotaError {
    fn from(err: config::ConfigError) -> Self {
        QuotaError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QuotaError>;
