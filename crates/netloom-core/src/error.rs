use thiserror::Error;

/// Top-level error type for netloom shared types.
#[derive(Error, Debug)]
pub enum NetloomError {
    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("Invalid address target: {0}")]
    InvalidTarget(String),

    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("Invalid scan job: {0}")]
    InvalidJob(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NetloomError>;
