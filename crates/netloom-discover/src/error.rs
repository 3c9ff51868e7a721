//! Error types for the netloom-discover crate.

use thiserror::Error;

use crate::scanner::ScanError;

#[derive(Error, Debug)]
pub enum DiscoverError {
    #[error("ConfigInvalid: {0}")]
    ConfigInvalid(String),

    #[error("StoreUnavailable: {0}")]
    StoreUnavailable(#[from] netloom_graph::StoreError),

    #[error("JobDeadlineExceeded")]
    JobDeadlineExceeded,

    #[error("Job queue is closed")]
    QueueClosed,

    #[error("Job queue is full, job {0} not accepted")]
    QueueFull(uuid::Uuid),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<netloom_core::NetloomError> for DiscoverError {
    fn from(e: netloom_core::NetloomError) -> Self {
        Self::ConfigInvalid(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DiscoverError>;
