//! Error types for sluice-core

use thiserror::Error;

/// Main error type for the sluice-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The durable storage capability is absent from the host.
    ///
    /// This is the one error allowed to surface from `DurableQueue::init`;
    /// every other queue operation degrades silently.
    #[error("durable storage unavailable: {0}")]
    StorageUnavailable(String),
}

/// Result type alias for sluice-core
pub type Result<T> = std::result::Result<T, Error>;
