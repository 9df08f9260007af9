//! mysql-sync error types

use thiserror::Error;

/// Result type alias for mysql-sync operations
pub type Result<T> = std::result::Result<T, Error>;

/// mysql-sync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Query execution failed: {0}")]
    QueryExecution(String),

    /// Rejection raised while applying an incoming change. The message is
    /// forwarded verbatim to the originating peer.
    #[error("{0}")]
    Apply(String),

    // Queue errors
    #[error("Queue error: {0}")]
    Queue(String),

    // Bus errors
    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Bus client error: {0}")]
    BusClient(#[from] rumqttc::ClientError),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
