//! Error handling for hostsetup
//!
//! Library code returns [`SetupError`]. Anything that happens inside a step is
//! converted into an outcome at the step boundary, so these errors only reach
//! callers from document I/O and the status bridge. Plan loading and the CLI
//! report through `anyhow` with context.

use thiserror::Error;

/// Main error type for hostsetup
#[derive(Error, Debug)]
pub enum SetupError {
    /// IO errors (file operations, pipes)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Config document errors (bad key path, unwritable location)
    #[error("Config error: {0}")]
    Config(String),

    /// A process could not be started
    #[error("Spawn error: {0}")]
    Spawn(String),

    /// Status channel / completion marker errors
    #[error("Status channel error: {0}")]
    Channel(String),
}

/// Result type alias for hostsetup operations
pub type Result<T> = std::result::Result<T, SetupError>;

impl SetupError {
    /// Create a config document error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a spawn error
    pub fn spawn(msg: impl Into<String>) -> Self {
        Self::Spawn(msg.into())
    }

    /// Create a status channel error
    pub fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }
}
