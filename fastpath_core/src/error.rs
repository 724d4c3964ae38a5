//! Error types for the fastpath_core library.

use std::io;
use uuid::Uuid;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for fastpath_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A second active record would violate the one-active-fast rule
    #[error("A fast is already in progress (record {0})")]
    ActiveRecordExists(Uuid),

    /// Record lookup failed
    #[error("Fasting record {0} not found")]
    RecordNotFound(Uuid),

    /// A stopped record keeps its end time for good
    #[error("Fasting record {0} was already stopped")]
    RecordAlreadyStopped(Uuid),

    /// The start of a record never moves once saved
    #[error("Fasting record {0} cannot change its start time")]
    StartTimeChanged(Uuid),

    /// Record id collision on save
    #[error("Fasting record {0} already exists")]
    DuplicateRecord(Uuid),

    /// Goal lookup by name failed
    #[error("Goal '{0}' not found")]
    GoalNotFound(String),

    /// Goal definition failed validation
    #[error("Invalid goal: {0}")]
    InvalidGoal(String),

    /// The runtime actor or store worker is gone
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}
