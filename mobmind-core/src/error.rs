//! Error types for mobmind-core.

use thiserror::Error;

/// Result type alias using mobmind-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for inference orchestration
#[derive(Error, Debug)]
pub enum Error {
    // Queue / database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Request queue error: {0}")]
    Queue(String),

    // Model errors
    #[error("Model not found: {archetype}/{model_type}")]
    ModelNotFound {
        archetype: String,
        model_type: String,
    },

    #[error("Failed to load model {path}: {reason}")]
    ModelLoad { path: String, reason: String },

    #[error("Invalid model name: {0}")]
    InvalidModelName(String),

    #[error("Inference error: {0}")]
    Inference(String),

    // Collaborator errors
    #[error("Graph error: {0}")]
    Graph(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("{operation} timed out after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    // Configuration errors
    #[error("Invalid value for {field}: {message}")]
    Config { field: String, message: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a model load error
    pub fn model_load(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ModelLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a config validation error
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }
}
