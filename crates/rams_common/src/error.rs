//! Engine error taxonomy.
//!
//! Guard failures carry enough detail to identify the offending records;
//! storage faults bubble up untouched. Conflict is only surfaced after the
//! store's bounded retry gives up.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {message}")]
    Validation { message: String, ids: Vec<i64> },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation {
            message: message.into(),
            ids: Vec::new(),
        }
    }

    pub fn validation_with_ids(message: impl Into<String>, ids: Vec<i64>) -> Self {
        EngineError::Validation {
            message: message.into(),
            ids,
        }
    }

    pub fn not_found(kind: &'static str, id: i64) -> Self {
        EngineError::NotFound { kind, id }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
