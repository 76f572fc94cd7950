//! Error types for idcard-photo

use std::fmt;
use thiserror::Error;

/// Pipeline stage a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Resolving,
    Processing,
    Uploading,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Resolving => write!(f, "resolving"),
            Stage::Processing => write!(f, "processing"),
            Stage::Uploading => write!(f, "uploading"),
        }
    }
}

#[derive(Error, Debug)]
pub enum PhotoError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Photo record not found: {0}")]
    NotFound(String),

    #[error("Resolution failed: {0}")]
    ResolutionFailed(String),

    #[error("Processing failed: {0}")]
    ProcessingFailed(String),

    #[error("Storage failed: {0}")]
    StorageFailed(String),

    #[error("Stage {stage} timed out after {after_ms}ms")]
    Timeout { stage: Stage, after_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PhotoError {
    /// Stage this error belongs to, if it is one of the pipeline stage failures
    pub fn stage_class(&self) -> Option<Stage> {
        match self {
            PhotoError::ResolutionFailed(_) => Some(Stage::Resolving),
            PhotoError::ProcessingFailed(_) => Some(Stage::Processing),
            PhotoError::StorageFailed(_) => Some(Stage::Uploading),
            PhotoError::Timeout { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

impl From<rmp_serde::encode::Error> for PhotoError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        PhotoError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for PhotoError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        PhotoError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for PhotoError {
    fn from(e: serde_json::Error) -> Self {
        PhotoError::Serialization(e.to_string())
    }
}
