//! Error types for the similarity graph engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GraphError>;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Embedding failed for {path}: {reason}")]
    EmbeddingFailed { path: String, reason: String },

    #[error("Description failed for {path}: {reason}")]
    DescriptionFailed { path: String, reason: String },

    #[error("Feature extraction failed for {path}: {reason}")]
    ExtractionFailed { path: String, reason: String },

    #[error("Graph store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Computation error: {0}")]
    Computation(String),

    #[error("Invalid similarity threshold: {0} (expected 0.0..=1.0)")]
    InvalidThreshold(f32),

    #[error("Invalid edge: {0}")]
    InvalidEdge(String),

    #[error("Build cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),
}

impl GraphError {
    /// Stable error code for callers that map errors onto a wire format.
    pub fn code(&self) -> &'static str {
        match self {
            GraphError::ImageNotFound(_) => "NOT_FOUND",
            GraphError::EmbeddingFailed { .. } => "EMBEDDING_FAILED",
            GraphError::DescriptionFailed { .. } => "DESCRIPTION_FAILED",
            GraphError::ExtractionFailed { .. } => "EXTRACTION_FAILED",
            GraphError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            GraphError::Computation(_) => "COMPUTATION_ERROR",
            GraphError::InvalidThreshold(_) => "INVALID_THRESHOLD",
            GraphError::InvalidEdge(_) => "INVALID_EDGE",
            GraphError::Cancelled => "CANCELLED",
            GraphError::Config(_) | GraphError::Yaml(_) => "CONFIG_ERROR",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Failures of shared infrastructure. Mutating operations surface these
    /// to the caller; everything else is recovered per item.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            GraphError::StoreUnavailable(_)
                | GraphError::Io(_)
                | GraphError::Serialization(_)
                | GraphError::InvalidFormat(_)
        )
    }
}
