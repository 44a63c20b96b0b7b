//! Error types for the report verification pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {

    // =============================
    // Terminal Pipeline Errors
    // =============================

    /// The article store returned nothing for the requested range.
    #[error("No input data: {0}")]
    NoArticles(String),

    /// Every candidate model failed on every attempt.
    #[error("All model providers failed: {}", .failures.join("; "))]
    AllProvidersFailed { failures: Vec<String> },

    // =============================
    // Collaborator Errors
    // =============================

    #[error("Model provider error: {0}")]
    Provider(String),

    #[error("Reference data error: {0}")]
    ReferenceData(String),

    #[error("Article store error: {0}")]
    Store(String),

    #[error("Report sink error: {0}")]
    Sink(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// True for the two failures a caller must handle: missing input and
    /// unreachable providers. Everything else is an infrastructure fault.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineError::NoArticles(_) | PipelineError::AllProvidersFailed { .. }
        )
    }
}
