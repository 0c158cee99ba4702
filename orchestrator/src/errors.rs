//! Error types for the orchestrator

use thiserror::Error;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Provider error for {resource}: {message}")]
    ProviderError {
        resource: String,
        message: String,
        /// Transient failures are eligible for retry with backoff.
        transient: bool,
    },

    #[error("Conflict on {resource}: {detail}")]
    ConflictError { resource: String, detail: String },

    #[error("Rollout of {service} did not stabilize within {elapsed_secs}s")]
    RolloutTimeoutError { service: String, elapsed_secs: u64 },

    #[error("Build error: {0}")]
    BuildError(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Provider failure that is safe to retry (throttling, timeouts,
    /// eventual-consistency reads).
    pub fn transient(resource: impl Into<String>, message: impl Into<String>) -> Self {
        OrchestratorError::ProviderError {
            resource: resource.into(),
            message: message.into(),
            transient: true,
        }
    }

    /// Provider failure that retrying will not fix.
    pub fn permanent(resource: impl Into<String>, message: impl Into<String>) -> Self {
        OrchestratorError::ProviderError {
            resource: resource.into(),
            message: message.into(),
            transient: false,
        }
    }

    /// Whether the engine should retry the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestratorError::ProviderError { transient: true, .. }
        )
    }
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        OrchestratorError::Internal(err.to_string())
    }
}
