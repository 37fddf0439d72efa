//! Kafka channel error abstractions.

use thiserror::Error;

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// A broker namespace credential Secret is missing required data.
    #[error("invalid Kafka Secret found: {0}")]
    InvalidNamespaceSecret(String),
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// The target resource was not found.
    #[error("the target resource was not found")]
    ResourceNotFound,
    /// A precondition of the requested action does not yet hold.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    /// The system has hit an internal error, but will remain online.
    #[error("internal error")]
    Ise(anyhow::Error),
}
