//! Dispatcher error abstractions.

use thiserror::Error;

/// An error from converging a single subscription.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// The subscription's consumer could not be started.
    #[error("error starting consumer group {group_id}: {error:#}")]
    Start { group_id: String, error: anyhow::Error },
    /// The subscription's consumer could not be stopped.
    #[error("error stopping consumer group {group_id}: {error:#}")]
    Stop { group_id: String, error: anyhow::Error },
    /// The convergence deadline passed before the subscription's operation finished.
    #[error("convergence of consumer group {group_id} was cancelled")]
    Cancelled { group_id: String },
}
