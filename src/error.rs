//! Error types for the PPO training core.

use thiserror::Error;

/// Errors that can occur while computing a PPO training update.
#[derive(Debug, Error)]
pub enum PpoError {
    /// Inconsistent shapes or ranks between the tensors of one call.
    ///
    /// Fatal to the current training call, raised before any scan begins.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid hyper-parameters, or a distribution family that cannot serve
    /// the action spec in use. Raised at construction time.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A checked tensor contained NaN or Inf.
    #[error("Numerical error: '{name}' contains NaN or Inf values")]
    Numerical {
        /// Name of the offending tensor.
        name: String,
    },

    /// libtorch error.
    #[error("Torch error: {0}")]
    Torch(#[from] tch::TchError),

    /// Failure reported by a network or optimizer collaborator.
    #[error("Collaborator error: {0}")]
    Collaborator(#[from] anyhow::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PpoError {
    /// Shorthand for a [`PpoError::Validation`] with a formatted message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Shorthand for a [`PpoError::Configuration`] with a formatted message.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

/// Result type for PPO training operations.
pub type Result<T> = std::result::Result<T, PpoError>;
