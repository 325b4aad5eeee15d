//! Error types for the FracNet training system

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for FracNet operations
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A tensor does not have the shape the network expects
    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Shape the consumer required
        expected: String,
        /// Shape that was supplied
        actual: String,
    },

    /// A checkpoint record does not exist
    #[error("Checkpoint not found: {}", path.display())]
    CheckpointNotFound {
        /// Path that was looked up
        path: PathBuf,
    },

    /// Stored parameters cannot be loaded into the supplied architecture
    #[error("Checkpoint does not match architecture: {0}")]
    ConfigMismatch(String),

    /// A checkpoint record exists but cannot be decoded
    #[error("Checkpoint format error: {0}")]
    Checkpoint(String),

    /// Dataset descriptor or sample files are malformed or missing
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Safetensors container error
    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    /// Image decoding error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for FracNet operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a shape mismatch error from any two debuggable shapes
    pub fn shape_mismatch(expected: impl std::fmt::Debug, actual: impl std::fmt::Debug) -> Self {
        Self::ShapeMismatch {
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }

    /// Create a checkpoint-not-found error
    pub fn checkpoint_not_found(path: impl Into<PathBuf>) -> Self {
        Self::CheckpointNotFound { path: path.into() }
    }

    /// Create a config mismatch error
    pub fn config_mismatch(msg: impl Into<String>) -> Self {
        Self::ConfigMismatch(msg.into())
    }

    /// Create a checkpoint format error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a dataset error
    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_message() {
        let err = Error::shape_mismatch([3, 32, 32], [1, 32, 32]);
        assert_eq!(
            err.to_string(),
            "Shape mismatch: expected [3, 32, 32], got [1, 32, 32]"
        );
    }

    #[test]
    fn test_checkpoint_not_found_message() {
        let err = Error::checkpoint_not_found("runs/a/model_nf2_8.safetensors");
        assert!(err.to_string().contains("model_nf2_8.safetensors"));
    }
}
