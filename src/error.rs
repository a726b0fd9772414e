//! Error types for OC-CNN experiment operations.
//!
//! Every malformed input halts the run with a typed error instead of a
//! panic deep inside an array reshape.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for experiment operations.
pub type Result<T> = std::result::Result<T, OcnnError>;

/// Errors that can occur while loading data, training or evaluating.
#[derive(Debug, Error)]
pub enum OcnnError {
    /// Dataset directory does not exist or is not a directory.
    #[error("dataset directory not found: {path}")]
    DatasetNotFound { path: PathBuf },

    /// Dataset directory contains no PNG images.
    #[error("no png images found in {path}")]
    EmptyDataset { path: PathBuf },

    /// Image could not be decoded.
    #[error("failed to decode image {path}: {reason}")]
    ImageDecode { path: PathBuf, reason: String },

    /// Image size is not a multiple of the patch size.
    #[error("patch grid does not divide image: {height}x{width} by patch size {patch_size}")]
    InvalidPatchGrid {
        height: usize,
        width: usize,
        patch_size: usize,
    },

    /// Dimension mismatch between arrays.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: String, actual: String },

    /// Patches and labels cannot be aligned.
    #[error("label alignment failed: {reason}")]
    LabelAlignment { reason: String },

    /// Experiment configuration is invalid.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Pretrained weights are missing or malformed.
    #[error("weights error: {reason}")]
    Weights { reason: String },

    /// Evaluation cannot be computed on the given labels/scores.
    #[error("evaluation failed: {reason}")]
    Evaluation { reason: String },

    /// Plot rendering failed.
    #[error("plot rendering failed: {0}")]
    Plot(String),

    /// I/O error during file operations.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Underlying aprender error.
    #[error("aprender error: {0}")]
    Aprender(String),
}

impl OcnnError {
    /// Create a dimension mismatch error.
    #[must_use]
    pub fn dimension_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::DimensionMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a label alignment error.
    #[must_use]
    pub fn label_alignment(reason: impl Into<String>) -> Self {
        Self::LabelAlignment {
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error.
    #[must_use]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a weights error.
    #[must_use]
    pub fn weights(reason: impl Into<String>) -> Self {
        Self::Weights {
            reason: reason.into(),
        }
    }

    /// Create an evaluation error.
    #[must_use]
    pub fn evaluation(reason: impl Into<String>) -> Self {
        Self::Evaluation {
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for OcnnError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
