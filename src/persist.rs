//! Trained-head persistence in the `.apr` format.
//!
//! The head is stored as a [`ModelType::Custom`] payload through
//! `aprender::format`; the file header carries the experiment name and a
//! short description so `ocnn inspect` can report on a model without
//! deserializing it.

use crate::classifier::ClassifierHead;
use crate::error::{OcnnError, Result};
use aprender::format::{self, Compression, ModelInfo, ModelType, SaveOptions};
use std::path::Path;

/// File name of the saved head inside an output directory.
pub const HEAD_FILE: &str = "head.apr";

/// Save a head, naming it after the experiment.
///
/// # Errors
///
/// Returns an error if serialization or writing fails.
pub fn save_head(head: &ClassifierHead, experiment: &str, path: impl AsRef<Path>) -> Result<()> {
    let description = format!(
        "OC-CNN head: {} inputs, {} layers, {} parameters",
        head.input_dim(),
        head.layers().len(),
        head.num_params()
    );
    let options = SaveOptions::default()
        .with_name(experiment)
        .with_description(description)
        .with_compression(Compression::ZstdDefault);
    format::save(head, ModelType::Custom, path, options)
        .map_err(|e| OcnnError::Aprender(e.to_string()))
}

/// Load a head saved by [`save_head`].
///
/// # Errors
///
/// Returns an error if the file is missing, of another model type, or
/// cannot be deserialized.
pub fn load_head(path: impl AsRef<Path>) -> Result<ClassifierHead> {
    format::load(path, ModelType::Custom).map_err(|e| OcnnError::Aprender(e.to_string()))
}

/// Header summary of a saved head.
#[derive(Debug, Clone)]
pub struct HeadInfo {
    inner: ModelInfo,
}

impl HeadInfo {
    /// Inspect a file without loading the payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let inner = format::inspect(path).map_err(|e| OcnnError::Aprender(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Stored model type.
    #[must_use]
    pub fn model_type(&self) -> ModelType {
        self.inner.model_type
    }

    /// Format version.
    #[must_use]
    pub fn version(&self) -> (u8, u8) {
        self.inner.format_version
    }

    /// Experiment name, if recorded.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.inner.metadata.model_name.as_deref()
    }

    /// Description, if recorded.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.inner.metadata.description.as_deref()
    }

    /// Stored payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.inner.payload_size
    }

    /// True if the payload is smaller than its uncompressed form.
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.inner.payload_size < self.inner.uncompressed_size
    }
}
