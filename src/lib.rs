//! # OC-CNN on MVTec
//!
//! One-class anomaly detection on image patches. A frozen VGG16 backbone turns
//! every 32×32 patch into a 512-dim feature vector; a small dense head is
//! trained to separate those vectors from zero-mean Gaussian noise. At test
//! time the head's sigmoid output is an anomaly score per patch, evaluated
//! against ground-truth masks with a ROC curve.
//!
//! ## Pipeline
//!
//! - **Patches**: non-overlapping `P × P × 3` crops, row-major ([`patch`])
//! - **Labels**: a patch is anomalous if its mask has any non-zero pixel ([`labels`])
//! - **Features**: VGG-style conv stack from SafeTensors weights ([`features`], [`weights`])
//! - **Training**: noise-augmented batches, summed BCE, Adam ([`trainer`])
//! - **Evaluation**: ROC/AUC, JSON/CSV reports and SVG plots ([`evaluation`], [`plot`])
//!
//! ## Example
//!
//! ```no_run
//! use ocnn_mvtec::prelude::*;
//!
//! fn main() -> ocnn_mvtec::Result<()> {
//!     let config = ExperimentConfig::carpet_color();
//!     let backbone = ConvBackbone::random(&VGG16_LAYERS, 33)?;
//!     let outcome = Experiment::new(config, backbone)?.run()?;
//!     println!("AUC = {:.4}", outcome.report.auc);
//!     Ok(())
//! }
//! ```

pub mod classifier;
pub mod config;
pub mod dataset;
pub mod error;
pub mod evaluation;
pub mod experiment;
pub mod features;
pub mod inference;
pub mod labels;
pub mod logging;
pub mod metrics;
pub mod noise;
pub mod patch;
pub mod persist;
pub mod plot;
pub mod trainer;
pub mod weights;

pub use error::{OcnnError, Result};

// Re-export matrix type used across the public API
pub use aprender::primitives::Matrix;

/// Re-exports for convenient access
pub mod prelude {
    pub use crate::classifier::ClassifierHead;
    pub use crate::config::{DecisionRule, ExperimentConfig, LabelPairing, Preset, TrainingMetric};
    pub use crate::dataset::{Image, LabeledSample};
    pub use crate::error::{OcnnError, Result};
    pub use crate::evaluation::{auc, roc_curve, EvaluationReport, RocCurve};
    pub use crate::experiment::{Experiment, ExperimentContext, ExperimentOutcome};
    pub use crate::features::{ConvBackbone, FeatureExtractor, InputNormalization, VGG16_LAYERS};
    pub use crate::inference::InferenceModel;
    pub use crate::labels::{balance_normal_patches, patch_label, patch_labels};
    pub use crate::noise::{AugmentedBatch, NoiseAugmenter};
    pub use crate::patch::{extract_patches, image_patches, reassemble, Patch, PatchGrid};
    pub use crate::trainer::{EpochSummary, Trainer};
    pub use crate::weights::WeightStore;
    pub use crate::Matrix;
}
