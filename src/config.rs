//! Experiment configuration.
//!
//! One [`ExperimentConfig`] is constructed per run and threaded through
//! training and inference. The two presets reproduce the parameter sets of
//! the original carpet experiments, including the places where they disagree
//! (noise standard deviation, metric set, decision rule).

use crate::error::{OcnnError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Decision threshold used by the color-defect experiment.
pub const CARPET_COLOR_THRESHOLD: f32 = 0.000_526_052_5;

/// How classifier scores become predictions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DecisionRule {
    /// `1.0` when the score is strictly above the threshold, else `0.0`.
    Threshold(f32),
    /// The raw sigmoid output is used as the prediction.
    RawScore,
}

impl DecisionRule {
    /// Apply the rule to one score.
    #[must_use]
    pub fn apply(&self, score: f32) -> f32 {
        match self {
            Self::Threshold(t) => {
                if score > *t {
                    1.0
                } else {
                    0.0
                }
            }
            Self::RawScore => score,
        }
    }
}

/// How test images are matched with their ground-truth masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelPairing {
    /// `NNN.png` pairs with `NNN{mask_suffix}.png`.
    ByFilename,
    /// Zip the two sorted directory listings.
    EnumerationOrder,
}

/// Running metrics tracked during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingMetric {
    /// Fraction of correctly classified real/noise rows.
    Accuracy,
    /// Mean binary cross-entropy.
    CrossEntropy,
}

/// Named parameter sets of the carpet experiments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    /// Color-defect run: σ = 5.0, fixed decision threshold.
    CarpetColor,
    /// Raw-score run: σ = 0.1, accuracy and cross-entropy tracked.
    CarpetRawScore,
}

impl Preset {
    /// Build the configuration for this preset.
    #[must_use]
    pub fn config(self) -> ExperimentConfig {
        match self {
            Self::CarpetColor => ExperimentConfig::carpet_color(),
            Self::CarpetRawScore => ExperimentConfig::carpet_raw_score(),
        }
    }

    /// Preset identifier.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::CarpetColor => "carpet-color",
            Self::CarpetRawScore => "carpet-raw-score",
        }
    }
}

/// Full configuration of one experiment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Experiment name, used for output naming and seed derivation.
    pub name: String,
    /// Directory of normal training images.
    pub train_dir: PathBuf,
    /// Directory of test images.
    pub test_dir: PathBuf,
    /// Directory of ground-truth masks.
    pub ground_truth_dir: PathBuf,
    /// Suffix appended to a test image stem to name its mask.
    pub mask_suffix: String,
    /// Height every image is resized to.
    pub image_height: usize,
    /// Width every image is resized to.
    pub image_width: usize,
    /// Side length of square patches.
    pub patch_size: usize,
    /// Real feature vectors per training batch.
    pub batch_size: usize,
    /// Training epochs.
    pub epochs: usize,
    /// Standard deviation of the injected Gaussian noise.
    pub noise_std: f32,
    /// Adam learning rate.
    pub learning_rate: f32,
    /// Score-to-prediction rule.
    pub decision: DecisionRule,
    /// Test image / mask pairing strategy.
    pub pairing: LabelPairing,
    /// Metrics accumulated per epoch.
    pub metrics: Vec<TrainingMetric>,
    /// Drop excess normal test patches to balance the evaluation set.
    pub balance_test_set: bool,
    /// RNG seed; derived from `name` when absent.
    pub seed: Option<u64>,
    /// Log the batch loss every `log_every` steps (0 disables).
    pub log_every: usize,
    /// SafeTensors file with VGG16 weights.
    pub backbone_weights: Option<PathBuf>,
    /// Apply ImageNet mean/std normalization before the backbone.
    pub imagenet_normalize: bool,
    /// Directory receiving reports, plots and the trained head.
    pub output_dir: PathBuf,
    /// Render the SVG ROC plots.
    pub render_plots: bool,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self::carpet_color()
    }
}

impl ExperimentConfig {
    /// Color-defect experiment parameters.
    #[must_use]
    pub fn carpet_color() -> Self {
        Self {
            name: "carpet-color".to_string(),
            train_dir: PathBuf::from("dataset/carpet/train/good"),
            test_dir: PathBuf::from("dataset/carpet/test/color"),
            ground_truth_dir: PathBuf::from("dataset/carpet/ground_truth/color"),
            mask_suffix: "_mask".to_string(),
            image_height: 512,
            image_width: 512,
            patch_size: 32,
            batch_size: 32,
            epochs: 2,
            noise_std: 5.0,
            learning_rate: 1e-4,
            decision: DecisionRule::Threshold(CARPET_COLOR_THRESHOLD),
            pairing: LabelPairing::ByFilename,
            metrics: vec![TrainingMetric::Accuracy],
            balance_test_set: false,
            seed: Some(33),
            log_every: 200,
            backbone_weights: None,
            imagenet_normalize: false,
            output_dir: PathBuf::from("runs/carpet-color"),
            render_plots: true,
        }
    }

    /// Raw-score experiment parameters.
    #[must_use]
    pub fn carpet_raw_score() -> Self {
        Self {
            name: "carpet-raw-score".to_string(),
            epochs: 3,
            noise_std: 0.1,
            decision: DecisionRule::RawScore,
            metrics: vec![TrainingMetric::Accuracy, TrainingMetric::CrossEntropy],
            output_dir: PathBuf::from("runs/carpet-raw-score"),
            ..Self::carpet_color()
        }
    }

    /// Load a configuration from a JSON file and validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check that the configuration describes a runnable experiment.
    ///
    /// # Errors
    ///
    /// Returns [`OcnnError::InvalidConfig`] describing the first problem found,
    /// or [`OcnnError::InvalidPatchGrid`] if the patch size does not divide the
    /// image size.
    pub fn validate(&self) -> Result<()> {
        if self.patch_size == 0 {
            return Err(OcnnError::invalid_config("patch_size must be positive"));
        }
        if self.image_height == 0 || self.image_width == 0 {
            return Err(OcnnError::invalid_config("image size must be positive"));
        }
        if self.image_height % self.patch_size != 0 || self.image_width % self.patch_size != 0 {
            return Err(OcnnError::InvalidPatchGrid {
                height: self.image_height,
                width: self.image_width,
                patch_size: self.patch_size,
            });
        }
        if self.batch_size == 0 {
            return Err(OcnnError::invalid_config("batch_size must be positive"));
        }
        if !(self.noise_std.is_finite() && self.noise_std > 0.0) {
            return Err(OcnnError::invalid_config(format!(
                "noise_std must be positive and finite, got {}",
                self.noise_std
            )));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(OcnnError::invalid_config(format!(
                "learning_rate must be positive and finite, got {}",
                self.learning_rate
            )));
        }
        if let DecisionRule::Threshold(t) = self.decision {
            if !t.is_finite() {
                return Err(OcnnError::invalid_config("decision threshold must be finite"));
            }
        }
        Ok(())
    }

    /// Number of patches cut from one image.
    #[must_use]
    pub fn patches_per_image(&self) -> usize {
        if self.patch_size == 0 {
            return 0;
        }
        (self.image_height / self.patch_size) * (self.image_width / self.patch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_presets_differ_where_scripts_differ() {
        let color = ExperimentConfig::carpet_color();
        let raw = ExperimentConfig::carpet_raw_score();

        assert!((color.noise_std - 5.0).abs() < f32::EPSILON);
        assert!((raw.noise_std - 0.1).abs() < f32::EPSILON);
        assert_eq!(color.epochs, 2);
        assert_eq!(raw.epochs, 3);
        assert_eq!(color.decision, DecisionRule::Threshold(CARPET_COLOR_THRESHOLD));
        assert_eq!(raw.decision, DecisionRule::RawScore);
        assert_eq!(raw.metrics.len(), 2);
        assert_eq!(color.seed, Some(33));
        assert_eq!(raw.patch_size, 32);
    }

    #[test]
    fn test_presets_validate() {
        assert!(Preset::CarpetColor.config().validate().is_ok());
        assert!(Preset::CarpetRawScore.config().validate().is_ok());
    }

    #[test]
    fn test_patches_per_image() {
        let config = ExperimentConfig::carpet_color();
        assert_eq!(config.patches_per_image(), 256);
    }

    #[test]
    fn test_threshold_rule() {
        let rule = DecisionRule::Threshold(0.5);
        assert_eq!(rule.apply(0.7), 1.0);
        assert_eq!(rule.apply(0.5), 0.0);
        assert_eq!(rule.apply(0.1), 0.0);
    }

    #[test]
    fn test_raw_score_rule() {
        assert_eq!(DecisionRule::RawScore.apply(0.37), 0.37);
    }

    #[test]
    fn test_validate_rejects_non_divisible_grid() {
        let config = ExperimentConfig {
            image_height: 500,
            ..ExperimentConfig::carpet_color()
        };
        assert!(matches!(
            config.validate(),
            Err(OcnnError::InvalidPatchGrid { height: 500, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_noise() {
        let config = ExperimentConfig {
            noise_std: 0.0,
            ..ExperimentConfig::carpet_color()
        };
        assert!(matches!(
            config.validate(),
            Err(OcnnError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config = ExperimentConfig {
            batch_size: 0,
            ..ExperimentConfig::carpet_color()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("experiment.json");

        let original = ExperimentConfig::carpet_raw_score();
        std::fs::write(&path, original.to_json_pretty().unwrap()).unwrap();

        let loaded = ExperimentConfig::from_json_file(&path).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ExperimentConfig =
            serde_json::from_str(r#"{"name": "tiny", "epochs": 1}"#).unwrap();
        assert_eq!(config.name, "tiny");
        assert_eq!(config.epochs, 1);
        assert_eq!(config.patch_size, 32);
    }

    #[test]
    fn test_decision_rule_json_shape() {
        let json = serde_json::to_string(&DecisionRule::Threshold(0.25)).unwrap();
        assert_eq!(json, r#"{"kind":"threshold","value":0.25}"#);
        let raw = serde_json::to_string(&DecisionRule::RawScore).unwrap();
        assert_eq!(raw, r#"{"kind":"raw_score"}"#);
    }
}
