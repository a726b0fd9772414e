//! Noise-augmented one-class training loop.
//!
//! Each step takes `B` real feature rows, appends `B` Gaussian noise rows,
//! runs the head forward and backward on the `2B` rows and applies exactly
//! one `aprender::nn::Adam` update. Epochs reshuffle the feature rows, and
//! metrics are read and then reset at every epoch boundary.
//!
//! Gradients live in aprender's thread-local autograd graph. A step clears
//! the graph, re-records the head's cached kernel transposes, runs
//! `backward` on the summed loss and clears the graph again.

use crate::classifier::{bce_with_logits_sum, sigmoid, ClassifierHead};
use crate::config::ExperimentConfig;
use crate::error::{OcnnError, Result};
use crate::metrics::MetricSet;
use crate::noise::NoiseAugmenter;
use aprender::autograd::{clear_graph, no_grad, Tensor};
use aprender::nn::{Adam, Module, Optimizer};
use aprender::primitives::Matrix;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Outcome of a single optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    /// Summed BCE over the augmented batch.
    pub loss: f32,
    /// Real rows in the batch (the augmented batch holds twice as many).
    pub batch_len: usize,
}

/// Per-epoch training report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochSummary {
    /// Zero-based epoch index.
    pub epoch: usize,
    /// Optimizer steps in this epoch.
    pub steps: usize,
    /// Mean of the per-step summed losses.
    pub mean_loss: f64,
    /// Metric values read at the end of the epoch.
    pub metrics: BTreeMap<String, f64>,
}

/// Trains a [`ClassifierHead`] against Gaussian pseudo-negatives.
#[derive(Debug)]
pub struct Trainer {
    head: ClassifierHead,
    optimizer: Adam,
    augmenter: NoiseAugmenter,
    metrics: MetricSet,
    rng: StdRng,
    batch_size: usize,
    epochs: usize,
    log_every: usize,
    steps: u32,
}

impl Trainer {
    /// Trainer with a freshly initialized head of the standard shape.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or `input_dim` is 0.
    pub fn new(config: &ExperimentConfig, input_dim: usize, mut rng: StdRng) -> Result<Self> {
        let head = ClassifierHead::new(input_dim, &mut rng)?;
        Self::with_head(config, head, rng)
    }

    /// Trainer for an existing head.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch size is zero or the noise level or
    /// learning rate is not finite and positive.
    pub fn with_head(
        config: &ExperimentConfig,
        mut head: ClassifierHead,
        rng: StdRng,
    ) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(OcnnError::invalid_config("batch_size must be positive"));
        }
        if !config.learning_rate.is_finite() || config.learning_rate <= 0.0 {
            return Err(OcnnError::invalid_config(format!(
                "learning_rate must be finite and positive, got {}",
                config.learning_rate
            )));
        }
        let optimizer = Adam::new(head.parameters_mut(), config.learning_rate)
            .betas(0.9, 0.999)
            .eps(1e-7);
        Ok(Self {
            head,
            optimizer,
            augmenter: NoiseAugmenter::new(config.noise_std)?,
            metrics: MetricSet::from_config(&config.metrics),
            rng,
            batch_size: config.batch_size,
            epochs: config.epochs,
            log_every: config.log_every,
            steps: 0,
        })
    }

    /// Current head.
    #[must_use]
    pub fn head(&self) -> &ClassifierHead {
        &self.head
    }

    /// Consume the trainer, keeping the trained head.
    #[must_use]
    pub fn into_head(self) -> ClassifierHead {
        self.head
    }

    /// Tracked metrics.
    #[must_use]
    pub fn metrics(&self) -> &MetricSet {
        &self.metrics
    }

    /// Optimizer steps applied so far.
    #[must_use]
    pub fn steps(&self) -> u32 {
        self.steps
    }

    /// One augmented forward/backward pass and one optimizer update.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch width does not match the head.
    pub fn train_step(&mut self, batch: &Matrix<f32>) -> Result<StepOutcome> {
        let augmented = self.augmenter.augment(batch, &mut self.rng)?;
        let inputs = self.head.input_tensor(&augmented.inputs)?;
        let targets = Tensor::new(&augmented.labels, &[augmented.labels.len(), 1]);

        clear_graph();
        self.head.refresh_caches();
        let logits = self.head.forward(&inputs);
        let loss = bce_with_logits_sum(&logits, &targets);
        loss.backward();
        {
            let mut params = self.head.parameters_mut();
            self.optimizer.step_with_params(&mut params);
        }
        self.optimizer.zero_grad();
        clear_graph();
        no_grad(|| self.head.refresh_caches());
        self.steps += 1;

        let probabilities: Vec<f32> = logits.data().iter().copied().map(sigmoid).collect();
        self.metrics.update(&probabilities, &augmented.labels);
        Ok(StepOutcome {
            loss: loss.item(),
            batch_len: batch.n_rows(),
        })
    }

    /// Shuffle, batch and train over every feature row once.
    ///
    /// # Errors
    ///
    /// Returns an error if `features` is empty or a step fails.
    pub fn train_epoch(&mut self, epoch: usize, features: &Matrix<f32>) -> Result<EpochSummary> {
        let (rows, cols) = features.shape();
        if rows == 0 {
            return Err(OcnnError::dimension_mismatch(
                "at least one training feature row",
                "0 rows",
            ));
        }
        info!(epoch, rows, "start of epoch");

        let mut order: Vec<usize> = (0..rows).collect();
        order.shuffle(&mut self.rng);

        let data = features.as_slice();
        let mut seen = 0usize;
        let mut loss_sum = 0.0f64;
        let mut steps = 0usize;

        for (step, chunk) in order.chunks(self.batch_size).enumerate() {
            let mut batch = Vec::with_capacity(chunk.len() * cols);
            for &row in chunk {
                batch.extend_from_slice(&data[row * cols..(row + 1) * cols]);
            }
            let batch = Matrix::from_vec(chunk.len(), cols, batch)
                .map_err(|e| OcnnError::Aprender(e.to_string()))?;

            let outcome = self.train_step(&batch)?;
            seen += outcome.batch_len;
            loss_sum += f64::from(outcome.loss);
            steps += 1;

            if self.log_every > 0 && step % self.log_every == 0 {
                info!(epoch, step, loss = outcome.loss, seen, "training loss for one batch");
            }
        }

        let metrics = self.metrics.read();
        for (name, value) in &metrics {
            info!(epoch, metric = %name, value, "epoch metric");
        }
        self.metrics.reset();
        debug!(epoch, "metrics reset");

        Ok(EpochSummary {
            epoch,
            steps,
            mean_loss: loss_sum / steps as f64,
            metrics,
        })
    }

    /// Run every configured epoch.
    ///
    /// # Errors
    ///
    /// Returns the first epoch error.
    pub fn train(&mut self, features: &Matrix<f32>) -> Result<Vec<EpochSummary>> {
        (0..self.epochs)
            .map(|epoch| self.train_epoch(epoch, features))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainingMetric;
    use crate::metrics::MetricPhase;
    use rand::{Rng, SeedableRng};

    fn config() -> ExperimentConfig {
        ExperimentConfig {
            batch_size: 8,
            epochs: 3,
            noise_std: 1.0,
            learning_rate: 1e-2,
            metrics: vec![TrainingMetric::Accuracy, TrainingMetric::CrossEntropy],
            log_every: 0,
            ..ExperimentConfig::carpet_raw_score()
        }
    }

    fn trainer(cfg: &ExperimentConfig, seed: u64) -> Trainer {
        let mut rng = StdRng::seed_from_u64(seed);
        let head = ClassifierHead::with_hidden_units(4, &[8, 4], &mut rng).unwrap();
        Trainer::with_head(cfg, head, rng).unwrap()
    }

    /// Normal features clustered around a fixed point, far from N(0, 1).
    fn clustered_features(rows: usize) -> Matrix<f32> {
        let mut rng = StdRng::seed_from_u64(99);
        let data = (0..rows * 4)
            .map(|i| [3.0, 0.0, 3.0, 0.0][i % 4] + rng.gen_range(-0.05..0.05))
            .collect();
        Matrix::from_vec(rows, 4, data).unwrap()
    }

    #[test]
    fn test_standard_head_dimension() {
        let cfg = config();
        let t = Trainer::new(&cfg, 512, StdRng::seed_from_u64(33)).unwrap();
        assert_eq!(t.head().input_dim(), 512);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let rng = || StdRng::seed_from_u64(0);
        let zero_batch = ExperimentConfig {
            batch_size: 0,
            ..config()
        };
        assert!(Trainer::new(&zero_batch, 4, rng()).is_err());

        let zero_noise = ExperimentConfig {
            noise_std: 0.0,
            ..config()
        };
        assert!(Trainer::new(&zero_noise, 4, rng()).is_err());

        let bad_lr = ExperimentConfig {
            learning_rate: f32::NAN,
            ..config()
        };
        assert!(Trainer::new(&bad_lr, 4, rng()).is_err());
    }

    #[test]
    fn test_step_applies_one_update() {
        let cfg = config();
        let mut t = trainer(&cfg, 1);
        let before = t.head().state();
        let outcome = t.train_step(&clustered_features(8)).unwrap();

        assert_eq!(outcome.batch_len, 8);
        assert!(outcome.loss > 0.0);
        assert_eq!(t.steps(), 1);
        assert_ne!(before, t.head().state());
        assert!(t
            .metrics()
            .metrics()
            .iter()
            .all(|m| m.phase() == MetricPhase::Accumulating));
    }

    #[test]
    fn test_scores_follow_updated_weights() {
        let cfg = config();
        let mut t = trainer(&cfg, 6);
        let features = clustered_features(8);
        t.train_step(&features).unwrap();

        let rebuilt = ClassifierHead::from_state(t.head().state()).unwrap();
        assert_eq!(
            t.head().scores(&features).unwrap(),
            rebuilt.scores(&features).unwrap()
        );
    }

    #[test]
    fn test_epoch_batches_with_short_tail() {
        let cfg = config();
        let mut t = trainer(&cfg, 2);
        let summary = t.train_epoch(0, &clustered_features(20)).unwrap();

        // 8 + 8 + 4
        assert_eq!(summary.steps, 3);
        assert_eq!(t.steps(), 3);
        assert!(summary.metrics.contains_key("accuracy"));
        assert!(summary.metrics.contains_key("binary_crossentropy"));
        // reset after read
        assert!(t.metrics().results().values().all(|&v| v == 0.0));
        assert!(t
            .metrics()
            .metrics()
            .iter()
            .all(|m| m.phase() == MetricPhase::Reset));
    }

    #[test]
    fn test_empty_features_rejected() {
        let cfg = config();
        let mut t = trainer(&cfg, 3);
        let empty = Matrix::from_vec(0, 4, vec![]).unwrap();
        assert!(t.train_epoch(0, &empty).is_err());
    }

    #[test]
    fn test_wrong_feature_width_rejected() {
        let cfg = config();
        let mut t = trainer(&cfg, 3);
        let wide = Matrix::from_vec(2, 5, vec![0.0; 10]).unwrap();
        assert!(t.train_step(&wide).is_err());
    }

    #[test]
    fn test_separates_cluster_from_noise() {
        let cfg = ExperimentConfig {
            epochs: 50,
            ..config()
        };
        let mut t = trainer(&cfg, 4);
        let features = clustered_features(64);
        let history = t.train(&features).unwrap();

        assert_eq!(history.len(), 50);
        assert!(history[49].mean_loss < history[0].mean_loss);
        assert!(history[49].metrics["accuracy"] > 0.8);

        let head = t.into_head();
        let real = head.scores(&clustered_features(4)).unwrap();
        assert!(real.iter().all(|&p| p < 0.5));
    }

    #[test]
    fn test_same_seed_same_training() {
        let cfg = config();
        let features = clustered_features(16);
        let mut a = trainer(&cfg, 5);
        let mut b = trainer(&cfg, 5);
        assert_eq!(a.train(&features).unwrap(), b.train(&features).unwrap());
        assert_eq!(a.head(), b.head());
    }
}
