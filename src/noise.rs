//! Gaussian pseudo-negative augmentation.
//!
//! A batch of `B` real feature rows becomes `2B` rows: the originals labelled
//! [`REAL_LABEL`], followed by `B` rows of zero-mean Gaussian noise labelled
//! [`NOISE_LABEL`].

use crate::error::{OcnnError, Result};
use aprender::primitives::Matrix;
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Label of real (normal) feature rows.
pub const REAL_LABEL: f32 = 0.0;

/// Label of synthetic noise rows.
pub const NOISE_LABEL: f32 = 1.0;

/// Features plus labels after augmentation.
#[derive(Debug, Clone)]
pub struct AugmentedBatch {
    /// `2B × D` rows: real first, noise second
    pub inputs: Matrix<f32>,
    /// `[0]*B + [1]*B`
    pub labels: Vec<f32>,
}

impl AugmentedBatch {
    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// True if the batch holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Draws noise rows from `N(0, std_dev²)`.
#[derive(Debug, Clone, Copy)]
pub struct NoiseAugmenter {
    std_dev: f32,
    normal: Normal<f32>,
}

impl NoiseAugmenter {
    /// Create an augmenter.
    ///
    /// # Errors
    ///
    /// Returns an error if `std_dev` is not finite and positive.
    pub fn new(std_dev: f32) -> Result<Self> {
        if !std_dev.is_finite() || std_dev <= 0.0 {
            return Err(OcnnError::invalid_config(format!(
                "noise standard deviation must be finite and positive, got {std_dev}"
            )));
        }
        let normal = Normal::new(0.0, std_dev)
            .map_err(|e| OcnnError::invalid_config(format!("noise distribution: {e}")))?;
        Ok(Self { std_dev, normal })
    }

    /// Standard deviation of the noise.
    #[must_use]
    pub fn std_dev(&self) -> f32 {
        self.std_dev
    }

    /// Append one noise row per input row and build the label vector.
    ///
    /// # Errors
    ///
    /// Returns an error if the augmented matrix cannot be assembled.
    pub fn augment<R: Rng + ?Sized>(&self, batch: &Matrix<f32>, rng: &mut R) -> Result<AugmentedBatch> {
        let (rows, cols) = batch.shape();
        let mut data = Vec::with_capacity(2 * rows * cols);
        data.extend_from_slice(batch.as_slice());
        data.extend((0..rows * cols).map(|_| self.normal.sample(rng)));

        let inputs = Matrix::from_vec(2 * rows, cols, data)
            .map_err(|e| OcnnError::Aprender(e.to_string()))?;
        let mut labels = vec![REAL_LABEL; rows];
        labels.resize(2 * rows, NOISE_LABEL);
        Ok(AugmentedBatch { inputs, labels })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_rejects_bad_std() {
        assert!(NoiseAugmenter::new(0.0).is_err());
        assert!(NoiseAugmenter::new(-1.0).is_err());
        assert!(NoiseAugmenter::new(f32::NAN).is_err());
        assert_eq!(NoiseAugmenter::new(5.0).unwrap().std_dev(), 5.0);
    }

    #[test]
    fn test_layout_and_labels() {
        let batch = Matrix::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let mut rng = StdRng::seed_from_u64(33);
        let out = NoiseAugmenter::new(0.1).unwrap().augment(&batch, &mut rng).unwrap();

        assert_eq!(out.inputs.shape(), (4, 3));
        assert_eq!(&out.inputs.as_slice()[..6], batch.as_slice());
        assert_eq!(out.labels, vec![0.0, 0.0, 1.0, 1.0]);
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_noise_statistics() {
        let batch = Matrix::from_vec(1000, 8, vec![0.0; 8000]).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let out = NoiseAugmenter::new(5.0).unwrap().augment(&batch, &mut rng).unwrap();

        let noise = &out.inputs.as_slice()[8000..];
        let n = noise.len() as f32;
        let mean = noise.iter().sum::<f32>() / n;
        let var = noise.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        assert!(mean.abs() < 0.3);
        assert!((var.sqrt() - 5.0).abs() < 0.2);
    }

    #[test]
    fn test_same_seed_same_noise() {
        let batch = Matrix::from_vec(4, 4, vec![0.5; 16]).unwrap();
        let aug = NoiseAugmenter::new(1.0).unwrap();
        let a = aug.augment(&batch, &mut StdRng::seed_from_u64(1)).unwrap();
        let b = aug.augment(&batch, &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(a.inputs, b.inputs);
    }

    #[test]
    fn test_empty_batch() {
        let batch = Matrix::from_vec(0, 4, vec![]).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let out = NoiseAugmenter::new(1.0).unwrap().augment(&batch, &mut rng).unwrap();
        assert!(out.is_empty());
    }
}
