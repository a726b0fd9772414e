//! Dense classifier head trained on top of frozen features.
//!
//! `Linear(d, 512) -> ReLU -> Linear(512, 128) -> ReLU -> Linear(128, 1) -> Sigmoid`
//! built from `aprender::nn` layers. Kernels are Glorot-uniform and biases
//! start at zero. The module output is the logit; [`ClassifierHead::scores`]
//! applies the sigmoid. Training minimizes [`bce_with_logits_sum`].

use crate::error::{OcnnError, Result};
use aprender::autograd::{no_grad, Tensor};
use aprender::nn::{Linear, Module, ReLU, Sigmoid};
use aprender::primitives::Matrix;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Hidden layer widths of the head.
pub const HIDDEN_UNITS: [usize; 2] = [512, 128];

/// Plain weights of one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerState {
    /// Input width.
    pub in_dim: usize,
    /// Output width.
    pub out_dim: usize,
    /// Kernel, `out_dim × in_dim` row-major.
    pub weight: Vec<f32>,
    /// One bias per output unit.
    pub bias: Vec<f32>,
}

/// Plain snapshot of a head; this is what gets serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadState {
    /// Feature width.
    pub input_dim: usize,
    /// Layers from input to output.
    pub layers: Vec<LayerState>,
}

/// The trainable head.
#[derive(Debug)]
pub struct ClassifierHead {
    input_dim: usize,
    layers: Vec<Linear>,
}

impl ClassifierHead {
    /// Head with the standard hidden widths.
    ///
    /// # Errors
    ///
    /// Returns an error if `input_dim` is zero.
    pub fn new<R: Rng + ?Sized>(input_dim: usize, rng: &mut R) -> Result<Self> {
        Self::with_hidden_units(input_dim, &HIDDEN_UNITS, rng)
    }

    /// Head with custom ReLU hidden widths and one output unit.
    ///
    /// Each layer draws its initialization seed from `rng`.
    ///
    /// # Errors
    ///
    /// Returns an error if `input_dim` or any hidden width is zero.
    pub fn with_hidden_units<R: Rng + ?Sized>(
        input_dim: usize,
        hidden: &[usize],
        rng: &mut R,
    ) -> Result<Self> {
        if input_dim == 0 || hidden.contains(&0) {
            return Err(OcnnError::invalid_config(
                "classifier layer widths must be positive",
            ));
        }
        let mut layers = Vec::with_capacity(hidden.len() + 1);
        let mut width = input_dim;
        for &units in hidden.iter().chain(std::iter::once(&1)) {
            layers.push(Linear::with_seed(width, units, Some(rng.gen())));
            width = units;
        }
        Ok(Self { input_dim, layers })
    }

    /// Rebuild a head from a snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the layers do not chain from `input_dim` to a
    /// single output, or a buffer length disagrees with its layer shape.
    pub fn from_state(state: HeadState) -> Result<Self> {
        if state.layers.is_empty() {
            return Err(OcnnError::invalid_config("classifier head has no layers"));
        }
        let mut width = state.input_dim;
        let mut layers = Vec::with_capacity(state.layers.len());
        for (i, layer) in state.layers.into_iter().enumerate() {
            if layer.in_dim != width || layer.out_dim == 0 {
                return Err(OcnnError::dimension_mismatch(
                    format!("layer {i} with {width} inputs"),
                    format!("{} inputs, {} outputs", layer.in_dim, layer.out_dim),
                ));
            }
            if layer.weight.len() != layer.in_dim * layer.out_dim
                || layer.bias.len() != layer.out_dim
            {
                return Err(OcnnError::dimension_mismatch(
                    format!(
                        "{} weights and {} biases in layer {i}",
                        layer.in_dim * layer.out_dim,
                        layer.out_dim
                    ),
                    format!(
                        "{} weights and {} biases",
                        layer.weight.len(),
                        layer.bias.len()
                    ),
                ));
            }
            let shape = [layer.out_dim, layer.in_dim];
            let mut linear = Linear::with_seed(layer.in_dim, layer.out_dim, Some(0));
            no_grad(|| linear.set_weight(Tensor::new(&layer.weight, &shape).requires_grad()));
            linear.set_bias(Tensor::new(&layer.bias, &[layer.out_dim]).requires_grad());
            layers.push(linear);
            width = layer.out_dim;
        }
        if width != 1 {
            return Err(OcnnError::dimension_mismatch(
                "a single output unit",
                format!("{width} output units"),
            ));
        }
        Ok(Self {
            input_dim: state.input_dim,
            layers,
        })
    }

    /// Copy the current weights out.
    #[must_use]
    pub fn state(&self) -> HeadState {
        let layers = self
            .layers
            .iter()
            .map(|layer| LayerState {
                in_dim: layer.in_features(),
                out_dim: layer.out_features(),
                weight: layer.weight().data().to_vec(),
                bias: layer
                    .bias()
                    .map(|b| b.data().to_vec())
                    .unwrap_or_else(|| vec![0.0; layer.out_features()]),
            })
            .collect();
        HeadState {
            input_dim: self.input_dim,
            layers,
        }
    }

    /// Expected feature width.
    #[must_use]
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Layers from input to output.
    #[must_use]
    pub fn layers(&self) -> &[Linear] {
        &self.layers
    }

    /// Total trainable parameters.
    #[must_use]
    pub fn num_params(&self) -> usize {
        self.parameters().iter().map(|p| p.numel()).sum()
    }

    /// Check a feature batch against the head and wrap it as a tensor.
    pub(crate) fn input_tensor(&self, features: &Matrix<f32>) -> Result<Tensor> {
        let (rows, cols) = features.shape();
        if cols != self.input_dim {
            return Err(OcnnError::dimension_mismatch(
                format!("{} feature columns", self.input_dim),
                format!("{cols} feature columns"),
            ));
        }
        Ok(Tensor::new(features.as_slice(), &[rows, cols]))
    }

    /// Output logits, one per row.
    ///
    /// # Errors
    ///
    /// Returns an error if the feature width is wrong.
    pub fn logits(&self, features: &Matrix<f32>) -> Result<Vec<f32>> {
        let x = self.input_tensor(features)?;
        if features.n_rows() == 0 {
            return Ok(Vec::new());
        }
        Ok(no_grad(|| self.forward(&x).data().to_vec()))
    }

    /// Sigmoid scores in `(0, 1)`, one per row.
    ///
    /// # Errors
    ///
    /// Returns an error if the feature width is wrong.
    pub fn scores(&self, features: &Matrix<f32>) -> Result<Vec<f32>> {
        let x = self.input_tensor(features)?;
        if features.n_rows() == 0 {
            return Ok(Vec::new());
        }
        Ok(no_grad(|| {
            Sigmoid::new().forward(&self.forward(&x)).data().to_vec()
        }))
    }
}

impl Module for ClassifierHead {
    fn forward(&self, input: &Tensor) -> Tensor {
        let relu = ReLU::new();
        let last = self.layers.len().saturating_sub(1);
        self.layers
            .iter()
            .enumerate()
            .fold(input.clone(), |x, (i, layer)| {
                let z = layer.forward(&x);
                if i < last {
                    relu.forward(&z)
                } else {
                    z
                }
            })
    }

    fn parameters(&self) -> Vec<&Tensor> {
        self.layers.iter().flat_map(Module::parameters).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        self.layers
            .iter_mut()
            .flat_map(Module::parameters_mut)
            .collect()
    }

    // `Linear` keeps a transposed copy of its kernel; rebuild it after
    // every optimizer update.
    fn refresh_caches(&mut self) {
        for layer in &mut self.layers {
            layer.refresh_caches();
        }
    }
}

impl PartialEq for ClassifierHead {
    fn eq(&self, other: &Self) -> bool {
        self.state() == other.state()
    }
}

impl Serialize for ClassifierHead {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.state().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ClassifierHead {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let state = HeadState::deserialize(deserializer)?;
        Self::from_state(state).map_err(serde::de::Error::custom)
    }
}

/// Summed binary cross-entropy of `logits` against `targets` in `{0, 1}`.
///
/// Evaluated as `relu(x) - x*y + ln(1 + exp(-|x|))` from autograd ops, so
/// calling `backward` on the result reaches every head parameter.
#[must_use]
pub fn bce_with_logits_sum(logits: &Tensor, targets: &Tensor) -> Tensor {
    let positive = logits.relu();
    let abs = positive.add(&logits.neg().relu());
    let log_term = Tensor::ones(logits.shape()).add(&abs.neg().exp()).log();
    positive.sub(&logits.mul(targets)).add(&log_term).sum()
}

/// Numerically stable logistic sigmoid.
#[must_use]
pub fn sigmoid(z: f32) -> f32 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aprender::autograd::{clear_graph, get_grad};
    use aprender::nn::{BCEWithLogitsLoss, Reduction};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny_head(seed: u64) -> ClassifierHead {
        let mut rng = StdRng::seed_from_u64(seed);
        ClassifierHead::with_hidden_units(3, &[5, 4], &mut rng).unwrap()
    }

    fn batch() -> (Matrix<f32>, Vec<f32>) {
        let x = Matrix::from_vec(
            4,
            3,
            vec![
                0.5, -1.0, 2.0, //
                1.5, 0.2, -0.3, //
                -0.7, 0.9, 1.1, //
                0.0, 0.4, -2.0,
            ],
        )
        .unwrap();
        (x, vec![0.0, 1.0, 0.0, 1.0])
    }

    #[test]
    fn test_standard_head_shape() {
        let mut rng = StdRng::seed_from_u64(33);
        let head = ClassifierHead::new(512, &mut rng).unwrap();
        let widths: Vec<(usize, usize)> = head
            .layers()
            .iter()
            .map(|l| (l.in_features(), l.out_features()))
            .collect();
        assert_eq!(widths, vec![(512, 512), (512, 128), (128, 1)]);
        assert_eq!(
            head.num_params(),
            512 * 512 + 512 + 512 * 128 + 128 + 128 + 1
        );
    }

    #[test]
    fn test_glorot_bounds_and_zero_bias() {
        let mut rng = StdRng::seed_from_u64(1);
        let head = ClassifierHead::new(512, &mut rng).unwrap();
        let first = &head.state().layers[0];
        let limit = (6.0f32 / 1024.0).sqrt();
        assert!(first.weight.iter().all(|w| w.abs() <= limit));
        assert!(first.bias.iter().all(|&b| b == 0.0));
    }

    #[test]
    fn test_zero_width_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(ClassifierHead::new(0, &mut rng).is_err());
        assert!(ClassifierHead::with_hidden_units(4, &[0], &mut rng).is_err());
    }

    #[test]
    fn test_scores_are_sigmoid_of_logits() {
        let head = tiny_head(2);
        let (x, _) = batch();
        let scores = head.scores(&x).unwrap();
        let logits = head.logits(&x).unwrap();
        assert_eq!(scores.len(), 4);
        assert!(scores.iter().all(|&p| p > 0.0 && p < 1.0));
        for (p, z) in scores.iter().zip(&logits) {
            assert!((p - sigmoid(*z)).abs() < 1e-6);
        }
    }

    #[test]
    fn test_empty_batch() {
        let head = tiny_head(2);
        let x = Matrix::from_vec(0, 3, vec![]).unwrap();
        assert!(head.scores(&x).unwrap().is_empty());
    }

    #[test]
    fn test_wrong_feature_width() {
        let head = tiny_head(2);
        let x = Matrix::from_vec(1, 2, vec![0.0, 1.0]).unwrap();
        assert!(matches!(
            head.scores(&x),
            Err(OcnnError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_loss_matches_aprender_bce() {
        let logits = Tensor::new(&[-3.0, -0.5, 0.0, 0.7, 40.0, -40.0], &[6, 1]);
        let targets = Tensor::new(&[0.0, 1.0, 1.0, 0.0, 1.0, 0.0], &[6, 1]);
        let ours = bce_with_logits_sum(&logits, &targets).item();
        let reference = BCEWithLogitsLoss::with_reduction(Reduction::Sum)
            .forward(&logits, &targets)
            .item();
        assert!((ours - reference).abs() < 1e-4, "{ours} vs {reference}");
    }

    #[test]
    fn test_loss_gradient_is_p_minus_y() {
        clear_graph();
        let logits = Tensor::new(&[-1.0, 0.5, 2.0], &[3, 1]).requires_grad();
        let targets = Tensor::new(&[1.0, 0.0, 1.0], &[3, 1]);
        bce_with_logits_sum(&logits, &targets).backward();

        let grad = get_grad(logits.id()).unwrap();
        for ((g, &z), &y) in grad.data().iter().zip(logits.data()).zip(targets.data()) {
            assert!((g - (sigmoid(z) - y)).abs() < 1e-5);
        }
        clear_graph();
    }

    #[test]
    fn test_backward_reaches_every_parameter() {
        clear_graph();
        let mut head = tiny_head(4);
        let (x, y) = batch();
        head.refresh_caches();
        let logits = head.forward(&head.input_tensor(&x).unwrap());
        bce_with_logits_sum(&logits, &Tensor::new(&y, &[4, 1])).backward();

        let grads: Vec<usize> = head
            .parameters()
            .iter()
            .map(|p| get_grad(p.id()).map_or(0, |g| g.numel()))
            .collect();
        assert_eq!(grads, vec![15, 5, 20, 4, 4, 1]);
        clear_graph();
    }

    #[test]
    fn test_state_roundtrip() {
        let head = tiny_head(7);
        let rebuilt = ClassifierHead::from_state(head.state()).unwrap();
        assert_eq!(head, rebuilt);
        let (x, _) = batch();
        assert_eq!(head.scores(&x).unwrap(), rebuilt.scores(&x).unwrap());
    }

    #[test]
    fn test_inconsistent_state_rejected() {
        let mut state = tiny_head(8).state();
        state.layers[1].weight.pop();
        assert!(ClassifierHead::from_state(state).is_err());

        let mut state = tiny_head(8).state();
        state.input_dim = 4;
        assert!(ClassifierHead::from_state(state).is_err());

        let mut state = tiny_head(8).state();
        state.layers.pop();
        assert!(ClassifierHead::from_state(state).is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let head = tiny_head(7);
        let json = serde_json::to_string(&head).unwrap();
        let back: ClassifierHead = serde_json::from_str(&json).unwrap();
        assert_eq!(head, back);
    }
}
