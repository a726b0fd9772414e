//! Frozen convolutional feature extraction.
//!
//! [`ConvBackbone`] runs a VGG-style stack of `aprender::nn` layers
//! (`Conv2d` 3×3 same-padded with ReLU, `MaxPool2d` 2×2) over NCHW patch
//! tensors and closes with `GlobalAvgPool2d`. With the VGG16 topology a
//! 32×32 patch is pooled down to 1×1×512, so the pooled vector equals the
//! raw backbone output.
//!
//! # Weight layout
//!
//! Weights follow torchvision indexing: every convolution occupies one
//! `features.{i}` slot followed by a ReLU slot, every pooling layer one
//! slot. Kernels are stored `[out, in, 3, 3]`.

use crate::dataset::CHANNELS;
use crate::error::{OcnnError, Result};
use crate::patch::Patch;
use crate::weights::{TensorData, WeightStore};
use aprender::autograd::{no_grad, Tensor};
use aprender::nn::{Conv2d, GlobalAvgPool2d, MaxPool2d, Module, ReLU};
use aprender::primitives::Matrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// ImageNet per-channel mean (RGB).
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// ImageNet per-channel standard deviation (RGB).
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Produces one fixed-length feature vector per patch.
pub trait FeatureExtractor {
    /// Length of every produced feature vector.
    fn output_dim(&self) -> usize;

    /// Extract the features of one patch.
    ///
    /// # Errors
    ///
    /// Returns an error if the patch cannot be processed.
    fn extract(&self, patch: &Patch) -> Result<Vec<f32>>;

    /// Extract features for a batch; row `i` belongs to `patches[i]`.
    ///
    /// # Errors
    ///
    /// Returns the first extraction error, or a dimension error if a vector
    /// has the wrong length.
    fn extract_batch(&self, patches: &[Patch]) -> Result<Matrix<f32>> {
        let dim = self.output_dim();
        let mut data = Vec::with_capacity(patches.len() * dim);
        for patch in patches {
            let features = self.extract(patch)?;
            if features.len() != dim {
                return Err(OcnnError::dimension_mismatch(
                    format!("{dim} features"),
                    format!("{} features", features.len()),
                ));
            }
            data.extend(features);
        }
        Matrix::from_vec(patches.len(), dim, data)
            .map_err(|e| OcnnError::Aprender(e.to_string()))
    }
}

/// One stage of a VGG-style backbone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackboneLayer {
    /// 3×3 convolution, stride 1, same padding, followed by ReLU.
    Conv3x3 {
        /// Output channels
        out_channels: usize,
    },
    /// 2×2 max pooling, stride 2.
    MaxPool2x2,
}

const fn conv(out_channels: usize) -> BackboneLayer {
    BackboneLayer::Conv3x3 { out_channels }
}

const POOL: BackboneLayer = BackboneLayer::MaxPool2x2;

/// VGG16 feature layers (without the classifier top).
pub const VGG16_LAYERS: [BackboneLayer; 18] = [
    conv(64),
    conv(64),
    POOL,
    conv(128),
    conv(128),
    POOL,
    conv(256),
    conv(256),
    conv(256),
    POOL,
    conv(512),
    conv(512),
    conv(512),
    POOL,
    conv(512),
    conv(512),
    conv(512),
    POOL,
];

/// Input normalization applied before the first convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputNormalization {
    /// Feed `[0, 1]` pixels unchanged.
    #[default]
    Identity,
    /// Subtract [`IMAGENET_MEAN`] and divide by [`IMAGENET_STD`].
    ImageNet,
}

/// Patches per forward pass in [`ConvBackbone::extract_batch`].
const EXTRACT_CHUNK: usize = 64;

#[derive(Debug)]
struct ConvStage {
    /// Slot in the torchvision `features.{i}` numbering.
    index: usize,
    in_channels: usize,
    out_channels: usize,
    conv: Conv2d,
}

impl ConvStage {
    /// Same-padded 3×3 convolution with the given OIHW kernel and bias.
    fn new(index: usize, in_channels: usize, out_channels: usize, oihw: &[f32], bias: &[f32]) -> Self {
        let mut conv = Conv2d::with_padding(in_channels, out_channels, 3, 1);
        let mut params = conv.parameters_mut();
        *params[0] = Tensor::new(oihw, &[out_channels, in_channels, 3, 3]);
        *params[1] = Tensor::new(bias, &[out_channels]);
        Self {
            index,
            in_channels,
            out_channels,
            conv,
        }
    }

    fn weight_key(&self) -> String {
        format!("features.{}.weight", self.index)
    }

    fn bias_key(&self) -> String {
        format!("features.{}.bias", self.index)
    }
}

#[derive(Debug)]
enum Stage {
    Conv(ConvStage),
    Pool(MaxPool2d),
}

/// Frozen VGG-style convolutional backbone.
#[derive(Debug)]
pub struct ConvBackbone {
    stages: Vec<Stage>,
    output_dim: usize,
    normalization: InputNormalization,
}

impl ConvBackbone {
    /// VGG16 backbone with pretrained weights.
    ///
    /// # Errors
    ///
    /// Returns an error if a weight tensor is missing or misshapen.
    pub fn vgg16(weights: &WeightStore) -> Result<Self> {
        Self::from_layers(&VGG16_LAYERS, weights)
    }

    /// Backbone of an arbitrary layer list with pretrained weights.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer list has no convolution or a weight
    /// tensor is missing or misshapen.
    pub fn from_layers(layers: &[BackboneLayer], weights: &WeightStore) -> Result<Self> {
        Self::build(layers, |index, in_c, out_c| {
            let kernel =
                weights.tensor_f32(&format!("features.{index}.weight"), &[out_c, in_c, 3, 3])?;
            let bias = weights.tensor_f32(&format!("features.{index}.bias"), &[out_c])?;
            Ok(ConvStage::new(index, in_c, out_c, &kernel, &bias))
        })
    }

    /// Backbone with Glorot-uniform kernels and zero biases.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer list has no convolution.
    pub fn random(layers: &[BackboneLayer], seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::build(layers, |index, in_c, out_c| {
            let fan_in = (in_c * 9) as f32;
            let fan_out = (out_c * 9) as f32;
            let limit = (6.0 / (fan_in + fan_out)).sqrt();
            let kernel: Vec<f32> = (0..out_c * in_c * 9)
                .map(|_| rng.gen_range(-limit..limit))
                .collect();
            Ok(ConvStage::new(index, in_c, out_c, &kernel, &vec![0.0; out_c]))
        })
    }

    fn build<F>(layers: &[BackboneLayer], mut make_conv: F) -> Result<Self>
    where
        F: FnMut(usize, usize, usize) -> Result<ConvStage>,
    {
        let mut stages = Vec::with_capacity(layers.len());
        let mut channels = CHANNELS;
        let mut index = 0;
        for layer in layers {
            match *layer {
                BackboneLayer::Conv3x3 { out_channels } => {
                    stages.push(Stage::Conv(make_conv(index, channels, out_channels)?));
                    channels = out_channels;
                    // the ReLU takes the next slot
                    index += 2;
                }
                BackboneLayer::MaxPool2x2 => {
                    stages.push(Stage::Pool(MaxPool2d::new(2)));
                    index += 1;
                }
            }
        }
        if !stages.iter().any(|s| matches!(s, Stage::Conv(_))) {
            return Err(OcnnError::weights("backbone needs at least one convolution"));
        }
        Ok(Self {
            stages,
            output_dim: channels,
            normalization: InputNormalization::default(),
        })
    }

    /// Set the input normalization.
    #[must_use]
    pub fn with_normalization(mut self, normalization: InputNormalization) -> Self {
        self.normalization = normalization;
        self
    }

    /// Active input normalization.
    #[must_use]
    pub fn normalization(&self) -> InputNormalization {
        self.normalization
    }

    /// Number of convolution layers.
    #[must_use]
    pub fn conv_layers(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| matches!(s, Stage::Conv(_)))
            .count()
    }

    /// Total number of frozen parameters.
    #[must_use]
    pub fn num_params(&self) -> usize {
        self.stages
            .iter()
            .map(|s| match s {
                Stage::Conv(c) => c.conv.num_parameters(),
                Stage::Pool(_) => 0,
            })
            .sum()
    }

    /// Export weights in torchvision layout.
    #[must_use]
    pub fn to_weight_store(&self) -> WeightStore {
        let mut store = WeightStore::new();
        for stage in &self.stages {
            if let Stage::Conv(c) = stage {
                let params = c.conv.parameters();
                store.insert(TensorData::from_f32(
                    c.weight_key(),
                    vec![c.out_channels, c.in_channels, 3, 3],
                    params[0].data(),
                ));
                store.insert(TensorData::from_f32(
                    c.bias_key(),
                    vec![c.out_channels],
                    params[1].data(),
                ));
            }
        }
        store
    }

    /// Normalized patches of one size as an `[N, 3, P, P]` tensor.
    fn input_tensor(&self, patches: &[Patch]) -> Result<Tensor> {
        let size = patches.first().map_or(0, Patch::size);
        let plane = size * size;
        let mut data = vec![0.0f32; patches.len() * CHANNELS * plane];
        for (n, patch) in patches.iter().enumerate() {
            if patch.size() != size {
                return Err(OcnnError::dimension_mismatch(
                    format!("{size}x{size} patches in one batch"),
                    format!("a {0}x{0} patch", patch.size()),
                ));
            }
            let image = &mut data[n * CHANNELS * plane..(n + 1) * CHANNELS * plane];
            for (p, pixel) in patch.as_slice().chunks_exact(CHANNELS).enumerate() {
                for (c, &value) in pixel.iter().enumerate() {
                    image[c * plane + p] = match self.normalization {
                        InputNormalization::Identity => value,
                        InputNormalization::ImageNet => (value - IMAGENET_MEAN[c]) / IMAGENET_STD[c],
                    };
                }
            }
        }
        Ok(Tensor::new(&data, &[patches.len(), CHANNELS, size, size]))
    }

    /// `[N, output_dim]` features of a same-size patch batch.
    fn forward_batch(&self, patches: &[Patch]) -> Result<Tensor> {
        let input = self.input_tensor(patches)?;
        no_grad(|| {
            let relu = ReLU::new();
            let mut x = input;
            for stage in &self.stages {
                x = match stage {
                    Stage::Conv(c) => relu.forward(&c.conv.forward(&x)),
                    Stage::Pool(pool) => {
                        let (h, w) = (x.shape()[2], x.shape()[3]);
                        if h < 2 || w < 2 {
                            return Err(OcnnError::dimension_mismatch(
                                "activation of at least 2x2 before pooling",
                                format!("{h}x{w}"),
                            ));
                        }
                        pool.forward(&x)
                    }
                };
            }
            Ok(GlobalAvgPool2d::new().forward(&x))
        })
    }
}

impl FeatureExtractor for ConvBackbone {
    fn output_dim(&self) -> usize {
        self.output_dim
    }

    fn extract(&self, patch: &Patch) -> Result<Vec<f32>> {
        let features = self.forward_batch(std::slice::from_ref(patch))?;
        Ok(features.data().to_vec())
    }

    fn extract_batch(&self, patches: &[Patch]) -> Result<Matrix<f32>> {
        let mut data = Vec::with_capacity(patches.len() * self.output_dim);
        for chunk in patches.chunks(EXTRACT_CHUNK) {
            data.extend_from_slice(self.forward_batch(chunk)?.data());
        }
        Matrix::from_vec(patches.len(), self.output_dim, data)
            .map_err(|e| OcnnError::Aprender(e.to_string()))
    }
}
