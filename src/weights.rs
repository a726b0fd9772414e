//! Pretrained weight loading from `SafeTensors` files.
//!
//! Backbone weights are stored under torchvision-style keys
//! (`features.{i}.weight`, `features.{i}.bias`). Half-precision tensors are
//! widened to `f32` on access.

use crate::error::{OcnnError, Result};
use safetensors::{Dtype, SafeTensors};
use std::collections::HashMap;
use std::path::Path;

/// Tensor element types accepted for backbone weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// 32-bit float
    F32,
    /// 16-bit float
    F16,
    /// 16-bit brain float
    BF16,
}

impl DataType {
    /// Bytes per element.
    #[must_use]
    pub fn element_size(&self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 | Self::BF16 => 2,
        }
    }

    fn from_safetensors(dtype: Dtype) -> Option<Self> {
        match dtype {
            Dtype::F32 => Some(Self::F32),
            Dtype::F16 => Some(Self::F16),
            Dtype::BF16 => Some(Self::BF16),
            _ => None,
        }
    }

    fn to_safetensors(self) -> Dtype {
        match self {
            Self::F32 => Dtype::F32,
            Self::F16 => Dtype::F16,
            Self::BF16 => Dtype::BF16,
        }
    }
}

/// One named tensor with its raw little-endian bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorData {
    /// Tensor name
    pub name: String,
    /// Shape dimensions
    pub shape: Vec<usize>,
    /// Element type
    pub dtype: DataType,
    /// Raw bytes
    pub data: Vec<u8>,
}

impl TensorData {
    /// Build an `f32` tensor.
    #[must_use]
    pub fn from_f32(name: impl Into<String>, shape: Vec<usize>, values: &[f32]) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype: DataType::F32,
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    /// Number of elements implied by the shape.
    #[must_use]
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Decode the payload as `f32` values.
    ///
    /// # Errors
    ///
    /// Returns an error if the byte length disagrees with shape and dtype.
    pub fn to_f32(&self) -> Result<Vec<f32>> {
        let expected = self.num_elements() * self.dtype.element_size();
        if self.data.len() != expected {
            return Err(OcnnError::weights(format!(
                "tensor {} holds {} bytes, shape {:?} needs {}",
                self.name,
                self.data.len(),
                self.shape,
                expected
            )));
        }
        let values = match self.dtype {
            DataType::F32 => self
                .data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            DataType::F16 => self
                .data
                .chunks_exact(2)
                .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            DataType::BF16 => self
                .data
                .chunks_exact(2)
                .map(|c| half::bf16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
        };
        Ok(values)
    }
}

/// Named collection of pretrained tensors.
#[derive(Debug, Clone, Default)]
pub struct WeightStore {
    tensors: HashMap<String, TensorData>,
}

impl WeightStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `SafeTensors` buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is malformed or holds a tensor with an
    /// unsupported dtype.
    pub fn from_safetensors_bytes(bytes: &[u8]) -> Result<Self> {
        let parsed = SafeTensors::deserialize(bytes)
            .map_err(|e| OcnnError::weights(format!("failed to parse safetensors: {e}")))?;

        let mut store = Self::new();
        for (name, view) in parsed.tensors() {
            let Some(dtype) = DataType::from_safetensors(view.dtype()) else {
                return Err(OcnnError::weights(format!(
                    "tensor {name} has unsupported dtype {:?}",
                    view.dtype()
                )));
            };
            store.insert(TensorData {
                name,
                shape: view.shape().to_vec(),
                dtype,
                data: view.data().to_vec(),
            });
        }
        Ok(store)
    }

    /// Read and parse a `SafeTensors` file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_safetensors_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_safetensors_bytes(&bytes)
    }

    /// Serialize the store as a `SafeTensors` buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor's bytes disagree with its shape.
    pub fn to_safetensors_bytes(&self) -> Result<Vec<u8>> {
        let mut views = Vec::with_capacity(self.tensors.len());
        for tensor in self.tensors.values() {
            let view = safetensors::tensor::TensorView::new(
                tensor.dtype.to_safetensors(),
                tensor.shape.clone(),
                &tensor.data,
            )
            .map_err(|e| OcnnError::weights(format!("tensor {}: {e}", tensor.name)))?;
            views.push((tensor.name.clone(), view));
        }
        safetensors::tensor::serialize(views, &None)
            .map_err(|e| OcnnError::weights(format!("failed to serialize safetensors: {e}")))
    }

    /// Add or replace a tensor.
    pub fn insert(&mut self, tensor: TensorData) {
        self.tensors.insert(tensor.name.clone(), tensor);
    }

    /// Get a tensor by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TensorData> {
        self.tensors.get(name)
    }

    /// Tensor names in sorted order.
    #[must_use]
    pub fn tensor_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of tensors.
    #[must_use]
    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    /// Total number of scalar parameters.
    #[must_use]
    pub fn total_parameters(&self) -> usize {
        self.tensors.values().map(TensorData::num_elements).sum()
    }

    /// Fetch a tensor as `f32` values, checking its shape.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor is missing or has a different shape.
    pub fn tensor_f32(&self, name: &str, expected_shape: &[usize]) -> Result<Vec<f32>> {
        let tensor = self
            .get(name)
            .ok_or_else(|| OcnnError::weights(format!("missing tensor {name}")))?;
        if tensor.shape != expected_shape {
            return Err(OcnnError::weights(format!(
                "tensor {name} has shape {:?}, expected {:?}",
                tensor.shape, expected_shape
            )));
        }
        tensor.to_f32()
    }
}
