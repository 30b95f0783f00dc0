//! Tensor types exchanged with the inference backends.
//!
//! The classification model only consumes and produces `f32` data, so both
//! tensor types wrap a dynamically shaped `f32` array.

use ndarray::{Array4, ArrayD, IxDyn};

use crate::error::InferenceError;
use crate::Result;

/// Canonical NCHW input shape of the classification model.
pub const IMAGE_INPUT_SHAPE: [usize; 4] = [1, 3, 224, 224];

/// Input tensor for inference.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
    data: ArrayD<f32>,
}

impl InputTensor {
    /// Wrap an arbitrarily shaped array. Shape checks happen at the executor.
    pub fn new(data: ArrayD<f32>) -> Self {
        Self { data }
    }

    /// Create a tensor from raw data laid out in row-major order.
    pub fn from_vec(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        let actual = data.len();
        let arr = ArrayD::from_shape_vec(IxDyn(shape), data).map_err(|_| {
            InferenceError::ShapeMismatch {
                expected: shape.to_vec(),
                actual: vec![actual],
            }
        })?;
        Ok(Self { data: arr })
    }

    /// An all-zero tensor, used for warm-up runs.
    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            data: ArrayD::zeros(IxDyn(shape)),
        }
    }

    /// Get the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Borrow the underlying array.
    pub fn view(&self) -> &ArrayD<f32> {
        &self.data
    }

    /// Fail with [`InferenceError::ShapeMismatch`] unless the shape matches exactly.
    pub fn ensure_shape(&self, expected: &[usize]) -> Result<()> {
        if self.shape() == expected {
            Ok(())
        } else {
            Err(InferenceError::ShapeMismatch {
                expected: expected.to_vec(),
                actual: self.shape().to_vec(),
            })
        }
    }

    /// Copy out the elements in standard (row-major) order.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }
}

impl From<Array4<f32>> for InputTensor {
    fn from(arr: Array4<f32>) -> Self {
        Self {
            data: arr.into_dyn(),
        }
    }
}

impl From<ArrayD<f32>> for InputTensor {
    fn from(data: ArrayD<f32>) -> Self {
        Self { data }
    }
}

/// Output tensor from inference.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTensor {
    data: ArrayD<f32>,
}

impl OutputTensor {
    /// Create an output tensor from raw data and shape.
    pub fn from_shape_vec(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        let arr = ArrayD::from_shape_vec(IxDyn(shape), data)
            .map_err(|e| InferenceError::OutputExtraction(e.to_string()))?;
        Ok(Self { data: arr })
    }

    /// Get the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Flatten a `[1, N]` (or `[N]`) output into its `N` class scores.
    pub fn into_scores(self) -> Result<Vec<f32>> {
        let shape = self.data.shape().to_vec();
        match shape.as_slice() {
            [_] | [1, _] => Ok(self.data.iter().copied().collect()),
            _ => Err(InferenceError::OutputExtraction(format!(
                "expected a single score row, got shape {:?}",
                shape
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ensure_shape_rejects_missing_batch_dim() {
        let tensor = InputTensor::zeros(&[3, 224, 224]);
        let err = tensor.ensure_shape(&IMAGE_INPUT_SHAPE).unwrap_err();
        match err {
            InferenceError::ShapeMismatch { expected, actual } => {
                assert_eq!(expected, vec![1, 3, 224, 224]);
                assert_eq!(actual, vec![3, 224, 224]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_from_vec_length_mismatch() {
        assert!(InputTensor::from_vec(&[1, 3, 2, 2], vec![0.0; 5]).is_err());
        assert!(InputTensor::from_vec(&[1, 3, 2, 2], vec![0.0; 12]).is_ok());
    }

    #[test]
    fn test_into_scores_flattens_batch_row() {
        let out = OutputTensor::from_shape_vec(&[1, 4], vec![0.1, 0.2, 0.3, 0.4]).unwrap();
        assert_eq!(out.into_scores().unwrap(), vec![0.1, 0.2, 0.3, 0.4]);

        let out = OutputTensor::from_shape_vec(&[2, 2], vec![0.0; 4]).unwrap();
        assert!(out.into_scores().is_err());
    }
}
