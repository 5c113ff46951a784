//! The [Tensor] struct, the [Cpu] device, and the crate [Error].
//!
//! At a high level a tensor consists of only two parts
//! 1. A dense row-major rust array stored in a [std::sync::Arc].
//! 2. A runtime shape.
//!
//! There is no tape: the scan ops compute their gradients explicitly, with the
//! forward pass handing a [crate::scan_ops::SavedTrajectory] to the backward pass.
//!
//! # Creating tensors
//!
//! Tensors are allocated by a device:
//!
//! ```rust
//! # use selscan_core::prelude::*;
//! let dev: Cpu = Default::default();
//! let zeros: Tensor<f32> = dev.zeros_like(&[2, 3]);
//! let data = dev.tensor_from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
//! let noise: Tensor<f64> = dev.sample_normal_like(&[4]);
//! assert_eq!(data.as_vec()[4], 5.0);
//! ```
//!
//! # Changing precision
//!
//! ```rust
//! # use selscan_core::prelude::*;
//! let dev: Cpu = Default::default();
//! let a = dev.tensor_from_vec(vec![0.5f32, -1.0], &[2]);
//! let b: Tensor<f64> = a.to_dtype();
//! assert_eq!(b.as_vec(), vec![0.5, -1.0]);
//! ```

pub(crate) mod cpu;
mod error;

pub use cpu::{Cpu, SampleTensor, TensorFromVec, ZerosTensor};
pub use error::Error;

use crate::dtypes::Dtype;
use std::sync::Arc;

/// Number of elements described by `shape`.
pub fn num_elements(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// A dense, row-major nd-array.
#[derive(Debug, Clone)]
pub struct Tensor<E> {
    pub(crate) data: Arc<Vec<E>>,
    pub(crate) shape: Vec<usize>,
}

impl<E> Tensor<E> {
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn num_elements(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[E] {
        self.data.as_slice()
    }
}

impl<E: Dtype> Tensor<E> {
    pub fn as_vec(&self) -> Vec<E> {
        self.data.as_ref().clone()
    }

    /// Converts every element through `f64`.
    pub fn to_dtype<T: Dtype>(&self) -> Tensor<T> {
        Tensor {
            data: Arc::new(self.data.iter().map(|x| T::from_f64(x.to_f64())).collect()),
            shape: self.shape.clone(),
        }
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.data.iter().map(|x| x.to_f64()).collect()
    }

    pub(crate) fn data_mut(&mut self) -> &mut Vec<E> {
        Arc::make_mut(&mut self.data)
    }
}
