use crate::{
    dtypes::Dtype,
    tensor::{num_elements, Error, Tensor},
};

use super::Cpu;

use rand::{distributions::Distribution, Rng};
use rand_distr::{StandardNormal, Uniform};
use std::{sync::Arc, vec::Vec};

impl Cpu {
    #[inline]
    pub(crate) fn try_alloc_zeros<E: Clone + Default>(
        &self,
        numel: usize,
    ) -> Result<Vec<E>, Error> {
        let mut data: Vec<E> = Vec::new();
        data.try_reserve(numel).map_err(|_| Error::OutOfMemory)?;
        data.resize(numel, Default::default());
        Ok(data)
    }
}

/// Construct tensors filled with zeros.
pub trait ZerosTensor<E> {
    /// Creates a tensor filled with zeros.
    /// ```rust
    /// # use selscan_core::prelude::*;
    /// # let dev: Cpu = Default::default();
    /// let a: Tensor<f32> = dev.zeros_like(&[2, 3]);
    /// assert_eq!(a.as_vec(), vec![0.0; 6]);
    /// ```
    fn zeros_like(&self, shape: &[usize]) -> Tensor<E> {
        self.try_zeros_like(shape).unwrap()
    }

    /// Fallible version of [ZerosTensor::zeros_like]
    fn try_zeros_like(&self, shape: &[usize]) -> Result<Tensor<E>, Error>;
}

impl<E: Dtype> ZerosTensor<E> for Cpu {
    fn try_zeros_like(&self, shape: &[usize]) -> Result<Tensor<E>, Error> {
        let data = self.try_alloc_zeros::<E>(num_elements(shape))?;
        Ok(Tensor {
            data: Arc::new(data),
            shape: shape.to_vec(),
        })
    }
}

/// Construct tensors from rust vectors.
pub trait TensorFromVec<E> {
    fn tensor_from_vec(&self, src: Vec<E>, shape: &[usize]) -> Tensor<E> {
        self.try_tensor_from_vec(src, shape).unwrap()
    }

    /// Fails with [Error::WrongNumElements] when `src` does not hold exactly the
    /// number of elements `shape` describes.
    fn try_tensor_from_vec(&self, src: Vec<E>, shape: &[usize]) -> Result<Tensor<E>, Error>;
}

impl<E: Dtype> TensorFromVec<E> for Cpu {
    fn try_tensor_from_vec(&self, src: Vec<E>, shape: &[usize]) -> Result<Tensor<E>, Error> {
        if src.len() != num_elements(shape) {
            Err(Error::WrongNumElements)
        } else {
            Ok(Tensor {
                data: Arc::new(src),
                shape: shape.to_vec(),
            })
        }
    }
}

/// Constructs tensors filled with random values.
///
/// Values are drawn in `f64` from the device's rng and rounded to `E`, so a
/// given seed produces the same stream for every dtype.
pub trait SampleTensor<E> {
    /// Samples from the standard normal distribution.
    fn sample_normal_like(&self, shape: &[usize]) -> Tensor<E> {
        self.try_sample_normal_like(shape).unwrap()
    }
    fn try_sample_normal_like(&self, shape: &[usize]) -> Result<Tensor<E>, Error> {
        self.try_sample_f64_like(shape, StandardNormal)
    }

    /// Samples uniformly from `[low, high)`.
    fn sample_uniform_like(&self, shape: &[usize], low: f64, high: f64) -> Tensor<E> {
        self.try_sample_uniform_like(shape, low, high).unwrap()
    }
    fn try_sample_uniform_like(
        &self,
        shape: &[usize],
        low: f64,
        high: f64,
    ) -> Result<Tensor<E>, Error> {
        self.try_sample_f64_like(shape, Uniform::new(low, high))
    }

    fn try_sample_f64_like<D: Distribution<f64>>(
        &self,
        shape: &[usize],
        distr: D,
    ) -> Result<Tensor<E>, Error>;
}

impl<E: Dtype> SampleTensor<E> for Cpu {
    fn try_sample_f64_like<D: Distribution<f64>>(
        &self,
        shape: &[usize],
        distr: D,
    ) -> Result<Tensor<E>, Error> {
        let mut data = self.try_alloc_zeros::<E>(num_elements(shape))?;
        {
            let mut rng = self.rng.lock().unwrap();
            for v in data.iter_mut() {
                *v = E::from_f64(rng.sample(&distr));
            }
        }
        Ok(Tensor {
            data: Arc::new(data),
            shape: shape.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::*;

    #[test]
    fn test_zeros_like() {
        let dev: TestDevice = Default::default();
        let t: Tensor<TestDtype> = dev.zeros_like(&[3, 0, 2]);
        assert_eq!(t.shape(), &[3, 0, 2]);
        assert_eq!(t.num_elements(), 0);
        let t: Tensor<TestDtype> = dev.zeros_like(&[2, 2]);
        assert_eq!(t.as_vec(), vec![TestDtype::default(); 4]);
    }

    #[test]
    fn test_tensor_from_vec_wrong_num_elements() {
        let dev: TestDevice = Default::default();
        let r = dev.try_tensor_from_vec(vec![1.0f32; 5], &[2, 3]);
        assert_eq!(r.unwrap_err(), Error::WrongNumElements);
    }

    #[test]
    fn test_seeded_samples_are_reproducible() {
        let a: Tensor<f64> = Cpu::with_seed(7).sample_normal_like(&[16]);
        let b: Tensor<f64> = Cpu::with_seed(7).sample_normal_like(&[16]);
        assert_eq!(a.as_vec(), b.as_vec());

        let u: Tensor<f64> = Cpu::with_seed(7).sample_uniform_like(&[64], -2.0, -1.0);
        assert!(u.as_vec().iter().all(|&x| (-2.0..-1.0).contains(&x)));
    }
}
