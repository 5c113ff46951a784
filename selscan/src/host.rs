//! Dtype-tagged host buffers and the dynamic dispatch onto the typed scan.
//!
//! A host hands over raw little endian bytes plus a [DType] tag. [forward] and
//! [backward] resolve one storage dtype for the whole call, decode the buffers
//! into [Tensor]s of that dtype, run the typed pass and encode the results back.
//!
//! ```rust
//! # use selscan::prelude::*;
//! let dev: Cpu = Default::default();
//! let u: Tensor<f32> = dev.sample_normal_like(&[1, 2, 5]);
//! let delta: Tensor<f32> = dev.sample_uniform_like(&[1, 2, 5], 0.0, 0.5);
//! let a: Tensor<f32> = dev.sample_uniform_like(&[2, 3], -1.0, -0.1);
//! let b: Tensor<f32> = dev.sample_normal_like(&[2, 3]);
//! let c: Tensor<f32> = dev.sample_normal_like(&[2, 3]);
//!
//! let inputs = HostInputs::new(
//!     HostTensor::from_tensor(&u),
//!     HostTensor::from_tensor(&delta),
//!     HostTensor::from_tensor(&a),
//!     HostTensor::from_tensor(&b),
//!     HostTensor::from_tensor(&c),
//! );
//! let fwd = host::forward(&dev, &inputs, &Default::default()).unwrap();
//! assert_eq!(fwd.out.dtype, DType::F32);
//! assert_eq!(fwd.trajectory.dtype(), DType::F32);
//!
//! let grads = host::backward(&dev, &fwd.out, &fwd.trajectory, &inputs).unwrap();
//! assert_eq!(grads.a.shape, vec![2, 3]);
//! ```

use selscan_core::{
    dtypes::{DType, Dtype},
    scan_ops::{
        try_selective_scan, try_selective_scan_backward, SavedTrajectory, ScanConfig,
        ScanInputs,
    },
    tensor::{Cpu, Error, Tensor, TensorFromVec},
};

/// A dense row-major buffer as a host framework holds it.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub dtype: DType,
    pub shape: Vec<usize>,
    /// Little endian element bytes.
    pub data: Vec<u8>,
}

impl HostTensor {
    pub fn from_tensor<E: Dtype>(t: &Tensor<E>) -> Self {
        let data = t
            .as_slice()
            .iter()
            .flat_map(|&x| x.to_le_bytes())
            .collect();
        Self {
            dtype: E::DTYPE,
            shape: t.shape().to_vec(),
            data,
        }
    }

    /// Decodes the buffer, which must already be tagged with `E`'s dtype.
    pub fn try_to_tensor<E: Dtype>(&self, dev: &Cpu) -> Result<Tensor<E>, Error> {
        if self.dtype != E::DTYPE {
            return Err(Error::UnsupportedPrecision {
                tensor: "host",
                dtype: self.dtype,
            });
        }
        let num_bytes = self
            .num_elements()
            .and_then(|n| n.checked_mul(E::NUM_BYTES));
        if num_bytes != Some(self.data.len()) {
            return Err(Error::WrongNumElements);
        }
        let data = self
            .data
            .chunks_exact(E::NUM_BYTES)
            .map(E::from_le_slice)
            .collect();
        dev.try_tensor_from_vec(data, &self.shape)
    }

    /// `None` when the shape's element count overflows `usize`.
    pub fn num_elements(&self) -> Option<usize> {
        self.shape
            .iter()
            .try_fold(1usize, |n, &dim| n.checked_mul(dim))
    }
}

/// Host-side counterpart of [ScanInputs].
#[derive(Debug, Clone, PartialEq)]
pub struct HostInputs {
    pub u: HostTensor,
    pub delta: HostTensor,
    pub a: HostTensor,
    pub b: HostTensor,
    pub c: HostTensor,
    pub d: Option<HostTensor>,
    pub z: Option<HostTensor>,
    pub delta_bias: Option<HostTensor>,
}

impl HostInputs {
    pub fn new(
        u: HostTensor,
        delta: HostTensor,
        a: HostTensor,
        b: HostTensor,
        c: HostTensor,
    ) -> Self {
        Self {
            u,
            delta,
            a,
            b,
            c,
            d: None,
            z: None,
            delta_bias: None,
        }
    }

    pub fn with_d(mut self, d: HostTensor) -> Self {
        self.d = Some(d);
        self
    }

    pub fn with_z(mut self, z: HostTensor) -> Self {
        self.z = Some(z);
        self
    }

    pub fn with_delta_bias(mut self, delta_bias: HostTensor) -> Self {
        self.delta_bias = Some(delta_bias);
        self
    }

    fn named(&self) -> impl Iterator<Item = (&'static str, &HostTensor)> + '_ {
        [
            ("u", Some(&self.u)),
            ("delta", Some(&self.delta)),
            ("a", Some(&self.a)),
            ("b", Some(&self.b)),
            ("c", Some(&self.c)),
            ("d", self.d.as_ref()),
            ("z", self.z.as_ref()),
            ("delta_bias", self.delta_bias.as_ref()),
        ]
        .into_iter()
        .filter_map(|(name, t)| t.map(|t| (name, t)))
    }

    /// The single storage dtype every tensor of the call is in.
    pub fn try_dtype(&self) -> Result<DType, Error> {
        let dtype = self.u.dtype;
        if !dtype.is_supported() {
            return Err(Error::UnsupportedPrecision { tensor: "u", dtype });
        }
        match self.named().find(|(_, t)| t.dtype != dtype) {
            Some((tensor, t)) => Err(Error::UnsupportedPrecision {
                tensor,
                dtype: t.dtype,
            }),
            None => Ok(dtype),
        }
    }

    fn decode<E: Dtype>(&self, dev: &Cpu) -> Result<TypedInputs<E>, Error> {
        let opt = |t: &Option<HostTensor>| t.as_ref().map(|t| t.try_to_tensor(dev)).transpose();
        Ok(TypedInputs {
            u: self.u.try_to_tensor(dev)?,
            delta: self.delta.try_to_tensor(dev)?,
            a: self.a.try_to_tensor(dev)?,
            b: self.b.try_to_tensor(dev)?,
            c: self.c.try_to_tensor(dev)?,
            d: opt(&self.d)?,
            z: opt(&self.z)?,
            delta_bias: opt(&self.delta_bias)?,
        })
    }
}

struct TypedInputs<E> {
    u: Tensor<E>,
    delta: Tensor<E>,
    a: Tensor<E>,
    b: Tensor<E>,
    c: Tensor<E>,
    d: Option<Tensor<E>>,
    z: Option<Tensor<E>>,
    delta_bias: Option<Tensor<E>>,
}

impl<E: Dtype> TypedInputs<E> {
    fn view(&self) -> ScanInputs<'_, E> {
        ScanInputs {
            u: &self.u,
            delta: &self.delta,
            a: &self.a,
            b: &self.b,
            c: &self.c,
            d: self.d.as_ref(),
            z: self.z.as_ref(),
            delta_bias: self.delta_bias.as_ref(),
        }
    }
}

/// Checkpoints of a host forward pass, tagged with the dtype it ran in.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum HostTrajectory {
    F32(SavedTrajectory<f32>),
    F64(SavedTrajectory<f64>),
    #[cfg(feature = "f16")]
    F16(SavedTrajectory<selscan_core::dtypes::f16>),
    #[cfg(feature = "f16")]
    BF16(SavedTrajectory<selscan_core::dtypes::bf16>),
}

impl HostTrajectory {
    pub fn dtype(&self) -> DType {
        match self {
            Self::F32(_) => DType::F32,
            Self::F64(_) => DType::F64,
            #[cfg(feature = "f16")]
            Self::F16(_) => DType::F16,
            #[cfg(feature = "f16")]
            Self::BF16(_) => DType::BF16,
        }
    }

    pub fn config(&self) -> &ScanConfig {
        match self {
            Self::F32(t) => t.config(),
            Self::F64(t) => t.config(),
            #[cfg(feature = "f16")]
            Self::F16(t) => t.config(),
            #[cfg(feature = "f16")]
            Self::BF16(t) => t.config(),
        }
    }
}

/// Storage dtypes with a [HostTrajectory] variant.
trait HostDtype: Dtype {
    fn wrap(t: SavedTrajectory<Self>) -> HostTrajectory;
    fn unwrap(t: &HostTrajectory) -> Option<&SavedTrajectory<Self>>;
}

macro_rules! host_dtype {
    ($Ty:ty, $Variant:ident) => {
        impl HostDtype for $Ty {
            fn wrap(t: SavedTrajectory<Self>) -> HostTrajectory {
                HostTrajectory::$Variant(t)
            }
            fn unwrap(t: &HostTrajectory) -> Option<&SavedTrajectory<Self>> {
                match t {
                    HostTrajectory::$Variant(t) => Some(t),
                    _ => None,
                }
            }
        }
    };
}

host_dtype!(f32, F32);
host_dtype!(f64, F64);
#[cfg(feature = "f16")]
host_dtype!(selscan_core::dtypes::f16, F16);
#[cfg(feature = "f16")]
host_dtype!(selscan_core::dtypes::bf16, BF16);

/// Result of [forward].
#[derive(Debug, Clone)]
pub struct HostOutput {
    pub out: HostTensor,
    pub last_state: Option<HostTensor>,
    pub trajectory: HostTrajectory,
    pub clamped_decays: usize,
}

/// Result of [backward], each gradient in the dtype and shape of its input.
#[derive(Debug, Clone, PartialEq)]
pub struct HostGradients {
    pub u: HostTensor,
    pub delta: HostTensor,
    pub a: HostTensor,
    pub b: HostTensor,
    pub c: HostTensor,
    pub d: Option<HostTensor>,
    pub z: Option<HostTensor>,
    pub delta_bias: Option<HostTensor>,
}

fn forward_typed<E: HostDtype>(
    dev: &Cpu,
    inputs: &HostInputs,
    cfg: &ScanConfig,
) -> Result<HostOutput, Error> {
    let typed = inputs.decode::<E>(dev)?;
    let fwd = try_selective_scan(dev, &typed.view(), cfg)?;
    Ok(HostOutput {
        out: HostTensor::from_tensor(&fwd.out),
        last_state: fwd.last_state.as_ref().map(HostTensor::from_tensor),
        trajectory: E::wrap(fwd.trajectory),
        clamped_decays: fwd.clamped_decays,
    })
}

fn backward_typed<E: HostDtype>(
    dev: &Cpu,
    dout: &HostTensor,
    trajectory: &HostTrajectory,
    inputs: &HostInputs,
) -> Result<HostGradients, Error> {
    let saved = E::unwrap(trajectory).ok_or_else(|| Error::InconsistentTrajectory {
        reason: format!(
            "trajectory was saved in {} but the inputs are {}",
            trajectory.dtype(),
            E::DTYPE
        ),
    })?;
    if dout.dtype != E::DTYPE {
        return Err(Error::UnsupportedPrecision {
            tensor: "dout",
            dtype: dout.dtype,
        });
    }
    let typed = inputs.decode::<E>(dev)?;
    let dout: Tensor<E> = dout.try_to_tensor(dev)?;
    let grads = try_selective_scan_backward(dev, &dout, saved, &typed.view())?;
    Ok(HostGradients {
        u: HostTensor::from_tensor(&grads.u),
        delta: HostTensor::from_tensor(&grads.delta),
        a: HostTensor::from_tensor(&grads.a),
        b: HostTensor::from_tensor(&grads.b),
        c: HostTensor::from_tensor(&grads.c),
        d: grads.d.as_ref().map(HostTensor::from_tensor),
        z: grads.z.as_ref().map(HostTensor::from_tensor),
        delta_bias: grads.delta_bias.as_ref().map(HostTensor::from_tensor),
    })
}

/// Runs the forward pass in the dtype all of `inputs` share.
///
/// Fails with [Error::UnsupportedPrecision] when that dtype has no kernel in
/// this build or when the inputs disagree on their dtype.
pub fn forward(dev: &Cpu, inputs: &HostInputs, cfg: &ScanConfig) -> Result<HostOutput, Error> {
    let dtype = inputs.try_dtype()?;
    tracing::debug!(%dtype, shape = ?inputs.u.shape, "dispatching selective scan forward");
    match dtype {
        DType::F32 => forward_typed::<f32>(dev, inputs, cfg),
        DType::F64 => forward_typed::<f64>(dev, inputs, cfg),
        #[cfg(feature = "f16")]
        DType::F16 => forward_typed::<selscan_core::dtypes::f16>(dev, inputs, cfg),
        #[cfg(feature = "f16")]
        DType::BF16 => forward_typed::<selscan_core::dtypes::bf16>(dev, inputs, cfg),
        dtype => Err(Error::UnsupportedPrecision { tensor: "u", dtype }),
    }
}

/// Runs the backward pass of a [forward] call.
///
/// `trajectory` must come from a [forward] over the same `inputs`.
pub fn backward(
    dev: &Cpu,
    dout: &HostTensor,
    trajectory: &HostTrajectory,
    inputs: &HostInputs,
) -> Result<HostGradients, Error> {
    let dtype = inputs.try_dtype()?;
    tracing::debug!(%dtype, shape = ?inputs.u.shape, "dispatching selective scan backward");
    match dtype {
        DType::F32 => backward_typed::<f32>(dev, dout, trajectory, inputs),
        DType::F64 => backward_typed::<f64>(dev, dout, trajectory, inputs),
        #[cfg(feature = "f16")]
        DType::F16 => backward_typed::<selscan_core::dtypes::f16>(dev, dout, trajectory, inputs),
        #[cfg(feature = "f16")]
        DType::BF16 => backward_typed::<selscan_core::dtypes::bf16>(dev, dout, trajectory, inputs),
        dtype => Err(Error::UnsupportedPrecision { tensor: "u", dtype }),
    }
}
