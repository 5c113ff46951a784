//! # selscan-core
//!
//! selscan-core computes the selective scan of a state-space sequence model
//! (the recurrence at the heart of Mamba), together with its exact backward pass,
//! written entirely in rust!
//!
//! The following sections provide some high level core concepts & examples, and
//! there is more detailed documentation in each of the submodules.
//!
//! See [feature_flags] for details on feature flags.
//!
//! # Dtypes & Tensors
//!
//! *See [dtypes] and [tensor] for more information.*
//!
//! A [`tensor::Tensor`] is a dense row-major nd-array with a runtime shape. The element
//! type is a storage [`dtypes::Dtype`]: `f32`, `f64`, and with the `f16` feature
//! [`dtypes::f16`] and [`dtypes::bf16`]. Every dtype names an accumulator type
//! ([`dtypes::Dtype::Acc`]) and all scan arithmetic happens in that accumulator,
//! so compact storage never means compact accumulation.
//!
//! # Devices
//!
//! Devices allocate tensors and execute ops. [`tensor::Cpu`] stores tensors on the
//! heap and runs the scan over (batch, channel) units with rayon.
//!
//! ```rust
//! # use selscan_core::prelude::*;
//! let dev: Cpu = Default::default();
//! let u: Tensor<f32> = dev.sample_normal_like(&[2, 4, 16]);
//! assert_eq!(u.shape(), &[2, 4, 16]);
//! ```
//!
//! # The selective scan
//!
//! *See [scan_ops] for more information*
//!
//! For every batch item `b`, channel `d` and state index `n`:
//!
//! ```text
//! dt[t]   = softplus(delta[t] + delta_bias)          (or the identity)
//! x[t]    = exp(dt[t] * A) * x[t - 1] + dt[t] * B[t] * u[t]
//! y[t]    = Re(sum_n C[t] * x[t]) + D * u[t]
//! out[t]  = y[t] * silu(z[t])                          (when a gate is given)
//! ```
//!
//! ```rust
//! # use selscan_core::prelude::*;
//! let dev: Cpu = Default::default();
//! let u: Tensor<f32> = dev.sample_normal_like(&[2, 4, 16]);
//! let delta: Tensor<f32> = dev.sample_uniform_like(&[2, 4, 16], 0.01, 0.5);
//! let a: Tensor<f32> = dev.sample_uniform_like(&[4, 8], -2.0, -0.1);
//! let b: Tensor<f32> = dev.sample_normal_like(&[2, 1, 16, 8]);
//! let c: Tensor<f32> = dev.sample_normal_like(&[2, 1, 16, 8]);
//!
//! let inputs = ScanInputs::new(&u, &delta, &a, &b, &c);
//! let cfg = ScanConfig { chunk_size: 4, ..Default::default() };
//! let fwd = try_selective_scan(&dev, &inputs, &cfg).unwrap();
//! assert_eq!(fwd.out.shape(), u.shape());
//!
//! let grad_out: Tensor<f32> = dev.sample_normal_like(&[2, 4, 16]);
//! let grads = try_selective_scan_backward(&dev, &grad_out, &fwd.trajectory, &inputs).unwrap();
//! assert_eq!(grads.a.shape(), a.shape());
//! ```

pub mod dtypes;
pub mod feature_flags;
pub mod scan_ops;
pub mod tensor;

/// Contains subset of all public exports.
pub mod prelude {
    pub use crate::dtypes::*;
    pub use crate::scan_ops::*;
    pub use crate::tensor::*;
}
