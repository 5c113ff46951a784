//! Operations of the selective scan.
//!
//! The building blocks are public modules:
//! - [discretize]: continuous-time parameters to discrete coefficients.
//! - [chunked_scan]: the associative scan of `x[t] = a[t] * x[t - 1] + b[t]` in
//!   chunks, forward and reverse.
//! - [output_proj]: the state readout and the gate.
//!
//! The passes built from them are re-exported here:
//! - [try_selective_scan] / [try_selective_scan_backward]: the full sequence pass
//!   and its gradients, over (batch, channel) units in parallel.
//! - [selective_scan_ref]: a naive `f64` recurrence.
//! - [try_selective_state_update]: a single decoding step.
//!
//! # Forward and backward
//!
//! The forward pass returns a [SavedTrajectory] holding the state at every chunk
//! end. The backward pass recomputes each chunk from the previous checkpoint and
//! runs the adjoint recurrence backwards through the chunks:
//!
//! ```rust
//! # use selscan_core::prelude::*;
//! let dev: Cpu = Default::default();
//! let u: Tensor<f64> = dev.sample_normal_like(&[1, 2, 6]);
//! let delta: Tensor<f64> = dev.sample_normal_like(&[1, 2, 6]);
//! let a: Tensor<f64> = dev.sample_uniform_like(&[2, 4, 2], -1.0, -0.1);
//! let b: Tensor<f64> = dev.sample_normal_like(&[1, 1, 6, 4, 2]);
//! let c: Tensor<f64> = dev.sample_normal_like(&[1, 1, 6, 4, 2]);
//! let inputs = ScanInputs::new(&u, &delta, &a, &b, &c);
//! let cfg = ScanConfig {
//!     chunk_size: 4,
//!     delta_softplus: true,
//!     ..Default::default()
//! };
//! let fwd = try_selective_scan(&dev, &inputs, &cfg).unwrap();
//! assert_eq!(fwd.trajectory.op().mode, StateMode::Complex);
//! assert_eq!(fwd.trajectory.n_chunks(), 2);
//!
//! let grads = try_selective_scan_backward(&dev, &fwd.out, &fwd.trajectory, &inputs).unwrap();
//! assert_eq!(grads.b.shape(), b.shape());
//! assert!(grads.d.is_none());
//! ```

pub mod chunked_scan;
pub mod discretize;
pub mod output_proj;
mod selective_scan;
mod state_update;

pub use chunked_scan::ScanStrategy;
pub use discretize::{Discretization, StabilityCheck};
pub use selective_scan::*;
pub use state_update::*;
