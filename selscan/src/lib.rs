//! # selscan
//!
//! selscan exposes the selective scan of [selscan_core] to host frameworks that
//! hold their tensors as raw, dtype-tagged byte buffers.
//!
//! - [host] decodes [host::HostTensor]s, picks the storage dtype at runtime and
//!   dispatches to the typed forward and backward passes.
//! - [function] wraps that pair as [function::SelectiveScanFn], an operator whose
//!   forward hands back a [function::SavedContext] for its backward.
//!
//! Everything from [selscan_core] is re-exported, so typed callers can use this
//! crate alone.
//!
//! ```rust
//! # use selscan::prelude::*;
//! let dev: Cpu = Default::default();
//! let u: Tensor<f32> = dev.sample_normal_like(&[1, 2, 4]);
//! let host_u = HostTensor::from_tensor(&u);
//! assert_eq!(host_u.dtype, DType::F32);
//! assert_eq!(host_u.data.len(), 8 * 4);
//! ```
//!
//! See [feature_flags] for details on feature flags.

pub mod function;
pub mod host;

pub use selscan_core::*;

pub mod prelude {
    pub use crate::function::{SavedContext, SelectiveScanFn};
    pub use crate::host::{
        self, HostGradients, HostInputs, HostOutput, HostTensor, HostTrajectory,
    };
    pub use selscan_core::prelude::*;
}
