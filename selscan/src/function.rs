//! A differentiable operator for host autograd engines.
//!
//! [SelectiveScanFn::try_forward] returns the output together with a
//! [SavedContext] that owns everything the matching
//! [SelectiveScanFn::try_backward] needs. The context is consumed by the
//! backward call, so each forward is differentiated at most once.
//!
//! ```rust
//! # use selscan::prelude::*;
//! let dev: Cpu = Default::default();
//! let host = |t: Tensor<f32>| HostTensor::from_tensor(&t);
//! let inputs = HostInputs::new(
//!     host(dev.sample_normal_like(&[2, 3, 8])),
//!     host(dev.sample_uniform_like(&[2, 3, 8], -1.0, 1.0)),
//!     host(dev.sample_uniform_like(&[3, 4], -1.0, -0.1)),
//!     host(dev.sample_normal_like(&[2, 1, 8, 4])),
//!     host(dev.sample_normal_like(&[2, 1, 8, 4])),
//! );
//! let f = SelectiveScanFn::new(ScanConfig {
//!     delta_softplus: true,
//!     return_last_state: true,
//!     ..Default::default()
//! });
//! let (out, ctx) = f.try_forward(inputs).unwrap();
//! assert_eq!(ctx.last_state().unwrap().shape, vec![2, 3, 4]);
//!
//! let grads = f.try_backward(ctx, &out).unwrap();
//! assert_eq!(grads.b.shape, vec![2, 1, 8, 4]);
//! ```

use crate::host::{self, HostGradients, HostInputs, HostTensor, HostTrajectory};
use selscan_core::{scan_ops::ScanConfig, tensor::{Cpu, Error}};

/// The selective scan as a forward/backward pair over host buffers.
#[derive(Debug, Clone, Default)]
pub struct SelectiveScanFn {
    pub cfg: ScanConfig,
    dev: Cpu,
}

/// What a forward call leaves behind for its backward call.
#[derive(Debug, Clone)]
pub struct SavedContext {
    inputs: HostInputs,
    trajectory: HostTrajectory,
    last_state: Option<HostTensor>,
    clamped_decays: usize,
}

impl SavedContext {
    pub fn inputs(&self) -> &HostInputs {
        &self.inputs
    }

    pub fn trajectory(&self) -> &HostTrajectory {
        &self.trajectory
    }

    /// Present when the forward ran with [ScanConfig::return_last_state].
    pub fn last_state(&self) -> Option<&HostTensor> {
        self.last_state.as_ref()
    }

    pub fn clamped_decays(&self) -> usize {
        self.clamped_decays
    }
}

impl SelectiveScanFn {
    pub fn new(cfg: ScanConfig) -> Self {
        Self {
            cfg,
            dev: Default::default(),
        }
    }

    pub fn with_device(cfg: ScanConfig, dev: Cpu) -> Self {
        Self { cfg, dev }
    }

    pub fn try_forward(&self, inputs: HostInputs) -> Result<(HostTensor, SavedContext), Error> {
        let fwd = host::forward(&self.dev, &inputs, &self.cfg)?;
        let ctx = SavedContext {
            inputs,
            trajectory: fwd.trajectory,
            last_state: fwd.last_state,
            clamped_decays: fwd.clamped_decays,
        };
        Ok((fwd.out, ctx))
    }

    pub fn forward(&self, inputs: HostInputs) -> (HostTensor, SavedContext) {
        self.try_forward(inputs).unwrap()
    }

    /// The configuration stored in `ctx` wins over [SelectiveScanFn::cfg].
    pub fn try_backward(
        &self,
        ctx: SavedContext,
        dout: &HostTensor,
    ) -> Result<HostGradients, Error> {
        host::backward(&self.dev, dout, &ctx.trajectory, &ctx.inputs)
    }

    pub fn backward(&self, ctx: SavedContext, dout: &HostTensor) -> HostGradients {
        self.try_backward(ctx, dout).unwrap()
    }
}
