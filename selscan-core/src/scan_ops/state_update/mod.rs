mod cpu_kernel;

#[cfg(test)]
mod tests;

use super::selective_scan::{check_stability, CouplingLayout, ScanConfig};
use crate::{
    dtypes::{Dtype, StateMode},
    scan_ops::discretize::StabilityCheck,
    tensor::{Error, Tensor},
};

/// Inputs of one decoding step.
///
/// `u`, `delta` and `z` are `[batch, dim]`. `a` is `[dim, dstate]` (real) or
/// `[dim, dstate, 2]` (complex). `b` and `c` are shared `[dim, dstate]` or
/// per-step `[batch, groups, dstate]`, with a trailing 2 when complex.
#[derive(Debug, Clone, Copy)]
pub struct StepInputs<'a, E> {
    pub u: &'a Tensor<E>,
    pub delta: &'a Tensor<E>,
    pub a: &'a Tensor<E>,
    pub b: &'a Tensor<E>,
    pub c: &'a Tensor<E>,
    pub d: Option<&'a Tensor<E>>,
    pub z: Option<&'a Tensor<E>>,
    pub delta_bias: Option<&'a Tensor<E>>,
}

/// Validated description of a decoding step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepOp {
    pub batch: usize,
    pub dim: usize,
    pub dstate: usize,
    pub mode: StateMode,
    /// [CouplingLayout::Selective] here means `[batch, groups, dstate]`.
    pub b_layout: CouplingLayout,
    pub c_layout: CouplingLayout,
}

impl StepOp {
    #[inline]
    pub(crate) fn coupling_base(&self, layout: CouplingLayout, b: usize, d: usize) -> usize {
        match layout {
            CouplingLayout::Shared => d * self.dstate,
            CouplingLayout::Selective { groups } => {
                (b * groups + d / (self.dim / groups)) * self.dstate
            }
        }
    }

    pub fn state_shape(&self) -> Vec<usize> {
        let mut shape = vec![self.batch, self.dim, self.dstate];
        if self.mode == StateMode::Complex {
            shape.push(2);
        }
        shape
    }
}

impl<'a, E: Dtype> StepInputs<'a, E> {
    pub fn new(
        u: &'a Tensor<E>,
        delta: &'a Tensor<E>,
        a: &'a Tensor<E>,
        b: &'a Tensor<E>,
        c: &'a Tensor<E>,
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

    pub fn with_d(mut self, d: &'a Tensor<E>) -> Self {
        self.d = Some(d);
        self
    }

    pub fn with_z(mut self, z: &'a Tensor<E>) -> Self {
        self.z = Some(z);
        self
    }

    pub fn with_delta_bias(mut self, delta_bias: &'a Tensor<E>) -> Self {
        self.delta_bias = Some(delta_bias);
        self
    }

    pub fn try_op(&self) -> Result<StepOp, Error> {
        let (batch, dim) = match self.u.shape() {
            &[batch, dim] => (batch, dim),
            s => return Err(Error::layout("u", "[batch, dim]", s)),
        };
        if self.delta.shape() != self.u.shape() {
            return Err(Error::shape("delta", [batch, dim], self.delta.shape()));
        }
        let (mode, dstate) = match self.a.shape() {
            &[d, n] if d == dim && n > 0 => (StateMode::Real, n),
            &[d, n, 2] if d == dim && n > 0 => (StateMode::Complex, n),
            s => {
                return Err(Error::layout(
                    "a",
                    &format!("[{dim}, dstate > 0] or [{dim}, dstate > 0, 2]"),
                    s,
                ))
            }
        };
        let mut op = StepOp {
            batch,
            dim,
            dstate,
            mode,
            b_layout: CouplingLayout::Shared,
            c_layout: CouplingLayout::Shared,
        };
        op.b_layout = step_coupling_layout("b", self.b, &op)?;
        op.c_layout = step_coupling_layout("c", self.c, &op)?;

        for (name, t) in [("d", self.d), ("delta_bias", self.delta_bias)] {
            if let Some(t) = t {
                if t.shape() != [dim] {
                    return Err(Error::shape(name, [dim], t.shape()));
                }
            }
        }
        if let Some(z) = self.z {
            if z.shape() != self.u.shape() {
                return Err(Error::shape("z", [batch, dim], z.shape()));
            }
        }
        Ok(op)
    }
}

/// Shared and per-step layouts overlap in rank once the trailing pair axis is
/// counted, so a shape is matched against both readings and the state mode
/// picks between them.
fn step_coupling_layout<E>(
    name: &'static str,
    t: &Tensor<E>,
    op: &StepOp,
) -> Result<CouplingLayout, Error> {
    let fits = |s: &[usize]| match s {
        &[d, n] if d == op.dim && n == op.dstate => Some(CouplingLayout::Shared),
        &[b, groups, n] if b == op.batch && n == op.dstate => {
            Some(CouplingLayout::Selective { groups })
        }
        _ => None,
    };
    let shape = t.shape();
    let plain = fits(shape);
    let paired = match shape.split_last() {
        Some((&2, rest)) => fits(rest),
        _ => None,
    };
    let layout = match (op.mode, plain, paired) {
        (StateMode::Real, Some(l), _) | (StateMode::Complex, _, Some(l)) => l,
        (StateMode::Real, None, Some(_)) | (StateMode::Complex, Some(_), None) => {
            return Err(Error::UnsupportedVariant {
                tensor: name,
                mode: op.mode,
            })
        }
        _ => {
            let expected = format!(
                "[{}, {}(, 2)] or [{}, groups, {}(, 2)]",
                op.dim, op.dstate, op.batch, op.dstate
            );
            return Err(Error::layout(name, &expected, shape));
        }
    };
    if let CouplingLayout::Selective { groups } = layout {
        if groups == 0 || op.dim % groups != 0 {
            return Err(Error::layout(name, &format!("groups dividing dim = {}", op.dim), shape));
        }
    }
    Ok(layout)
}

pub trait SelectiveStateUpdateKernel<E: Dtype> {
    /// Advances `state` by one step and returns `(y, clamped transitions)`.
    fn step(
        &self,
        op: &StepOp,
        cfg: &ScanConfig,
        state: &mut Tensor<E>,
        inp: &StepInputs<E>,
    ) -> Result<(Tensor<E>, usize), Error>;
}

/// Advances the recurrence by one step for autoregressive decoding.
///
/// `state` is `[batch, dim, dstate]` (plus a trailing 2 when complex) and is
/// updated in place; the returned output is `[batch, dim]`. Only the
/// discretization, softplus and stability settings of `cfg` apply.
///
/// ```rust
/// # use selscan_core::prelude::*;
/// let dev: Cpu = Default::default();
/// let a: Tensor<f32> = dev.sample_uniform_like(&[3, 4], -1.0, -0.1);
/// let b: Tensor<f32> = dev.sample_normal_like(&[2, 1, 4]);
/// let c: Tensor<f32> = dev.sample_normal_like(&[2, 1, 4]);
/// let mut state: Tensor<f32> = dev.zeros_like(&[2, 3, 4]);
/// for _ in 0..3 {
///     let u: Tensor<f32> = dev.sample_normal_like(&[2, 3]);
///     let delta: Tensor<f32> = dev.sample_uniform_like(&[2, 3], 0.0, 0.5);
///     let inputs = StepInputs::new(&u, &delta, &a, &b, &c);
///     let y = try_selective_state_update(&dev, &mut state, &inputs, &Default::default()).unwrap();
///     assert_eq!(y.shape(), &[2, 3]);
/// }
/// ```
pub fn try_selective_state_update<E: Dtype, D: SelectiveStateUpdateKernel<E>>(
    dev: &D,
    state: &mut Tensor<E>,
    inputs: &StepInputs<E>,
    cfg: &ScanConfig,
) -> Result<Tensor<E>, Error> {
    let op = inputs.try_op()?;
    let expected = op.state_shape();
    if state.shape() != expected.as_slice() {
        return Err(Error::shape("state", expected, state.shape()));
    }
    if cfg.stability == StabilityCheck::Strict {
        check_stability(
            inputs.a,
            inputs.delta,
            inputs.delta_bias,
            op.mode.width(),
            1,
            cfg.delta_softplus,
        )?;
    }
    let _span = tracing::trace_span!(
        "selective_state_update",
        batch = op.batch,
        dim = op.dim,
        dstate = op.dstate,
        mode = ?op.mode,
    )
    .entered();
    let (y, clamped) = dev.step(&op, cfg, state, inputs)?;
    if clamped > 0 {
        tracing::warn!(clamped, "clamped transitions with positive real part");
    }
    Ok(y)
}

/// See [try_selective_state_update]
pub fn selective_state_update<E: Dtype, D: SelectiveStateUpdateKernel<E>>(
    dev: &D,
    state: &mut Tensor<E>,
    inputs: &StepInputs<E>,
    cfg: &ScanConfig,
) -> Tensor<E> {
    try_selective_state_update(dev, state, inputs, cfg).unwrap()
}
