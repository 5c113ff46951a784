mod cpu_kernel;
mod reference;


pub use reference::selective_scan_ref;

use crate::{
    dtypes::{Dtype, ScanElem, StateMode},
    feature_flags::PARALLEL,
    scan_ops::{
        chunked_scan::{n_chunks, ScanStrategy},
        discretize::{Discretization, StabilityCheck},
    },
    tensor::{Error, Tensor},
};

/// Chunk size used by [ScanConfig::default].
pub const DEFAULT_CHUNK_SIZE: usize = 2048;

/// Where a coupling tensor (`b` or `c`) takes its values from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CouplingLayout {
    /// `[dim, dstate]`, constant over time and batch.
    Shared,
    /// `[batch, groups, seqlen, dstate]`, channel `d` reads group `d / (dim / groups)`.
    Selective { groups: usize },
}

/// Validated description of one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SelectiveScanOp {
    pub batch: usize,
    pub dim: usize,
    pub seqlen: usize,
    pub dstate: usize,
    pub mode: StateMode,
    pub b_layout: CouplingLayout,
    pub c_layout: CouplingLayout,
    pub has_d: bool,
    pub has_z: bool,
    pub has_delta_bias: bool,
}

impl SelectiveScanOp {
    /// Number of independent (batch, channel) units.
    pub fn units(&self) -> usize {
        self.batch * self.dim
    }

    pub fn n_chunks(&self, chunk_size: usize) -> usize {
        n_chunks(self.seqlen, chunk_size)
    }

    /// Number of accumulator scalars in the chunk boundaries of one unit.
    pub(crate) fn boundary_len_per_unit(&self, chunk_size: usize) -> usize {
        self.n_chunks(chunk_size) * self.dstate * self.mode.width()
    }

    pub(crate) fn boundary_len(&self, chunk_size: usize) -> usize {
        self.units() * self.boundary_len_per_unit(chunk_size)
    }

    /// State-element index of `(b, d, t, n = 0)` in a coupling tensor.
    #[inline]
    pub(crate) fn coupling_base(
        &self,
        layout: CouplingLayout,
        b: usize,
        d: usize,
        t: usize,
    ) -> usize {
        match layout {
            CouplingLayout::Shared => d * self.dstate,
            CouplingLayout::Selective { groups } => {
                let g = d / (self.dim / groups);
                ((b * groups + g) * self.seqlen + t) * self.dstate
            }
        }
    }

    /// Number of channel blocks per batch entry such that every selective coupling
    /// group lies inside a single block.
    pub(crate) fn blocks_per_batch(&self) -> usize {
        let groups = |layout: CouplingLayout| match layout {
            CouplingLayout::Shared => None,
            CouplingLayout::Selective { groups } => Some(groups),
        };
        match (groups(self.b_layout), groups(self.c_layout)) {
            (None, None) => self.dim.max(1),
            (Some(g), None) | (None, Some(g)) => g,
            (Some(g1), Some(g2)) => gcd(g1, g2),
        }
    }

    /// Number of state elements in a coupling tensor.
    pub(crate) fn coupling_len(&self, layout: CouplingLayout) -> usize {
        match layout {
            CouplingLayout::Shared => self.dim * self.dstate,
            CouplingLayout::Selective { groups } => self.batch * groups * self.seqlen * self.dstate,
        }
    }
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Configuration of a pass.
///
/// ```rust
/// # use selscan_core::prelude::*;
/// let cfg = ScanConfig {
///     chunk_size: 64,
///     strategy: ScanStrategy::LogDepth,
///     delta_softplus: true,
///     ..Default::default()
/// };
/// assert_eq!(cfg.discretization, Discretization::Euler);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanConfig {
    /// Steps per chunk. The forward pass checkpoints the state at every chunk end.
    pub chunk_size: usize,
    pub strategy: ScanStrategy,
    pub discretization: Discretization,
    /// Apply softplus to `delta + delta_bias`.
    pub delta_softplus: bool,
    pub stability: StabilityCheck,
    /// Also return the state after the last step.
    pub return_last_state: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            strategy: Default::default(),
            discretization: Default::default(),
            delta_softplus: false,
            stability: Default::default(),
            return_last_state: false,
        }
    }
}

/// Borrowed inputs of a pass.
///
/// The mode of the hidden state is decided by the rank of `a`: `[dim, dstate]` is
/// real, `[dim, dstate, 2]` is complex. `b` and `c` are either
/// - `[dim, dstate]` / `[dim, dstate, 2]` (shared), or
/// - `[batch, groups, seqlen, dstate]` / `[batch, groups, seqlen, dstate, 2]` (selective).
#[derive(Debug, Clone, Copy)]
pub struct ScanInputs<'a, E> {
    pub u: &'a Tensor<E>,
    pub delta: &'a Tensor<E>,
    pub a: &'a Tensor<E>,
    pub b: &'a Tensor<E>,
    pub c: &'a Tensor<E>,
    pub d: Option<&'a Tensor<E>>,
    pub z: Option<&'a Tensor<E>>,
    pub delta_bias: Option<&'a Tensor<E>>,
}

impl<'a, E: Dtype> ScanInputs<'a, E> {
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

    /// Skip connection `D * u`.
    pub fn with_d(mut self, d: &'a Tensor<E>) -> Self {
        self.d = Some(d);
        self
    }

    /// Gate, `out = y * silu(z)`.
    pub fn with_z(mut self, z: &'a Tensor<E>) -> Self {
        self.z = Some(z);
        self
    }

    pub fn with_delta_bias(mut self, delta_bias: &'a Tensor<E>) -> Self {
        self.delta_bias = Some(delta_bias);
        self
    }

    /// Validates every shape and returns the description of the pass.
    pub fn try_op(&self) -> Result<SelectiveScanOp, Error> {
        let (batch, dim, seqlen) = match self.u.shape() {
            &[batch, dim, seqlen] => (batch, dim, seqlen),
            s => return Err(Error::layout("u", "[batch, dim, seqlen]", s)),
        };
        if self.delta.shape() != self.u.shape() {
            return Err(Error::shape("delta", [batch, dim, seqlen], self.delta.shape()));
        }

        let (mode, dstate) = match self.a.shape() {
            &[d, n] if d == dim => (StateMode::Real, n),
            &[d, n, 2] if d == dim => (StateMode::Complex, n),
            s => {
                let expected = format!("[{dim}, dstate] or [{dim}, dstate, 2]");
                return Err(Error::layout("a", &expected, s));
            }
        };
        if dstate == 0 {
            return Err(Error::layout("a", "dstate > 0", self.a.shape()));
        }

        let partial = SelectiveScanOp {
            batch,
            dim,
            seqlen,
            dstate,
            mode,
            b_layout: CouplingLayout::Shared,
            c_layout: CouplingLayout::Shared,
            has_d: self.d.is_some(),
            has_z: self.z.is_some(),
            has_delta_bias: self.delta_bias.is_some(),
        };
        let b_layout = coupling_layout("b", self.b, &partial)?;
        let c_layout = coupling_layout("c", self.c, &partial)?;

        if let Some(d) = self.d {
            if d.shape() != [dim] {
                return Err(Error::shape("d", [dim], d.shape()));
            }
        }
        if let Some(z) = self.z {
            if z.shape() != self.u.shape() {
                return Err(Error::shape("z", [batch, dim, seqlen], z.shape()));
            }
        }
        if let Some(bias) = self.delta_bias {
            if bias.shape() != [dim] {
                return Err(Error::shape("delta_bias", [dim], bias.shape()));
            }
        }

        Ok(SelectiveScanOp {
            b_layout,
            c_layout,
            ..partial
        })
    }

    /// Rejects transitions that would make the state grow and non-finite time steps.
    ///
    /// Without softplus the raw `delta + delta_bias` is the time step, so a negative
    /// value is rejected too.
    pub fn check_stability(&self, op: &SelectiveScanOp, delta_softplus: bool) -> Result<(), Error> {
        check_stability(
            self.a,
            self.delta,
            self.delta_bias,
            op.mode.width(),
            op.seqlen,
            delta_softplus,
        )
    }
}

/// `delta` is laid out `[.., dim, steps]` and `delta_bias` is `[dim]`.
pub(crate) fn check_stability<E: Dtype>(
    a: &Tensor<E>,
    delta: &Tensor<E>,
    delta_bias: Option<&Tensor<E>>,
    width: usize,
    steps: usize,
    delta_softplus: bool,
) -> Result<(), Error> {
    for (i, a) in a.as_slice().chunks_exact(width).enumerate() {
        if !(a[0].to_f64() <= 0.0) || !a.iter().all(|x| x.to_f64().is_finite()) {
            return Err(Error::NumericInstability {
                tensor: "a",
                index: i * width,
            });
        }
    }
    let bias = delta_bias.map(|t| t.as_slice());
    if let Some(bias) = bias {
        if let Some(index) = bias.iter().position(|x| !x.to_f64().is_finite()) {
            return Err(Error::NumericInstability {
                tensor: "delta_bias",
                index,
            });
        }
    }
    for (i, delta) in delta.as_slice().iter().enumerate() {
        let row = i / steps.max(1);
        let v = delta.to_f64() + bias.map_or(0.0, |b| b[row % b.len()].to_f64());
        if !v.is_finite() || (!delta_softplus && v < 0.0) {
            return Err(Error::NumericInstability {
                tensor: "delta",
                index: i,
            });
        }
    }
    Ok(())
}

fn coupling_layout<E: Dtype>(
    name: &'static str,
    t: &Tensor<E>,
    op: &SelectiveScanOp,
) -> Result<CouplingLayout, Error> {
    let SelectiveScanOp {
        batch,
        dim,
        seqlen,
        dstate,
        ..
    } = *op;
    let (layout, paired) = match t.shape() {
        &[d, n] if d == dim && n == dstate => (CouplingLayout::Shared, false),
        &[d, n, 2] if d == dim && n == dstate => (CouplingLayout::Shared, true),
        &[b, groups, l, n] if b == batch && l == seqlen && n == dstate => {
            (CouplingLayout::Selective { groups }, false)
        }
        &[b, groups, l, n, 2] if b == batch && l == seqlen && n == dstate => {
            (CouplingLayout::Selective { groups }, true)
        }
        s => {
            let expected = format!(
                "[{dim}, {dstate}(, 2)] or [{batch}, groups, {seqlen}, {dstate}(, 2)]"
            );
            return Err(Error::layout(name, &expected, s));
        }
    };
    if paired != (op.mode == StateMode::Complex) {
        return Err(Error::UnsupportedVariant {
            tensor: name,
            mode: op.mode,
        });
    }
    if let CouplingLayout::Selective { groups } = layout {
        if groups == 0 || dim % groups != 0 {
            return Err(Error::layout(name, &format!("groups dividing dim = {dim}"), t.shape()));
        }
    }
    Ok(layout)
}

/// Checkpoints of a forward pass, consumed by the backward pass.
///
/// Holds the state at the end of every chunk in accumulator precision,
/// `[batch, dim, n_chunks, dstate]` (times 2 when complex), along with the
/// description and configuration of the pass that produced it.
#[derive(Debug, Clone)]
pub struct SavedTrajectory<E: Dtype> {
    pub(crate) op: SelectiveScanOp,
    pub(crate) config: ScanConfig,
    pub(crate) boundaries: Vec<E::Acc>,
}

impl<E: Dtype> SavedTrajectory<E> {
    pub fn op(&self) -> &SelectiveScanOp {
        &self.op
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn n_chunks(&self) -> usize {
        self.op.n_chunks(self.config.chunk_size)
    }

    pub fn boundaries(&self) -> &[E::Acc] {
        &self.boundaries
    }
}

/// Result of a forward pass.
#[derive(Debug, Clone)]
pub struct ScanOutput<E: Dtype> {
    /// `[batch, dim, seqlen]`
    pub out: Tensor<E>,
    /// `[batch, dim, dstate]` (plus a trailing 2 when complex), present when
    /// [ScanConfig::return_last_state] is set.
    pub last_state: Option<Tensor<E>>,
    pub trajectory: SavedTrajectory<E>,
    /// Number of `(batch, channel, step, state)` transitions whose real part had to
    /// be clamped.
    pub clamped_decays: usize,
}

/// Gradients of a pass, each with the shape of its input.
#[derive(Debug, Clone)]
pub struct ScanGradients<E> {
    pub u: Tensor<E>,
    pub delta: Tensor<E>,
    pub a: Tensor<E>,
    pub b: Tensor<E>,
    pub c: Tensor<E>,
    pub d: Option<Tensor<E>>,
    pub z: Option<Tensor<E>>,
    pub delta_bias: Option<Tensor<E>>,
}

pub trait SelectiveScanKernel<E: Dtype> {
    fn forward(
        &self,
        op: &SelectiveScanOp,
        cfg: &ScanConfig,
        inp: &ScanInputs<E>,
    ) -> Result<ScanOutput<E>, Error>;

    fn backward(
        &self,
        dout: &Tensor<E>,
        trajectory: &SavedTrajectory<E>,
        inp: &ScanInputs<E>,
    ) -> Result<ScanGradients<E>, Error>;
}

/// Runs the selective scan over `inputs`.
///
/// Every error is reported before any work is dispatched.
pub fn try_selective_scan<E: Dtype, D: SelectiveScanKernel<E>>(
    dev: &D,
    inputs: &ScanInputs<E>,
    cfg: &ScanConfig,
) -> Result<ScanOutput<E>, Error> {
    if cfg.chunk_size == 0 {
        return Err(Error::ZeroChunkSize);
    }
    let op = inputs.try_op()?;
    if cfg.stability == StabilityCheck::Strict {
        inputs.check_stability(&op, cfg.delta_softplus)?;
    }

    let dtype = E::DTYPE;
    let span = tracing::debug_span!(
        "selective_scan",
        batch = op.batch,
        dim = op.dim,
        seqlen = op.seqlen,
        dstate = op.dstate,
        mode = ?op.mode,
        dtype = %dtype,
        chunk_size = cfg.chunk_size,
        parallel = PARALLEL,
    );
    let _enter = span.enter();

    let out = dev.forward(&op, cfg, inputs)?;
    if out.clamped_decays > 0 {
        tracing::warn!(
            clamped = out.clamped_decays,
            "clamped transitions with positive real part"
        );
    }
    Ok(out)
}

/// See [try_selective_scan]
pub fn selective_scan<E: Dtype, D: SelectiveScanKernel<E>>(
    dev: &D,
    inputs: &ScanInputs<E>,
    cfg: &ScanConfig,
) -> ScanOutput<E> {
    try_selective_scan(dev, inputs, cfg).unwrap()
}

/// Computes the gradients of every input of a forward pass, given the gradient
/// of its output.
///
/// `inputs` must be the inputs the forward pass that produced `trajectory` ran on.
/// The chunking and discretization of the forward pass are taken from the
/// trajectory.
pub fn try_selective_scan_backward<E: Dtype, D: SelectiveScanKernel<E>>(
    dev: &D,
    dout: &Tensor<E>,
    trajectory: &SavedTrajectory<E>,
    inputs: &ScanInputs<E>,
) -> Result<ScanGradients<E>, Error> {
    let op = inputs.try_op()?;
    if op != trajectory.op {
        return Err(Error::InconsistentTrajectory {
            reason: format!(
                "trajectory was saved for {:?}, inputs describe {:?}",
                trajectory.op, op
            ),
        });
    }
    if trajectory.config.chunk_size == 0 {
        return Err(Error::ZeroChunkSize);
    }
    let expected = op.boundary_len(trajectory.config.chunk_size);
    if trajectory.boundaries.len() != expected {
        return Err(Error::InconsistentTrajectory {
            reason: format!(
                "expected {expected} boundary values, found {}",
                trajectory.boundaries.len()
            ),
        });
    }
    if dout.shape() != inputs.u.shape() {
        return Err(Error::shape("dout", inputs.u.shape(), dout.shape()));
    }

    let dtype = E::DTYPE;
    let span = tracing::debug_span!(
        "selective_scan_backward",
        batch = op.batch,
        dim = op.dim,
        seqlen = op.seqlen,
        dstate = op.dstate,
        mode = ?op.mode,
        dtype = %dtype,
        chunk_size = trajectory.config.chunk_size,
        parallel = PARALLEL,
    );
    let _enter = span.enter();

    dev.backward(dout, trajectory, inputs)
}

/// See [try_selective_scan_backward]
pub fn selective_scan_backward<E: Dtype, D: SelectiveScanKernel<E>>(
    dev: &D,
    dout: &Tensor<E>,
    trajectory: &SavedTrajectory<E>,
    inputs: &ScanInputs<E>,
) -> ScanGradients<E> {
    try_selective_scan_backward(dev, dout, trajectory, inputs).unwrap()
}

/// Loads element `n` of a coupling row that starts at state-element `base`.
#[inline(always)]
pub(crate) fn load_elem<E: Dtype, S: ScanElem<E::Acc>>(src: &[E], base: usize, n: usize) -> S {
    S::load(&src[(base + n) * S::MODE.width()..])
}

/// Adds `v` into the accumulator slot `i`.
#[inline(always)]
pub(crate) fn accumulate<R: Copy, S: ScanElem<R>>(dst: &mut [R], i: usize, v: S) {
    let w = S::MODE.width();
    let cur = S::load_acc(&dst[i * w..]);
    (cur + v).store_acc(&mut dst[i * w..]);
}
