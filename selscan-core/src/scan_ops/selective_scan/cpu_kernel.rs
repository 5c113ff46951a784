#![allow(clippy::needless_range_loop)]

use super::{
    accumulate, load_elem, CouplingLayout, SavedTrajectory, ScanConfig, ScanGradients,
    ScanInputs, ScanOutput, SelectiveScanKernel, SelectiveScanOp,
};
use crate::{
    dtypes::{Accum, Dtype, ScanElem, StateMode},
    scan_ops::{
        chunked_scan::{chunks, scan_chunk_from, ReverseChunk, ScanPair},
        discretize::{decay, input_scale, time_step, Discretization},
        output_proj::{gate, gate_backward, project, project_backward},
    },
    tensor::{Cpu, Error, Tensor},
};

use num_traits::Zero;
use std::{ops::Range, sync::Arc};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Read-only view of the inputs of one (batch, channel) unit.
struct UnitCtx<'a, E: Dtype, S> {
    op: &'a SelectiveScanOp,
    cfg: &'a ScanConfig,
    b: usize,
    d: usize,
    u: &'a [E],
    delta: &'a [E],
    z: Option<&'a [E]>,
    b_src: &'a [E],
    c_src: &'a [E],
    a: Vec<S>,
    bias: E::Acc,
    skip: E::Acc,
}

impl<'a, E: Dtype, S: ScanElem<E::Acc>> UnitCtx<'a, E, S> {
    fn new(
        op: &'a SelectiveScanOp,
        cfg: &'a ScanConfig,
        inp: &ScanInputs<'a, E>,
        unit: usize,
    ) -> Self {
        let (b, d) = (unit / op.dim, unit % op.dim);
        let row = unit * op.seqlen..(unit + 1) * op.seqlen;
        let a_src = inp.a.as_slice();
        Self {
            op,
            cfg,
            b,
            d,
            u: &inp.u.as_slice()[row.clone()],
            delta: &inp.delta.as_slice()[row.clone()],
            z: inp.z.map(|z| &z.as_slice()[row]),
            b_src: inp.b.as_slice(),
            c_src: inp.c.as_slice(),
            a: (0..op.dstate)
                .map(|n| load_elem::<E, S>(a_src, d * op.dstate, n))
                .collect(),
            bias: inp
                .delta_bias
                .map_or(Zero::zero(), |t| t.as_slice()[d].to_acc()),
            skip: inp.d.map_or(Zero::zero(), |t| t.as_slice()[d].to_acc()),
        }
    }

    #[inline]
    fn time_step(&self, t: usize) -> (E::Acc, E::Acc) {
        time_step(self.delta[t].to_acc() + self.bias, self.cfg.delta_softplus)
    }

    #[inline]
    fn gate_in(&self, t: usize) -> Option<E::Acc> {
        self.z.map(|z| z[t].to_acc())
    }

    #[inline]
    fn b_at(&self, t: usize, n: usize) -> S {
        let base = self.op.coupling_base(self.op.b_layout, self.b, self.d, t);
        load_elem::<E, S>(self.b_src, base, n)
    }

    #[inline]
    fn c_at(&self, t: usize, n: usize) -> S {
        let base = self.op.coupling_base(self.op.c_layout, self.b, self.d, t);
        load_elem::<E, S>(self.c_src, base, n)
    }

    /// Output before the gate, given the state readout `ys`.
    #[inline]
    fn pre_gate(&self, ys: E::Acc, t: usize) -> E::Acc {
        ys + self.skip * self.u[t].to_acc()
    }
}

/// Discrete coefficients of one `(step, state)` element.
#[derive(Debug, Default, Clone, Copy)]
struct Step<S> {
    a_bar: S,
    q: S,
    dq: S,
    b: S,
    clamped: bool,
}

/// Per-chunk scratch space of one unit, indexed `[step][state]`.
struct Workspace<R, S> {
    dts: Vec<R>,
    ys: Vec<R>,
    steps: Vec<Step<S>>,
    xs: Vec<S>,
    pairs: Vec<ScanPair<S>>,
}

impl<R: Accum, S: ScanElem<R>> Workspace<R, S> {
    fn new(chunk_len: usize, dstate: usize) -> Self {
        Self {
            dts: vec![R::zero(); chunk_len],
            ys: vec![R::zero(); chunk_len],
            steps: vec![Default::default(); chunk_len * dstate],
            xs: vec![S::zeroed(); chunk_len * dstate],
            pairs: Vec::with_capacity(chunk_len),
        }
    }

    /// Scans the steps in `range` starting from `state`, leaving the chunk's end
    /// state in `state`. Returns the number of clamped transitions.
    fn run_chunk<E: Dtype<Acc = R>>(
        &mut self,
        ctx: &UnitCtx<E, S>,
        range: Range<usize>,
        state: &mut [S],
    ) -> usize {
        let ds = ctx.op.dstate;
        let start = range.start;
        let len = range.len();
        let mut clamped = 0;
        for i in 0..len {
            self.dts[i] = ctx.time_step(start + i).0;
            self.ys[i] = R::zero();
        }
        for n in 0..ds {
            self.pairs.clear();
            for i in 0..len {
                let t = start + i;
                let dt = self.dts[i];
                let dec = decay(dt, ctx.a[n]);
                let (q, dq) = input_scale::<R, S>(ctx.cfg.discretization, &dec);
                let b = ctx.b_at(t, n);
                clamped += dec.clamped as usize;
                self.steps[i * ds + n] = Step {
                    a_bar: dec.a_bar,
                    q,
                    dq,
                    b,
                    clamped: dec.clamped,
                };
                let b_bar = (q * b).scale(dt * ctx.u[t].to_acc());
                self.pairs.push(ScanPair::new(dec.a_bar, b_bar));
            }
            let xs = &mut self.xs;
            let ys = &mut self.ys;
            state[n] = scan_chunk_from::<R, S, _>(
                &mut self.pairs,
                state[n],
                ctx.cfg.strategy,
                |i, x| {
                    xs[i * ds + n] = x;
                    ys[i] += project::<R, S>(ctx.c_at(start + i, n), x);
                },
            );
        }
        clamped
    }
}

fn forward_unit<R: Accum, E: Dtype<Acc = R>, S: ScanElem<R>>(
    op: &SelectiveScanOp,
    cfg: &ScanConfig,
    inp: &ScanInputs<E>,
    unit: usize,
    out: &mut [E],
    boundaries: &mut [R],
) -> usize {
    let ctx = UnitCtx::<E, S>::new(op, cfg, inp, unit);
    let ds = op.dstate;
    let w = S::MODE.width();
    let mut ws = Workspace::<R, S>::new(cfg.chunk_size.min(op.seqlen), ds);
    let mut state = vec![S::zeroed(); ds];
    let mut clamped = 0;
    for (k, range) in chunks(op.seqlen, cfg.chunk_size).enumerate() {
        clamped += ws.run_chunk(&ctx, range.clone(), &mut state);
        for (i, t) in range.enumerate() {
            let y = ctx.pre_gate(ws.ys[i], t);
            out[t] = E::from_acc(gate(y, ctx.gate_in(t)));
        }
        for n in 0..ds {
            state[n].store_acc(&mut boundaries[(k * ds + n) * w..]);
        }
    }
    clamped
}

/// Gradients of one (batch, channel) unit that are summed over the batch.
struct ChannelGrads<R> {
    /// `[dstate]` state elements
    da: Vec<R>,
    /// `[dstate]` state elements for a shared coupling, empty when selective
    db: Vec<R>,
    dc: Vec<R>,
    dd: R,
    dbias: R,
}

impl<R: Accum> ChannelGrads<R> {
    fn new(op: &SelectiveScanOp, w: usize) -> Self {
        let shared_len = |layout: CouplingLayout| match layout {
            CouplingLayout::Shared => op.dstate * w,
            CouplingLayout::Selective { .. } => 0,
        };
        Self {
            da: vec![R::zero(); op.dstate * w],
            db: vec![R::zero(); shared_len(op.b_layout)],
            dc: vec![R::zero(); shared_len(op.c_layout)],
            dd: R::zero(),
            dbias: R::zero(),
        }
    }
}

/// Per-step gradients of one unit, reused by every unit of a block.
struct StepGrads<R> {
    du: Vec<R>,
    ddelta: Vec<R>,
    dz: Vec<R>,
}

impl<R: Accum> StepGrads<R> {
    fn new(seqlen: usize, has_z: bool) -> Self {
        Self {
            du: vec![R::zero(); seqlen],
            ddelta: vec![R::zero(); seqlen],
            dz: vec![R::zero(); if has_z { seqlen } else { 0 }],
        }
    }

    fn reset(&mut self) {
        self.du.fill(R::zero());
        self.ddelta.fill(R::zero());
        self.dz.fill(R::zero());
    }
}

#[inline]
fn grad_slot(layout: CouplingLayout, t: usize, n: usize, dstate: usize) -> usize {
    match layout {
        CouplingLayout::Shared => n,
        CouplingLayout::Selective { .. } => t * dstate + n,
    }
}

/// Group of channel `j` of a block inside the block's slice of a selective
/// coupling gradient.
fn group_grad<R>(
    dst: &mut [R],
    layout: CouplingLayout,
    dim: usize,
    j: usize,
    group_len: usize,
) -> Option<&mut [R]> {
    match layout {
        CouplingLayout::Shared => None,
        CouplingLayout::Selective { groups } => {
            let g = j / (dim / groups);
            Some(&mut dst[g * group_len..(g + 1) * group_len])
        }
    }
}

/// Runs the adjoint of one unit. Selective coupling gradients are added into
/// `db_sel` / `dc_sel`, the `[seqlen, dstate]` slice of the unit's group.
#[allow(clippy::too_many_arguments)]
fn backward_unit<R: Accum, E: Dtype<Acc = R>, S: ScanElem<R>>(
    op: &SelectiveScanOp,
    cfg: &ScanConfig,
    inp: &ScanInputs<E>,
    dout: &[E],
    boundaries: &[R],
    unit: usize,
    steps: &mut StepGrads<R>,
    db_sel: Option<&mut [R]>,
    dc_sel: Option<&mut [R]>,
) -> ChannelGrads<R> {
    let ctx = UnitCtx::<E, S>::new(op, cfg, inp, unit);
    let ds = op.dstate;
    let w = S::MODE.width();
    let seqlen = op.seqlen;
    let dout = &dout[unit * seqlen..(unit + 1) * seqlen];
    let is_zoh = cfg.discretization == Discretization::Zoh;

    steps.reset();
    let mut g = ChannelGrads::<R>::new(op, w);
    let db_dst: &mut [R] = match db_sel {
        Some(dst) => dst,
        None => &mut g.db,
    };
    let dc_dst: &mut [R] = match dc_sel {
        Some(dst) => dst,
        None => &mut g.dc,
    };

    let cap = cfg.chunk_size.min(seqlen);
    let mut ws = Workspace::<R, S>::new(cap, ds);
    let mut rev = ReverseChunk::<R, S>::with_capacity(cap);
    let mut dys = vec![R::zero(); cap];
    let mut carry_in = vec![S::zeroed(); ds];
    let mut state = vec![S::zeroed(); ds];
    // adjoint flowing in from the later chunk, and the transition it flows through
    let mut rev_h = vec![S::zeroed(); ds];
    let mut rev_a = vec![S::zeroed(); ds];

    for (k, range) in chunks(seqlen, cfg.chunk_size).enumerate().rev() {
        let start = range.start;
        let len = range.len();
        for n in 0..ds {
            carry_in[n] = if k == 0 {
                S::zeroed()
            } else {
                S::load_acc(&boundaries[((k - 1) * ds + n) * w..])
            };
        }
        state.copy_from_slice(&carry_in);
        ws.run_chunk(&ctx, range, &mut state);

        for i in 0..len {
            let t = start + i;
            let y = ctx.pre_gate(ws.ys[i], t);
            let (dy, dz) = gate_backward(y, ctx.gate_in(t), dout[t].to_acc());
            if op.has_z {
                steps.dz[t] = dz;
            }
            g.dd += dy * ctx.u[t].to_acc();
            steps.du[t] += dy * ctx.skip;
            dys[i] = dy;
        }

        for n in 0..ds {
            rev.clear();
            for i in (0..len).rev() {
                let t = start + i;
                let a_next = if i + 1 == len {
                    rev_a[n]
                } else {
                    ws.steps[(i + 1) * ds + n].a_bar
                };
                let (dc, gx) =
                    project_backward::<R, S>(ctx.c_at(t, n), ws.xs[i * ds + n], dys[i]);
                accumulate::<R, S>(dc_dst, grad_slot(op.c_layout, t, n, ds), dc);
                rev.push(a_next, gx);
            }

            let ws = &ws;
            let carry_in = &carry_in;
            rev_h[n] = rev.scan(rev_h[n], cfg.strategy, |j, h| {
                let i = len - 1 - j;
                let t = start + i;
                let step = ws.steps[i * ds + n];
                let x_prev = if i == 0 {
                    carry_in[n]
                } else {
                    ws.xs[(i - 1) * ds + n]
                };
                let dt = ws.dts[i];
                let u = ctx.u[t].to_acc();
                let weight = dt * u;

                // x = a_bar * x_prev + weight * q * B, with a_bar = exp(z), q = q(z)
                let mut gz = h * x_prev.conj() * step.a_bar.conj();
                if is_zoh {
                    gz += (step.dq.conj() * step.b.conj() * h).scale(weight);
                }
                let db = (step.q.conj() * h).scale(weight);
                accumulate::<R, S>(db_dst, grad_slot(op.b_layout, t, n, ds), db);
                let gw = (h * (step.q * step.b).conj()).re();
                steps.du[t] += dt * gw;

                // z = dt * A with the real part clamped
                let gz = gz.mask_re(!step.clamped);
                accumulate::<R, S>(&mut g.da, n, gz.scale(dt));
                steps.ddelta[t] += u * gw + (gz * ctx.a[n].conj()).re();
            });
            rev_a[n] = ws.steps[n].a_bar;
        }
    }

    for t in 0..seqlen {
        let (_, dsoftplus) = ctx.time_step(t);
        steps.ddelta[t] *= dsoftplus;
        g.dbias += steps.ddelta[t];
    }
    g
}

/// Gradient slices owned by one block of channels of one batch entry.
struct BlockGrads<'a, E, R> {
    du: &'a mut [E],
    ddelta: &'a mut [E],
    dz: &'a mut [E],
    /// the block's groups of a selective `b`, empty when shared
    db: &'a mut [R],
    dc: &'a mut [R],
}

/// Splits `data` into `blocks` equal parts, or `blocks` empty parts when `data`
/// is empty.
fn split_blocks<T>(data: &mut [T], blocks: usize) -> Vec<&mut [T]> {
    if data.is_empty() {
        (0..blocks).map(|_| Default::default()).collect()
    } else {
        data.chunks_mut(data.len() / blocks).collect()
    }
}

fn selective_part<R>(data: &mut [R], layout: CouplingLayout) -> &mut [R] {
    match layout {
        CouplingLayout::Shared => Default::default(),
        CouplingLayout::Selective { .. } => data,
    }
}

/// Runs the units of `block` in channel order, writing per-step gradients and
/// selective coupling gradients straight into `out`.
fn backward_block<R: Accum, E: Dtype<Acc = R>, S: ScanElem<R>>(
    op: &SelectiveScanOp,
    cfg: &ScanConfig,
    inp: &ScanInputs<E>,
    dout: &[E],
    boundaries: &[R],
    block: usize,
    out: BlockGrads<E, R>,
) -> Vec<ChannelGrads<R>> {
    let BlockGrads {
        du,
        ddelta,
        dz,
        db,
        dc,
    } = out;
    let seqlen = op.seqlen;
    let per_unit = op.boundary_len_per_unit(cfg.chunk_size);
    let group_len = seqlen * op.dstate * S::MODE.width();
    let channels = op.dim / op.blocks_per_batch();

    let mut steps = StepGrads::<R>::new(seqlen, op.has_z);
    let mut grads = Vec::with_capacity(channels);
    for j in 0..channels {
        let unit = block * channels + j;
        let g = backward_unit::<R, E, S>(
            op,
            cfg,
            inp,
            dout,
            &boundaries[unit * per_unit..(unit + 1) * per_unit],
            unit,
            &mut steps,
            group_grad(db, op.b_layout, op.dim, j, group_len),
            group_grad(dc, op.c_layout, op.dim, j, group_len),
        );
        let row = j * seqlen..(j + 1) * seqlen;
        for (o, v) in du[row.clone()].iter_mut().zip(&steps.du) {
            *o = E::from_acc(*v);
        }
        for (o, v) in ddelta[row.clone()].iter_mut().zip(&steps.ddelta) {
            *o = E::from_acc(*v);
        }
        if op.has_z {
            for (o, v) in dz[row].iter_mut().zip(&steps.dz) {
                *o = E::from_acc(*v);
            }
        }
        grads.push(g);
    }
    grads
}

fn add_into<R: Accum>(dst: &mut [R], src: &[R]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d += *s;
    }
}

fn from_acc_vec<E: Dtype>(src: Vec<E::Acc>, shape: &[usize]) -> Tensor<E> {
    Tensor {
        data: Arc::new(src.into_iter().map(E::from_acc).collect()),
        shape: shape.to_vec(),
    }
}

impl Cpu {
    fn forward_mode<R: Accum, E: Dtype<Acc = R>, S: ScanElem<R>>(
        &self,
        op: &SelectiveScanOp,
        cfg: &ScanConfig,
        inp: &ScanInputs<E>,
    ) -> Result<ScanOutput<E>, Error> {
        let w = S::MODE.width();
        let per_unit = op.boundary_len_per_unit(cfg.chunk_size);
        let mut out = self.try_alloc_zeros::<E>(op.units() * op.seqlen)?;
        let mut boundaries = self.try_alloc_zeros::<R>(op.units() * per_unit)?;

        let clamped_decays: usize = if op.seqlen == 0 {
            0
        } else {
            #[cfg(feature = "parallel")]
            let units = out
                .par_chunks_mut(op.seqlen)
                .zip(boundaries.par_chunks_mut(per_unit))
                .enumerate();
            #[cfg(not(feature = "parallel"))]
            let units = out
                .chunks_mut(op.seqlen)
                .zip(boundaries.chunks_mut(per_unit))
                .enumerate();
            units
                .map(|(unit, (out, bnd))| forward_unit::<R, E, S>(op, cfg, inp, unit, out, bnd))
                .sum()
        };

        let last_state = if cfg.return_last_state {
            let state_len = op.dstate * w;
            let mut data = self.try_alloc_zeros::<E>(op.units() * state_len)?;
            if op.seqlen > 0 {
                for (dst, bnd) in data.chunks_mut(state_len).zip(boundaries.chunks(per_unit)) {
                    let last = &bnd[per_unit - state_len..];
                    for (o, x) in dst.iter_mut().zip(last.iter()) {
                        *o = E::from_acc(*x);
                    }
                }
            }
            let mut shape = vec![op.batch, op.dim, op.dstate];
            if op.mode == StateMode::Complex {
                shape.push(2);
            }
            Some(Tensor {
                data: Arc::new(data),
                shape,
            })
        } else {
            None
        };

        Ok(ScanOutput {
            out: Tensor {
                data: Arc::new(out),
                shape: inp.u.shape().to_vec(),
            },
            last_state,
            trajectory: SavedTrajectory {
                op: *op,
                config: *cfg,
                boundaries,
            },
            clamped_decays,
        })
    }

    fn backward_mode<R: Accum, E: Dtype<Acc = R>, S: ScanElem<R>>(
        &self,
        dout: &Tensor<E>,
        trajectory: &SavedTrajectory<E>,
        inp: &ScanInputs<E>,
    ) -> Result<ScanGradients<E>, Error> {
        let op = &trajectory.op;
        let cfg = &trajectory.config;
        let (ds, w, seqlen) = (op.dstate, S::MODE.width(), op.seqlen);
        let dout = dout.as_slice();
        let boundaries = trajectory.boundaries.as_slice();

        let blocks_per_batch = op.blocks_per_batch();
        let channels = op.dim / blocks_per_batch;
        let n_blocks = op.batch * blocks_per_batch;

        let numel = op.units() * seqlen;
        let mut du = self.try_alloc_zeros::<E>(numel)?;
        let mut ddelta = self.try_alloc_zeros::<E>(numel)?;
        let mut dz = self.try_alloc_zeros::<E>(if op.has_z { numel } else { 0 })?;
        let mut da = self.try_alloc_zeros::<R>(op.dim * ds * w)?;
        let mut db = self.try_alloc_zeros::<R>(op.coupling_len(op.b_layout) * w)?;
        let mut dc = self.try_alloc_zeros::<R>(op.coupling_len(op.c_layout) * w)?;
        let mut dd = self.try_alloc_zeros::<R>(op.dim)?;
        let mut dbias = self.try_alloc_zeros::<R>(op.dim)?;

        // a block owns whole selective groups, so its units never share an output slot
        // with another block
        let blocks: Vec<BlockGrads<E, R>> = split_blocks(&mut du, n_blocks)
            .into_iter()
            .zip(split_blocks(&mut ddelta, n_blocks))
            .zip(split_blocks(&mut dz, n_blocks))
            .zip(split_blocks(selective_part(&mut db, op.b_layout), n_blocks))
            .zip(split_blocks(selective_part(&mut dc, op.c_layout), n_blocks))
            .map(|((((du, ddelta), dz), db), dc)| BlockGrads {
                du,
                ddelta,
                dz,
                db,
                dc,
            })
            .collect();
        let run = |(block, out): (usize, BlockGrads<E, R>)| {
            backward_block::<R, E, S>(op, cfg, inp, dout, boundaries, block, out)
        };
        #[cfg(feature = "parallel")]
        let partials: Vec<Vec<ChannelGrads<R>>> =
            blocks.into_par_iter().enumerate().map(run).collect();
        #[cfg(not(feature = "parallel"))]
        let partials: Vec<Vec<ChannelGrads<R>>> =
            blocks.into_iter().enumerate().map(run).collect();

        // per channel in batch order so the sums do not depend on scheduling
        for (block, grads) in partials.into_iter().enumerate() {
            let first = (block % blocks_per_batch) * channels;
            for (j, g) in grads.into_iter().enumerate() {
                let d = first + j;
                let row = d * ds * w..(d + 1) * ds * w;
                add_into(&mut da[row.clone()], &g.da);
                if !g.db.is_empty() {
                    add_into(&mut db[row.clone()], &g.db);
                }
                if !g.dc.is_empty() {
                    add_into(&mut dc[row], &g.dc);
                }
                dd[d] += g.dd;
                dbias[d] += g.dbias;
            }
        }

        Ok(ScanGradients {
            u: Tensor {
                data: Arc::new(du),
                shape: inp.u.shape().to_vec(),
            },
            delta: Tensor {
                data: Arc::new(ddelta),
                shape: inp.delta.shape().to_vec(),
            },
            a: from_acc_vec(da, inp.a.shape()),
            b: from_acc_vec(db, inp.b.shape()),
            c: from_acc_vec(dc, inp.c.shape()),
            d: op.has_d.then(|| from_acc_vec(dd, &[op.dim])),
            z: op.has_z.then(|| Tensor {
                data: Arc::new(dz),
                shape: inp.u.shape().to_vec(),
            }),
            delta_bias: op.has_delta_bias.then(|| from_acc_vec(dbias, &[op.dim])),
        })
    }
}

impl<E: Dtype> SelectiveScanKernel<E> for Cpu {
    fn forward(
        &self,
        op: &SelectiveScanOp,
        cfg: &ScanConfig,
        inp: &ScanInputs<E>,
    ) -> Result<ScanOutput<E>, Error> {
        match op.mode {
            StateMode::Real => self.forward_mode::<E::Acc, E, E::Acc>(op, cfg, inp),
            StateMode::Complex => {
                self.forward_mode::<E::Acc, E, <E::Acc as Accum>::Complex>(op, cfg, inp)
            }
        }
    }

    fn backward(
        &self,
        dout: &Tensor<E>,
        trajectory: &SavedTrajectory<E>,
        inp: &ScanInputs<E>,
    ) -> Result<ScanGradients<E>, Error> {
        match trajectory.op.mode {
            StateMode::Real => self.backward_mode::<E::Acc, E, E::Acc>(dout, trajectory, inp),
            StateMode::Complex => {
                self.backward_mode::<E::Acc, E, <E::Acc as Accum>::Complex>(dout, trajectory, inp)
            }
        }
    }
}
