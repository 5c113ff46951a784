use super::{SelectiveStateUpdateKernel, StepInputs, StepOp};
use crate::{
    dtypes::{Accum, Dtype, ScanElem, StateMode},
    scan_ops::{
        discretize::{decay, input_scale, time_step},
        output_proj::{gate, project},
        selective_scan::{load_elem, ScanConfig},
    },
    tensor::{Cpu, Error, Tensor},
};

use std::sync::Arc;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

fn step_unit<R: Accum, E: Dtype<Acc = R>, S: ScanElem<R>>(
    op: &StepOp,
    cfg: &ScanConfig,
    inp: &StepInputs<E>,
    unit: usize,
    state: &mut [E],
    y: &mut E,
) -> usize {
    let (b, d) = (unit / op.dim, unit % op.dim);
    let w = S::MODE.width();
    let bias = inp
        .delta_bias
        .map_or(R::zero(), |t| t.as_slice()[d].to_acc());
    let u = inp.u.as_slice()[unit].to_acc();
    let v = inp.delta.as_slice()[unit].to_acc() + bias;
    let (dt, _) = time_step(v, cfg.delta_softplus);
    let b_base = op.coupling_base(op.b_layout, b, d);
    let c_base = op.coupling_base(op.c_layout, b, d);

    let mut clamped = 0;
    let mut acc = R::zero();
    for n in 0..op.dstate {
        let dec = decay(dt, load_elem::<E, S>(inp.a.as_slice(), d * op.dstate, n));
        clamped += dec.clamped as usize;
        let (q, _) = input_scale::<R, S>(cfg.discretization, &dec);
        let b_bar = (q * load_elem::<E, S>(inp.b.as_slice(), b_base, n)).scale(dt * u);
        let x = dec.a_bar * S::load(&state[n * w..]) + b_bar;
        x.store(&mut state[n * w..]);
        acc += project::<R, S>(load_elem::<E, S>(inp.c.as_slice(), c_base, n), x);
    }
    let skip = inp.d.map_or(R::zero(), |t| t.as_slice()[d].to_acc());
    let z = inp.z.map(|t| t.as_slice()[unit].to_acc());
    *y = E::from_acc(gate(acc + skip * u, z));
    clamped
}

impl Cpu {
    fn step_mode<R: Accum, E: Dtype<Acc = R>, S: ScanElem<R>>(
        &self,
        op: &StepOp,
        cfg: &ScanConfig,
        state: &mut Tensor<E>,
        inp: &StepInputs<E>,
    ) -> Result<(Tensor<E>, usize), Error> {
        let state_len = op.dstate * S::MODE.width();
        let mut y = self.try_alloc_zeros::<E>(op.batch * op.dim)?;
        let states = state.data_mut();

        #[cfg(feature = "parallel")]
        let units = y
            .par_iter_mut()
            .zip(states.par_chunks_mut(state_len))
            .enumerate();
        #[cfg(not(feature = "parallel"))]
        let units = y.iter_mut().zip(states.chunks_mut(state_len)).enumerate();
        let clamped: usize = units
            .map(|(unit, (y, x))| step_unit::<R, E, S>(op, cfg, inp, unit, x, y))
            .sum();

        let y = Tensor {
            data: Arc::new(y),
            shape: vec![op.batch, op.dim],
        };
        Ok((y, clamped))
    }
}

impl<E: Dtype> SelectiveStateUpdateKernel<E> for Cpu {
    fn step(
        &self,
        op: &StepOp,
        cfg: &ScanConfig,
        state: &mut Tensor<E>,
        inp: &StepInputs<E>,
    ) -> Result<(Tensor<E>, usize), Error> {
        match op.mode {
            StateMode::Real => self.step_mode::<E::Acc, E, E::Acc>(op, cfg, state, inp),
            StateMode::Complex => {
                self.step_mode::<E::Acc, E, <E::Acc as Accum>::Complex>(op, cfg, state, inp)
            }
        }
    }
}
