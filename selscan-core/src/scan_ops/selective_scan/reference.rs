use super::{ScanConfig, ScanInputs};
use crate::{
    dtypes::{Complex, Dtype, ScanElem, StateMode},
    scan_ops::{
        discretize::{decay, input_scale, time_step, StabilityCheck},
        output_proj::{gate, project},
    },
    tensor::{Error, Tensor},
};
use std::sync::Arc;

/// Step-by-step recurrence in `f64`, without chunking. Returns the output and,
/// when [ScanConfig::return_last_state] is set, the last state.
///
/// Validation and discretization match [super::try_selective_scan]; the chunk
/// size and scan strategy are ignored.
///
/// ```rust
/// # use selscan_core::prelude::*;
/// let dev: Cpu = Default::default();
/// let u: Tensor<f32> = dev.sample_normal_like(&[1, 2, 5]);
/// let delta: Tensor<f32> = dev.sample_uniform_like(&[1, 2, 5], 0.1, 0.2);
/// let a: Tensor<f32> = dev.sample_uniform_like(&[2, 3], -1.0, -0.5);
/// let b: Tensor<f32> = dev.sample_normal_like(&[2, 3]);
/// let c: Tensor<f32> = dev.sample_normal_like(&[2, 3]);
/// let inputs = ScanInputs::new(&u, &delta, &a, &b, &c);
/// let (out, last) = selective_scan_ref(&inputs, &Default::default()).unwrap();
/// assert_eq!(out.shape(), &[1, 2, 5]);
/// assert!(last.is_none());
/// ```
pub fn selective_scan_ref<E: Dtype>(
    inputs: &ScanInputs<E>,
    cfg: &ScanConfig,
) -> Result<(Tensor<f64>, Option<Tensor<f64>>), Error> {
    let op = inputs.try_op()?;
    if cfg.stability == StabilityCheck::Strict {
        inputs.check_stability(&op, cfg.delta_softplus)?;
    }
    Ok(match op.mode {
        StateMode::Real => run::<E, f64>(&op, cfg, inputs),
        StateMode::Complex => run::<E, Complex<f64>>(&op, cfg, inputs),
    })
}

fn run<E: Dtype, S: ScanElem<f64>>(
    op: &super::SelectiveScanOp,
    cfg: &ScanConfig,
    inp: &ScanInputs<E>,
) -> (Tensor<f64>, Option<Tensor<f64>>) {
    let (ds, w, seqlen) = (op.dstate, S::MODE.width(), op.seqlen);
    let u = inp.u.to_f64_vec();
    let delta = inp.delta.to_f64_vec();
    let a = inp.a.to_f64_vec();
    let b = inp.b.to_f64_vec();
    let c = inp.c.to_f64_vec();
    let skip = inp.d.map(|t| t.to_f64_vec());
    let gate_in = inp.z.map(|t| t.to_f64_vec());
    let bias = inp.delta_bias.map(|t| t.to_f64_vec());
    let load = |src: &[f64], i: usize| -> S { S::load_acc(&src[i * w..]) };

    let mut out = vec![0.0; op.units() * seqlen];
    let mut last = vec![0.0; op.units() * ds * w];
    for bi in 0..op.batch {
        for d in 0..op.dim {
            let unit = bi * op.dim + d;
            let row = unit * seqlen;
            let mut x = vec![S::zeroed(); ds];
            for t in 0..seqlen {
                let v = delta[row + t] + bias.as_ref().map_or(0.0, |bias| bias[d]);
                let (dt, _) = time_step(v, cfg.delta_softplus);
                let b_base = op.coupling_base(op.b_layout, bi, d, t);
                let c_base = op.coupling_base(op.c_layout, bi, d, t);
                let mut y = 0.0;
                for n in 0..ds {
                    let dec = decay(dt, load(&a, d * ds + n));
                    let (q, _) = input_scale::<f64, S>(cfg.discretization, &dec);
                    let b_bar = (q * load(&b, b_base + n)).scale(dt * u[row + t]);
                    x[n] = dec.a_bar * x[n] + b_bar;
                    y += project::<f64, S>(load(&c, c_base + n), x[n]);
                }
                y += skip.as_ref().map_or(0.0, |skip| skip[d]) * u[row + t];
                out[row + t] = gate(y, gate_in.as_ref().map(|z| z[row + t]));
            }
            for (n, x) in x.into_iter().enumerate() {
                x.store_acc(&mut last[(unit * ds + n) * w..]);
            }
        }
    }

    let out = Tensor {
        data: Arc::new(out),
        shape: inp.u.shape().to_vec(),
    };
    let last_state = cfg.return_last_state.then(|| {
        let mut shape = vec![op.batch, op.dim, ds];
        if op.mode == StateMode::Complex {
            shape.push(2);
        }
        Tensor {
            data: Arc::new(last),
            shape,
        }
    });
    (out, last_state)
}
