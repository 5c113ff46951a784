use super::*;
use crate::{
    scan_ops::{try_selective_scan, Discretization, ScanInputs, StabilityCheck},
    tensor::*,
    tests::*,
};

/// Removes the time axis (axis 2) of `t`, keeping step `step`.
fn select_step<E: Dtype>(dev: &TestDevice, t: &Tensor<E>, step: usize) -> Tensor<E> {
    let shape = t.shape();
    let seqlen = shape[2];
    let outer = shape[0] * shape[1];
    let inner: usize = shape[3..].iter().product();
    let mut data = Vec::with_capacity(outer * inner);
    for o in 0..outer {
        let start = (o * seqlen + step) * inner;
        data.extend_from_slice(&t.as_slice()[start..start + inner]);
    }
    let mut new_shape = shape.to_vec();
    new_shape.remove(2);
    dev.tensor_from_vec(data, &new_shape)
}

struct Sequence<E> {
    u: Tensor<E>,
    delta: Tensor<E>,
    a: Tensor<E>,
    b: Tensor<E>,
    c: Tensor<E>,
    d: Tensor<E>,
    z: Tensor<E>,
    bias: Tensor<E>,
}

impl<E: Dtype> Sequence<E> {
    fn sample(dev: &TestDevice, complex: bool) -> Self {
        let (batch, dim, seqlen, dstate) = (2, 4, 6, 3);
        let pair = |mut s: Vec<usize>| {
            if complex {
                s.push(2);
            }
            s
        };
        let a = if complex {
            let mut a: Tensor<E> = dev.sample_uniform_like(&[dim, dstate, 2], -2.0, -0.2);
            for (i, x) in a.data_mut().iter_mut().enumerate() {
                if i % 2 == 1 {
                    *x = E::from_f64(x.to_f64() * -3.0);
                }
            }
            a
        } else {
            dev.sample_uniform_like(&[dim, dstate], -2.0, -0.2)
        };
        Self {
            u: dev.sample_normal_like(&[batch, dim, seqlen]),
            delta: dev.sample_uniform_like(&[batch, dim, seqlen], -1.0, 1.0),
            a,
            b: dev.sample_normal_like(&pair(vec![batch, 2, seqlen, dstate])),
            c: dev.sample_normal_like(&pair(vec![dim, dstate])),
            d: dev.sample_normal_like(&[dim]),
            z: dev.sample_normal_like(&[batch, dim, seqlen]),
            bias: dev.sample_uniform_like(&[dim], -0.2, 0.2),
        }
    }

    fn scan_inputs(&self) -> ScanInputs<'_, E> {
        ScanInputs::new(&self.u, &self.delta, &self.a, &self.b, &self.c)
            .with_d(&self.d)
            .with_z(&self.z)
            .with_delta_bias(&self.bias)
    }

    /// Decodes the whole sequence one step at a time, returning `(y, final state)`.
    fn decode(
        &self,
        dev: &TestDevice,
        cfg: &ScanConfig,
        complex: bool,
    ) -> (Vec<Vec<E>>, Tensor<E>) {
        let mut shape = vec![2, 4, 3];
        if complex {
            shape.push(2);
        }
        let mut state: Tensor<E> = dev.zeros_like(&shape);
        let ys = (0..6)
            .map(|t| {
                let u = select_step(dev, &self.u, t);
                let delta = select_step(dev, &self.delta, t);
                let b = select_step(dev, &self.b, t);
                let z = select_step(dev, &self.z, t);
                let inputs = StepInputs::new(&u, &delta, &self.a, &b, &self.c)
                    .with_d(&self.d)
                    .with_z(&z)
                    .with_delta_bias(&self.bias);
                try_selective_state_update(dev, &mut state, &inputs, cfg)
                    .unwrap()
                    .as_vec()
            })
            .collect();
        (ys, state)
    }
}

#[test]
fn test_stepping_equals_scan() {
    let dev: TestDevice = Default::default();
    for complex in [false, true] {
        for discretization in [Discretization::Euler, Discretization::Zoh] {
            let seq = Sequence::<f64>::sample(&dev, complex);
            let cfg = ScanConfig {
                chunk_size: 4,
                discretization,
                delta_softplus: true,
                return_last_state: true,
                ..Default::default()
            };
            let fwd = try_selective_scan(&dev, &seq.scan_inputs(), &cfg).unwrap();
            let (ys, state) = seq.decode(&dev, &cfg, complex);
            for (t, y) in ys.iter().enumerate() {
                let expected = select_step(&dev, &fwd.out, t).as_vec();
                assert_close!(y.clone(), expected, 1e-12);
            }
            assert_close!(state.as_vec(), fwd.last_state.unwrap().as_vec(), 1e-12);
        }
    }
}

#[test]
fn test_stepping_in_test_dtype() {
    let dev: TestDevice = Default::default();
    let seq = Sequence::<TestDtype>::sample(&dev, false);
    let cfg = ScanConfig {
        delta_softplus: true,
        ..Default::default()
    };
    let (ys, _) = seq.decode(&dev, &cfg, false);
    let (out, _) = crate::scan_ops::selective_scan_ref(&seq.scan_inputs(), &cfg).unwrap();
    for (t, y) in ys.iter().enumerate() {
        let y: Vec<f64> = y.iter().map(|x| x.to_f64()).collect();
        let expected = select_step(&dev, &out, t).as_vec();
        assert_close!(y, expected, TEST_TOL);
    }
}

#[test]
fn test_step_layout_errors() {
    let dev: TestDevice = Default::default();
    let u: Tensor<TestDtype> = dev.zeros_like(&[2, 4]);
    let a: Tensor<TestDtype> = dev.sample_uniform_like(&[4, 3], -1.0, -0.5);
    let a_c: Tensor<TestDtype> = dev.sample_uniform_like(&[4, 3, 2], -1.0, -0.5);
    let shared: Tensor<TestDtype> = dev.zeros_like(&[4, 3]);
    let shared_c: Tensor<TestDtype> = dev.zeros_like(&[4, 3, 2]);
    let per_step: Tensor<TestDtype> = dev.zeros_like(&[2, 2, 3]);
    let per_step_c: Tensor<TestDtype> = dev.zeros_like(&[2, 2, 3, 2]);

    let op = StepInputs::new(&u, &u, &a, &per_step, &shared).try_op().unwrap();
    assert_eq!(op.b_layout, CouplingLayout::Selective { groups: 2 });
    assert_eq!(op.c_layout, CouplingLayout::Shared);
    assert_eq!(op.mode, StateMode::Real);

    let op = StepInputs::new(&u, &u, &a_c, &shared_c, &per_step_c).try_op().unwrap();
    assert_eq!(op.b_layout, CouplingLayout::Shared);
    assert_eq!(op.c_layout, CouplingLayout::Selective { groups: 2 });
    assert_eq!(op.state_shape(), vec![2, 4, 3, 2]);

    let err = StepInputs::new(&u, &u, &a, &per_step_c, &shared).try_op();
    assert_eq!(
        err.unwrap_err(),
        Error::UnsupportedVariant {
            tensor: "b",
            mode: StateMode::Real
        }
    );
    let err = StepInputs::new(&u, &u, &a_c, &shared_c, &shared).try_op();
    assert_eq!(
        err.unwrap_err(),
        Error::UnsupportedVariant {
            tensor: "c",
            mode: StateMode::Complex
        }
    );
    let odd: Tensor<TestDtype> = dev.zeros_like(&[2, 3, 3]);
    assert!(matches!(
        StepInputs::new(&u, &u, &a, &odd, &shared).try_op(),
        Err(Error::ShapeMismatch { tensor: "b", .. })
    ));
}

#[test]
fn test_step_state_shape_and_stability() {
    let dev: TestDevice = Default::default();
    let u: Tensor<TestDtype> = dev.sample_normal_like(&[2, 4]);
    let delta: Tensor<TestDtype> = dev.sample_uniform_like(&[2, 4], 0.1, 0.5);
    let mut a: Tensor<TestDtype> = dev.sample_uniform_like(&[4, 3], -1.0, -0.5);
    let bc: Tensor<TestDtype> = dev.sample_normal_like(&[4, 3]);

    let mut wrong: Tensor<TestDtype> = dev.zeros_like(&[2, 4, 2]);
    let inputs = StepInputs::new(&u, &delta, &a, &bc, &bc);
    let err = try_selective_state_update(&dev, &mut wrong, &inputs, &Default::default());
    assert!(matches!(
        err,
        Err(Error::ShapeMismatch {
            tensor: "state",
            ..
        })
    ));

    a.data_mut()[7] = TestDtype::ONE;
    let inputs = StepInputs::new(&u, &delta, &a, &bc, &bc);
    let mut state: Tensor<TestDtype> = dev.zeros_like(&[2, 4, 3]);
    let strict = ScanConfig {
        stability: StabilityCheck::Strict,
        ..Default::default()
    };
    let err = try_selective_state_update(&dev, &mut state, &inputs, &strict);
    assert_eq!(
        err.unwrap_err(),
        Error::NumericInstability {
            tensor: "a",
            index: 7
        }
    );
    let y = try_selective_state_update(&dev, &mut state, &inputs, &Default::default()).unwrap();
    assert!(y.to_f64_vec().iter().all(|x| x.is_finite()));
}
