use selscan::prelude::*;

fn host_inputs(dev: &Cpu) -> HostInputs {
    let h = |t: Tensor<f64>| HostTensor::from_tensor(&t);
    HostInputs::new(
        h(dev.sample_normal_like(&[1, 2, 9])),
        h(dev.sample_uniform_like(&[1, 2, 9], 0.2, 0.6)),
        h(dev.sample_uniform_like(&[2, 3, 2], -1.5, -0.1)),
        h(dev.sample_normal_like(&[2, 3, 2])),
        h(dev.sample_normal_like(&[1, 1, 9, 3, 2])),
    )
    .with_d(h(dev.sample_normal_like(&[2])))
    .with_delta_bias(h(dev.sample_uniform_like(&[2], -0.1, 0.1)))
}

#[test]
fn test_forward_then_backward() {
    let dev: Cpu = Default::default();
    let inputs = host_inputs(&dev);
    let f = SelectiveScanFn::with_device(
        ScanConfig {
            chunk_size: 4,
            discretization: Discretization::Zoh,
            return_last_state: true,
            ..Default::default()
        },
        dev.clone(),
    );

    let (out, ctx) = f.try_forward(inputs.clone()).unwrap();
    assert_eq!(out.dtype, DType::F64);
    assert_eq!(out.shape, vec![1, 2, 9]);
    assert_eq!(ctx.inputs(), &inputs);
    assert_eq!(ctx.trajectory().config().chunk_size, 4);
    assert_eq!(ctx.last_state().unwrap().shape, vec![1, 2, 3, 2]);
    assert_eq!(ctx.clamped_decays(), 0);

    let expected = host::forward(&dev, &inputs, &f.cfg).unwrap();
    assert_eq!(out, expected.out);

    let grads = f.try_backward(ctx, &out).unwrap();
    assert_eq!(grads.a.shape, vec![2, 3, 2]);
    assert_eq!(grads.c.shape, vec![1, 1, 9, 3, 2]);
    assert_eq!(grads.d.unwrap().shape, vec![2]);
    assert_eq!(grads.delta_bias.unwrap().shape, vec![2]);
    assert!(grads.z.is_none());
}

#[test]
fn test_backward_uses_saved_config() {
    let dev: Cpu = Default::default();
    let inputs = host_inputs(&dev);
    let f = SelectiveScanFn::new(ScanConfig {
        chunk_size: 3,
        ..Default::default()
    });
    let (out, ctx) = f.forward(inputs.clone());

    let g = SelectiveScanFn::new(ScanConfig {
        chunk_size: 7,
        ..Default::default()
    });
    let from_f = f.backward(ctx.clone(), &out);
    let from_g = g.backward(ctx, &out);
    assert_eq!(from_f, from_g);
}

#[test]
fn test_forward_reports_errors() {
    let dev: Cpu = Default::default();
    let mut inputs = host_inputs(&dev);
    inputs.a.shape = vec![3, 2, 2];
    let f = SelectiveScanFn::default();
    assert!(matches!(
        f.try_forward(inputs),
        Err(Error::ShapeMismatch { tensor: "a", .. })
    ));

    let f = SelectiveScanFn::new(ScanConfig {
        chunk_size: 0,
        ..Default::default()
    });
    assert_eq!(
        f.try_forward(host_inputs(&dev)).unwrap_err(),
        Error::ZeroChunkSize
    );
}
