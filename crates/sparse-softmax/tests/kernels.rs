//! Cross-kernel agreement and error-path tests on small random projections.

use candle_core::{DType, Device, Tensor};
use sparse_softmax::{
    sample_inputs, BaselineSoftmax, InplaceSoftmax, KernelConfig, SoftmaxError, SoftmaxKernel,
    TiledSoftmax, TopKSoftmax, TopKSparseSoftmax, TopKTiledSoftmax,
};

static_assertions::assert_impl_all!(BaselineSoftmax: Send, Sync);
static_assertions::assert_impl_all!(TopKTiledSoftmax: Send, Sync);
static_assertions::assert_impl_all!(TopKSparseSoftmax: Send, Sync);
static_assertions::assert_impl_all!(SoftmaxError: std::error::Error);

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    a.sub(b)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_vec0::<f32>()
        .unwrap()
}

fn assert_rows_sum_to_one(probs: &Tensor, tolerance: f32) {
    let sums = probs.sum(1).unwrap().to_vec1::<f32>().unwrap();
    for (row, sum) in sums.iter().enumerate() {
        assert!(
            (sum - 1.0).abs() < tolerance,
            "row {row} sums to {sum}, expected 1 within {tolerance}"
        );
    }
}

#[test]
fn every_dense_output_is_a_distribution() {
    let device = Device::Cpu;
    let config = KernelConfig::new(6, 4);
    for (dtype, tolerance) in [(DType::F32, 1e-5), (DType::F16, 1e-2), (DType::BF16, 1e-2)] {
        let inputs = sample_inputs(12, 16, 96, dtype, &device).unwrap();
        let outputs = [
            BaselineSoftmax::build(&inputs.weight, &config)
                .unwrap()
                .forward(&inputs.activation, &inputs.labels)
                .unwrap(),
            TiledSoftmax::build(&inputs.weight, &config)
                .unwrap()
                .forward(&inputs.activation, &inputs.labels)
                .unwrap(),
            TopKSoftmax::build(&inputs.weight, &config)
                .unwrap()
                .forward(&inputs.activation, &inputs.labels)
                .unwrap(),
            TopKTiledSoftmax::build(&inputs.weight, &config)
                .unwrap()
                .forward(&inputs.activation, &inputs.labels)
                .unwrap(),
        ];
        for out in &outputs {
            assert_eq!(out.dims(), &[12, 96]);
            assert_eq!(out.dtype(), DType::F32);
            assert_rows_sum_to_one(out, tolerance);
        }
        let sparse = TopKSparseSoftmax::build(&inputs.weight, &config)
            .unwrap()
            .forward(&inputs.activation, &inputs.labels)
            .unwrap();
        assert_eq!(sparse.probs().dtype(), DType::F32);
        assert_rows_sum_to_one(sparse.probs(), tolerance);
    }
}

#[test]
fn label_always_has_mass_in_top_k_tiled() {
    let device = Device::Cpu;
    let inputs = sample_inputs(32, 16, 128, DType::F32, &device).unwrap();
    let kernel = TopKTiledSoftmax::build(&inputs.weight, &KernelConfig::new(4, 8)).unwrap();
    let dense = kernel.forward(&inputs.activation, &inputs.labels).unwrap();

    let label_probs = dense
        .gather(&inputs.labels.reshape((32, 1)).unwrap(), 1)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    assert!(label_probs.iter().all(|&p| p > 0.0));

    let sparse = kernel
        .forward_sparse(&inputs.activation, &inputs.labels)
        .unwrap();
    assert_eq!(sparse.support(), 5);
    for nnz in sparse.nnz_per_row().unwrap() {
        assert!((4..=5).contains(&nnz), "unexpected support size {nnz}");
    }
    assert_rows_sum_to_one(sparse.probs(), 1e-5);
}

#[test]
fn full_support_single_tile_matches_baseline() {
    let device = Device::Cpu;
    let inputs = sample_inputs(8, 16, 40, DType::F32, &device).unwrap();
    let config = KernelConfig::new(40, 1);

    let topk = TopKTiledSoftmax::build(&inputs.weight, &config)
        .unwrap()
        .forward(&inputs.activation, &inputs.labels)
        .unwrap();
    let baseline = BaselineSoftmax::build(&inputs.weight, &config)
        .unwrap()
        .forward(&inputs.activation, &inputs.labels)
        .unwrap();
    assert!(max_abs_diff(&topk, &baseline) < 1e-5);
}

#[test]
fn inplace_and_tiled_agree_with_baseline() {
    let device = Device::Cpu;
    let inputs = sample_inputs(9, 8, 50, DType::F32, &device).unwrap();
    let config = KernelConfig::new(5, 4);
    let baseline = BaselineSoftmax::build(&inputs.weight, &config)
        .unwrap()
        .forward(&inputs.activation, &inputs.labels)
        .unwrap();
    let inplace = InplaceSoftmax::build(&inputs.weight, &config)
        .unwrap()
        .forward(&inputs.activation, &inputs.labels)
        .unwrap();
    let tiled = TiledSoftmax::build(&inputs.weight, &config)
        .unwrap()
        .forward(&inputs.activation, &inputs.labels)
        .unwrap();
    assert!(max_abs_diff(&inplace, &baseline) < 1e-6);
    assert!(max_abs_diff(&tiled, &baseline) < 1e-6);
}

#[test]
fn sparse_kernel_shares_the_tiled_support() {
    let device = Device::Cpu;
    let inputs = sample_inputs(10, 8, 64, DType::F32, &device).unwrap();
    let config = KernelConfig::new(3, 4);
    let tiled = TopKTiledSoftmax::build(&inputs.weight, &config)
        .unwrap()
        .forward_sparse(&inputs.activation, &inputs.labels)
        .unwrap();
    let sparse = TopKSparseSoftmax::build(&inputs.weight, &config)
        .unwrap()
        .forward(&inputs.activation, &inputs.labels)
        .unwrap();

    let sorted_rows = |rows: Vec<Vec<u32>>| {
        rows.into_iter()
            .map(|mut row| {
                row.sort_unstable();
                row
            })
            .collect::<Vec<_>>()
    };
    let tiled_idx = tiled.indices().narrow(1, 0, 3).unwrap();
    assert_eq!(
        sorted_rows(tiled_idx.to_vec2::<u32>().unwrap()),
        sorted_rows(sparse.indices().to_vec2::<u32>().unwrap())
    );
    assert_eq!(sparse.support(), 3);
    assert_rows_sum_to_one(sparse.probs(), 1e-5);
}

#[test]
fn tile_configs_that_do_not_fit_are_rejected() {
    let weight = Tensor::zeros((4, 100), DType::F32, &Device::Cpu).unwrap();
    let cases = [
        KernelConfig::new(0, 4),
        KernelConfig::new(4, 0),
        KernelConfig::new(26, 4),
        KernelConfig::new(1, 101),
    ];
    for config in cases {
        let err = TopKTiledSoftmax::build(&weight, &config).unwrap_err();
        assert!(
            matches!(err, SoftmaxError::InvalidTileConfig { .. }),
            "{config:?} gave {err}"
        );
    }
    assert!(matches!(
        TopKSoftmax::build(&weight, &KernelConfig::new(101, 1)),
        Err(SoftmaxError::InvalidTileConfig { .. })
    ));
    assert!(TopKTiledSoftmax::build(&weight, &KernelConfig::new(25, 4)).is_ok());
}

#[test]
fn forward_rejects_bad_inputs() {
    let device = Device::Cpu;
    let inputs = sample_inputs(4, 8, 20, DType::F32, &device).unwrap();
    let kernel = TopKTiledSoftmax::build(&inputs.weight, &KernelConfig::new(2, 2)).unwrap();

    let wrong_hidden = Tensor::zeros((4, 7), DType::F32, &device).unwrap();
    assert!(matches!(
        kernel.forward(&wrong_hidden, &inputs.labels),
        Err(SoftmaxError::InvalidShape { .. })
    ));

    let wrong_dtype = inputs.activation.to_dtype(DType::F16).unwrap();
    assert!(matches!(
        kernel.forward(&wrong_dtype, &inputs.labels),
        Err(SoftmaxError::InvalidShape { .. })
    ));

    let out_of_range = Tensor::new(&[0u32, 1, 20, 3], &device).unwrap();
    assert!(matches!(
        kernel.forward(&inputs.activation, &out_of_range),
        Err(SoftmaxError::InvalidTarget { .. })
    ));

    let negative = Tensor::new(&[0i64, -1, 2, 3], &device).unwrap();
    assert!(matches!(
        kernel.forward(&inputs.activation, &negative),
        Err(SoftmaxError::InvalidTarget { .. })
    ));

    let short = Tensor::new(&[0u32, 1], &device).unwrap();
    assert!(matches!(
        kernel.forward(&inputs.activation, &short),
        Err(SoftmaxError::InvalidShape { .. })
    ));
}

#[test]
fn unsupported_weight_dtype_is_reported() {
    let weight = Tensor::zeros((4, 8), DType::F64, &Device::Cpu).unwrap();
    assert!(matches!(
        BaselineSoftmax::build(&weight, &KernelConfig::default()),
        Err(SoftmaxError::UnsupportedDType { .. })
    ));
}
