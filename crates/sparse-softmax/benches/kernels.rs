use candle_core::{DType, Device};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sparse_softmax::{
    sample_inputs, BaselineSoftmax, KernelConfig, SampleInputs, SoftmaxKernel, TiledSoftmax,
    TopKSparseSoftmax, TopKTiledSoftmax,
};

fn bench_kernel<K: SoftmaxKernel>(
    group: &mut criterion::BenchmarkGroup<'_, criterion::measurement::WallTime>,
    name: &str,
    inputs: &SampleInputs,
    config: &KernelConfig,
    shape: &str,
) {
    let kernel = K::build(&inputs.weight, config).expect("build kernel");
    group.bench_with_input(
        BenchmarkId::new(name, shape),
        &(&kernel, inputs),
        |b, (kernel, inputs)| {
            b.iter(|| {
                let out = kernel
                    .forward(black_box(&inputs.activation), black_box(&inputs.labels))
                    .expect("forward");
                black_box(out);
            });
        },
    );
}

fn bench_softmax(c: &mut Criterion) {
    let device = Device::Cpu;
    let hidden = 128usize;
    let shapes = &[(256usize, 16_384usize), (512, 65_536)];
    let config = KernelConfig::new(64, 16);

    for dtype in [DType::F32, DType::F16] {
        let mut group = c.benchmark_group(format!("softmax/{dtype:?}"));
        group.sample_size(10);
        for &(tokens, vocab) in shapes {
            let inputs = sample_inputs(tokens, hidden, vocab, dtype, &device).expect("inputs");
            let shape = format!("{tokens}x{hidden}x{vocab}");
            group.throughput(Throughput::Elements((tokens * hidden * vocab) as u64));
            bench_kernel::<BaselineSoftmax>(&mut group, "baseline", &inputs, &config, &shape);
            bench_kernel::<TiledSoftmax>(&mut group, "tiled", &inputs, &config, &shape);
            bench_kernel::<TopKTiledSoftmax>(&mut group, "topk-tiled", &inputs, &config, &shape);
            bench_kernel::<TopKSparseSoftmax>(&mut group, "topk-sparse", &inputs, &config, &shape);
        }
        group.finish();
    }
}

criterion_group!(benches, bench_softmax);
criterion_main!(benches);
