use std::{error::Error, time::Instant};

use candle_core::{DType, Device};
use clap::Parser;
use sparse_softmax::{
    sample_inputs, BaselineSoftmax, InplaceSoftmax, KernelConfig, KernelKind, OutputFootprint,
    SampleInputs, SoftmaxKernel, TiledSoftmax, TopKSoftmax, TopKSparseSoftmax, TopKTiledSoftmax,
};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        eprintln!("softmax benchmark failed: {err}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Benchmark dense and top-k softmax kernels", long_about = None)]
struct Args {
    #[arg(long, default_value_t = 1024, help = "Number of tokens (activation rows)")]
    tokens: usize,

    #[arg(long, default_value_t = 128, help = "Hidden size")]
    hidden: usize,

    #[arg(long, default_value_t = 256 * 1024, help = "Vocabulary size")]
    vocab: usize,

    #[arg(long, default_value = "f16", value_parser = parse_dtype, help = "f32, f16 or bf16")]
    dtype: DType,

    #[arg(
        long,
        value_delimiter = ',',
        default_value = "baseline,tiled,topk-tiled",
        help = "Comma-separated kernels to run"
    )]
    kernels: Vec<KernelKind>,

    #[arg(long, default_value_t = 9, help = "Timed forward calls per kernel")]
    repeats: usize,

    #[arg(long, default_value_t = 200)]
    top_k: usize,

    #[arg(long, default_value_t = 16)]
    tile_factor: usize,
}

fn parse_dtype(value: &str) -> Result<DType, String> {
    match value.to_ascii_lowercase().as_str() {
        "f32" | "fp32" => Ok(DType::F32),
        "f16" | "fp16" => Ok(DType::F16),
        "bf16" => Ok(DType::BF16),
        other => Err(format!("unsupported dtype '{other}'")),
    }
}

struct Report {
    kind: KernelKind,
    durations_ms: Vec<f64>,
    output_bytes: usize,
}

fn run() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let device = Device::Cpu;
    let config = KernelConfig::new(args.top_k, args.tile_factor);
    config.validate()?;

    let inputs = sample_inputs(args.tokens, args.hidden, args.vocab, args.dtype, &device)?;
    println!(
        "shape: ({}, {}) x ({}, {}) dtype={:?} k={} tile_factor={} repeats={}",
        args.tokens,
        args.hidden,
        args.hidden,
        args.vocab,
        args.dtype,
        args.top_k,
        args.tile_factor,
        args.repeats
    );

    let mut reports = Vec::new();
    for &kind in &args.kernels {
        let report = match kind {
            KernelKind::Baseline => time_kernel::<BaselineSoftmax>(&inputs, &config, args.repeats),
            KernelKind::Inplace => time_kernel::<InplaceSoftmax>(&inputs, &config, args.repeats),
            KernelKind::Tiled => time_kernel::<TiledSoftmax>(&inputs, &config, args.repeats),
            KernelKind::TopK => time_kernel::<TopKSoftmax>(&inputs, &config, args.repeats),
            KernelKind::TopKTiled => time_kernel::<TopKTiledSoftmax>(&inputs, &config, args.repeats),
            KernelKind::TopKSparse => {
                time_kernel::<TopKSparseSoftmax>(&inputs, &config, args.repeats)
            }
        };
        match report {
            Ok(report) => reports.push(report),
            // Dtype restrictions of individual kernels should not abort the run.
            Err(err) => log::warn!("skipping {kind}: {err}"),
        }
    }

    println!("| kernel | mean ms | min ms | output MiB |");
    println!("| --- | --- | --- | --- |");
    for report in &reports {
        let mean =
            report.durations_ms.iter().sum::<f64>() / report.durations_ms.len().max(1) as f64;
        let min = report
            .durations_ms
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min);
        println!(
            "| {} | {:.2} | {:.2} | {:.1} |",
            report.kind,
            mean,
            min,
            report.output_bytes as f64 / (1024.0 * 1024.0)
        );
    }
    Ok(())
}

fn time_kernel<K: SoftmaxKernel>(
    inputs: &SampleInputs,
    config: &KernelConfig,
    repeats: usize,
) -> Result<Report, Box<dyn Error>> {
    let kernel = K::build(&inputs.weight, config)?;
    let mut durations_ms = Vec::with_capacity(repeats);
    let mut output_bytes = 0;
    for _ in 0..repeats {
        let start = Instant::now();
        let out = kernel.forward(&inputs.activation, &inputs.labels)?;
        durations_ms.push(start.elapsed().as_secs_f64() * 1000.0);
        output_bytes = output_bytes.max(out.footprint_bytes());
    }
    log::info!("{} done: {} repeats", K::KIND, repeats);
    Ok(Report {
        kind: K::KIND,
        durations_ms,
        output_bytes,
    })
}
