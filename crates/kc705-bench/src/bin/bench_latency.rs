//! End-to-end inference latency through the host protocol.
//!
//! Runs upload → START → DONE → result read in a loop and reports the host
//! latency distribution next to the device-reported processing time. By
//! default the software backend serves the two-block model; `--hardware`
//! uses the first KC705 found instead.
//!
//! Usage:
//!   cargo run --release --bin bench_latency
//!   cargo run --release --bin bench_latency -- --iterations 200 --model small
//!   cargo run --release --bin bench_latency -- --iterations 20 --model large
//!   cargo run --release --bin bench_latency -- --hardware --weights mnv3.k7w

use anyhow::{bail, Result};
use kc705_chip::image::NUM_CLASSES;
use kc705_driver::{DeviceManager, Kc705Device, SoftwareBackend};
use kc705_pipeline::{ModelConfig, ModelWeights};
use tracing_subscriber::EnvFilter;

const DEFAULT_ITERATIONS: usize = 100;
const WARMUP: usize = 3;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let iterations = parse_arg(&args, "--iterations", DEFAULT_ITERATIONS).max(1);
    let hardware = args.iter().any(|a| a == "--hardware");
    let model = match find_arg(&args, "--model").unwrap_or("tiny") {
        "tiny" => ModelConfig::tiny(NUM_CLASSES),
        "small" => ModelConfig::mobilenet_v3_small(NUM_CLASSES),
        "large" => ModelConfig::mobilenet_v3_large(NUM_CLASSES),
        other => bail!("unknown model {other:?} (tiny | small | large)"),
    };
    let weights_path = find_arg(&args, "--weights");

    let mut device = if hardware {
        DeviceManager::discover()?.open_first()?
    } else {
        Kc705Device::new(Box::new(SoftwareBackend::new(model.clone())?))
    };
    match weights_path {
        Some(path) => device.load_weights_file(path)?,
        None => device.load_weights(&ModelWeights::random(&model, 1))?,
    }

    let input = model.input();
    let image: Vec<u8> = (0..input.volume()).map(|i| (i % 251) as u8).collect();

    println!("Inference latency benchmark");
    println!("===========================");
    println!("Backend        : {}", device.backend_type());
    println!("Input          : {input}");
    println!("Blocks         : {}", model.blocks().len());
    println!("Iterations     : {iterations}");
    println!();

    for _ in 0..WARMUP {
        device.infer(&image)?;
    }
    device.reset_stats();

    let mut host_us = Vec::with_capacity(iterations);
    let mut device_us = Vec::with_capacity(iterations);
    for _ in 0..iterations {
        let result = device.infer(&image)?;
        host_us.push(result.latency.as_micros() as f64);
        device_us.push(f64::from(result.processing_time_us));
    }

    report("Host latency (upload → result)", &mut host_us);
    report("Device processing time", &mut device_us);
    println!("{}", device.stats());

    Ok(())
}

fn report(title: &str, samples: &mut [f64]) {
    samples.sort_by(f64::total_cmp);
    let n = samples.len();
    let mean = samples.iter().sum::<f64>() / n as f64;
    let at = |q: f64| samples[((n as f64 * q) as usize).min(n - 1)];

    println!("{title}");
    println!("{}", "-".repeat(title.len()));
    println!("  mean : {mean:.0} µs  ({:.1} FPS)", 1e6 / mean.max(1.0));
    println!("  min  : {:.0} µs", samples[0]);
    println!("  p50  : {:.0} µs", at(0.50));
    println!("  p95  : {:.0} µs", at(0.95));
    println!("  p99  : {:.0} µs", at(0.99));
    println!("  max  : {:.0} µs", samples[n - 1]);
    println!();
}

fn find_arg<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}

fn parse_arg(args: &[String], flag: &str, default: usize) -> usize {
    find_arg(args, flag)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
