//! MAC-unit and link-depth sweep on the software pipeline.
//!
//! The number of parallel multiply-accumulate units only changes how a dot
//! product's partial sums are grouped, and link capacity only changes how
//! far stages run ahead of each other. Neither should change the answer
//! unless a partial sum saturates. This sweep times one frame per setting
//! and flags any classification that differs from the 1-unit reference.
//!
//! Usage:
//!   cargo run --release --bin bench_units
//!   cargo run --release --bin bench_units -- --frames 20

use anyhow::Result;
use kc705_chip::image::NUM_CLASSES;
use kc705_pipeline::{Classification, FeatureMap, FixedPoint, ModelConfig, ModelWeights, Sequencer};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

const DEFAULT_FRAMES: usize = 5;
const UNITS: [usize; 6] = [1, 2, 4, 8, 16, 32];
const LINKS: [usize; 4] = [1, 2, 4, 16];

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let frames = args
        .windows(2)
        .find(|w| w[0] == "--frames")
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(DEFAULT_FRAMES)
        .max(1);

    let base = ModelConfig::tiny(NUM_CLASSES);
    let weights = ModelWeights::random(&base, 7);
    let fx = FixedPoint::new(base.activation_format());
    let images = (0..frames)
        .map(|f| {
            let pixels: Vec<u8> = (0..base.input().volume())
                .map(|i| ((i * 31 + f * 97) % 256) as u8)
                .collect();
            FeatureMap::from_interleaved_u8(&fx, base.input(), &pixels)
        })
        .collect::<kc705_pipeline::Result<Vec<_>>>()?;

    println!("MAC unit / link capacity sweep");
    println!("==============================");
    println!("Model  : tiny ({} blocks, {})", base.blocks().len(), base.input());
    println!("Frames : {frames}");
    println!();

    let reference = run(base.clone().with_compute_units(1), &weights, &images)?.1;

    println!("  {:>5}  {:>5}  {:>12}  {:>11}  {:>8}", "units", "link", "µs/frame", "saturations", "matches");
    for &units in &UNITS {
        for &link in &LINKS {
            let config = base.clone().with_compute_units(units).with_link_capacity(link);
            let (us_per_frame, results, saturations) = run(config, &weights, &images)?;
            let matching = results
                .iter()
                .zip(&reference)
                .filter(|(a, b)| a.class_id == b.class_id)
                .count();
            println!(
                "  {units:>5}  {link:>5}  {us_per_frame:>12.0}  {saturations:>11}  {matching:>5}/{frames}"
            );
        }
    }

    Ok(())
}

fn run(
    config: ModelConfig,
    weights: &ModelWeights,
    images: &[FeatureMap],
) -> Result<(f64, Vec<Classification>, u64)> {
    let mut sequencer = Sequencer::new(config)?;
    sequencer.load_weights(weights.clone())?;

    let t0 = Instant::now();
    let results = images
        .iter()
        .map(|image| sequencer.infer(image))
        .collect::<kc705_pipeline::Result<Vec<_>>>()?;
    let us = t0.elapsed().as_micros() as f64 / images.len() as f64;

    Ok((us, results, sequencer.saturation_count()))
}
