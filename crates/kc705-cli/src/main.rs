//! `kc705` — command-line interface for the KC705 MobileNetV3 accelerator.
//!
//! ```text
//! USAGE:
//!   kc705 enumerate                    List all boards
//!   kc705 info [-d device]             Identification and link state
//!   kc705 infer <image> [options]      Classify one raw RGB image
//!   kc705 batch <images>... [options]  Classify several images
//!   kc705 regs [-d device]             Dump the register file
//!   kc705 reset [-d device]            Soft-reset a board
//!   kc705 pack-weights <out> [options] Write a packed weight blob
//! ```
//!
//! `--software` runs the same protocol against the CPU pipeline; without a
//! weight file it installs seeded random weights.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use kc705_chip::image::NUM_CLASSES;
use kc705_driver::{
    DeviceManager, InferenceConfig, Kc705Device, RgbImage, SoftwareBackend,
};
use kc705_pipeline::{ModelConfig, ModelWeights};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kc705", about = "KC705 MobileNetV3 accelerator CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List all KC705 boards on the PCIe bus.
    Enumerate,
    /// Print identification and link state for one device.
    Info(DeviceArgs),
    /// Classify one image.
    Infer {
        /// Headerless interleaved RGB file.
        image: PathBuf,
        #[command(flatten)]
        device: DeviceArgs,
        #[command(flatten)]
        input: InputArgs,
    },
    /// Classify several images, continuing past failures.
    Batch {
        /// Headerless interleaved RGB files.
        #[arg(required = true)]
        images: Vec<PathBuf>,
        #[command(flatten)]
        device: DeviceArgs,
        #[command(flatten)]
        input: InputArgs,
    },
    /// Dump every register.
    Regs(DeviceArgs),
    /// Assert RESET for one pulse.
    Reset(DeviceArgs),
    /// Write a packed weight blob with seeded random weights.
    PackWeights {
        /// Output path.
        out: PathBuf,
        /// Model the weights are shaped for.
        #[arg(long, value_enum, default_value_t = Model::Small)]
        model: Model,
        /// Random seed.
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
}

#[derive(Args)]
struct DeviceArgs {
    /// PCIe address (e.g. 0000:03:00.0) or device index (e.g. 0).
    #[arg(long, short, default_value = "0")]
    device: String,
    /// Use the software backend instead of a board.
    #[arg(long)]
    software: bool,
    /// Model served by the software backend.
    #[arg(long, value_enum, default_value_t = Model::Small)]
    model: Model,
    /// Packed weight blob to load before inference.
    #[arg(long)]
    weights: Option<PathBuf>,
    /// Seed for random weights when `--software` runs without `--weights`.
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// DONE wait bound in milliseconds.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

#[derive(Args)]
struct InputArgs {
    /// Width of the input file if it is not at the model's input size.
    #[arg(long, requires = "height")]
    width: Option<usize>,
    /// Height of the input file if it is not at the model's input size.
    #[arg(long, requires = "width")]
    height: Option<usize>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Model {
    /// MobileNetV3-Small, 224×224 input.
    Small,
    /// MobileNetV3-Large, 224×224 input.
    Large,
    /// Two-block model, 16×16 input.
    Tiny,
}

impl Model {
    fn config(self) -> ModelConfig {
        match self {
            Self::Small => ModelConfig::mobilenet_v3_small(NUM_CLASSES),
            Self::Large => ModelConfig::mobilenet_v3_large(NUM_CLASSES),
            Self::Tiny => ModelConfig::tiny(NUM_CLASSES),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Enumerate => cmd_enumerate()?,
        Cmd::Info(device) => cmd_info(&device)?,
        Cmd::Infer {
            image,
            device,
            input,
        } => cmd_infer(&image, &device, &input)?,
        Cmd::Batch {
            images,
            device,
            input,
        } => cmd_batch(&images, &device, &input)?,
        Cmd::Regs(device) => cmd_regs(&device)?,
        Cmd::Reset(device) => cmd_reset(&device)?,
        Cmd::PackWeights { out, model, seed } => cmd_pack_weights(&out, model, seed)?,
    }

    Ok(())
}

fn cmd_enumerate() -> Result<()> {
    let mgr = DeviceManager::discover()?;

    println!("KC705 devices: {}", mgr.device_count());
    println!();

    for info in mgr.devices() {
        println!("[{}] KC705 @ {}", info.index(), info.pcie_address());
        println!("     sysfs {}", info.path().display());
    }

    Ok(())
}

/// Open the device named by `args`, applying timeout and weights.
fn open(args: &DeviceArgs) -> Result<Kc705Device> {
    let config = InferenceConfig::default().with_timeout(Duration::from_millis(args.timeout_ms));

    let mut dev = if args.software {
        let model = args.model.config();
        let backend = SoftwareBackend::new(model.clone())?;
        let mut dev = Kc705Device::new(Box::new(backend));
        if args.weights.is_none() {
            tracing::warn!("no --weights given, installing random weights (seed {})", args.seed);
            dev.load_weights(&ModelWeights::random(&model, args.seed))?;
        }
        dev
    } else {
        let mgr = DeviceManager::discover()?;
        if let Ok(index) = args.device.parse::<usize>() {
            mgr.open(index)?
        } else {
            mgr.devices()
                .iter()
                .find(|d| d.pcie_address() == args.device)
                .ok_or_else(|| anyhow::anyhow!("Device not found: {}", args.device))?
                .open()?
        }
    };

    if let Some(path) = &args.weights {
        dev.load_weights_file(path)
            .with_context(|| format!("loading weights from {}", path.display()))?;
    }

    Ok(dev.with_config(config))
}

/// Load `path` and bring it to the model's input size.
fn load_image(path: &Path, device: &DeviceArgs, input: &InputArgs) -> Result<RgbImage> {
    let target = if device.software {
        device.model.config().input()
    } else {
        ModelConfig::mobilenet_v3_small(NUM_CLASSES).input()
    };
    let (width, height) = match (input.width, input.height) {
        (Some(w), Some(h)) => (w, h),
        _ => (target.width, target.height),
    };
    let image = RgbImage::load_raw(path, width, height)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(image.resize_nearest(target.width, target.height))
}

fn cmd_info(args: &DeviceArgs) -> Result<()> {
    let dev = open(args)?;
    println!("{}", dev.device_info()?);
    Ok(())
}

fn cmd_infer(path: &Path, device: &DeviceArgs, input: &InputArgs) -> Result<()> {
    let mut dev = open(device)?;
    let image = load_image(path, device, input)?;
    let result = dev.infer(image.as_bytes())?;

    println!("Image        : {}", path.display());
    println!("Class        : {} ({})", result.class_id, result.class_name());
    println!("Confidence   : {:.2}%", result.confidence() * 100.0);
    println!("Device time  : {} µs", result.processing_time_us);
    println!("Host latency : {:.3} ms", result.latency.as_secs_f64() * 1e3);
    Ok(())
}

fn cmd_batch(paths: &[PathBuf], device: &DeviceArgs, input: &InputArgs) -> Result<()> {
    let mut dev = open(device)?;
    let mut failed = 0usize;

    for path in paths {
        let outcome = load_image(path, device, input)
            .and_then(|image| Ok(dev.infer(image.as_bytes())?));
        match outcome {
            Ok(r) => println!(
                "{:<40} {:>4} {:<24} {:6.2}%",
                path.display(),
                r.class_id,
                r.class_name(),
                r.confidence() * 100.0
            ),
            Err(e) => {
                failed += 1;
                println!("{:<40} error: {e:#}", path.display());
            }
        }
    }

    println!();
    println!("Processed {}/{} images", paths.len() - failed, paths.len());
    println!("{}", dev.stats());
    Ok(())
}

fn cmd_regs(args: &DeviceArgs) -> Result<()> {
    let dev = open(args)?;
    println!("Registers ({}):", dev.address());
    print!("{}", dev.debug_status()?);
    Ok(())
}

fn cmd_reset(args: &DeviceArgs) -> Result<()> {
    let mut dev = open(args)?;
    dev.reset()?;
    println!("Reset {}", dev.address());
    Ok(())
}

fn cmd_pack_weights(out: &Path, model: Model, seed: u64) -> Result<()> {
    let config = model.config();
    let weights = ModelWeights::random(&config, seed);
    let blob = weights.pack();
    std::fs::write(out, &blob).with_context(|| format!("writing {}", out.display()))?;
    println!(
        "Wrote {} ({} bytes, {} parameters)",
        out.display(),
        blob.len(),
        weights.parameter_count()
    );
    Ok(())
}
