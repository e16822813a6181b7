#![deny(unsafe_code)]

//! Streaming fixed-point inference pipeline for MobileNetV3 classifiers
//!
//! The model runs as a chain of streaming stages joined by bounded channels.
//! Every stage consumes and produces one sample at a time; every arithmetic
//! result is clamped to the configured fixed-point range.
//!
//! # Stage chain
//!
//! ```text
//! image ─▶ stem conv ─▶ inverted-residual × N ─▶ head conv ─▶ pool ─▶ classifier ─▶ logits
//! ```
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`fixed`] | Q formats, saturating arithmetic, clamp counter |
//! | [`activation`] | ReLU, ReLU6, hard-sigmoid, h-swish, sigmoid approximation |
//! | [`frame`] | Feature maps, iteration orders, tokens |
//! | [`stream`] | Bounded channels, the `Stage` trait, synchronous scheduler |
//! | [`window`] | Row ring buffers for spatial kernels |
//! | [`conv`] | Depthwise, pointwise and standard convolution engines |
//! | [`norm`] | Folded batch normalization |
//! | [`se`] | Squeeze-and-excitation attention |
//! | [`block`] | Inverted-residual composition |
//! | [`sequencer`] | Top-level state machine |
//!
//! # Example
//!
//! ```no_run
//! use kc705_pipeline::{FeatureMap, ModelConfig, ModelWeights, Sequencer};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ModelConfig::tiny(10);
//! let weights = ModelWeights::random(&config, 42);
//! let mut seq = Sequencer::new(config.clone())?;
//! seq.load_weights(weights)?;
//!
//! let image = FeatureMap::zeros(config.input());
//! let result = seq.infer(&image)?;
//! println!("class {} ({:.1}%)", result.class_id, result.confidence_ratio() * 100.0);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod activation;
pub mod block;
pub mod config;
pub mod conv;
mod error;
pub mod fixed;
pub mod frame;
pub mod linear;
pub mod norm;
pub mod pool;
pub mod reorder;
pub mod se;
pub mod sequencer;
pub mod stream;
pub mod weights;
pub mod window;

pub use activation::Activation;
pub use config::{ConvConfig, LayerConfig, ModelConfig};
pub use error::{PipelineError, Result};
pub use fixed::{FixedPoint, QFormat, Sample, SaturationCounter};
pub use frame::{FeatureMap, FrameShape, Layout, Port, Token};
pub use sequencer::{Classification, Sequencer, SequencerState, CONFIDENCE_SCALE};
pub use stream::{Channel, Pipeline, PushError, Stage};
pub use weights::{ModelWeights, WeightSet};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        Classification, FeatureMap, FrameShape, ModelConfig, ModelWeights, QFormat, Result, Sample,
        Sequencer, SequencerState,
    };
}
