// SPDX-License-Identifier: AGPL-3.0-only

//! Top-level inference state machine.
//!
//! ```text
//!        start ──▶ LoadingWeights ──▶ Processing ──▶ Done
//!          ▲         (install)         (stream)       │
//!          └──────────── Idle ◀───── acknowledge ─────┘
//! ```
//!
//! Any structural error while loading or processing tears the pipeline down
//! and leaves the sequencer `Idle`, exactly as an explicit [`Sequencer::reset`]
//! would. Installed weights survive a reset.

use crate::activation::sigmoid_approx;
use crate::block::{conv_stages, BuildContext, InvertedResidual};
use crate::config::ModelConfig;
use crate::error::{PipelineError, Result};
use crate::fixed::{FixedPoint, Sample, SaturationCounter};
use crate::frame::{FeatureMap, Token};
use crate::linear::Classifier;
use crate::pool::GlobalAvgPool;
use crate::stream::{Pipeline, Stage};
use crate::weights::{ModelWeights, WeightSet};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Parts-per-unit scale of [`Classification::confidence`].
pub const CONFIDENCE_SCALE: u32 = 10_000;

/// Sequencer states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    /// Waiting for `start`.
    Idle,
    /// Installing weight sets into freshly built stages.
    LoadingWeights,
    /// A frame is streaming through the pipeline.
    Processing,
    /// A result is held until acknowledged.
    Done,
}

impl std::fmt::Display for SequencerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::LoadingWeights => "loading weights",
            Self::Processing => "processing",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Outcome of one inference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Index of the largest logit; ties resolve to the lowest index.
    pub class_id: u32,
    /// `sigmoid(top logit)` in parts per [`CONFIDENCE_SCALE`].
    pub confidence: u32,
    /// Raw logits in the activation format.
    pub logits: Vec<Sample>,
}

impl Classification {
    fn from_logits(logits: Vec<Sample>, fx: &FixedPoint) -> Self {
        let (class_id, top) = logits
            .iter()
            .enumerate()
            .fold((0usize, Sample::from_raw(i32::MIN)), |best, (i, &v)| {
                if v > best.1 {
                    (i, v)
                } else {
                    best
                }
            });
        let probability = sigmoid_approx(fx, top).wide().max(0);
        let one = i64::from(fx.one());
        let scale = i64::from(CONFIDENCE_SCALE);
        let confidence = (probability * scale / one).min(scale);
        Self {
            class_id: u32::try_from(class_id).unwrap_or(u32::MAX),
            confidence: u32::try_from(confidence).unwrap_or(CONFIDENCE_SCALE),
            logits,
        }
    }

    /// Confidence as a fraction.
    #[allow(clippy::cast_precision_loss)]
    pub fn confidence_ratio(&self) -> f32 {
        self.confidence as f32 / CONFIDENCE_SCALE as f32
    }

    /// The `k` largest logits as `(class, logit)`, largest first.
    pub fn top_k(&self, k: usize) -> Vec<(u32, Sample)> {
        let mut ranked: Vec<(u32, Sample)> = self
            .logits
            .iter()
            .enumerate()
            .map(|(i, &v)| (u32::try_from(i).unwrap_or(u32::MAX), v))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(k);
        ranked
    }
}

/// Drives one configured model through the inference state machine.
#[derive(Debug)]
pub struct Sequencer {
    config: ModelConfig,
    weights: Option<ModelWeights>,
    state: SequencerState,
    pipeline: Option<Pipeline>,
    pending: VecDeque<Token>,
    logits: Vec<Sample>,
    result: Option<Classification>,
    saturations: SaturationCounter,
    fx: FixedPoint,
    frames: u64,
}

impl Sequencer {
    /// Create an idle sequencer for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Configuration`] if the layer chain is
    /// inconsistent; such a sequencer never reaches `Processing`.
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        info!(
            input = %config.input(),
            blocks = config.blocks().len(),
            classes = config.num_classes(),
            "sequencer configured"
        );
        let saturations = SaturationCounter::new();
        let fx = FixedPoint::with_counter(config.activation_format(), saturations.clone());
        Ok(Self {
            config,
            weights: None,
            state: SequencerState::Idle,
            pipeline: None,
            pending: VecDeque::new(),
            logits: Vec::new(),
            result: None,
            saturations,
            fx,
            frames: 0,
        })
    }

    /// Model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// True once weights have been installed.
    pub fn has_weights(&self) -> bool {
        self.weights.is_some()
    }

    /// Installed weights.
    pub fn weights(&self) -> Option<&ModelWeights> {
        self.weights.as_ref()
    }

    /// Clamp events since creation or the last [`Sequencer::clear_saturations`].
    pub fn saturation_count(&self) -> u64 {
        self.saturations.count()
    }

    /// Zero the clamp counter.
    pub fn clear_saturations(&self) {
        self.saturations.reset();
    }

    /// Frames completed.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Replace the installed weights. Administrative; only allowed while idle.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidState`] outside `Idle` and
    /// [`PipelineError::Weights`] if the set does not fit the configuration.
    pub fn load_weights(&mut self, weights: ModelWeights) -> Result<()> {
        if self.state != SequencerState::Idle {
            return Err(PipelineError::invalid_state(format!(
                "weights can only be reloaded while idle (currently {})",
                self.state
            )));
        }
        weights.validate(&self.config)?;
        info!(parameters = weights.parameter_count(), "weights installed");
        self.weights = Some(weights);
        Ok(())
    }

    /// Begin an inference on `image`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidState`] unless idle with weights
    /// installed, and a configuration error if `image` has the wrong shape.
    /// Assembly errors reset the sequencer to `Idle`.
    pub fn start(&mut self, image: &FeatureMap) -> Result<()> {
        if self.state != SequencerState::Idle {
            return Err(PipelineError::invalid_state(format!(
                "cannot start while {}",
                self.state
            )));
        }
        if self.weights.is_none() {
            return Err(PipelineError::invalid_state("no weights installed"));
        }
        if image.shape() != self.config.input() {
            return Err(PipelineError::configuration(format!(
                "model expects {} input, image is {}",
                self.config.input(),
                image.shape()
            )));
        }

        self.state = SequencerState::LoadingWeights;
        let pipeline = match self.assemble() {
            Ok(p) => p,
            Err(e) => return Err(self.abort(e)),
        };
        let layout = pipeline.input().layout;
        self.pending = image.tokens(layout).collect();
        self.logits.clear();
        self.pipeline = Some(pipeline);
        self.state = SequencerState::Processing;
        debug!(samples = self.pending.len(), "frame accepted");
        Ok(())
    }

    /// Build every stage and install each layer's weight set.
    fn assemble(&self) -> Result<Pipeline> {
        let weights = self
            .weights
            .as_ref()
            .ok_or_else(|| PipelineError::invalid_state("no weights installed"))?;
        weights.validate(&self.config)?;
        let ctx = BuildContext::new(&self.config, self.saturations.clone());
        let layers = weights.layers();
        let mut stages: Vec<Box<dyn Stage>> = Vec::new();

        let WeightSet::Stem(stem_weights) = &layers[0] else {
            return Err(PipelineError::weights("layer 0 is not a stem"));
        };
        let (stem, mut shape) =
            conv_stages("stem", self.config.stem(), self.config.input(), stem_weights, &ctx)?;
        stages.extend(stem);

        for (i, block) in self.config.blocks().iter().enumerate() {
            let WeightSet::Block(block_weights) = &layers[i + 1] else {
                return Err(PipelineError::weights(format!("layer {} is not a block", i + 1)));
            };
            let stage =
                InvertedResidual::new(format!("block{i}"), block, shape, block_weights, &ctx)?;
            shape = stage.output().shape;
            stages.push(Box::new(stage));
        }

        let head_index = layers.len() - 2;
        let WeightSet::Head(head_weights) = &layers[head_index] else {
            return Err(PipelineError::weights(format!("layer {head_index} is not a head")));
        };
        let (head, shape) = conv_stages("head", self.config.head(), shape, head_weights, &ctx)?;
        stages.extend(head);
        stages.push(Box::new(GlobalAvgPool::new("pool", shape, ctx.fx.clone())));

        let WeightSet::Classifier(classifier) = &layers[head_index + 1] else {
            return Err(PipelineError::weights("last layer is not a classifier"));
        };
        stages.push(Box::new(Classifier::new(
            "classifier",
            shape.channels,
            classifier.clone(),
            ctx.weight_format,
            ctx.fx.clone(),
            ctx.compute_units,
        )?));

        Pipeline::new(stages, ctx.link_capacity)
    }

    /// Run up to `budget` scheduler steps of the current frame.
    ///
    /// Returns `true` once the sequencer reaches `Done`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidState`] outside `Processing`. Stage
    /// errors and stalls abort the frame and reset the sequencer to `Idle`.
    pub fn advance(&mut self, budget: usize) -> Result<bool> {
        if self.state == SequencerState::Done {
            return Ok(true);
        }
        if self.state != SequencerState::Processing {
            return Err(PipelineError::invalid_state(format!(
                "cannot advance while {}",
                self.state
            )));
        }
        for _ in 0..budget {
            match self.step_once() {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => return Err(self.abort(e)),
            }
        }
        Ok(false)
    }

    fn step_once(&mut self) -> Result<bool> {
        let pipeline = self
            .pipeline
            .as_mut()
            .ok_or_else(|| PipelineError::invalid_state("processing without a pipeline"))?;

        let mut progress = false;
        while let Some(token) = self.pending.pop_front() {
            if let Err(rejected) = pipeline.try_feed(token) {
                self.pending.push_front(rejected.into_inner());
                break;
            }
            progress = true;
        }
        progress |= pipeline.step()?;

        while let Some(token) = pipeline.try_drain() {
            progress = true;
            self.logits.push(token.sample);
            if token.last {
                let logits = std::mem::take(&mut self.logits);
                let result = Classification::from_logits(logits, &self.fx);
                info!(
                    class_id = result.class_id,
                    confidence = result.confidence,
                    saturations = self.saturations.count(),
                    "inference complete"
                );
                self.result = Some(result);
                self.pipeline = None;
                self.frames += 1;
                self.state = SequencerState::Done;
                return Ok(true);
            }
        }

        if progress {
            Ok(false)
        } else {
            Err(PipelineError::invalid_state("pipeline stalled before frame end"))
        }
    }

    /// Drive the current frame to completion.
    ///
    /// # Errors
    ///
    /// As [`Sequencer::advance`].
    pub fn finish(&mut self) -> Result<&Classification> {
        while !self.advance(usize::MAX)? {}
        self.result
            .as_ref()
            .ok_or_else(|| PipelineError::invalid_state("done without a result"))
    }

    /// Held result; only available in `Done`.
    pub fn result(&self) -> Option<&Classification> {
        match self.state {
            SequencerState::Done => self.result.as_ref(),
            _ => None,
        }
    }

    /// Release the held result and return to `Idle`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidState`] outside `Done`.
    pub fn acknowledge(&mut self) -> Result<Classification> {
        if self.state != SequencerState::Done {
            return Err(PipelineError::invalid_state(format!(
                "nothing to acknowledge while {}",
                self.state
            )));
        }
        self.state = SequencerState::Idle;
        self.result
            .take()
            .ok_or_else(|| PipelineError::invalid_state("done without a result"))
    }

    /// Start, finish and acknowledge one inference.
    ///
    /// # Errors
    ///
    /// Any error from [`Sequencer::start`] or [`Sequencer::advance`].
    pub fn infer(&mut self, image: &FeatureMap) -> Result<Classification> {
        self.start(image)?;
        self.finish()?;
        self.acknowledge()
    }

    /// Destroy all stage state and return to `Idle`. Weights are kept.
    pub fn reset(&mut self) {
        if self.state != SequencerState::Idle {
            debug!(state = %self.state, "sequencer reset");
        }
        self.pipeline = None;
        self.pending.clear();
        self.logits.clear();
        self.result = None;
        self.state = SequencerState::Idle;
    }

    fn abort(&mut self, error: PipelineError) -> PipelineError {
        warn!(%error, state = %self.state, "frame aborted");
        self.reset();
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::QFormat;

    #[test]
    fn classification_picks_lowest_index_on_ties() {
        let fx = FixedPoint::new(QFormat::Q8_8);
        let logits = [3, 9, 9, -2].into_iter().map(Sample::from_raw).collect();
        let c = Classification::from_logits(logits, &fx);
        assert_eq!(c.class_id, 1);
        assert_eq!(c.top_k(2), vec![(1, Sample::from_raw(9)), (2, Sample::from_raw(9))]);
    }

    fn running_tiny() -> (Sequencer, FeatureMap) {
        let config = ModelConfig::tiny(4);
        let fx = FixedPoint::new(config.activation_format());
        let image = FeatureMap::filled(config.input(), fx.encode(0.25));
        let mut seq = Sequencer::new(config.clone()).unwrap();
        seq.load_weights(ModelWeights::random(&config, 3)).unwrap();
        seq.start(&image).unwrap();
        (seq, image)
    }

    fn assert_recovers(seq: &mut Sequencer, image: &FeatureMap) {
        assert_eq!(seq.state(), SequencerState::Idle);
        assert!(seq.result().is_none());
        assert!(seq.has_weights());
        assert!(matches!(seq.advance(1), Err(PipelineError::InvalidState { .. })));

        let (mut fresh, _) = running_tiny();
        let expected = fresh.finish().unwrap().clone();
        assert_eq!(seq.infer(image).unwrap(), expected);
        assert_eq!(seq.frames(), 1);
    }

    #[test]
    fn overlong_frame_aborts_to_idle() {
        let (mut seq, image) = running_tiny();
        let tail = seq.pending.pop_back().unwrap();
        seq.pending.push_back(Token::body(tail.sample));
        seq.pending.push_back(tail);

        let err = seq.advance(usize::MAX).unwrap_err();
        assert!(matches!(err, PipelineError::ResourceExhaustion { .. }), "{err}");
        assert_recovers(&mut seq, &image);
    }

    #[test]
    fn early_marker_aborts_to_idle() {
        let (mut seq, image) = running_tiny();
        seq.pending[10].last = true;

        let err = seq.advance(usize::MAX).unwrap_err();
        assert!(matches!(err, PipelineError::FrameMarker { .. }), "{err}");
        assert_recovers(&mut seq, &image);
    }

    #[test]
    fn confidence_is_sigmoid_of_top_logit() {
        let fx = FixedPoint::new(QFormat::Q8_8);
        let c = Classification::from_logits(vec![fx.encode(0.0)], &fx);
        assert_eq!(c.confidence, 5_000);
        let c = Classification::from_logits(vec![fx.encode(-1.0), fx.encode(20.0)], &fx);
        assert_eq!(c.class_id, 1);
        assert!(c.confidence > 9_900);
        assert!((c.confidence_ratio() - 0.996).abs() < 0.01);
    }
}
