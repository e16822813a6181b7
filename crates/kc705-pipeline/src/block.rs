//! Inverted-residual block and layer assembly.
//!
//! A block is itself a [`Stage`] that owns an inner [`Pipeline`]:
//!
//! ```text
//!  CM ─▶ reorder ─▶ 1×1 expand ─▶ norm ─▶ act ─▶ reorder
//!     ─▶ K×K depthwise ─▶ norm ─▶ act ─▶ [SE]
//!     ─▶ reorder ─▶ 1×1 project ─▶ norm ─▶ reorder ─▶ (+ residual) ─▶ CM
//! ```
//!
//! Pointwise engines consume spatial-major streams; depthwise, attention and
//! pooling consume channel-major streams. The reorder adapters between them
//! keep the block's external order channel-major.

use crate::activation::{Activation, ActivationStage};
use crate::config::{ConvConfig, LayerConfig, ModelConfig};
use crate::conv::{DepthwiseConv, PointwiseConv, StandardConv};
use crate::error::{PipelineError, Result};
use crate::fixed::{FixedPoint, QFormat, Sample, SaturationCounter};
use crate::frame::{FrameShape, Layout, Port, Position, Token};
use crate::norm::AffineNorm;
use crate::reorder::Reorder;
use crate::se::SqueezeExcite;
use crate::stream::{Outbox, Pipeline, PushError, Stage};
use crate::weights::{BlockWeights, ConvWeights};
use std::collections::VecDeque;

/// Settings shared by every stage built for one model.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Activation arithmetic, reporting into the model's saturation counter.
    pub fx: FixedPoint,
    /// Format of kernels and scales.
    pub weight_format: QFormat,
    /// Attention gate.
    pub se_gate: Activation,
    /// MAC units per engine.
    pub compute_units: usize,
    /// Tokens per link.
    pub link_capacity: usize,
}

impl BuildContext {
    /// Context for `config`, counting clamps into `saturations`.
    pub fn new(config: &ModelConfig, saturations: SaturationCounter) -> Self {
        Self {
            fx: FixedPoint::with_counter(config.activation_format(), saturations),
            weight_format: config.weight_format(),
            se_gate: config.se_gate(),
            compute_units: config.compute_units(),
            link_capacity: config.link_capacity(),
        }
    }
}

/// Stages of a convolution followed by normalization and activation.
///
/// 1×1 unit-stride convolutions run on the pointwise engine between layout
/// adapters; anything else runs on the full-frame engine. Both produce a
/// channel-major stream.
///
/// # Errors
///
/// Propagates configuration and weight errors from the engines.
pub fn conv_stages(
    name: &str,
    conv: &ConvConfig,
    input: FrameShape,
    weights: &ConvWeights,
    ctx: &BuildContext,
) -> Result<(Vec<Box<dyn Stage>>, FrameShape)> {
    let geometry = conv.geometry();
    let mut stages: Vec<Box<dyn Stage>> = Vec::new();
    let output;
    if geometry.kernel == 1 && geometry.stride == 1 {
        output = FrameShape::new(conv.output_channels(), input.height, input.width);
        stages.push(Box::new(Reorder::new(
            format!("{name}.to_spatial"),
            input,
            Layout::ChannelMajor,
            Layout::SpatialMajor,
        )));
        stages.push(Box::new(PointwiseConv::new(
            format!("{name}.conv"),
            input,
            conv.output_channels(),
            weights.kernel.clone(),
            ctx.weight_format,
            ctx.fx.clone(),
            ctx.compute_units,
        )?));
        stages.push(Box::new(AffineNorm::new(
            format!("{name}.norm"),
            Port::spatial_major(output),
            weights.norm.clone(),
            ctx.weight_format,
            ctx.fx.clone(),
        )?));
        stages.push(Box::new(ActivationStage::new(
            format!("{name}.act"),
            Port::spatial_major(output),
            conv.activation(),
            ctx.fx.clone(),
        )));
        stages.push(Box::new(Reorder::new(
            format!("{name}.to_channel"),
            output,
            Layout::SpatialMajor,
            Layout::ChannelMajor,
        )));
    } else {
        let engine = StandardConv::new(
            format!("{name}.conv"),
            input,
            conv.output_channels(),
            geometry,
            weights.kernel.clone(),
            ctx.weight_format,
            ctx.fx.clone(),
            ctx.compute_units,
        )?;
        output = engine.output().shape;
        stages.push(Box::new(engine));
        stages.push(Box::new(AffineNorm::new(
            format!("{name}.norm"),
            Port::channel_major(output),
            weights.norm.clone(),
            ctx.weight_format,
            ctx.fx.clone(),
        )?));
        stages.push(Box::new(ActivationStage::new(
            format!("{name}.act"),
            Port::channel_major(output),
            conv.activation(),
            ctx.fx.clone(),
        )));
    }
    Ok((stages, output))
}

/// MobileNetV3 inverted-residual block over channel-major frames.
#[derive(Debug)]
pub struct InvertedResidual {
    name: String,
    input: FrameShape,
    output: FrameShape,
    inner: Pipeline,
    residual: Option<VecDeque<Sample>>,
    fx: FixedPoint,
}

impl InvertedResidual {
    /// Assemble the block for `input` frames.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `input` does not match `config`, and
    /// a weight error if `weights` does not match the layer shapes.
    pub fn new(
        name: impl Into<String>,
        config: &LayerConfig,
        input: FrameShape,
        weights: &BlockWeights,
        ctx: &BuildContext,
    ) -> Result<Self> {
        let name = name.into();
        let output = config.output_shape(input)?;
        let expanded = FrameShape::new(config.expanded_channels(), input.height, input.width);
        let filtered = FrameShape::new(config.expanded_channels(), output.height, output.width);
        let act = config.activation();
        let fx = &ctx.fx;
        let wf = ctx.weight_format;
        let units = ctx.compute_units;

        let mut stages: Vec<Box<dyn Stage>> = vec![
            Box::new(Reorder::new(
                format!("{name}.expand.to_spatial"),
                input,
                Layout::ChannelMajor,
                Layout::SpatialMajor,
            )),
            Box::new(PointwiseConv::new(
                format!("{name}.expand"),
                input,
                expanded.channels,
                weights.expand.kernel.clone(),
                wf,
                fx.clone(),
                units,
            )?),
            Box::new(AffineNorm::new(
                format!("{name}.expand.norm"),
                Port::spatial_major(expanded),
                weights.expand.norm.clone(),
                wf,
                fx.clone(),
            )?),
            Box::new(ActivationStage::new(
                format!("{name}.expand.act"),
                Port::spatial_major(expanded),
                act,
                fx.clone(),
            )),
            Box::new(Reorder::new(
                format!("{name}.expand.to_channel"),
                expanded,
                Layout::SpatialMajor,
                Layout::ChannelMajor,
            )),
            Box::new(DepthwiseConv::new(
                format!("{name}.depthwise"),
                expanded,
                config.geometry(),
                weights.depthwise.kernel.clone(),
                wf,
                fx.clone(),
                units,
            )?),
            Box::new(AffineNorm::new(
                format!("{name}.depthwise.norm"),
                Port::channel_major(filtered),
                weights.depthwise.norm.clone(),
                wf,
                fx.clone(),
            )?),
            Box::new(ActivationStage::new(
                format!("{name}.depthwise.act"),
                Port::channel_major(filtered),
                act,
                fx.clone(),
            )),
        ];

        match (&weights.se, config.use_se()) {
            (Some(se), true) => stages.push(Box::new(SqueezeExcite::new(
                format!("{name}.se"),
                filtered,
                se,
                ctx.se_gate,
                wf,
                fx.clone(),
                units,
            )?)),
            (None, false) => {}
            _ => {
                return Err(PipelineError::weights(format!(
                    "{name}: attention weights do not match the layer configuration"
                )))
            }
        }

        stages.push(Box::new(Reorder::new(
            format!("{name}.project.to_spatial"),
            filtered,
            Layout::ChannelMajor,
            Layout::SpatialMajor,
        )));
        stages.push(Box::new(PointwiseConv::new(
            format!("{name}.project"),
            filtered,
            output.channels,
            weights.project.kernel.clone(),
            wf,
            fx.clone(),
            units,
        )?));
        stages.push(Box::new(AffineNorm::new(
            format!("{name}.project.norm"),
            Port::spatial_major(output),
            weights.project.norm.clone(),
            wf,
            fx.clone(),
        )?));
        stages.push(Box::new(Reorder::new(
            format!("{name}.project.to_channel"),
            output,
            Layout::SpatialMajor,
            Layout::ChannelMajor,
        )));

        let inner = Pipeline::new(stages, ctx.link_capacity)?;
        let residual = config
            .has_residual()
            .then(|| VecDeque::with_capacity(input.volume()));
        Ok(Self {
            name,
            input,
            output,
            inner,
            residual,
            fx: ctx.fx.clone(),
        })
    }

    /// True if the block adds its input to its output.
    pub fn has_residual(&self) -> bool {
        self.residual.is_some()
    }

    /// Names of the inner stages, head first.
    pub fn stage_names(&self) -> Vec<String> {
        self.inner.stage_names()
    }

    fn pump(&mut self, out: &mut Outbox) -> Result<bool> {
        let mut progress = self.inner.step()?;
        while let Some(token) = self.inner.try_drain() {
            progress = true;
            let sample = match self.residual.as_mut() {
                Some(fifo) => {
                    let skip = fifo.pop_front().ok_or_else(|| {
                        PipelineError::invalid_state(format!(
                            "{}: branch output without a buffered input",
                            self.name
                        ))
                    })?;
                    self.fx.add(skip, token.sample)
                }
                None => token.sample,
            };
            out.emit(sample);
        }
        Ok(progress)
    }
}

impl Stage for InvertedResidual {
    fn name(&self) -> &str {
        &self.name
    }

    fn input(&self) -> Port {
        Port::channel_major(self.input)
    }

    fn output(&self) -> Port {
        Port::channel_major(self.output)
    }

    fn accept(&mut self, token: Token, _at: Position, out: &mut Outbox) -> Result<()> {
        if let Some(fifo) = self.residual.as_mut() {
            if fifo.len() >= self.input.volume() {
                return Err(PipelineError::resource_exhaustion(
                    format!("{} residual", self.name),
                    self.input.volume(),
                ));
            }
            fifo.push_back(token.sample);
        }

        let mut pending = token;
        loop {
            match self.inner.try_feed(pending) {
                Ok(()) => break,
                Err(PushError::Full(rejected)) => {
                    pending = rejected;
                    if !self.pump(out)? {
                        return Err(PipelineError::invalid_state(format!(
                            "{}: inner pipeline stalled",
                            self.name
                        )));
                    }
                }
                Err(PushError::Closed(_)) => {
                    return Err(PipelineError::invalid_state(format!(
                        "{}: inner pipeline closed",
                        self.name
                    )))
                }
            }
        }
        while self.pump(out)? {}
        Ok(())
    }

    fn reset(&mut self) {
        self.inner.reset();
        if let Some(fifo) = self.residual.as_mut() {
            fifo.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::frame::FeatureMap;
    use crate::weights::{ModelWeights, WeightSet};

    fn context() -> BuildContext {
        BuildContext::new(&ModelConfig::tiny(10), SaturationCounter::new())
    }

    fn block_weights(config: &ModelConfig, index: usize) -> BlockWeights {
        let weights = ModelWeights::random(config, 11);
        match &weights.layers()[index + 1] {
            WeightSet::Block(b) => b.clone(),
            other => panic!("expected block weights, found {}", other.kind()),
        }
    }

    #[test]
    fn residual_follows_shape_rule() {
        let config = ModelConfig::tiny(10);
        let ctx = context();
        let first = InvertedResidual::new(
            "b0",
            &config.blocks()[0],
            FrameShape::new(8, 8, 8),
            &block_weights(&config, 0),
            &ctx,
        )
        .unwrap();
        assert!(first.has_residual());
        assert!(first.stage_names().iter().any(|n| n == "b0.se"));

        let second = InvertedResidual::new(
            "b1",
            &config.blocks()[1],
            FrameShape::new(8, 8, 8),
            &block_weights(&config, 1),
            &ctx,
        )
        .unwrap();
        assert!(!second.has_residual());
        assert_eq!(second.output().shape, FrameShape::new(12, 4, 4));
    }

    #[test]
    fn wrong_input_channels_fail_at_assembly() {
        let config = ModelConfig::tiny(10);
        let err = InvertedResidual::new(
            "b0",
            &config.blocks()[0],
            FrameShape::new(7, 8, 8),
            &block_weights(&config, 0),
            &context(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration { .. }));
    }

    #[test]
    fn block_runs_repeated_frames_identically() {
        let config = ModelConfig::tiny(10);
        let block = InvertedResidual::new(
            "b0",
            &config.blocks()[0],
            FrameShape::new(8, 8, 8),
            &block_weights(&config, 0),
            &context(),
        )
        .unwrap();
        let mut pipe = Pipeline::new(vec![Box::new(block)], 3).unwrap();
        let data = (0..512)
            .map(|i| Sample::from_raw((i * 13 % 97) - 48))
            .collect();
        let input = FeatureMap::from_samples(FrameShape::new(8, 8, 8), data).unwrap();
        let first = pipe.run_frame(&input).unwrap();
        let second = pipe.run_frame(&input).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn pointwise_head_stages_are_channel_major_at_both_ends() {
        let config = ModelConfig::tiny(10);
        let weights = ModelWeights::random(&config, 2);
        let WeightSet::Head(head) = &weights.layers()[3] else {
            panic!("layer 3 is the head");
        };
        let (stages, output) =
            conv_stages("head", config.head(), FrameShape::new(12, 4, 4), head, &context()).unwrap();
        assert_eq!(output, FrameShape::new(32, 4, 4));
        assert_eq!(stages[0].input().layout, Layout::ChannelMajor);
        assert_eq!(stages[stages.len() - 1].output().layout, Layout::ChannelMajor);
    }
}
