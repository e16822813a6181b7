//! Squeeze-and-excitation channel attention.
//!
//! ```text
//!            ┌──────────── replay buffer (C·H·W) ─────────────┐
//!  x ──▶ ────┤                                                ├──▶ x · s[c]
//!            └─▶ mean per channel ─▶ FC + ReLU ─▶ FC + gate ──┘
//! ```
//!
//! The stage is a frame barrier: nothing is emitted until the final sample
//! of the frame has been pooled, because every gate depends on the whole
//! spatial extent.

use crate::activation::{relu, Activation};
use crate::error::{PipelineError, Result};
use crate::fixed::{FixedPoint, QFormat, Sample};
use crate::frame::{FrameShape, Port, Position, Token};
use crate::linear::Linear;
use crate::pool::floor_mean;
use crate::stream::{Outbox, Stage};
use crate::weights::SeWeights;
use std::sync::Arc;

/// Squeeze-and-excitation over channel-major frames.
#[derive(Debug)]
pub struct SqueezeExcite {
    name: String,
    shape: FrameShape,
    reduce: Linear,
    expand: Linear,
    gate: Activation,
    fx: FixedPoint,
    replay: Vec<Sample>,
    sums: Vec<i64>,
    pooled: Vec<Sample>,
    hidden: Vec<Sample>,
    scale: Vec<Sample>,
}

impl SqueezeExcite {
    /// Build the stage for `shape` frames.
    ///
    /// # Errors
    ///
    /// Returns a weight error if the two layers do not map
    /// `channels → hidden → channels`.
    pub fn new(
        name: impl Into<String>,
        shape: FrameShape,
        params: &SeWeights,
        gate: Activation,
        weight_format: QFormat,
        fx: FixedPoint,
        units: usize,
    ) -> Result<Self> {
        let name = name.into();
        let channels = shape.channels;
        let hidden = params.reduce.outputs();
        let reduce = Linear::new(&name, channels, Arc::clone(&params.reduce), weight_format, units)?;
        let expand = Linear::new(&name, hidden, Arc::clone(&params.expand), weight_format, units)?;
        if expand.outputs() != channels {
            return Err(PipelineError::weights(format!(
                "{name}: expansion produces {} gates for {channels} channels",
                expand.outputs()
            )));
        }
        Ok(Self {
            name,
            shape,
            reduce,
            expand,
            gate,
            fx,
            replay: Vec::with_capacity(shape.volume()),
            sums: vec![0; channels],
            pooled: Vec::with_capacity(channels),
            hidden: Vec::with_capacity(hidden),
            scale: Vec::with_capacity(channels),
        })
    }

    /// Replay buffer capacity in samples.
    pub fn capacity(&self) -> usize {
        self.shape.volume()
    }

    fn excite(&mut self) {
        self.pooled.clear();
        for &sum in &self.sums {
            self.pooled.push(self.fx.saturate(floor_mean(sum, self.shape.spatial())));
        }

        self.hidden.clear();
        self.reduce.forward(&self.fx, &self.pooled, &mut self.hidden);
        for h in &mut self.hidden {
            *h = relu(*h);
        }

        self.scale.clear();
        self.expand.forward(&self.fx, &self.hidden, &mut self.scale);
        for s in &mut self.scale {
            *s = self.gate.apply(&self.fx, *s);
        }
    }
}

impl Stage for SqueezeExcite {
    fn name(&self) -> &str {
        &self.name
    }

    fn input(&self) -> Port {
        Port::channel_major(self.shape)
    }

    fn output(&self) -> Port {
        Port::channel_major(self.shape)
    }

    fn accept(&mut self, token: Token, at: Position, out: &mut Outbox) -> Result<()> {
        if self.replay.len() >= self.capacity() {
            return Err(PipelineError::resource_exhaustion(&self.name, self.capacity()));
        }
        self.replay.push(token.sample);
        let sum = &mut self.sums[at.channel];
        *sum = sum.saturating_add(token.sample.wide());

        if token.last {
            self.excite();
            let spatial = self.shape.spatial();
            for (i, &x) in self.replay.iter().enumerate() {
                out.emit(self.fx.mul(x, self.scale[i / spatial]));
            }
            self.replay.clear();
            self.sums.fill(0);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.replay.clear();
        self.sums.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FeatureMap, Layout};
    use crate::stream::{Channel, Pipeline, StageRunner};
    use crate::weights::LinearWeights;

    fn params(channels: usize, hidden: usize, gate_bias: i32) -> SeWeights {
        SeWeights {
            reduce: Arc::new(LinearWeights {
                weights: vec![16; hidden * channels],
                bias: vec![0; hidden],
            }),
            expand: Arc::new(LinearWeights {
                weights: vec![0; channels * hidden],
                bias: vec![gate_bias; channels],
            }),
        }
    }

    fn ramp(shape: FrameShape) -> FeatureMap {
        let data = (0..shape.volume())
            .map(|i| Sample::from_raw(i32::try_from(i).unwrap() * 37 - 300))
            .collect();
        FeatureMap::from_samples(shape, data).unwrap()
    }

    #[test]
    fn unit_gates_reproduce_input() {
        let fx = FixedPoint::new(QFormat::Q8_8);
        let shape = FrameShape::new(4, 3, 3);
        // hard_sigmoid(4.0) saturates at 1.0 on every channel.
        let gate_bias = fx.encode(4.0).raw();
        let se = SqueezeExcite::new(
            "se",
            shape,
            &params(4, 2, gate_bias),
            Activation::HardSigmoid,
            QFormat::Q2_6,
            fx,
            2,
        )
        .unwrap();
        let mut pipe = Pipeline::new(vec![Box::new(se)], 3).unwrap();
        let input = ramp(shape);
        assert_eq!(pipe.run_frame(&input).unwrap(), input);
    }

    #[test]
    fn zero_gates_silence_the_frame() {
        let fx = FixedPoint::new(QFormat::Q8_8);
        let shape = FrameShape::new(2, 2, 2);
        let gate_bias = fx.encode(-4.0).raw();
        let se = SqueezeExcite::new(
            "se",
            shape,
            &params(2, 1, gate_bias),
            Activation::HardSigmoid,
            QFormat::Q2_6,
            fx,
            1,
        )
        .unwrap();
        let mut pipe = Pipeline::new(vec![Box::new(se)], 3).unwrap();
        let out = pipe.run_frame(&ramp(shape)).unwrap();
        assert!(out.samples().iter().all(|s| *s == Sample::ZERO));
    }

    #[test]
    fn emits_nothing_before_frame_end() {
        let fx = FixedPoint::new(QFormat::Q8_8);
        let shape = FrameShape::new(2, 2, 2);
        let se = SqueezeExcite::new(
            "se",
            shape,
            &params(2, 1, 0),
            Activation::Sigmoid,
            QFormat::Q2_6,
            fx,
            1,
        )
        .unwrap();
        let mut runner = StageRunner::new(Box::new(se));
        let mut input = Channel::new(16);
        let mut output = Channel::new(16);
        for token in ramp(shape).tokens(Layout::ChannelMajor) {
            let last = token.last;
            input.try_push(token).unwrap();
            runner.step(&mut input, &mut output).unwrap();
            assert_eq!(output.is_empty(), !last);
        }
        assert_eq!(output.len(), shape.volume());
    }

    #[test]
    fn oversized_frame_fails_fast() {
        let fx = FixedPoint::new(QFormat::Q8_8);
        let shape = FrameShape::new(1, 2, 2);
        let mut se = SqueezeExcite::new(
            "se",
            shape,
            &params(1, 1, 0),
            Activation::HardSigmoid,
            QFormat::Q2_6,
            fx,
            1,
        )
        .unwrap();
        // Five unmarked samples into a four-sample replay buffer.
        let mut out = Outbox::new(shape.volume());
        let at = Position {
            channel: 0,
            row: 0,
            col: 0,
        };
        for _ in 0..4 {
            se.accept(Token::body(Sample::ZERO), at, &mut out).unwrap();
        }
        let err = se.accept(Token::body(Sample::ZERO), at, &mut out).unwrap_err();
        assert!(matches!(err, PipelineError::ResourceExhaustion { capacity: 4, .. }));
        assert_eq!(out.produced(), 0);
    }

    #[test]
    fn oversized_frame_in_pipeline_is_resource_exhaustion() {
        let fx = FixedPoint::new(QFormat::Q8_8);
        let shape = FrameShape::new(1, 2, 2);
        let se = SqueezeExcite::new(
            "se",
            shape,
            &params(1, 1, 0),
            Activation::HardSigmoid,
            QFormat::Q2_6,
            fx,
            1,
        )
        .unwrap();
        let mut pipe = Pipeline::new(vec![Box::new(se)], 8).unwrap();
        for _ in 0..5 {
            pipe.try_feed(Token::body(Sample::ZERO)).unwrap();
        }
        let err = loop {
            if let Err(e) = pipe.step() {
                break e;
            }
        };
        assert_eq!(err, PipelineError::resource_exhaustion("se", 4));
        assert!(pipe.try_drain().is_none());
    }
}
