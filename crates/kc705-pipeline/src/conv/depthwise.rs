//! Per-channel spatial convolution.

use super::{expect_len, ConvGeometry, MacArray};
use crate::error::Result;
use crate::fixed::{FixedPoint, QFormat};
use crate::frame::{FrameShape, Port, Position, Token};
use crate::stream::{Outbox, Stage};
use crate::window::SlidingWindow;
use std::sync::Arc;

/// Depthwise `K×K` convolution over a channel-major stream.
///
/// Each channel owns a [`SlidingWindow`] of `K` rows. After every input
/// sample the engine emits, in raster order, each output position whose
/// receptive field (clipped to the plane) is now complete. Positions outside
/// the plane contribute zero.
#[derive(Debug)]
pub struct DepthwiseConv {
    name: String,
    input: FrameShape,
    output: FrameShape,
    geometry: ConvGeometry,
    /// `[channel][ky][kx]`, weight format.
    weights: Arc<[i32]>,
    weight_frac: u32,
    fx: FixedPoint,
    mac: MacArray,
    windows: Vec<SlidingWindow>,
    next_output: usize,
    taps: Vec<(i64, i64)>,
}

impl DepthwiseConv {
    /// Build the engine for an `input` frame.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an impossible geometry and a weight
    /// error if `weights` is not `channels × K × K` long.
    pub fn new(
        name: impl Into<String>,
        input: FrameShape,
        geometry: ConvGeometry,
        weights: Arc<[i32]>,
        weight_format: QFormat,
        fx: FixedPoint,
        units: usize,
    ) -> Result<Self> {
        let name = name.into();
        let output = FrameShape::new(
            input.channels,
            geometry.output_extent(input.height)?,
            geometry.output_extent(input.width)?,
        );
        let k = geometry.kernel;
        expect_len(&name, "depthwise kernel", weights.len(), input.channels * k * k)?;
        let windows = (0..input.channels)
            .map(|_| SlidingWindow::new(k, input.height, input.width))
            .collect();
        Ok(Self {
            name,
            input,
            output,
            geometry,
            weights,
            weight_frac: u32::from(weight_format.frac_bits()),
            fx,
            mac: MacArray::new(units),
            windows,
            next_output: 0,
            taps: Vec::with_capacity(k * k),
        })
    }

    fn trigger(&self, output: usize) -> usize {
        let oy = output / self.output.width;
        let ox = output % self.output.width;
        self.geometry.last_input(oy, self.input.height) * self.input.width
            + self.geometry.last_input(ox, self.input.width)
    }

    fn compute(&mut self, channel: usize, output: usize) -> Result<i64> {
        let oy = output / self.output.width;
        let ox = output % self.output.width;
        let k = self.geometry.kernel;
        let kernel = &self.weights[channel * k * k..(channel + 1) * k * k];
        let window = &self.windows[channel];
        self.taps.clear();
        for ky in 0..k {
            let row = self.geometry.input_coord(oy, ky);
            for kx in 0..k {
                let col = self.geometry.input_coord(ox, kx);
                let x = window.get(row, col)?;
                self.taps.push((x.wide(), i64::from(kernel[ky * k + kx])));
            }
        }
        Ok(self.mac.dot(self.taps.iter().copied()))
    }
}

impl Stage for DepthwiseConv {
    fn name(&self) -> &str {
        &self.name
    }

    fn input(&self) -> Port {
        Port::channel_major(self.input)
    }

    fn output(&self) -> Port {
        Port::channel_major(self.output)
    }

    fn accept(&mut self, token: Token, at: Position, out: &mut Outbox) -> Result<()> {
        let channel = at.channel;
        self.windows[channel].push(token.sample)?;

        let current = at.row * self.input.width + at.col;
        while self.next_output < self.output.spatial() && self.trigger(self.next_output) <= current {
            let acc = self.compute(channel, self.next_output)?;
            out.emit(self.fx.narrow(acc, self.weight_frac));
            self.next_output += 1;
        }

        if current + 1 == self.input.spatial() {
            self.windows[channel].reset();
            self.next_output = 0;
        }
        Ok(())
    }

    fn reset(&mut self) {
        for window in &mut self.windows {
            window.reset();
        }
        self.next_output = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FeatureMap, Layout};
    use crate::fixed::Sample;
    use crate::stream::Pipeline;

    fn run(conv: DepthwiseConv, input: &FeatureMap) -> FeatureMap {
        let mut pipe = Pipeline::new(vec![Box::new(conv)], 2).unwrap();
        pipe.run_frame(input).unwrap()
    }

    fn ramp(shape: FrameShape) -> FeatureMap {
        let data = (0..shape.volume())
            .map(|i| Sample::from_raw(i32::try_from(i * 7 % 101).unwrap() - 50))
            .collect();
        FeatureMap::from_samples(shape, data).unwrap()
    }

    /// Direct evaluation with zero padding.
    fn reference(input: &FeatureMap, g: ConvGeometry, weights: &[i32], frac: u32) -> Vec<i64> {
        let shape = input.shape();
        let oh = g.output_extent(shape.height).unwrap();
        let ow = g.output_extent(shape.width).unwrap();
        let k = g.kernel;
        let mut out = Vec::new();
        for c in 0..shape.channels {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = 0i64;
                    for ky in 0..k {
                        for kx in 0..k {
                            let (r, col) = (g.input_coord(oy, ky), g.input_coord(ox, kx));
                            let inside = r >= 0
                                && col >= 0
                                && (r as usize) < shape.height
                                && (col as usize) < shape.width;
                            if inside {
                                let x = input.get(c, r as usize, col as usize).wide();
                                acc += x * i64::from(weights[c * k * k + ky * k + kx]);
                            }
                        }
                    }
                    out.push(acc >> frac);
                }
            }
        }
        out
    }

    #[test]
    fn identity_kernel_reproduces_input() {
        let shape = FrameShape::new(3, 5, 6);
        let one = QFormat::Q2_6.one();
        let mut weights = vec![0; 3 * 9];
        for c in 0..3 {
            weights[c * 9 + 4] = one;
        }
        let conv = DepthwiseConv::new(
            "dw",
            shape,
            ConvGeometry::same(3, 1),
            weights.into(),
            QFormat::Q2_6,
            FixedPoint::new(QFormat::Q8_8),
            4,
        )
        .unwrap();
        let input = ramp(shape);
        assert_eq!(run(conv, &input), input);
    }

    #[test]
    fn strided_padded_matches_direct_evaluation() {
        for (k, stride, h, w) in [(3, 2, 7, 6), (5, 2, 9, 9), (5, 1, 6, 5), (3, 1, 1, 4)] {
            let shape = FrameShape::new(2, h, w);
            let g = ConvGeometry::same(k, stride);
            let weights: Vec<i32> = (0..2 * k * k)
                .map(|i| i32::try_from(i % 9).unwrap() - 4)
                .collect();
            let conv = DepthwiseConv::new(
                "dw",
                shape,
                g,
                weights.clone().into(),
                QFormat::Q2_6,
                FixedPoint::new(QFormat::Q8_8),
                3,
            )
            .unwrap();
            let input = ramp(shape);
            let got = run(conv, &input);
            let expected = reference(&input, g, &weights, 6);
            let got: Vec<i64> = got.tokens(Layout::ChannelMajor).map(|t| t.sample.wide()).collect();
            assert_eq!(got, expected, "k={k} s={stride} {h}x{w}");
        }
    }

    #[test]
    fn wrong_weight_count_is_rejected() {
        let err = DepthwiseConv::new(
            "dw",
            FrameShape::new(2, 4, 4),
            ConvGeometry::same(3, 1),
            vec![0; 9].into(),
            QFormat::Q2_6,
            FixedPoint::new(QFormat::Q8_8),
            1,
        )
        .unwrap_err();
        assert!(matches!(err, crate::error::PipelineError::Weights { .. }));
    }
}
