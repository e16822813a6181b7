//! Channel-mixing convolutions.

use super::{expect_len, ConvGeometry, MacArray};
use crate::error::{PipelineError, Result};
use crate::fixed::{FixedPoint, QFormat, Sample};
use crate::frame::{FrameShape, Port, Position, Token};
use crate::stream::{Outbox, Stage};
use std::sync::Arc;

/// 1×1 convolution over a spatial-major stream.
///
/// Gathers the `C_in` samples of one position, then emits all `C_out`
/// outputs for that position: `out[oc] = Σ_ic in[ic] · w[oc][ic]`.
#[derive(Debug)]
pub struct PointwiseConv {
    name: String,
    input: FrameShape,
    out_channels: usize,
    /// `[out_channel][in_channel]`, weight format.
    weights: Arc<[i32]>,
    weight_frac: u32,
    fx: FixedPoint,
    mac: MacArray,
    gathered: Vec<Sample>,
}

impl PointwiseConv {
    /// Build a `C_in → out_channels` mixer for `input` frames.
    ///
    /// # Errors
    ///
    /// Returns a weight error if `weights` is not `out_channels × C_in` long.
    pub fn new(
        name: impl Into<String>,
        input: FrameShape,
        out_channels: usize,
        weights: Arc<[i32]>,
        weight_format: QFormat,
        fx: FixedPoint,
        units: usize,
    ) -> Result<Self> {
        let name = name.into();
        expect_len(&name, "pointwise kernel", weights.len(), out_channels * input.channels)?;
        Ok(Self {
            name,
            input,
            out_channels,
            weights,
            weight_frac: u32::from(weight_format.frac_bits()),
            fx,
            mac: MacArray::new(units),
            gathered: Vec::with_capacity(input.channels),
        })
    }
}

impl Stage for PointwiseConv {
    fn name(&self) -> &str {
        &self.name
    }

    fn input(&self) -> Port {
        Port::spatial_major(self.input)
    }

    fn output(&self) -> Port {
        Port::spatial_major(FrameShape::new(
            self.out_channels,
            self.input.height,
            self.input.width,
        ))
    }

    fn accept(&mut self, token: Token, at: Position, out: &mut Outbox) -> Result<()> {
        if at.channel != self.gathered.len() {
            return Err(PipelineError::frame_marker(
                &self.name,
                format!("channel {} arrived after {} gathered", at.channel, self.gathered.len()),
            ));
        }
        self.gathered.push(token.sample);
        if self.gathered.len() < self.input.channels {
            return Ok(());
        }

        let c_in = self.input.channels;
        for oc in 0..self.out_channels {
            let row = &self.weights[oc * c_in..(oc + 1) * c_in];
            let acc = self
                .mac
                .dot(self.gathered.iter().zip(row).map(|(x, &w)| (x.wide(), i64::from(w))));
            out.emit(self.fx.narrow(acc, self.weight_frac));
        }
        self.gathered.clear();
        Ok(())
    }

    fn reset(&mut self) {
        self.gathered.clear();
    }
}

/// Dense `K×K` convolution over every input channel.
///
/// Buffers one whole channel-major frame (the channel reduction needs every
/// input plane), then emits the output frame channel-major.
#[derive(Debug)]
pub struct StandardConv {
    name: String,
    input: FrameShape,
    output: FrameShape,
    geometry: ConvGeometry,
    /// `[out_channel][in_channel][ky][kx]`, weight format.
    weights: Arc<[i32]>,
    weight_frac: u32,
    fx: FixedPoint,
    mac: MacArray,
    frame: Vec<Sample>,
    taps: Vec<(i64, i64)>,
}

impl StandardConv {
    /// Build a `C_in → out_channels` convolution for `input` frames.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an impossible geometry and a weight
    /// error if `weights` is not `out_channels × C_in × K × K` long.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        input: FrameShape,
        out_channels: usize,
        geometry: ConvGeometry,
        weights: Arc<[i32]>,
        weight_format: QFormat,
        fx: FixedPoint,
        units: usize,
    ) -> Result<Self> {
        let name = name.into();
        let output = FrameShape::new(
            out_channels,
            geometry.output_extent(input.height)?,
            geometry.output_extent(input.width)?,
        );
        let k = geometry.kernel;
        expect_len(&name, "kernel", weights.len(), out_channels * input.channels * k * k)?;
        Ok(Self {
            name,
            input,
            output,
            geometry,
            weights,
            weight_frac: u32::from(weight_format.frac_bits()),
            fx,
            mac: MacArray::new(units),
            frame: Vec::with_capacity(input.volume()),
            taps: Vec::with_capacity(input.channels * k * k),
        })
    }

    fn tap(&self, channel: usize, row: isize, col: isize) -> i64 {
        match (usize::try_from(row), usize::try_from(col)) {
            (Ok(r), Ok(c)) if r < self.input.height && c < self.input.width => {
                self.frame[channel * self.input.spatial() + r * self.input.width + c].wide()
            }
            _ => 0,
        }
    }

    fn emit_frame(&mut self, out: &mut Outbox) {
        let k = self.geometry.kernel;
        let c_in = self.input.channels;
        for oc in 0..self.output.channels {
            for oy in 0..self.output.height {
                for ox in 0..self.output.width {
                    self.taps.clear();
                    for ic in 0..c_in {
                        for ky in 0..k {
                            let row = self.geometry.input_coord(oy, ky);
                            for kx in 0..k {
                                let col = self.geometry.input_coord(ox, kx);
                                let w = self.weights[((oc * c_in + ic) * k + ky) * k + kx];
                                let x = self.tap(ic, row, col);
                                self.taps.push((x, i64::from(w)));
                            }
                        }
                    }
                    let acc = self.mac.dot(self.taps.iter().copied());
                    out.emit(self.fx.narrow(acc, self.weight_frac));
                }
            }
        }
    }
}

impl Stage for StandardConv {
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
        if self.frame.len() >= self.input.volume() {
            return Err(PipelineError::resource_exhaustion(&self.name, self.input.volume()));
        }
        self.frame.push(token.sample);
        if token.last {
            self.emit_frame(out);
            self.frame.clear();
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.frame.clear();
    }
}
