//! Feature maps, iteration orders and the tokens that carry them.

use crate::error::{PipelineError, Result};
use crate::fixed::{FixedPoint, Sample};

/// Dimensions of a feature map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameShape {
    /// Channel count.
    pub channels: usize,
    /// Rows.
    pub height: usize,
    /// Columns.
    pub width: usize,
}

impl FrameShape {
    /// Create a shape.
    pub const fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    /// A `channels × 1 × 1` vector shape.
    pub const fn vector(channels: usize) -> Self {
        Self::new(channels, 1, 1)
    }

    /// Samples per frame.
    pub const fn volume(&self) -> usize {
        self.channels * self.height * self.width
    }

    /// Positions per channel.
    pub const fn spatial(&self) -> usize {
        self.height * self.width
    }
}

impl std::fmt::Display for FrameShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}×{}×{}", self.channels, self.height, self.width)
    }
}

/// A sample coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    /// Channel index.
    pub channel: usize,
    /// Row index.
    pub row: usize,
    /// Column index.
    pub col: usize,
}

/// Order in which a frame's samples travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layout {
    /// Every position of channel 0 in row-major order, then channel 1, ...
    ChannelMajor,
    /// Every channel of position (0, 0), then position (0, 1), ...
    SpatialMajor,
}

impl Layout {
    /// Coordinate of the `index`-th sample of a frame.
    pub const fn position(self, shape: FrameShape, index: usize) -> Position {
        match self {
            Self::ChannelMajor => {
                let spatial = index % shape.spatial();
                Position {
                    channel: index / shape.spatial(),
                    row: spatial / shape.width,
                    col: spatial % shape.width,
                }
            }
            Self::SpatialMajor => {
                let spatial = index / shape.channels;
                Position {
                    channel: index % shape.channels,
                    row: spatial / shape.width,
                    col: spatial % shape.width,
                }
            }
        }
    }

    /// Stream index of a coordinate.
    pub const fn index(self, shape: FrameShape, at: Position) -> usize {
        let spatial = at.row * shape.width + at.col;
        match self {
            Self::ChannelMajor => at.channel * shape.spatial() + spatial,
            Self::SpatialMajor => spatial * shape.channels + at.channel,
        }
    }
}

/// Shape and order of the stream entering or leaving a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Port {
    /// Frame dimensions.
    pub shape: FrameShape,
    /// Sample order.
    pub layout: Layout,
}

impl Port {
    /// A channel-major port.
    pub const fn channel_major(shape: FrameShape) -> Self {
        Self {
            shape,
            layout: Layout::ChannelMajor,
        }
    }

    /// A spatial-major port.
    pub const fn spatial_major(shape: FrameShape) -> Self {
        Self {
            shape,
            layout: Layout::SpatialMajor,
        }
    }

    /// True if a stream leaving `upstream` can enter this port unchanged.
    ///
    /// Layouts only matter when both the channel and the spatial extent
    /// exceed one; otherwise both orders coincide.
    pub fn accepts(&self, upstream: &Self) -> bool {
        self.shape == upstream.shape
            && (self.layout == upstream.layout
                || self.shape.channels == 1
                || self.shape.spatial() == 1)
    }
}

/// One sample in flight, tagged with the end-of-frame marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    /// The value.
    pub sample: Sample,
    /// Set on the final sample of a frame only.
    pub last: bool,
}

impl Token {
    /// A sample that does not end the frame.
    pub const fn body(sample: Sample) -> Self {
        Self {
            sample,
            last: false,
        }
    }

    /// The final sample of a frame.
    pub const fn last(sample: Sample) -> Self {
        Self { sample, last: true }
    }
}

/// A dense `channels × height × width` tensor, stored channel-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureMap {
    shape: FrameShape,
    data: Vec<Sample>,
}

impl FeatureMap {
    /// A zero-filled map.
    pub fn zeros(shape: FrameShape) -> Self {
        Self::filled(shape, Sample::ZERO)
    }

    /// A map with every sample equal to `value`.
    pub fn filled(shape: FrameShape, value: Sample) -> Self {
        Self {
            shape,
            data: vec![value; shape.volume()],
        }
    }

    /// Wrap channel-major samples.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `data` does not match `shape`.
    pub fn from_samples(shape: FrameShape, data: Vec<Sample>) -> Result<Self> {
        if data.len() != shape.volume() {
            return Err(PipelineError::configuration(format!(
                "{} samples supplied for a {shape} feature map",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Reassemble a frame from a token stream in `layout` order.
    ///
    /// # Errors
    ///
    /// Returns a frame marker error unless exactly `shape.volume()` tokens
    /// arrive and only the final one carries the marker.
    pub fn from_tokens(
        shape: FrameShape,
        layout: Layout,
        tokens: impl IntoIterator<Item = Token>,
    ) -> Result<Self> {
        let volume = shape.volume();
        let mut data = vec![Sample::ZERO; volume];
        let mut count = 0usize;
        for token in tokens {
            if count >= volume {
                return Err(PipelineError::frame_marker(
                    "feature map",
                    format!("more than {volume} samples in frame"),
                ));
            }
            if token.last != (count + 1 == volume) {
                return Err(PipelineError::frame_marker(
                    "feature map",
                    format!("marker on sample {count} of {volume}"),
                ));
            }
            data[Layout::ChannelMajor.index(shape, layout.position(shape, count))] = token.sample;
            count += 1;
        }
        if count != volume {
            return Err(PipelineError::frame_marker(
                "feature map",
                format!("frame ended after {count} of {volume} samples"),
            ));
        }
        Ok(Self { shape, data })
    }

    /// Convert an interleaved `height × width × channels` byte image.
    ///
    /// Bytes are read as unsigned values with eight fractional bits, so
    /// `255` maps to `255/256` in the target format.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `pixels` does not match `shape`.
    pub fn from_interleaved_u8(fx: &FixedPoint, shape: FrameShape, pixels: &[u8]) -> Result<Self> {
        if pixels.len() != shape.volume() {
            return Err(PipelineError::configuration(format!(
                "{} bytes supplied for a {shape} image",
                pixels.len()
            )));
        }
        let mut data = vec![Sample::ZERO; shape.volume()];
        for (i, &byte) in pixels.iter().enumerate() {
            let channel = i % shape.channels;
            let spatial = i / shape.channels;
            data[channel * shape.spatial() + spatial] = fx.rescale(i64::from(byte), 8);
        }
        Ok(Self { shape, data })
    }

    /// Dimensions.
    pub const fn shape(&self) -> FrameShape {
        self.shape
    }

    /// Sample at a coordinate.
    pub fn get(&self, channel: usize, row: usize, col: usize) -> Sample {
        self.data[channel * self.shape.spatial() + row * self.shape.width + col]
    }

    /// Overwrite the sample at a coordinate.
    pub fn set(&mut self, channel: usize, row: usize, col: usize, value: Sample) {
        let index = channel * self.shape.spatial() + row * self.shape.width + col;
        self.data[index] = value;
    }

    /// Channel-major samples.
    pub fn samples(&self) -> &[Sample] {
        &self.data
    }

    /// The frame as a token stream in `layout` order.
    pub fn tokens(&self, layout: Layout) -> impl Iterator<Item = Token> + '_ {
        let volume = self.shape.volume();
        (0..volume).map(move |i| {
            let at = layout.position(self.shape, i);
            let sample = self.data[Layout::ChannelMajor.index(self.shape, at)];
            Token {
                sample,
                last: i + 1 == volume,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::QFormat;

    #[test]
    fn layouts_are_inverse_permutations() {
        let shape = FrameShape::new(3, 2, 4);
        for layout in [Layout::ChannelMajor, Layout::SpatialMajor] {
            for i in 0..shape.volume() {
                assert_eq!(layout.index(shape, layout.position(shape, i)), i);
            }
        }
        let second = Layout::SpatialMajor.position(shape, 1);
        assert_eq!((second.channel, second.row, second.col), (1, 0, 0));
    }

    #[test]
    fn degenerate_shapes_accept_either_layout() {
        let vector = FrameShape::vector(8);
        assert!(Port::channel_major(vector).accepts(&Port::spatial_major(vector)));
        let plane = FrameShape::new(1, 4, 4);
        assert!(Port::spatial_major(plane).accepts(&Port::channel_major(plane)));
        let cube = FrameShape::new(2, 4, 4);
        assert!(!Port::spatial_major(cube).accepts(&Port::channel_major(cube)));
        assert!(!Port::channel_major(cube).accepts(&Port::channel_major(plane)));
    }

    #[test]
    fn token_round_trip_through_spatial_major() {
        let shape = FrameShape::new(2, 2, 3);
        let data = (0..12).map(Sample::from_raw).collect();
        let map = FeatureMap::from_samples(shape, data).unwrap();
        let tokens: Vec<_> = map.tokens(Layout::SpatialMajor).collect();
        assert_eq!(tokens[1].sample.raw(), 6);
        assert_eq!(tokens.iter().filter(|t| t.last).count(), 1);
        assert!(tokens[11].last);
        let back = FeatureMap::from_tokens(shape, Layout::SpatialMajor, tokens).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn misplaced_marker_is_rejected() {
        let shape = FrameShape::new(1, 1, 3);
        let early = [Token::body(Sample::ZERO), Token::last(Sample::ZERO)];
        assert!(FeatureMap::from_tokens(shape, Layout::ChannelMajor, early).is_err());
        let missing = [Token::body(Sample::ZERO); 3];
        assert!(FeatureMap::from_tokens(shape, Layout::ChannelMajor, missing).is_err());
    }

    #[test]
    fn interleaved_bytes_become_channel_major() {
        let fx = FixedPoint::new(QFormat::Q8_8);
        let shape = FrameShape::new(3, 1, 2);
        let map = FeatureMap::from_interleaved_u8(&fx, shape, &[0, 128, 255, 64, 32, 16]).unwrap();
        assert_eq!(map.get(0, 0, 1).raw(), 64);
        assert_eq!(map.get(1, 0, 0).raw(), 128);
        assert_eq!(map.get(2, 0, 0).raw(), 255);
        assert!(FeatureMap::from_interleaved_u8(&fx, shape, &[0; 5]).is_err());
    }
}
