//! Global average pooling.

use crate::error::Result;
use crate::fixed::FixedPoint;
use crate::frame::{FrameShape, Port, Position, Token};
use crate::stream::{Outbox, Stage};

/// Reduces each channel of a channel-major frame to its mean.
///
/// Emits one sample as soon as a channel's last position has arrived. The
/// mean is floored.
#[derive(Debug)]
pub struct GlobalAvgPool {
    name: String,
    input: FrameShape,
    sum: i64,
    fx: FixedPoint,
}

impl GlobalAvgPool {
    /// Pool `input` frames to `channels × 1 × 1`.
    pub fn new(name: impl Into<String>, input: FrameShape, fx: FixedPoint) -> Self {
        Self {
            name: name.into(),
            input,
            sum: 0,
            fx,
        }
    }
}

/// Floored mean of `sum` over `count` positions.
pub(crate) fn floor_mean(sum: i64, count: usize) -> i64 {
    // Frame sizes are far below i64::MAX.
    #[allow(clippy::cast_possible_wrap)]
    let count = count.max(1) as i64;
    sum.div_euclid(count)
}

impl Stage for GlobalAvgPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn input(&self) -> Port {
        Port::channel_major(self.input)
    }

    fn output(&self) -> Port {
        Port::channel_major(FrameShape::vector(self.input.channels))
    }

    fn accept(&mut self, token: Token, at: Position, out: &mut Outbox) -> Result<()> {
        self.sum = self.sum.saturating_add(token.sample.wide());
        if at.row + 1 == self.input.height && at.col + 1 == self.input.width {
            out.emit(self.fx.saturate(floor_mean(self.sum, self.input.spatial())));
            self.sum = 0;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.sum = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::{QFormat, Sample};
    use crate::frame::FeatureMap;
    use crate::stream::Pipeline;

    #[test]
    fn per_channel_floored_mean() {
        let fx = FixedPoint::new(QFormat::Q8_8);
        let shape = FrameShape::new(2, 2, 2);
        let data = [1, 2, 3, 5, -1, -2, -2, -2].into_iter().map(Sample::from_raw).collect();
        let mut pipe = Pipeline::new(vec![Box::new(GlobalAvgPool::new("gap", shape, fx))], 1).unwrap();
        let out = pipe.run_frame(&FeatureMap::from_samples(shape, data).unwrap()).unwrap();
        assert_eq!(out.shape(), FrameShape::vector(2));
        assert_eq!(out.get(0, 0, 0).raw(), 2);
        assert_eq!(out.get(1, 0, 0).raw(), -2);
    }

    #[test]
    fn floor_mean_rounds_down() {
        assert_eq!(floor_mean(7, 2), 3);
        assert_eq!(floor_mean(-7, 2), -4);
        assert_eq!(floor_mean(5, 0), 5);
    }
}
