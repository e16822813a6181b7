//! Layout adapter between spatial-major and channel-major stages.

use crate::error::{PipelineError, Result};
use crate::fixed::Sample;
use crate::frame::{FrameShape, Layout, Port, Position, Token};
use crate::stream::{Outbox, Stage};

/// Buffers one frame and re-emits it in another order.
///
/// The buffer holds exactly one frame; the frame is released when its final
/// sample arrives.
#[derive(Debug)]
pub struct Reorder {
    name: String,
    shape: FrameShape,
    from: Layout,
    to: Layout,
    frame: Vec<Sample>,
}

impl Reorder {
    /// Convert `shape` frames from `from` order to `to` order.
    pub fn new(name: impl Into<String>, shape: FrameShape, from: Layout, to: Layout) -> Self {
        Self {
            name: name.into(),
            shape,
            from,
            to,
            frame: Vec::with_capacity(shape.volume()),
        }
    }
}

impl Stage for Reorder {
    fn name(&self) -> &str {
        &self.name
    }

    fn input(&self) -> Port {
        Port {
            shape: self.shape,
            layout: self.from,
        }
    }

    fn output(&self) -> Port {
        Port {
            shape: self.shape,
            layout: self.to,
        }
    }

    fn accept(&mut self, token: Token, _at: Position, out: &mut Outbox) -> Result<()> {
        if self.frame.len() >= self.shape.volume() {
            return Err(PipelineError::resource_exhaustion(&self.name, self.shape.volume()));
        }
        self.frame.push(token.sample);
        if token.last {
            for i in 0..self.shape.volume() {
                let at = self.to.position(self.shape, i);
                out.emit(self.frame[self.from.index(self.shape, at)]);
            }
            self.frame.clear();
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.frame.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FeatureMap;
    use crate::stream::Pipeline;

    #[test]
    fn round_trip_through_both_adapters_is_identity() {
        let shape = FrameShape::new(3, 2, 2);
        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(Reorder::new("to_sm", shape, Layout::ChannelMajor, Layout::SpatialMajor)),
            Box::new(Reorder::new("to_cm", shape, Layout::SpatialMajor, Layout::ChannelMajor)),
        ];
        let mut pipe = Pipeline::new(stages, 2).unwrap();
        let data = (0..12).map(Sample::from_raw).collect();
        let input = FeatureMap::from_samples(shape, data).unwrap();
        assert_eq!(pipe.run_frame(&input).unwrap(), input);
    }

    #[test]
    fn emits_in_target_order() {
        let shape = FrameShape::new(2, 1, 2);
        let mut pipe = Pipeline::new(
            vec![Box::new(Reorder::new("r", shape, Layout::ChannelMajor, Layout::SpatialMajor))],
            8,
        )
        .unwrap();
        for (i, v) in [1, 2, 3, 4].into_iter().enumerate() {
            pipe.try_feed(Token {
                sample: Sample::from_raw(v),
                last: i == 3,
            })
            .unwrap();
        }
        while pipe.step().unwrap() {}
        let order: Vec<i32> = std::iter::from_fn(|| pipe.try_drain()).map(|t| t.sample.raw()).collect();
        assert_eq!(order, vec![1, 3, 2, 4]);
    }
}
