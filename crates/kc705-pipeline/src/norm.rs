//! Folded batch normalization.

use crate::conv::expect_len;
use crate::error::Result;
use crate::fixed::{FixedPoint, QFormat};
use crate::frame::{Port, Position, Token};
use crate::stream::{Outbox, Stage};
use crate::weights::AffineParams;
use std::sync::Arc;

/// `y = sat(x · scale[c] + shift[c])`, elementwise in either layout.
#[derive(Debug)]
pub struct AffineNorm {
    name: String,
    port: Port,
    params: Arc<AffineParams>,
    weight_frac: u32,
    fx: FixedPoint,
}

impl AffineNorm {
    /// Normalize a stream on `port`.
    ///
    /// # Errors
    ///
    /// Returns a weight error if `params` does not cover every channel.
    pub fn new(
        name: impl Into<String>,
        port: Port,
        params: Arc<AffineParams>,
        weight_format: QFormat,
        fx: FixedPoint,
    ) -> Result<Self> {
        let name = name.into();
        expect_len(&name, "scale", params.scale.len(), port.shape.channels)?;
        expect_len(&name, "shift", params.shift.len(), port.shape.channels)?;
        Ok(Self {
            name,
            port,
            params,
            weight_frac: u32::from(weight_format.frac_bits()),
            fx,
        })
    }
}

impl Stage for AffineNorm {
    fn name(&self) -> &str {
        &self.name
    }

    fn input(&self) -> Port {
        self.port
    }

    fn output(&self) -> Port {
        self.port
    }

    fn accept(&mut self, token: Token, at: Position, out: &mut Outbox) -> Result<()> {
        let c = at.channel;
        let scaled = (token.sample.wide() * i64::from(self.params.scale[c])) >> self.weight_frac;
        out.emit(self.fx.saturate(scaled + i64::from(self.params.shift[c])));
        Ok(())
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::Sample;
    use crate::frame::{FeatureMap, FrameShape};
    use crate::stream::Pipeline;

    #[test]
    fn per_channel_scale_and_shift() {
        let fx = FixedPoint::new(QFormat::Q8_8);
        let shape = FrameShape::new(2, 1, 2);
        let params = AffineParams {
            scale: vec![QFormat::Q2_6.encode(0.5), QFormat::Q2_6.encode(-1.0)],
            shift: vec![fx.encode(1.0).raw(), 0],
        };
        let norm = AffineNorm::new(
            "bn",
            Port::spatial_major(shape),
            Arc::new(params),
            QFormat::Q2_6,
            fx.clone(),
        )
        .unwrap();
        let mut pipe = Pipeline::new(vec![Box::new(norm)], 4).unwrap();
        let input = FeatureMap::filled(shape, fx.encode(2.0));
        let out = pipe.run_frame(&input).unwrap();
        assert_eq!(out.get(0, 0, 1), fx.encode(2.0));
        assert_eq!(out.get(1, 0, 0), fx.encode(-2.0));
    }

    #[test]
    fn shift_saturates() {
        let fx = FixedPoint::new(QFormat::Q8_8);
        let shape = FrameShape::vector(1);
        let params = AffineParams {
            scale: vec![QFormat::Q2_6.one()],
            shift: vec![0x7F00],
        };
        let norm =
            AffineNorm::new("bn", Port::channel_major(shape), Arc::new(params), QFormat::Q2_6, fx.clone())
                .unwrap();
        let mut pipe = Pipeline::new(vec![Box::new(norm)], 1).unwrap();
        let out = pipe.run_frame(&FeatureMap::filled(shape, Sample::from_raw(0x4000))).unwrap();
        assert_eq!(out.get(0, 0, 0).raw(), 0x7FFF);
        assert_eq!(fx.saturations().count(), 1);
    }

    #[test]
    fn short_parameters_rejected() {
        let shape = FrameShape::new(3, 1, 1);
        let params = Arc::new(AffineParams::identity(2, QFormat::Q2_6));
        let fx = FixedPoint::new(QFormat::Q8_8);
        assert!(AffineNorm::new("bn", Port::channel_major(shape), params, QFormat::Q2_6, fx).is_err());
    }
}
