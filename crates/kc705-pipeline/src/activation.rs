//! Fixed-point activation functions.
//!
//! Each function is pure and maps one sample to one sample in the format of
//! the supplied [`FixedPoint`] context. The real-valued definitions are:
//!
//! | Function | Definition |
//! |----------|------------|
//! | [`relu`] | `max(0, x)` |
//! | [`relu6`] | `clamp(x, 0, 6)` |
//! | [`hard_sigmoid`] | `clamp((x + 1) / 2, 0, 1)` |
//! | [`hswish`] | `x * relu6(x + 3) / 6` |
//! | [`sigmoid_approx`] | piecewise-linear `1 / (1 + e^-x)` |
//!
//! Results are truncated toward negative infinity to the configured
//! fractional width, never rounded.
//!
//! # Sigmoid accuracy
//!
//! [`sigmoid_approx`] interpolates linearly between the exact sigmoid at the
//! integers `-6..=6` and clamps outside that range. Interpolation error is at
//! most `max|σ''| / 8 ≈ 0.012`; with table quantization and truncation the
//! absolute error in Q8.8 stays below `0.02` over the whole input range.

use crate::error::Result;
use crate::fixed::{FixedPoint, Sample};
use crate::frame::{Port, Position, Token};
use crate::stream::{Outbox, Stage};

/// Per-sample nonlinearity selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    /// Pass-through.
    #[default]
    Identity,
    /// `max(0, x)`.
    Relu,
    /// `clamp(x, 0, 6)`.
    Relu6,
    /// `clamp((x + 1) / 2, 0, 1)`.
    HardSigmoid,
    /// `x * relu6(x + 3) / 6`.
    HSwish,
    /// Piecewise-linear logistic sigmoid.
    Sigmoid,
}

impl Activation {
    /// Apply the activation to one sample.
    pub fn apply(self, fx: &FixedPoint, x: Sample) -> Sample {
        match self {
            Self::Identity => x,
            Self::Relu => relu(x),
            Self::Relu6 => relu6(fx, x),
            Self::HardSigmoid => hard_sigmoid(fx, x),
            Self::HSwish => hswish(fx, x),
            Self::Sigmoid => sigmoid_approx(fx, x),
        }
    }

    /// Short lowercase name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Relu => "relu",
            Self::Relu6 => "relu6",
            Self::HardSigmoid => "hard_sigmoid",
            Self::HSwish => "hswish",
            Self::Sigmoid => "sigmoid",
        }
    }
}

/// `max(0, x)`.
pub fn relu(x: Sample) -> Sample {
    x.max(Sample::ZERO)
}

/// `clamp(x, 0, 6)`.
pub fn relu6(fx: &FixedPoint, x: Sample) -> Sample {
    let six = 6 * i64::from(fx.one());
    // min(x, 6) never exceeds x, so the result is representable.
    fx.saturate(x.wide().clamp(0, six))
}

/// `clamp((x + 1) / 2, 0, 1)`.
pub fn hard_sigmoid(fx: &FixedPoint, x: Sample) -> Sample {
    let one = i64::from(fx.one());
    fx.saturate(((x.wide() + one) >> 1).clamp(0, one))
}

/// `x * relu6(x + 3) / 6`, truncated.
///
/// The division by six is carried out exactly on the quadruple-width product
/// so the result equals the real-valued definition floored to the output
/// format. The product of a 32-bit sample and its gate can exceed `i64`.
pub fn hswish(fx: &FixedPoint, x: Sample) -> Sample {
    let one = i128::from(fx.one());
    let x = i128::from(x.raw());
    let gate = (x + 3 * one).clamp(0, 6 * one);
    let quotient = (x * gate).div_euclid(6 * one);
    let wide = i64::try_from(quotient).unwrap_or(if quotient < 0 { i64::MIN } else { i64::MAX });
    fx.saturate(wide)
}

/// Logistic sigmoid sampled at the integers `-6..=6`.
const SIGMOID_KNOTS: [f64; 13] = [
    0.002_472_623_156_634_774_3,
    0.006_692_850_924_284_855_4,
    0.017_986_209_962_091_56,
    0.047_425_873_177_566_78,
    0.119_202_922_022_117_55,
    0.268_941_421_369_995_1,
    0.5,
    0.731_058_578_630_004_9,
    0.880_797_077_977_882_3,
    0.952_574_126_822_433_4,
    0.982_013_790_037_908_5,
    0.993_307_149_075_715_3,
    0.997_527_376_843_365_3,
];

const SIGMOID_MIN_KNOT: i64 = -6;

fn sigmoid_knot(fx: &FixedPoint, index: usize) -> i64 {
    i64::from(fx.encode(SIGMOID_KNOTS[index] + 0.5 / f64::from(fx.one())).raw())
}

/// Piecewise-linear sigmoid approximation.
///
/// See the module documentation for the accuracy bound.
pub fn sigmoid_approx(fx: &FixedPoint, x: Sample) -> Sample {
    let frac_bits = fx.format().frac_bits();
    let integer = x.wide() >> frac_bits;
    let last = SIGMOID_KNOTS.len() - 1;

    let offset = integer - SIGMOID_MIN_KNOT;
    if offset < 0 {
        return fx.saturate(sigmoid_knot(fx, 0));
    }
    let Ok(index) = usize::try_from(offset) else {
        return fx.saturate(sigmoid_knot(fx, last));
    };
    if index >= last {
        return fx.saturate(sigmoid_knot(fx, last));
    }

    let fraction = x.wide() - (integer << frac_bits);
    let y0 = sigmoid_knot(fx, index);
    let y1 = sigmoid_knot(fx, index + 1);
    fx.saturate(y0 + (((y1 - y0) * fraction) >> frac_bits))
}

/// Applies an [`Activation`] to every sample of a stream.
#[derive(Debug)]
pub struct ActivationStage {
    name: String,
    port: Port,
    activation: Activation,
    fx: FixedPoint,
}

impl ActivationStage {
    /// Activate a stream on `port`.
    pub fn new(name: impl Into<String>, port: Port, activation: Activation, fx: FixedPoint) -> Self {
        Self {
            name: name.into(),
            port,
            activation,
            fx,
        }
    }
}

impl Stage for ActivationStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn input(&self) -> Port {
        self.port
    }

    fn output(&self) -> Port {
        self.port
    }

    fn accept(&mut self, token: Token, _at: Position, out: &mut Outbox) -> Result<()> {
        out.emit(self.activation.apply(&self.fx, token.sample));
        Ok(())
    }

    fn reset(&mut self) {}
}
