//! Saturating fixed-point arithmetic.
//!
//! A [`QFormat`] describes a signed two's-complement representation with
//! `total_bits` of storage, `frac_bits` of which lie after the binary point.
//! Values are carried in an `i32` regardless of the configured width; every
//! arithmetic result is clamped to the format's range before it is stored.
//!
//! Rescale shifts are always explicit parameters derived from the configured
//! formats. Nothing in this module assumes a particular fractional width.
//!
//! Clamping is not an error. Each clamp increments a shared
//! [`SaturationCounter`] so the event stays observable for diagnostics.

use crate::error::{PipelineError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ── Format ───────────────────────────────────────────────────────────────────

/// Signed fixed-point format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QFormat {
    total_bits: u8,
    frac_bits: u8,
}

impl QFormat {
    /// 16-bit storage, 8 fractional bits.
    pub const Q8_8: Self = Self {
        total_bits: 16,
        frac_bits: 8,
    };

    /// 8-bit storage, 4 fractional bits.
    pub const Q4_4: Self = Self {
        total_bits: 8,
        frac_bits: 4,
    };

    /// 8-bit storage, 6 fractional bits. Default weight format.
    pub const Q2_6: Self = Self {
        total_bits: 8,
        frac_bits: 6,
    };

    /// Create a format, validating it once.
    ///
    /// `total_bits` must lie in `2..=32` and the integer part must be wide
    /// enough to hold `1.0` (`frac_bits <= total_bits - 2`).
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Configuration`] for an unrepresentable format.
    pub fn new(total_bits: u8, frac_bits: u8) -> Result<Self> {
        if !(2..=32).contains(&total_bits) {
            return Err(PipelineError::configuration(format!(
                "fixed-point width {total_bits} outside 2..=32"
            )));
        }
        if u16::from(frac_bits) + 2 > u16::from(total_bits) {
            return Err(PipelineError::configuration(format!(
                "Q format with {frac_bits} fractional bits in {total_bits} cannot represent 1.0"
            )));
        }
        Ok(Self {
            total_bits,
            frac_bits,
        })
    }

    /// Storage width in bits.
    pub const fn total_bits(self) -> u8 {
        self.total_bits
    }

    /// Fractional bits.
    pub const fn frac_bits(self) -> u8 {
        self.frac_bits
    }

    /// Largest representable raw value.
    pub const fn max_raw(self) -> i32 {
        ((1i64 << (self.total_bits - 1)) - 1) as i32
    }

    /// Smallest representable raw value.
    pub const fn min_raw(self) -> i32 {
        (-(1i64 << (self.total_bits - 1))) as i32
    }

    /// Raw encoding of `1.0`.
    pub const fn one(self) -> i32 {
        1 << self.frac_bits
    }

    /// Clamp a wide intermediate to the representable range.
    ///
    /// Returns the clamped value and whether clamping occurred.
    pub fn clamp(self, value: i64) -> (i32, bool) {
        let lo = i64::from(self.min_raw());
        let hi = i64::from(self.max_raw());
        let clamped = value.clamp(lo, hi);
        // Lossless: `clamped` lies within an i32-backed range.
        #[allow(clippy::cast_possible_truncation)]
        (clamped as i32, clamped != value)
    }

    /// Encode a real number, truncating toward negative infinity and clamping.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(self, value: f64) -> i32 {
        let scaled = (value * f64::from(self.one())).floor();
        let lo = f64::from(self.min_raw());
        let hi = f64::from(self.max_raw());
        scaled.clamp(lo, hi) as i32
    }

    /// Decode a raw value to a real number.
    pub fn decode(self, raw: i32) -> f64 {
        f64::from(raw) / f64::from(self.one())
    }

    /// Every representable raw value, ascending. Intended for narrow formats.
    pub fn all_values(self) -> impl Iterator<Item = i32> {
        self.min_raw()..=self.max_raw()
    }
}

impl std::fmt::Display for QFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Q{}.{}", self.total_bits - self.frac_bits, self.frac_bits)
    }
}

// ── Sample ───────────────────────────────────────────────────────────────────

/// One fixed-point scalar. The format is carried by the tensor, not the value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sample(i32);

impl Sample {
    /// The zero sample.
    pub const ZERO: Self = Self(0);

    /// Wrap a raw value.
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// Raw integer value.
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Raw value widened for intermediate arithmetic.
    pub const fn wide(self) -> i64 {
        self.0 as i64
    }
}

// ── Saturation counter ───────────────────────────────────────────────────────

/// Shared counter of clamp events.
///
/// Clones share the same count; every stage of a pipeline holds one.
#[derive(Debug, Clone, Default)]
pub struct SaturationCounter(Arc<AtomicU64>);

impl SaturationCounter {
    /// Create a counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one clamp.
    pub fn record(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Clamps recorded so far.
    pub fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Reset to zero.
    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

// ── Arithmetic context ───────────────────────────────────────────────────────

/// Saturating arithmetic in one format, counting every clamp.
#[derive(Debug, Clone)]
pub struct FixedPoint {
    format: QFormat,
    saturations: SaturationCounter,
}

impl FixedPoint {
    /// Arithmetic in `format` with a private counter.
    pub fn new(format: QFormat) -> Self {
        Self::with_counter(format, SaturationCounter::new())
    }

    /// Arithmetic in `format` reporting into a shared counter.
    pub fn with_counter(format: QFormat, saturations: SaturationCounter) -> Self {
        Self {
            format,
            saturations,
        }
    }

    /// The value format.
    pub const fn format(&self) -> QFormat {
        self.format
    }

    /// The clamp counter.
    pub fn saturations(&self) -> &SaturationCounter {
        &self.saturations
    }

    /// Raw encoding of `1.0`.
    pub const fn one(&self) -> i32 {
        self.format.one()
    }

    /// Clamp a wide intermediate into a sample.
    pub fn saturate(&self, value: i64) -> Sample {
        let (raw, clamped) = self.format.clamp(value);
        if clamped {
            self.saturations.record();
        }
        Sample(raw)
    }

    /// Saturating addition.
    pub fn add(&self, a: Sample, b: Sample) -> Sample {
        self.saturate(a.wide() + b.wide())
    }

    /// Saturating `(a * b) >> frac_bits`, both operands in this format.
    pub fn mul(&self, a: Sample, b: Sample) -> Sample {
        self.mul_shift(a.wide(), b.wide(), u32::from(self.format.frac_bits))
    }

    /// Saturating `(a * b) >> shift` for operands in mixed formats.
    ///
    /// The shift is arithmetic, so results round toward negative infinity.
    pub fn mul_shift(&self, a: i64, b: i64, shift: u32) -> Sample {
        self.narrow(a.saturating_mul(b), shift)
    }

    /// Saturating `acc >> shift` of an accumulator.
    pub fn narrow(&self, acc: i64, shift: u32) -> Sample {
        self.saturate(acc >> shift.min(63))
    }

    /// Convert a raw value with `from_frac` fractional bits into this format.
    pub fn rescale(&self, raw: i64, from_frac: u8) -> Sample {
        let to_frac = self.format.frac_bits;
        if from_frac >= to_frac {
            self.narrow(raw, u32::from(from_frac - to_frac))
        } else {
            let shifted = raw.checked_shl(u32::from(to_frac - from_frac));
            match shifted {
                Some(v) if (v >> (to_frac - from_frac)) == raw => self.saturate(v),
                _ => self.saturate(if raw < 0 { i64::MIN } else { i64::MAX }),
            }
        }
    }

    /// Encode a real number in this format.
    pub fn encode(&self, value: f64) -> Sample {
        Sample(self.format.encode(value))
    }

    /// Decode a sample to a real number.
    pub fn decode(&self, sample: Sample) -> f64 {
        self.format.decode(sample.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn q8_8_limits() {
        let q = QFormat::Q8_8;
        assert_eq!(q.max_raw(), 0x7FFF);
        assert_eq!(q.min_raw(), -0x8000);
        assert_eq!(q.one(), 256);
        assert_eq!(q.to_string(), "Q8.8");
    }

    #[test]
    fn format_validation() {
        assert!(QFormat::new(16, 8).is_ok());
        assert!(QFormat::new(32, 16).is_ok());
        assert!(QFormat::new(33, 8).is_err());
        assert!(QFormat::new(8, 7).is_err());
        assert!(QFormat::new(1, 0).is_err());
        assert!(matches!(
            QFormat::new(8, 255),
            Err(PipelineError::Configuration { .. })
        ));
        assert!(QFormat::new(32, 254).is_err());
        assert!(QFormat::new(32, 30).is_ok());
    }

    #[test]
    fn saturating_add_at_maximum_does_not_wrap() {
        let fx = FixedPoint::new(QFormat::Q8_8);
        let max = Sample::from_raw(0x7FFF);
        assert_eq!(fx.add(max, max).raw(), 0x7FFF);
        assert_eq!(fx.saturations().count(), 1);
    }

    #[test]
    fn saturating_add_at_minimum() {
        let fx = FixedPoint::new(QFormat::Q8_8);
        let min = Sample::from_raw(-0x8000);
        assert_eq!(fx.add(min, min).raw(), -0x8000);
    }

    #[test]
    fn in_range_add_is_not_counted() {
        let fx = FixedPoint::new(QFormat::Q8_8);
        let a = fx.encode(1.5);
        let b = fx.encode(-0.25);
        assert_eq!(fx.decode(fx.add(a, b)), 1.25);
        assert_eq!(fx.saturations().count(), 0);
    }

    #[test]
    fn multiply_rescales_by_fraction_bits() {
        let fx = FixedPoint::new(QFormat::Q8_8);
        let a = fx.encode(2.5);
        let b = fx.encode(-1.5);
        assert_eq!(fx.decode(fx.mul(a, b)), -3.75);

        let q44 = FixedPoint::new(QFormat::Q4_4);
        let c = q44.encode(1.5);
        assert_eq!(q44.decode(q44.mul(c, c)), 2.25);
    }

    #[test]
    fn multiply_saturates() {
        let fx = FixedPoint::new(QFormat::Q8_8);
        let big = fx.encode(100.0);
        assert_eq!(fx.mul(big, big).raw(), 0x7FFF);
        assert_eq!(fx.mul(big, fx.encode(-100.0)).raw(), -0x8000);
    }

    #[test]
    fn negative_products_floor() {
        let fx = FixedPoint::new(QFormat::Q8_8);
        // -1/256 * 1/2 = -1/512 floors to -1/256.
        assert_eq!(fx.mul_shift(-1, 128, 8).raw(), -1);
    }

    #[test]
    fn rescale_between_widths() {
        let fx = FixedPoint::new(QFormat::Q8_8);
        // Q.4 -> Q.8
        assert_eq!(fx.rescale(24, 4).raw(), 384);
        // Q.12 -> Q.8
        assert_eq!(fx.rescale(4096, 12).raw(), 256);
        // overflow on widening clamps
        assert_eq!(fx.rescale(i64::MAX / 2, 0).raw(), 0x7FFF);
    }

    #[test]
    fn counters_are_shared_between_clones() {
        let counter = SaturationCounter::new();
        let a = FixedPoint::with_counter(QFormat::Q8_8, counter.clone());
        let b = a.clone();
        a.saturate(1 << 20);
        b.saturate(-(1 << 20));
        assert_eq!(counter.count(), 2);
        counter.reset();
        assert_eq!(a.saturations().count(), 0);
    }
}
