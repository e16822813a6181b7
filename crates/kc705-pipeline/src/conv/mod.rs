//! Convolution engines.
//!
//! | Engine | Input order | Reduction |
//! |--------|-------------|-----------|
//! | [`DepthwiseConv`] | channel-major | `K×K` per channel |
//! | [`PointwiseConv`] | spatial-major | all input channels per position |
//! | [`StandardConv`] | channel-major | `C_in×K×K` per output, full-frame |
//!
//! All engines accumulate in 64 bits across a [`MacArray`] and narrow the
//! sum by the weight format's fractional bits, so outputs stay in the
//! activation format.

mod depthwise;
mod pointwise;

pub use depthwise::DepthwiseConv;
pub use pointwise::{PointwiseConv, StandardConv};

use crate::error::{PipelineError, Result};

/// Kernel size, stride and zero padding of a spatial convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    /// Kernel side length.
    pub kernel: usize,
    /// Step between output positions.
    pub stride: usize,
    /// Zero rows/columns added on each side.
    pub padding: usize,
}

impl ConvGeometry {
    /// `K×K` kernel, `padding = K / 2`.
    pub const fn same(kernel: usize, stride: usize) -> Self {
        Self {
            kernel,
            stride,
            padding: kernel / 2,
        }
    }

    /// A 1×1 kernel with unit stride.
    pub const fn pointwise() -> Self {
        Self {
            kernel: 1,
            stride: 1,
            padding: 0,
        }
    }

    /// Output extent along one axis: `(n + 2p - K) / s + 1`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a degenerate geometry or an input
    /// smaller than the padded kernel.
    pub fn output_extent(&self, n: usize) -> Result<usize> {
        if self.kernel == 0 || self.stride == 0 {
            return Err(PipelineError::configuration("kernel and stride must be positive"));
        }
        if self.padding >= self.kernel {
            return Err(PipelineError::configuration(format!(
                "padding {} must be smaller than kernel {}",
                self.padding, self.kernel
            )));
        }
        let padded = n + 2 * self.padding;
        if n == 0 || padded < self.kernel {
            return Err(PipelineError::configuration(format!(
                "extent {n} too small for a {}-wide kernel with padding {}",
                self.kernel, self.padding
            )));
        }
        Ok((padded - self.kernel) / self.stride + 1)
    }

    /// Input coordinate of kernel tap `tap` for output coordinate `out`.
    ///
    /// Negative or out-of-range results address the zero padding.
    #[allow(clippy::cast_possible_wrap)]
    pub const fn input_coord(&self, out: usize, tap: usize) -> isize {
        (out * self.stride + tap) as isize - self.padding as isize
    }

    /// Last input coordinate output `out` depends on, clamped to `extent`.
    pub fn last_input(&self, out: usize, extent: usize) -> usize {
        (out * self.stride + self.kernel - 1 - self.padding).min(extent - 1)
    }
}

/// A bank of multiply-accumulate units.
///
/// Terms of a dot product are dealt round-robin to the units; the units'
/// partial sums are then reduced. Accumulation saturates at the `i64` range.
#[derive(Debug, Clone)]
pub struct MacArray {
    partials: Vec<i64>,
}

impl MacArray {
    /// A bank of `units` accumulators (minimum one).
    pub fn new(units: usize) -> Self {
        Self {
            partials: vec![0; units.max(1)],
        }
    }

    /// Number of accumulators.
    pub fn units(&self) -> usize {
        self.partials.len()
    }

    /// `Σ a·b` over `terms`.
    pub fn dot(&mut self, terms: impl IntoIterator<Item = (i64, i64)>) -> i64 {
        self.partials.fill(0);
        let units = self.partials.len();
        for (i, (a, b)) in terms.into_iter().enumerate() {
            let unit = &mut self.partials[i % units];
            *unit = unit.saturating_add(a.saturating_mul(b));
        }
        self.partials.iter().fold(0i64, |acc, &p| acc.saturating_add(p))
    }
}

/// Check a weight vector against its expected length.
pub(crate) fn expect_len(stage: &str, what: &str, actual: usize, expected: usize) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(PipelineError::weights(format!(
            "{stage}: {what} has {actual} values, expected {expected}"
        )))
    }
}
