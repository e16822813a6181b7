//! Inference configuration, results and running statistics.

use crate::classes::class_name;
use kc705_chip::image::CONFIDENCE_SCALE;
use std::borrow::Cow;
use std::time::Duration;

/// Default bound on the DONE wait.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default STATUS polling period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Host-side inference settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferenceConfig {
    /// Maximum time to wait for DONE after START.
    pub timeout: Duration,

    /// Sleep between STATUS reads.
    pub poll_interval: Duration,

    /// Set IRQ_ENABLE together with START.
    pub interrupts: bool,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            interrupts: true,
        }
    }
}

impl InferenceConfig {
    /// Replace the DONE wait bound.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the polling period.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Enable or disable completion interrupts.
    #[must_use]
    pub const fn with_interrupts(mut self, enabled: bool) -> Self {
        self.interrupts = enabled;
        self
    }
}

/// One classification read back from the result region.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    /// Predicted class index.
    pub class_id: u32,

    /// Confidence in parts per 10 000, as the board reports it.
    pub confidence_raw: u32,

    /// Device-side processing time in microseconds.
    pub processing_time_us: u32,

    /// Host-observed time from upload to result.
    pub latency: Duration,
}

impl ClassificationResult {
    /// Confidence as a fraction in `[0, 1]`.
    #[allow(clippy::cast_precision_loss)]
    pub fn confidence(&self) -> f32 {
        self.confidence_raw as f32 / CONFIDENCE_SCALE as f32
    }

    /// ImageNet label of [`Self::class_id`].
    pub fn class_name(&self) -> Cow<'static, str> {
        class_name(self.class_id)
    }
}

impl std::fmt::Display for ClassificationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "class {} ({}) confidence {:.2}% device {} µs",
            self.class_id,
            self.class_name(),
            self.confidence() * 100.0,
            self.processing_time_us
        )
    }
}

/// Running totals over completed inferences.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerformanceStats {
    /// Successful inferences.
    pub total_inferences: u64,

    /// Summed host-observed latency of successful inferences.
    pub total_time: Duration,

    /// Failed inferences (timeouts, hardware errors, link loss).
    pub errors: u64,
}

impl PerformanceStats {
    /// Account one successful inference.
    pub fn record(&mut self, latency: Duration) {
        self.total_inferences += 1;
        self.total_time += latency;
    }

    /// Account one failed inference.
    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    /// Mean latency, or zero before the first inference.
    #[allow(clippy::cast_precision_loss)]
    pub fn avg_latency(&self) -> Duration {
        match u32::try_from(self.total_inferences) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.total_time / n,
            Err(_) => Duration::from_secs_f64(
                self.total_time.as_secs_f64() / self.total_inferences as f64,
            ),
        }
    }

    /// Inferences per second of accumulated latency.
    #[allow(clippy::cast_precision_loss)]
    pub fn avg_fps(&self) -> f64 {
        let secs = self.total_time.as_secs_f64();
        if secs > 0.0 {
            self.total_inferences as f64 / secs
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for PerformanceStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} inferences, {} errors, avg {:.3} ms, {:.1} FPS",
            self.total_inferences,
            self.errors,
            self.avg_latency().as_secs_f64() * 1e3,
            self.avg_fps()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = InferenceConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.poll_interval, Duration::from_millis(1));
        assert!(config.interrupts);
    }

    #[test]
    fn test_confidence_scaling() {
        let result = ClassificationResult {
            class_id: 1,
            confidence_raw: 8_750,
            processing_time_us: 120,
            latency: Duration::from_millis(2),
        };
        assert!((result.confidence() - 0.875).abs() < 1e-6);
        assert_eq!(result.class_name(), "goldfish");
    }

    #[test]
    fn test_stats_averages() {
        let mut stats = PerformanceStats::default();
        assert_eq!(stats.avg_latency(), Duration::ZERO);
        assert!(stats.avg_fps().abs() < f64::EPSILON);

        stats.record(Duration::from_millis(10));
        stats.record(Duration::from_millis(30));
        stats.record_error();

        assert_eq!(stats.avg_latency(), Duration::from_millis(20));
        assert!((stats.avg_fps() - 50.0).abs() < 1e-9);
        assert_eq!(stats.errors, 1);
    }
}
