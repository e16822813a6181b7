//! Canonical input image format.
//!
//! The accelerator classifies one 224×224 RGB image per invocation into one of
//! the 1000 ImageNet classes. Pixels are uploaded interleaved (`RGBRGB...`),
//! row by row.

/// Image width in pixels.
pub const WIDTH: usize = 224;
/// Image height in pixels.
pub const HEIGHT: usize = 224;
/// Colour channels per pixel.
pub const CHANNELS: usize = 3;
/// Bytes in one canonical image.
pub const BYTES: usize = WIDTH * HEIGHT * CHANNELS;
/// Number of output classes.
pub const NUM_CLASSES: usize = 1000;

/// Fixed-point scale of the confidence word in the result region.
///
/// `confidence = raw / CONFIDENCE_SCALE`.
pub const CONFIDENCE_SCALE: u32 = 10_000;
