//! Raw RGB image helpers.
//!
//! Images are interleaved 8-bit RGB (`HWC`), the byte order the gateware
//! consumes. No container formats are decoded.

use crate::error::{Kc705Error, Result};
use kc705_chip::image::{BYTES, CHANNELS, HEIGHT, WIDTH};
use std::path::Path;

/// An interleaved 8-bit image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbImage {
    width: usize,
    height: usize,
    pixels: Vec<u8>,
}

impl RgbImage {
    /// Wrap `pixels` as a `width × height` RGB image.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParam` if the buffer length does not match.
    pub fn new(width: usize, height: usize, pixels: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 || pixels.len() != width * height * CHANNELS {
            return Err(Kc705Error::invalid_param(format!(
                "{} bytes is not a {width}×{height}×{CHANNELS} image",
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Load a headerless RGB file of known dimensions.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read and `InvalidParam`
    /// if its length does not match the dimensions.
    pub fn load_raw(path: impl AsRef<Path>, width: usize, height: usize) -> Result<Self> {
        let path = path.as_ref();
        let pixels = std::fs::read(path)?;
        tracing::debug!("Loaded {} ({} bytes)", path.display(), pixels.len());
        Self::new(width, height, pixels)
    }

    /// Load a headerless file that is already at the canonical 224×224.
    ///
    /// # Errors
    ///
    /// As [`RgbImage::load_raw`].
    pub fn load_canonical(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_raw(path, WIDTH, HEIGHT)
    }

    /// Width in pixels.
    pub const fn width(&self) -> usize {
        self.width
    }

    /// Height in pixels.
    pub const fn height(&self) -> usize {
        self.height
    }

    /// Interleaved bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.pixels
    }

    /// Consume into the interleaved bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.pixels
    }

    /// Nearest-neighbour resample to `width × height`.
    #[must_use]
    pub fn resize_nearest(&self, width: usize, height: usize) -> Self {
        if width == self.width && height == self.height {
            return self.clone();
        }
        let mut pixels = Vec::with_capacity(width * height * CHANNELS);
        for y in 0..height {
            let sy = y * self.height / height;
            for x in 0..width {
                let sx = x * self.width / width;
                let at = (sy * self.width + sx) * CHANNELS;
                pixels.extend_from_slice(&self.pixels[at..at + CHANNELS]);
            }
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Resample to the canonical 224×224 input.
    #[must_use]
    pub fn to_canonical(&self) -> Self {
        let out = self.resize_nearest(WIDTH, HEIGHT);
        debug_assert_eq!(out.pixels.len(), BYTES);
        out
    }
}
