//! Data BAR layout.
//!
//! ```text
//! Region   Base          Size       Contents
//! ──────── ───────────── ────────── ─────────────────────────────────────────
//! result   0x0000_2000   16 B       class_id, confidence, timing_us, reserved
//! image    0x0010_0000   256 KiB    one interleaved RGB image (150 528 B used)
//! weights  0x0020_0000   30 MiB     blob length u32, then the packed weight blob
//! ```
//!
//! The image region holds a full canonical 224×224×3 image. Earlier board
//! firmware reserved only 4 KiB at `0x1000`, which cannot hold the canonical
//! input; that layout is not supported.

use crate::image;

/// A contiguous region inside the data BAR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Region name, for diagnostics.
    pub name: &'static str,
    /// Byte offset from the start of the data BAR.
    pub base: usize,
    /// Size in bytes.
    pub size: usize,
}

impl Region {
    /// One past the last byte of the region.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.base + self.size
    }

    /// True if `[offset, offset + len)` lies entirely inside the region.
    #[must_use]
    pub const fn contains(&self, offset: usize, len: usize) -> bool {
        offset >= self.base && offset + len <= self.end()
    }
}

/// Result region: three little-endian `u32` words plus one reserved word.
pub const RESULT: Region = Region {
    name: "result",
    base: 0x0000_2000,
    size: 16,
};

/// Image upload region.
pub const IMAGE: Region = Region {
    name: "image",
    base: 0x0010_0000,
    size: 0x0004_0000,
};

/// Weight region.
pub const WEIGHTS: Region = Region {
    name: "weights",
    base: 0x0020_0000,
    size: 0x01E0_0000,
};

/// All regions, in address order.
pub const REGIONS: [Region; 3] = [RESULT, IMAGE, WEIGHTS];

/// Minimum size of the data BAR.
pub const DATA_SPACE_BYTES: usize = WEIGHTS.end();

/// Word offsets inside the result region.
pub mod result {
    /// Predicted class index.
    pub const CLASS_ID: usize = 0;
    /// Confidence in parts per [`crate::image::CONFIDENCE_SCALE`].
    pub const CONFIDENCE: usize = 4;
    /// Device-side processing time in microseconds.
    pub const TIMING_US: usize = 8;
    /// Bytes the host reads.
    pub const LEN: usize = 12;
}

/// Byte offsets of a weight record, relative to `WEIGHT_ADDR`.
pub mod weights {
    /// Blob length in bytes (u32, little-endian).
    pub const LENGTH: usize = 0;
    /// First byte of the packed blob.
    pub const BLOB: usize = 4;
}

/// Find the region containing `[offset, offset + len)`.
#[must_use]
pub fn region_for(offset: usize, len: usize) -> Option<Region> {
    REGIONS.iter().copied().find(|r| r.contains(offset, len))
}

const _: () = assert!(IMAGE.size >= image::BYTES);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_region_holds_canonical_image() {
        assert!(IMAGE.size >= 224 * 224 * 3);
    }

    #[test]
    fn data_space_is_a_32_mib_bar() {
        assert_eq!(DATA_SPACE_BYTES, 32 << 20);
    }

    #[test]
    fn regions_do_not_overlap() {
        for (i, a) in REGIONS.iter().enumerate() {
            for b in &REGIONS[i + 1..] {
                assert!(a.end() <= b.base || b.end() <= a.base, "{} overlaps {}", a.name, b.name);
            }
        }
    }

    #[test]
    fn region_lookup() {
        assert_eq!(region_for(IMAGE.base, image::BYTES), Some(IMAGE));
        assert_eq!(region_for(RESULT.base + 4, 4), Some(RESULT));
        assert_eq!(region_for(IMAGE.base + IMAGE.size - 2, 4), None);
        assert_eq!(region_for(0, 4), None);
    }
}
