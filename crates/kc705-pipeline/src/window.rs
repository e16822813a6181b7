//! Bounded row ring for spatial convolution over a row-major stream.
//!
//! A window holds the `K` most recent rows of one channel. Each slot records
//! which image row it currently stores, so a read of a row that has been
//! overwritten (or has not arrived) is detected instead of silently aliasing
//! another row.

use crate::error::{PipelineError, Result};
use crate::fixed::Sample;

/// `K` row buffers of one channel.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    rows: usize,
    width: usize,
    height: usize,
    buffer: Vec<Sample>,
    tags: Vec<Option<usize>>,
    cursor: usize,
}

impl SlidingWindow {
    /// A window of `rows` rows over a `height × width` plane.
    pub fn new(rows: usize, height: usize, width: usize) -> Self {
        let rows = rows.max(1);
        Self {
            rows,
            width,
            height,
            buffer: vec![Sample::ZERO; rows * width],
            tags: vec![None; rows],
            cursor: 0,
        }
    }

    /// Append the next sample in row-major order.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ResourceExhaustion`] if the plane is already
    /// complete.
    pub fn push(&mut self, sample: Sample) -> Result<()> {
        if self.cursor >= self.height * self.width {
            return Err(PipelineError::resource_exhaustion(
                "sliding window",
                self.height * self.width,
            ));
        }
        let row = self.cursor / self.width;
        let col = self.cursor % self.width;
        let slot = row % self.rows;
        if col == 0 {
            self.tags[slot] = Some(row);
        }
        self.buffer[slot * self.width + col] = sample;
        self.cursor += 1;
        Ok(())
    }

    /// Sample at `(row, col)`; coordinates outside the plane read as zero.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidState`] if the coordinate lies inside
    /// the plane but is not currently held by the window.
    pub fn get(&self, row: isize, col: isize) -> Result<Sample> {
        let (Ok(r), Ok(c)) = (usize::try_from(row), usize::try_from(col)) else {
            return Ok(Sample::ZERO);
        };
        if r >= self.height || c >= self.width {
            return Ok(Sample::ZERO);
        }
        let slot = r % self.rows;
        let arrived = r * self.width + c < self.cursor;
        if self.tags[slot] != Some(r) || !arrived {
            return Err(PipelineError::invalid_state(format!(
                "sample ({r}, {c}) not held by a {}-row window",
                self.rows
            )));
        }
        Ok(self.buffer[slot * self.width + c])
    }

    /// Samples pushed in the current plane.
    pub const fn filled(&self) -> usize {
        self.cursor
    }

    /// Forget every row.
    pub fn reset(&mut self) {
        self.tags.fill(None);
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(rows: usize, height: usize, width: usize, count: usize) -> SlidingWindow {
        let mut w = SlidingWindow::new(rows, height, width);
        for i in 0..count {
            w.push(Sample::from_raw(i32::try_from(i).unwrap())).unwrap();
        }
        w
    }

    #[test]
    fn holds_most_recent_rows() {
        let w = filled(3, 5, 4, 14);
        // rows 1, 2 complete, row 3 has two columns
        assert_eq!(w.get(1, 0).unwrap().raw(), 4);
        assert_eq!(w.get(2, 3).unwrap().raw(), 11);
        assert_eq!(w.get(3, 1).unwrap().raw(), 13);
        assert!(w.get(0, 0).is_err(), "row 0 was overwritten");
        assert!(w.get(3, 2).is_err(), "not yet arrived");
    }

    #[test]
    fn outside_plane_reads_zero() {
        let w = filled(3, 2, 2, 4);
        assert_eq!(w.get(-1, 0).unwrap(), Sample::ZERO);
        assert_eq!(w.get(0, 2).unwrap(), Sample::ZERO);
        assert_eq!(w.get(2, 0).unwrap(), Sample::ZERO);
    }

    #[test]
    fn overfull_plane_is_exhaustion() {
        let mut w = filled(2, 2, 2, 4);
        let err = w.push(Sample::ZERO).unwrap_err();
        assert!(matches!(err, PipelineError::ResourceExhaustion { .. }));
        w.reset();
        assert!(w.push(Sample::ZERO).is_ok());
        assert!(w.get(1, 0).is_err());
    }
}
