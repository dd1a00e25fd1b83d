//! ASCII rendering of camera frames for the terminal preview.
//!
//! Frames go through three stages:
//!
//! 1. **Luma** - take the grayscale plane straight from the raw buffer
//! 2. **Downsampling** - average pixels into a character grid that keeps
//!    the picture's aspect ratio
//! 3. **Mapping** - turn cell brightness into a density ramp character
//!
//! Only uncompressed formats can be rendered; decoding MJPEG or H.264 for a
//! preview is left to the recording.

mod dimensions;
mod downsample;
mod luma;
mod mapping;

pub use dimensions::{fit, CHAR_ASPECT_RATIO};
pub use downsample::downsample_into;
pub use luma::luma_into;
pub use mapping::{CharMapper, RAMP};

use crate::camera::Frame;

/// Reusable frame-to-text renderer bounded to `max_cols` x `max_rows`.
#[derive(Debug, Clone)]
pub struct AsciiRenderer {
    max_cols: u16,
    max_rows: u16,
    mapper: CharMapper,
    luma: Vec<u8>,
    cells: Vec<u8>,
}

impl AsciiRenderer {
    pub fn new(max_cols: u16, max_rows: u16) -> Self {
        Self {
            max_cols,
            max_rows,
            mapper: CharMapper::new(),
            luma: Vec::new(),
            cells: Vec::new(),
        }
    }

    /// Render `frame` as rows of text, or `None` when it has no picture
    /// that can be shown without decoding.
    pub fn render(&mut self, frame: &Frame) -> Option<Vec<String>> {
        let resolution = luma_into(frame, &mut self.luma)?;
        let (cols, rows) = fit(resolution, self.max_cols, self.max_rows);
        if downsample_into(&self.luma, resolution, cols, rows, &mut self.cells) == 0 {
            return None;
        }
        Some(
            self.cells
                .chunks(cols as usize)
                .map(|row| row.iter().map(|&b| self.mapper.map(b)).collect())
                .collect(),
        )
    }
}
