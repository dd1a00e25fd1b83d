//! Fitting a picture into a character grid.

use crate::camera::Resolution;

/// Terminal cells are roughly twice as tall as they are wide.
pub const CHAR_ASPECT_RATIO: f32 = 2.0;

/// Largest `(columns, rows)` grid within `max_cols` x `max_rows` that shows
/// `resolution` without stretching it.
pub fn fit(resolution: Resolution, max_cols: u16, max_rows: u16) -> (u16, u16) {
    if resolution.width == 0 || resolution.height == 0 || max_cols == 0 || max_rows == 0 {
        return (0, 0);
    }

    // Columns per row that keep the picture's proportions on screen.
    let cell_aspect = resolution.width as f32 / resolution.height as f32 * CHAR_ASPECT_RATIO;

    let rows = (max_cols as f32 / cell_aspect).round() as u16;
    if rows > 0 && rows <= max_rows {
        return (max_cols, rows);
    }
    let cols = ((max_rows as f32 * cell_aspect).round() as u16).min(max_cols);
    (cols.max(1), max_rows)
}
