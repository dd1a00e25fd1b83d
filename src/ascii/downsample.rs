//! Area-averaging a grayscale image down to one value per character cell.

use crate::camera::Resolution;

/// Average the pixels under each of `cols` x `rows` cells of `gray` into
/// `buffer`, row-major. Returns the number of cells written.
///
/// Every cell covers at least one pixel, so pictures smaller than the grid
/// repeat pixels instead of leaving dark gaps.
pub fn downsample_into(
    gray: &[u8],
    resolution: Resolution,
    cols: u16,
    rows: u16,
    buffer: &mut Vec<u8>,
) -> usize {
    buffer.clear();
    let (width, height) = (resolution.width, resolution.height);
    if cols == 0 || rows == 0 || width == 0 || height == 0 || gray.is_empty() {
        return 0;
    }

    let cell_w = width as f32 / cols as f32;
    let cell_h = height as f32 / rows as f32;
    buffer.reserve(cols as usize * rows as usize);

    for cy in 0..rows {
        let y0 = ((cy as f32 * cell_h) as u32).min(height - 1);
        let y1 = (((cy + 1) as f32 * cell_h) as u32).clamp(y0 + 1, height);
        for cx in 0..cols {
            let x0 = ((cx as f32 * cell_w) as u32).min(width - 1);
            let x1 = (((cx + 1) as f32 * cell_w) as u32).clamp(x0 + 1, width);

            let mut sum = 0u32;
            let mut count = 0u32;
            for py in y0..y1 {
                let row = (py * width) as usize;
                for px in x0..x1 {
                    if let Some(&value) = gray.get(row + px as usize) {
                        sum += u32::from(value);
                        count += 1;
                    }
                }
            }
            buffer.push(if count > 0 { (sum / count) as u8 } else { 0 });
        }
    }
    buffer.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_averages_each_cell() {
        // 4x2 image: left half dark, right half bright.
        let gray = vec![0, 0, 200, 200, 0, 0, 100, 100];
        let mut cells = Vec::new();
        let n = downsample_into(&gray, Resolution::new(4, 2), 2, 1, &mut cells);
        assert_eq!(n, 2);
        assert_eq!(cells, vec![0, 150]);
    }

    #[test]
    fn test_grid_larger_than_image_repeats_pixels() {
        let gray = vec![10, 250];
        let mut cells = Vec::new();
        downsample_into(&gray, Resolution::new(2, 1), 4, 2, &mut cells);
        assert_eq!(cells, vec![10, 10, 250, 250, 10, 10, 250, 250]);
    }

    #[test]
    fn test_empty_input() {
        let mut cells = vec![1, 2, 3];
        assert_eq!(downsample_into(&[], Resolution::VGA, 10, 10, &mut cells), 0);
        assert!(cells.is_empty());
    }
}
