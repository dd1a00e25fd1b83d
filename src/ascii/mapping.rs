//! Brightness to character mapping.

/// Density ramp from darkest to brightest.
pub const RAMP: &[char] = &[' ', '.', ':', '-', '=', '+', '*', '#', '%', '@'];

/// Display gamma used to spread mid-tones over the ramp.
pub const GAMMA: f32 = 2.2;

fn gamma_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        *slot = ((i as f32 / 255.0).powf(1.0 / GAMMA) * 255.0).round() as u8;
    }
    table
}

/// Maps cell brightness to ramp characters with gamma correction.
#[derive(Debug, Clone)]
pub struct CharMapper {
    gamma: [u8; 256],
}

impl CharMapper {
    pub fn new() -> Self {
        Self {
            gamma: gamma_table(),
        }
    }

    pub fn map(&self, brightness: u8) -> char {
        let corrected = self.gamma[brightness as usize] as usize;
        RAMP[corrected * (RAMP.len() - 1) / 255]
    }
}

impl Default for CharMapper {
    fn default() -> Self {
        Self::new()
    }
}
