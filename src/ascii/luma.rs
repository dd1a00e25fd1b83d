//! Luminance extraction from raw camera buffers.

use crate::camera::{Frame, PixelFormat, Resolution};

/// Copy the grayscale image of `frame` into `buffer`.
///
/// YUYV packs each pixel pair as `Y0 U Y1 V`, so the even bytes already form
/// the luma plane and no color conversion is needed. Compressed formats have
/// no plane to read and yield `None`, as does a payload shorter than the
/// frame's resolution.
pub fn luma_into(frame: &Frame, buffer: &mut Vec<u8>) -> Option<Resolution> {
    let resolution = frame.format.resolution;
    match frame.format.pixel_format {
        PixelFormat::Yuyv => {
            let pixels = resolution.width as usize * resolution.height as usize;
            if pixels == 0 || frame.payload.len() < pixels * 2 {
                return None;
            }
            buffer.clear();
            buffer.reserve(pixels);
            buffer.extend(frame.payload[..pixels * 2].iter().step_by(2).copied());
            Some(resolution)
        }
        PixelFormat::Mjpeg | PixelFormat::H264 => None,
    }
}
