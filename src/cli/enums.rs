//! CLI enum types.

use clap::ValueEnum;

use crate::camera::PixelFormat;

/// Pixel format requested from the cameras.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum InputFormat {
    #[default]
    #[value(alias = "mjpg")]
    Mjpeg,
    #[value(alias = "yuyv422", alias = "yuy2")]
    Yuyv,
    H264,
}

impl From<InputFormat> for PixelFormat {
    fn from(f: InputFormat) -> Self {
        match f {
            InputFormat::Mjpeg => PixelFormat::Mjpeg,
            InputFormat::Yuyv => PixelFormat::Yuyv,
            InputFormat::H264 => PixelFormat::H264,
        }
    }
}
