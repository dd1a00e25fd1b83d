//! Stream format negotiation.
//!
//! A device advertises a list of [`SupportedMode`]s. [`negotiate`] picks the
//! mode to request according to the [`FormatPolicy`], and [`reconcile`]
//! checks what the driver actually applied.

use super::types::{PixelFormat, Resolution, StreamFormat};

/// What to do when a device cannot deliver the exact requested format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatPolicy {
    /// Fail the camera with `UnsupportedFormat`
    #[default]
    Strict,
    /// Use the closest supported mode and record the deviation
    ClosestMatch,
}

/// One pixel format + resolution combination and the frame rates offered for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedMode {
    pub pixel_format: PixelFormat,
    pub resolution: Resolution,
    pub framerates: Vec<u32>,
}

impl SupportedMode {
    pub fn new(pixel_format: PixelFormat, resolution: Resolution, framerates: Vec<u32>) -> Self {
        Self {
            pixel_format,
            resolution,
            framerates,
        }
    }

    /// An empty rate list means the driver did not enumerate intervals for
    /// this size; any rate is accepted and checked again by [`reconcile`].
    fn offers(&self, format: &StreamFormat) -> bool {
        self.pixel_format == format.pixel_format
            && self.resolution == format.resolution
            && (self.framerates.is_empty() || self.framerates.contains(&format.framerate))
    }

    fn nearest_framerate(&self, wanted: u32) -> u32 {
        self.framerates
            .iter()
            .copied()
            .min_by_key(|fps| fps.abs_diff(wanted))
            .unwrap_or(wanted)
    }
}

/// Requested and actually used format of a camera that fell back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatDeviation {
    pub requested: StreamFormat,
    pub actual: StreamFormat,
}

/// Result of negotiation: the format to stream with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub format: StreamFormat,
    pub deviation: Option<FormatDeviation>,
}

impl NegotiatedFormat {
    pub fn exact(format: StreamFormat) -> Self {
        Self {
            format,
            deviation: None,
        }
    }

    fn deviating(requested: StreamFormat, actual: StreamFormat) -> Self {
        if requested == actual {
            return Self::exact(actual);
        }
        Self {
            format: actual,
            deviation: Some(FormatDeviation { requested, actual }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("no supported mode matches {requested}")]
    NoExactMode { requested: StreamFormat },
    #[error("device advertises no usable modes")]
    NoModes,
    #[error("driver applied {actual} instead of {requested}")]
    DriverSubstituted {
        requested: StreamFormat,
        actual: StreamFormat,
    },
    #[error("driver switched to unsupported pixel format '{0}'")]
    UnknownPixelFormat(String),
}

/// Choose the format to request from a device.
///
/// An empty `modes` list means the driver does not enumerate its modes; the
/// request is then passed through and checked later by [`reconcile`].
pub fn negotiate(
    requested: StreamFormat,
    modes: &[SupportedMode],
    policy: FormatPolicy,
) -> Result<NegotiatedFormat, FormatError> {
    if modes.is_empty() || modes.iter().any(|m| m.offers(&requested)) {
        return Ok(NegotiatedFormat::exact(requested));
    }
    if policy == FormatPolicy::Strict {
        return Err(FormatError::NoExactMode { requested });
    }

    let same_format = modes
        .iter()
        .any(|m| m.pixel_format == requested.pixel_format);
    let closest = modes
        .iter()
        .filter(|m| !same_format || m.pixel_format == requested.pixel_format)
        .min_by_key(|m| {
            let fps = m.nearest_framerate(requested.framerate);
            (
                m.resolution.area().abs_diff(requested.resolution.area()),
                fps.abs_diff(requested.framerate),
            )
        })
        .ok_or(FormatError::NoModes)?;

    let actual = StreamFormat::new(
        closest.resolution,
        closest.nearest_framerate(requested.framerate),
        closest.pixel_format,
    );
    Ok(NegotiatedFormat::deviating(requested, actual))
}

/// Compare the format the driver echoed back with the one we asked for.
pub fn reconcile(
    requested: StreamFormat,
    negotiated: NegotiatedFormat,
    applied: StreamFormat,
    policy: FormatPolicy,
) -> Result<NegotiatedFormat, FormatError> {
    if applied == negotiated.format {
        return Ok(negotiated);
    }
    match policy {
        FormatPolicy::Strict => Err(FormatError::DriverSubstituted {
            requested,
            actual: applied,
        }),
        FormatPolicy::ClosestMatch => Ok(NegotiatedFormat::deviating(requested, applied)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c920_modes() -> Vec<SupportedMode> {
        vec![
            SupportedMode::new(PixelFormat::Yuyv, Resolution::VGA, vec![30, 15]),
            SupportedMode::new(PixelFormat::Yuyv, Resolution::HD, vec![10, 5]),
            SupportedMode::new(PixelFormat::Mjpeg, Resolution::VGA, vec![30, 15]),
            SupportedMode::new(PixelFormat::Mjpeg, Resolution::HD, vec![30, 24, 15]),
            SupportedMode::new(PixelFormat::Mjpeg, Resolution::new(1920, 1080), vec![30]),
        ]
    }

    #[test]
    fn test_exact_mode_is_used_as_is() {
        let requested = StreamFormat::new(Resolution::HD, 30, PixelFormat::Mjpeg);
        let negotiated = negotiate(requested, &c920_modes(), FormatPolicy::Strict).unwrap();
        assert_eq!(negotiated, NegotiatedFormat::exact(requested));
    }

    #[test]
    fn test_strict_rejects_missing_mode() {
        let requested = StreamFormat::new(Resolution::HD, 60, PixelFormat::Mjpeg);
        let err = negotiate(requested, &c920_modes(), FormatPolicy::Strict).unwrap_err();
        assert_eq!(err, FormatError::NoExactMode { requested });
    }

    #[test]
    fn test_closest_prefers_same_pixel_format() {
        let requested = StreamFormat::new(Resolution::HD, 60, PixelFormat::Mjpeg);
        let negotiated =
            negotiate(requested, &c920_modes(), FormatPolicy::ClosestMatch).unwrap();
        let expected = StreamFormat::new(Resolution::HD, 30, PixelFormat::Mjpeg);
        assert_eq!(negotiated.format, expected);
        assert_eq!(
            negotiated.deviation,
            Some(FormatDeviation {
                requested,
                actual: expected
            })
        );
    }

    #[test]
    fn test_closest_picks_nearest_resolution() {
        let requested = StreamFormat::new(Resolution::new(1600, 900), 30, PixelFormat::Mjpeg);
        let negotiated =
            negotiate(requested, &c920_modes(), FormatPolicy::ClosestMatch).unwrap();
        // 1600x900 = 1.44MP: 1280x720 (0.92MP) is closer than 1920x1080 (2.07MP)
        assert_eq!(negotiated.format.resolution, Resolution::HD);
    }

    #[test]
    fn test_closest_falls_back_to_other_pixel_format() {
        let modes = vec![SupportedMode::new(PixelFormat::Yuyv, Resolution::VGA, vec![30])];
        let requested = StreamFormat::new(Resolution::HD, 30, PixelFormat::Mjpeg);
        let negotiated = negotiate(requested, &modes, FormatPolicy::ClosestMatch).unwrap();
        assert_eq!(negotiated.format.pixel_format, PixelFormat::Yuyv);
        assert!(negotiated.deviation.is_some());
    }

    #[test]
    fn test_unknown_modes_pass_request_through() {
        let requested = StreamFormat::new(Resolution::HD, 30, PixelFormat::H264);
        let negotiated = negotiate(requested, &[], FormatPolicy::Strict).unwrap();
        assert_eq!(negotiated, NegotiatedFormat::exact(requested));
    }

    #[test]
    fn test_mode_without_enumerated_rates_accepts_requested_rate() {
        let modes = vec![
            SupportedMode::new(PixelFormat::Mjpeg, Resolution::VGA, vec![30]),
            SupportedMode::new(PixelFormat::Mjpeg, Resolution::HD, Vec::new()),
        ];
        let requested = StreamFormat::new(Resolution::HD, 30, PixelFormat::Mjpeg);
        let negotiated = negotiate(requested, &modes, FormatPolicy::Strict).unwrap();
        assert_eq!(negotiated, NegotiatedFormat::exact(requested));

        // The driver still has the final word on the rate.
        let applied = StreamFormat::new(Resolution::HD, 15, PixelFormat::Mjpeg);
        assert!(reconcile(requested, negotiated, applied, FormatPolicy::Strict).is_err());
    }

    #[test]
    fn test_reconcile_strict_rejects_driver_substitution() {
        let requested = StreamFormat::new(Resolution::HD, 30, PixelFormat::Mjpeg);
        let applied = StreamFormat::new(Resolution::VGA, 30, PixelFormat::Mjpeg);
        let err = reconcile(
            requested,
            NegotiatedFormat::exact(requested),
            applied,
            FormatPolicy::Strict,
        )
        .unwrap_err();
        assert!(matches!(err, FormatError::DriverSubstituted { .. }));
    }

    #[test]
    fn test_reconcile_lenient_records_deviation() {
        let requested = StreamFormat::new(Resolution::HD, 30, PixelFormat::Mjpeg);
        let applied = StreamFormat::new(Resolution::HD, 25, PixelFormat::Mjpeg);
        let negotiated = reconcile(
            requested,
            NegotiatedFormat::exact(requested),
            applied,
            FormatPolicy::ClosestMatch,
        )
        .unwrap();
        assert_eq!(negotiated.format, applied);
        assert_eq!(negotiated.deviation.map(|d| d.requested), Some(requested));
    }
}
