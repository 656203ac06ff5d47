//! Pixel format codes and negotiated format descriptors

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{MediaError, Result};

/// Maximum number of planes a buffer may carry (`VIDEO_MAX_PLANES`)
pub const MAX_PLANES: usize = 8;

/// `V4L2_FIELD_ANY`: let the driver choose the field order
pub const FIELD_ANY: u32 = 0;
/// `V4L2_FIELD_NONE`: progressive frames
pub const FIELD_NONE: u32 = 1;

/// V4L2 pixel format code (little-endian FourCC)
///
/// Frames are opaque to this crate, so the code is carried through
/// unchanged from configuration to the driver and onto the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PixelFormat(u32);

impl PixelFormat {
    pub const SBGGR8: PixelFormat = PixelFormat::from_fourcc(b"BA81");
    /// 10-bit Bayer BGGR, the default raw sensor format
    pub const SBGGR10: PixelFormat = PixelFormat::from_fourcc(b"BG10");
    pub const YUYV: PixelFormat = PixelFormat::from_fourcc(b"YUYV");
    pub const NV12: PixelFormat = PixelFormat::from_fourcc(b"NV12");
    pub const MJPEG: PixelFormat = PixelFormat::from_fourcc(b"MJPG");
    pub const GREY: PixelFormat = PixelFormat::from_fourcc(b"GREY");

    pub const fn from_fourcc(code: &[u8; 4]) -> Self {
        Self(u32::from_le_bytes(*code))
    }

    pub const fn from_u32(code: u32) -> Self {
        Self(code)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub fn fourcc(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.fourcc();
        if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            write!(f, "{}", String::from_utf8_lossy(&bytes))
        } else {
            write!(f, "0x{:08x}", self.0)
        }
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = MediaError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            return u32::from_str_radix(hex, 16)
                .map(PixelFormat)
                .map_err(|e| MediaError::InvalidParam(format!("Bad pixel format {}: {}", s, e)));
        }
        let bytes = s.as_bytes();
        if bytes.len() != 4 || !bytes.is_ascii() {
            return Err(MediaError::InvalidParam(format!(
                "Pixel format must be a FourCC or 0x-prefixed code: {}",
                s
            )));
        }
        Ok(PixelFormat::from_fourcc(&[bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl TryFrom<String> for PixelFormat {
    type Error = MediaError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PixelFormat> for String {
    fn from(value: PixelFormat) -> Self {
        value.to_string()
    }
}

/// Which V4L2 buffer API a device context uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaneMode {
    /// `V4L2_BUF_TYPE_VIDEO_CAPTURE`, one plane per buffer
    Single,
    /// `V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE`
    #[default]
    Multi,
}

impl fmt::Display for PlaneMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaneMode::Single => write!(f, "single-plane"),
            PlaneMode::Multi => write!(f, "multi-plane"),
        }
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Requested or negotiated capture format
///
/// `plane_sizes` has one entry per negotiated plane; the frame size is
/// their sum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub field: u32,
    pub plane_sizes: Vec<u32>,
}

impl FormatDescriptor {
    /// Single-plane format with one plane of `plane_size` bytes
    pub fn single(width: u32, height: u32, pixel_format: PixelFormat, plane_size: u32) -> Self {
        Self {
            width,
            height,
            pixel_format,
            field: FIELD_ANY,
            plane_sizes: vec![plane_size],
        }
    }

    pub fn multi(width: u32, height: u32, pixel_format: PixelFormat, plane_sizes: Vec<u32>) -> Self {
        Self {
            width,
            height,
            pixel_format,
            field: FIELD_ANY,
            plane_sizes,
        }
    }

    pub fn num_planes(&self) -> usize {
        self.plane_sizes.len()
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Total frame size in bytes (sum of plane sizes)
    pub fn frame_size(&self) -> usize {
        self.plane_sizes.iter().map(|s| *s as usize).sum()
    }

    /// Check that this descriptor can be requested in `mode`
    pub fn validate(&self, mode: PlaneMode) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(MediaError::InvalidParam(format!(
                "Invalid resolution {}",
                self.resolution()
            )));
        }
        let planes = self.num_planes();
        if planes == 0 || planes > MAX_PLANES {
            return Err(MediaError::InvalidParam(format!(
                "Plane count must be 1..={}, got {}",
                MAX_PLANES, planes
            )));
        }
        if mode == PlaneMode::Single && planes != 1 {
            return Err(MediaError::InvalidParam(format!(
                "Single-plane capture requires exactly one plane, got {}",
                planes
            )));
        }
        Ok(())
    }
}

impl fmt::Display for FormatDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} {} ({} plane{}, {} bytes)",
            self.width,
            self.height,
            self.pixel_format,
            self.num_planes(),
            if self.num_planes() == 1 { "" } else { "s" },
            self.frame_size()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_parse_and_display() {
        let fmt: PixelFormat = "BG10".parse().unwrap();
        assert_eq!(fmt, PixelFormat::SBGGR10);
        assert_eq!(fmt.to_string(), "BG10");

        let hex: PixelFormat = "0x56595559".parse().unwrap();
        assert_eq!(hex, PixelFormat::YUYV);

        assert!("NV1".parse::<PixelFormat>().is_err());
        assert!("0xZZ".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn test_frame_size_sums_planes() {
        let fmt = FormatDescriptor::multi(1280, 720, PixelFormat::NV12, vec![921_600, 460_800]);
        assert_eq!(fmt.num_planes(), 2);
        assert_eq!(fmt.frame_size(), 1_382_400);
    }

    #[test]
    fn test_validate_plane_counts() {
        let single = FormatDescriptor::single(640, 480, PixelFormat::YUYV, 614_400);
        assert!(single.validate(PlaneMode::Single).is_ok());
        assert!(single.validate(PlaneMode::Multi).is_ok());

        let two = FormatDescriptor::multi(640, 480, PixelFormat::NV12, vec![307_200, 153_600]);
        assert!(two.validate(PlaneMode::Single).is_err());
        assert!(two.validate(PlaneMode::Multi).is_ok());

        let none = FormatDescriptor::multi(640, 480, PixelFormat::NV12, vec![]);
        assert!(none.validate(PlaneMode::Multi).is_err());

        let too_many = FormatDescriptor::multi(640, 480, PixelFormat::NV12, vec![1; MAX_PLANES + 1]);
        assert!(too_many.validate(PlaneMode::Multi).is_err());

        let empty = FormatDescriptor::single(0, 480, PixelFormat::YUYV, 0);
        assert!(empty.validate(PlaneMode::Single).is_err());
    }
}
