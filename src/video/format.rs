//! Pixel format definitions and frame size math

use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported capture pixel formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// NV21 semi-planar format (Y plane + interleaved VU), the usual camera preview default
    #[default]
    Nv21,
    /// NV12 semi-planar format (Y plane + interleaved UV)
    Nv12,
    /// YUV420 planar format (I420)
    Yuv420,
    /// YVU420 planar format (YV12)
    Yvu420,
    /// YUYV 4:2:2 packed format
    Yuyv,
    /// RGB565 format
    Rgb565,
    /// RGB24 format (3 bytes per pixel)
    Rgb24,
    /// MJPEG compressed format (variable frame size)
    Mjpeg,
}

impl PixelFormat {
    /// Convert to V4L2 FourCC
    #[cfg(feature = "v4l2")]
    pub fn to_fourcc(&self) -> v4l::FourCC {
        match self {
            PixelFormat::Nv21 => v4l::FourCC::new(b"NV21"),
            PixelFormat::Nv12 => v4l::FourCC::new(b"NV12"),
            PixelFormat::Yuv420 => v4l::FourCC::new(b"YU12"),
            PixelFormat::Yvu420 => v4l::FourCC::new(b"YV12"),
            PixelFormat::Yuyv => v4l::FourCC::new(b"YUYV"),
            PixelFormat::Rgb565 => v4l::FourCC::new(b"RGBP"),
            PixelFormat::Rgb24 => v4l::FourCC::new(b"RGB3"),
            PixelFormat::Mjpeg => v4l::FourCC::new(b"MJPG"),
        }
    }

    /// Try to convert from V4L2 FourCC
    #[cfg(feature = "v4l2")]
    pub fn from_fourcc(fourcc: v4l::FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"NV21" => Some(PixelFormat::Nv21),
            b"NV12" => Some(PixelFormat::Nv12),
            b"YU12" | b"I420" => Some(PixelFormat::Yuv420),
            b"YV12" => Some(PixelFormat::Yvu420),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"RGBP" => Some(PixelFormat::Rgb565),
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            _ => None,
        }
    }

    /// Check if format is compressed
    pub fn is_compressed(&self) -> bool {
        matches!(self, PixelFormat::Mjpeg)
    }

    /// Bits per pixel for uncompressed formats.
    /// Returns None for compressed formats.
    pub fn bits_per_pixel(&self) -> Option<u32> {
        match self {
            PixelFormat::Nv21 | PixelFormat::Nv12 | PixelFormat::Yuv420 | PixelFormat::Yvu420 => {
                Some(12)
            }
            PixelFormat::Yuyv | PixelFormat::Rgb565 => Some(16),
            PixelFormat::Rgb24 => Some(24),
            PixelFormat::Mjpeg => None,
        }
    }

    /// Size in bytes of one frame at `resolution`: `width * height * bpp / 8`.
    /// Returns None for compressed formats and for sizes that do not fit in `usize`.
    pub fn frame_size(&self, resolution: Resolution) -> Option<usize> {
        let bits = self.bits_per_pixel()? as u64;
        let bytes = resolution.pixels().checked_mul(bits)? / 8;
        usize::try_from(bytes).ok()
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Nv21 => "NV21",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Yuv420 => "YUV420",
            PixelFormat::Yvu420 => "YVU420",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Rgb565 => "RGB565",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Mjpeg => "MJPEG",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "NV21" => Ok(PixelFormat::Nv21),
            "NV12" => Ok(PixelFormat::Nv12),
            "YUV420" | "I420" => Ok(PixelFormat::Yuv420),
            "YVU420" | "YV12" => Ok(PixelFormat::Yvu420),
            "YUYV" => Ok(PixelFormat::Yuyv),
            "RGB565" => Ok(PixelFormat::Rgb565),
            "RGB24" => Ok(PixelFormat::Rgb24),
            "MJPEG" | "MJPG" => Ok(PixelFormat::Mjpeg),
            _ => Err(format!("Unknown pixel format: {}", s)),
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

    /// Get total pixels
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub const QVGA: Resolution = Resolution {
        width: 320,
        height: 240,
    };
    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };
    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}
