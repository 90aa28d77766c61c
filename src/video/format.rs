//! Pixel format and resolution definitions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw pixel formats the camera can be asked to deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// YUV 4:2:0 planar (I420)
    #[default]
    I420,
    /// YUYV 4:2:2 packed format
    Yuyv,
    /// MJPEG compressed format
    Mjpeg,
}

impl PixelFormat {
    /// Name understood by the v4l2 demuxer's `-input_format`
    pub fn v4l2_input_format(&self) -> &'static str {
        match self {
            PixelFormat::I420 => "yuv420p",
            PixelFormat::Yuyv => "yuyv422",
            PixelFormat::Mjpeg => "mjpeg",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::I420 => write!(f, "I420"),
            PixelFormat::Yuyv => write!(f, "YUYV"),
            PixelFormat::Mjpeg => write!(f, "MJPEG"),
        }
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "I420" | "YUV420" | "YU12" => Ok(PixelFormat::I420),
            "YUYV" | "YUY2" => Ok(PixelFormat::Yuyv),
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

    /// Check if resolution is valid
    pub fn is_valid(&self) -> bool {
        self.width >= 160 && self.width <= 15360 && self.height >= 120 && self.height <= 8640
    }

    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };
    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
}

impl Default for Resolution {
    fn default() -> Self {
        Resolution::HD720
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u16, u16)> for Resolution {
    fn from((width, height): (u16, u16)) -> Self {
        Self::new(width as u32, height as u32)
    }
}
