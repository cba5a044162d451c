use serde::{Deserialize, Serialize};

use crate::capture::buffer::DEFAULT_BUFFER_COUNT;
use crate::capture::device::{DeviceDescriptor, Facing};
use crate::error::{CaptureError, Result};
use crate::video::format::PixelFormat;

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Capture session behaviour
    pub capture: CaptureSettings,
    /// Which device to open and how to describe it
    pub device: DeviceSettings,
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        self.capture.validate()?;
        self.device.validate()
    }
}

/// What `request_start` does when called with new parameters while streaming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconfigurePolicy {
    /// Refuse with `AlreadyStreamingConflict`
    #[default]
    Reject,
    /// Stop, then start with the new parameters
    Restart,
}

/// Capture session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Buffers cycled between hardware and delivery
    pub buffer_count: usize,
    /// Pixel format requested from the hardware
    pub pixel_format: PixelFormat,
    pub reconfigure: ReconfigurePolicy,
    /// Install a placeholder target when no surface provider exists
    pub placeholder_when_no_surface: bool,
    /// Window for the frame rate estimate
    pub frame_rate_window_ms: u64,
    /// Stall duration before the no-picture alarm is raised
    pub no_picture_timeout_ms: u64,
    /// Raise and clear the no-picture alarm from `process`
    pub no_picture_alarm: bool,
    /// Publish the measured frame rate from `process`
    pub frame_rate_events: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            buffer_count: DEFAULT_BUFFER_COUNT,
            pixel_format: PixelFormat::Nv21,
            reconfigure: ReconfigurePolicy::Reject,
            placeholder_when_no_surface: true,
            frame_rate_window_ms: 2000,
            no_picture_timeout_ms: 1000,
            no_picture_alarm: true,
            frame_rate_events: true,
        }
    }
}

impl CaptureSettings {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_count == 0 {
            return Err(CaptureError::Config(
                "capture.buffer_count must be at least 1".to_string(),
            ));
        }
        if self.pixel_format.is_compressed() {
            return Err(CaptureError::Config(format!(
                "capture.pixel_format {} has no fixed frame size",
                self.pixel_format
            )));
        }
        if self.frame_rate_window_ms == 0 || self.no_picture_timeout_ms == 0 {
            return Err(CaptureError::Config(
                "capture timing windows must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Capture backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceBackend {
    /// In-process simulated camera
    #[default]
    Virtual,
    /// V4L2 device node (requires the `v4l2` feature)
    V4l2,
}

/// Device configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub backend: DeviceBackend,
    /// Device node for the V4L2 backend
    pub path: String,
    /// Identifier used for logging and events
    pub id: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub facing: Facing,
    pub mirror_quirk: bool,
    /// Sensor mounting orientation in degrees
    pub orientation: u32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            backend: DeviceBackend::Virtual,
            path: "/dev/video0".to_string(),
            id: "virtual0".to_string(),
            width: 640,
            height: 480,
            fps: 30,
            facing: Facing::Back,
            mirror_quirk: false,
            orientation: 0,
        }
    }
}

impl DeviceSettings {
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(CaptureError::Config(format!(
                "device resolution {}x{} is empty",
                self.width, self.height
            )));
        }
        if self.fps == 0 {
            return Err(CaptureError::Config("device.fps must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            id: self.id.clone(),
            name: match self.backend {
                DeviceBackend::Virtual => format!("Virtual camera {}", self.id),
                DeviceBackend::V4l2 => self.path.clone(),
            },
            facing: self.facing,
            orientation: self.orientation,
            mirror_quirk: self.mirror_quirk,
        }
    }
}
