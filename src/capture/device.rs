//! Capture device abstraction and device metadata
//!
//! A [`CaptureDevice`] is the hardware handle a session drives. The session
//! never owns the device lifetime beyond calling [`CaptureDevice::release`]
//! on detach; callers construct it and hand it over behind an `Arc`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::buffer::FrameBuffer;
use super::surface::SurfaceHandle;
use crate::error::{CaptureError, Result};
use crate::video::format::{PixelFormat, Resolution};

/// Requested hardware configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub resolution: Resolution,
    pub fps: u32,
    pub format: PixelFormat,
}

impl DeviceConfig {
    pub fn new(width: u32, height: u32, fps: u32, format: PixelFormat) -> Self {
        Self {
            resolution: Resolution::new(width, height),
            fps,
            format,
        }
    }

    /// Expected size in bytes of every delivered frame.
    ///
    /// Fails for zero dimensions or frame rate, and for formats without a
    /// fixed frame size.
    pub fn frame_size(&self) -> Result<usize> {
        if self.resolution.is_empty() {
            return Err(CaptureError::InvalidConfiguration(format!(
                "resolution {} has no pixels",
                self.resolution
            )));
        }
        if self.fps == 0 {
            return Err(CaptureError::InvalidConfiguration(
                "frame rate must be non-zero".to_string(),
            ));
        }
        match self.format.frame_size(self.resolution) {
            Some(size) if size > 0 => Ok(size),
            Some(_) => Err(CaptureError::InvalidConfiguration(format!(
                "{} at {} produces an empty frame",
                self.format, self.resolution
            ))),
            None => Err(CaptureError::InvalidConfiguration(format!(
                "{} has no fixed frame size",
                self.format
            ))),
        }
    }
}

impl fmt::Display for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} {}", self.resolution, self.fps, self.format)
    }
}

/// Hardware frame-ready callback: the filled buffer and the number of bytes written
pub type FrameCallback = Arc<dyn Fn(FrameBuffer, usize) + Send + Sync>;

/// Render target the hardware writes preview output into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputTarget {
    /// A real surface supplied by the surface provider
    Surface(SurfaceHandle),
    /// Disposable target installed only because the hardware requires one
    Placeholder(u64),
}

/// Hardware capture device handle.
///
/// Every call may fail; implementations report failures as
/// [`CaptureError::DeviceFailure`]. `enqueue_buffer` and the frame callback
/// may run on any thread. Implementations must not hold internal locks while
/// invoking the frame callback, since the callback re-enters
/// `enqueue_buffer`.
pub trait CaptureDevice: Send + Sync {
    /// Stable device identifier
    fn id(&self) -> &str;

    /// Apply resolution, frame rate and pixel format. Buffers queued under a
    /// previous configuration are discarded.
    fn configure(&self, config: &DeviceConfig) -> Result<()>;

    /// Hand an empty buffer to the hardware input queue
    fn enqueue_buffer(&self, buffer: FrameBuffer) -> Result<()>;

    /// Drop every buffer still in the input queue without filling it
    fn flush_buffers(&self) -> Result<()>;

    /// Register (or clear, with `None`) the frame-ready callback
    fn set_frame_callback(&self, callback: Option<FrameCallback>) -> Result<()>;

    /// Bind (or clear, with `None`) the preview output target
    fn set_output_target(&self, target: Option<OutputTarget>) -> Result<()>;

    fn start_streaming(&self) -> Result<()>;

    /// Stop delivering frames. May block until the hardware has drained.
    fn stop_streaming(&self) -> Result<()>;

    fn set_display_orientation(&self, degrees: u32) -> Result<()>;

    fn release(&self) -> Result<()>;
}

/// Camera facing direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    Front,
    #[default]
    Back,
}

/// Static metadata about a capture device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub name: String,
    pub facing: Facing,
    /// Sensor mounting orientation in degrees
    pub orientation: u32,
    /// Front camera whose display orientation call mirrors before rotating
    pub mirror_quirk: bool,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>, facing: Facing) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            facing,
            orientation: 0,
            mirror_quirk: false,
        }
    }

    pub fn with_mirror_quirk(mut self, mirror_quirk: bool) -> Self {
        self.mirror_quirk = mirror_quirk;
        self
    }

    /// Whether rotation must be compensated for the mirrored display path
    pub fn is_front_facing_with_mirror(&self) -> bool {
        self.facing == Facing::Front && self.mirror_quirk
    }
}

/// Source of per-device metadata
pub trait DeviceInfoProvider: Send + Sync {
    fn describe(&self, device_id: &str) -> Option<DeviceDescriptor>;
}

/// Fixed table of device descriptors
#[derive(Debug, Clone, Default)]
pub struct StaticDeviceInfo {
    devices: HashMap<String, DeviceDescriptor>,
}

impl StaticDeviceInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, descriptor: DeviceDescriptor) -> Self {
        self.devices.insert(descriptor.id.clone(), descriptor);
        self
    }
}

impl DeviceInfoProvider for StaticDeviceInfo {
    fn describe(&self, device_id: &str) -> Option<DeviceDescriptor> {
        self.devices.get(device_id).cloned()
    }
}
