//! Camera capture session
//!
//! This module coordinates a capture device, its render target and a pool
//! of frame buffers, and hands finished frames to a [`FrameSink`].

pub mod buffer;
pub mod delivery;
pub mod device;
pub mod rotation;
pub mod session;
pub mod stats;
pub mod surface;
#[cfg(feature = "v4l2")]
pub mod v4l2_device;
pub mod virtual_device;

pub use buffer::{BufferOrigin, FrameBuffer, FrameBufferPool, DEFAULT_BUFFER_COUNT};
pub use delivery::{FrameDelivery, FrameSink, SinkContext};
pub use device::{
    CaptureDevice, DeviceConfig, DeviceDescriptor, DeviceInfoProvider, Facing, FrameCallback,
    OutputTarget, StaticDeviceInfo,
};
pub use rotation::{effective_rotation, Rotation};
pub use session::{CaptureSession, CaptureSessionBuilder, SessionState};
pub use stats::{AlarmState, CaptureStats};
pub use surface::{
    LocalSurface, SurfaceAvailability, SurfaceBinding, SurfaceEvents, SurfaceHandle,
    SurfaceProvider,
};
#[cfg(feature = "v4l2")]
pub use v4l2_device::V4l2Device;
pub use virtual_device::{Fault, VirtualDevice};
