//! Display orientation compensation

use serde::{Deserialize, Serialize};

use super::device::DeviceDescriptor;

/// Display rotation requested by the owner, normalized to `[0, 360)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rotation {
    /// Rotation as requested
    pub requested: u32,
    /// Rotation actually sent to the device
    pub effective: u32,
}

impl Rotation {
    pub fn for_device(requested: u32, descriptor: &DeviceDescriptor) -> Self {
        let requested = requested % 360;
        Self {
            requested,
            effective: effective_rotation(requested, descriptor.is_front_facing_with_mirror()),
        }
    }
}

/// Orientation to pass to the device for a requested display rotation.
///
/// Front cameras with the mirror quirk flip horizontally before rotating, so
/// the rotation direction is inverted for them.
pub fn effective_rotation(requested_degrees: u32, front_facing_with_mirror: bool) -> u32 {
    let requested = requested_degrees % 360;
    if front_facing_with_mirror {
        (360 - requested) % 360
    } else {
        requested
    }
}
