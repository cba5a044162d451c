//! Capture event types
//!
//! Defines all event types that can be broadcast through the event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capture::session::SessionState;
use crate::capture::stats::AlarmState;

/// Capture event (sent to subscribers)
///
/// Serialized as
/// ```json
/// {
///   "event": "capture.state_changed",
///   "data": { "device": "cam0", "state": "streaming" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum CaptureEvent {
    /// Session moved to a new state
    #[serde(rename = "capture.state_changed")]
    StateChanged {
        device: String,
        state: SessionState,
    },

    /// No frame arrived within the alarm timeout, or frames resumed
    #[serde(rename = "capture.no_picture_alarm")]
    NoPictureAlarm {
        device: String,
        alarm: AlarmState,
    },

    /// Periodic frame rate report
    #[serde(rename = "capture.frame_rate")]
    FrameRate { device: String, fps: u32 },

    /// A render target was bound to the device
    #[serde(rename = "surface.bound")]
    SurfaceBound {
        device: String,
        /// Surface id, None for a placeholder
        surface: Option<u64>,
    },

    /// The bound render target went away
    #[serde(rename = "surface.lost")]
    SurfaceLost { device: String },

    /// A device call failed outside of a caller's request
    #[serde(rename = "capture.device_error")]
    DeviceError {
        device: String,
        operation: Option<String>,
        message: String,
        at: DateTime<Utc>,
    },
}

impl CaptureEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "capture.state_changed",
            Self::NoPictureAlarm { .. } => "capture.no_picture_alarm",
            Self::FrameRate { .. } => "capture.frame_rate",
            Self::SurfaceBound { .. } => "surface.bound",
            Self::SurfaceLost { .. } => "surface.lost",
            Self::DeviceError { .. } => "capture.device_error",
        }
    }

    /// Check if event name matches a topic pattern
    ///
    /// Supports wildcards:
    /// - `*` matches all events
    /// - `capture.*` matches all capture events
    /// - `surface.lost` matches exact event
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        if let Some(prefix) = topic.strip_suffix(".*") {
            event_name
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.'))
        } else {
            event_name == topic
        }
    }
}
