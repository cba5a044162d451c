//! Capture statistics: frame counters, frame rate and the no-picture alarm

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of frame arrival times kept for rate estimation
const FRAME_HISTORY_SIZE: usize = 90;

/// Snapshot of capture counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    /// Frames forwarded to the sink
    pub frames_delivered: u64,
    /// Frames that arrived after streaming was stopped
    pub frames_dropped_stopped: u64,
    /// Frames whose length did not match the active configuration
    pub frames_dropped_size: u64,
    /// Buffers from an earlier pool dropped on reclaim
    pub stale_buffers: u64,
    /// Frame rate over the configured window
    pub current_fps: u32,
    /// Generation of the active buffer pool (0 = none yet)
    pub pool_generation: u64,
}

/// Sliding history of frame arrival times
#[derive(Debug, Clone)]
pub struct FrameRateTracker {
    /// Newest first
    arrivals: VecDeque<Instant>,
    window: Duration,
}

impl FrameRateTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            arrivals: VecDeque::with_capacity(FRAME_HISTORY_SIZE),
            window,
        }
    }

    pub fn record(&mut self, at: Instant) {
        if self.arrivals.len() == FRAME_HISTORY_SIZE {
            self.arrivals.pop_back();
        }
        self.arrivals.push_front(at);
    }

    pub fn last_arrival(&self) -> Option<Instant> {
        self.arrivals.front().copied()
    }

    /// Frames per second over arrivals younger than the window, rounded
    pub fn rate(&self, now: Instant) -> u32 {
        let mut frames = 0u32;
        let mut oldest = None;
        for at in &self.arrivals {
            if now.saturating_duration_since(*at) > self.window {
                break;
            }
            frames += 1;
            oldest = Some(*at);
        }

        let Some(oldest) = oldest else {
            return 0;
        };
        let span_ms = now.saturating_duration_since(oldest).as_millis() as u64;
        if span_ms == 0 {
            return frames;
        }
        ((frames as u64 * 1000 + span_ms / 2) / span_ms) as u32
    }

    pub fn clear(&mut self) {
        self.arrivals.clear();
    }
}

/// No-picture alarm level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmState {
    Raised,
    Cleared,
}

/// Edge-triggered detector for stalled streams
#[derive(Debug, Clone)]
pub struct NoPictureMonitor {
    state: AlarmState,
    timeout: Duration,
}

impl NoPictureMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: AlarmState::Cleared,
            timeout,
        }
    }

    pub fn state(&self) -> AlarmState {
        self.state
    }

    /// Evaluate the alarm. `last_picture` is the newest frame arrival, or the
    /// moment streaming began if no frame has arrived yet; `None` means not
    /// streaming. Returns the new level when it changed.
    pub fn check(&mut self, now: Instant, last_picture: Option<Instant>) -> Option<AlarmState> {
        let stalled = match last_picture {
            Some(at) => now.saturating_duration_since(at) >= self.timeout,
            None => false,
        };
        let next = if stalled {
            AlarmState::Raised
        } else {
            AlarmState::Cleared
        };
        if next == self.state {
            return None;
        }
        self.state = next;
        Some(next)
    }
}
