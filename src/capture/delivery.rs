//! Frame delivery: the hardware callback entry point
//!
//! Everything here runs under the buffer-ownership lock. The lock guards
//! the streaming flag, the expected frame size and the active buffer pool,
//! and is held for the whole forward-then-recycle sequence so that a stop
//! can never interleave with a frame being handed to the sink.
//!
//! The lock is reentrant: a sink may read delivery state or stop the
//! session from inside `deliver_frame` on the delivering thread.

use std::cell::RefCell;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::ReentrantMutex;
use tracing::{trace, warn};

use super::buffer::{BufferOrigin, FrameBuffer, FrameBufferPool, Reclaim};
use super::device::FrameCallback;
use super::stats::{CaptureStats, FrameRateTracker};
use crate::utils::LogThrottler;
use crate::{debug_throttled, warn_throttled};

/// Opaque value passed back to the sink with every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SinkContext(pub u64);

/// Consumer of finished frames.
///
/// `data` is only borrowed for the duration of the call: the buffer goes
/// back into the hardware queue as soon as `deliver_frame` returns.
///
/// From inside `deliver_frame` a sink may call the session's `request_stop`
/// and its data-plane accessors (`state`, `is_streaming`, `stats`,
/// `pool_generation`, `hardware_owned_buffers`). Every other session call
/// takes the capture lock, which a concurrent transition may hold while it
/// waits for this frame, and must not be made from the sink.
pub trait FrameSink: Send + Sync {
    fn deliver_frame(&self, data: &[u8], length: usize, context: SinkContext);
}

struct DeliveryState {
    streaming: bool,
    expected_frame_size: usize,
    pool: Option<FrameBufferPool>,
    last_generation: u64,
    streaming_since: Option<Instant>,
    /// Thread currently inside the sink
    delivering: Option<ThreadId>,
    rate: FrameRateTracker,
    frames_delivered: u64,
    frames_dropped_stopped: u64,
    frames_dropped_size: u64,
    stale_buffers: u64,
}

/// Data-plane half of a capture session
pub struct FrameDelivery {
    state: ReentrantMutex<RefCell<DeliveryState>>,
    sink: Arc<dyn FrameSink>,
    context: SinkContext,
    throttler: LogThrottler,
}

impl FrameDelivery {
    pub fn new(sink: Arc<dyn FrameSink>, context: SinkContext, rate_window: Duration) -> Self {
        Self {
            state: ReentrantMutex::new(RefCell::new(DeliveryState {
                streaming: false,
                expected_frame_size: 0,
                pool: None,
                last_generation: 0,
                streaming_since: None,
                delivering: None,
                rate: FrameRateTracker::new(rate_window),
                frames_delivered: 0,
                frames_dropped_stopped: 0,
                frames_dropped_size: 0,
                stale_buffers: 0,
            })),
            sink,
            context,
            throttler: LogThrottler::with_secs(5),
        }
    }

    /// Callback to register with the device. Holds only a weak reference, so
    /// a device that outlives the session delivers into nothing.
    pub fn callback(self: &Arc<Self>) -> FrameCallback {
        let delivery = Arc::downgrade(self);
        Arc::new(move |buffer, length| {
            if let Some(delivery) = delivery.upgrade() {
                delivery.on_frame(buffer, length);
            }
        })
    }

    /// Install the pool a start is about to stream into. Frames that arrive
    /// before [`begin_streaming`](Self::begin_streaming) are discarded but
    /// their buffers still go back to the hardware.
    pub(crate) fn prepare(&self, pool: FrameBufferPool, expected_frame_size: usize) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        state.streaming = false;
        state.last_generation = pool.generation();
        state.pool = Some(pool);
        state.expected_frame_size = expected_frame_size;
    }

    /// Flip the streaming flag on for the prepared pool.
    /// Returns false if no pool was prepared.
    pub(crate) fn begin_streaming(&self) -> bool {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if state.pool.is_none() {
            return false;
        }
        state.streaming_since = Some(Instant::now());
        state.rate.clear();
        state.streaming = true;
        true
    }

    /// Flip the streaming flag off and detach the pool. Any callback that
    /// acquires the lock afterwards discards its frame.
    pub(crate) fn end_streaming(&self) -> Option<FrameBufferPool> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        state.streaming = false;
        state.expected_frame_size = 0;
        state.streaming_since = None;
        state.pool.take()
    }

    /// True when called by the sink from inside `deliver_frame`
    pub fn is_delivering_on_current_thread(&self) -> bool {
        let guard = self.state.lock();
        let delivering = guard.borrow().delivering;
        delivering == Some(thread::current().id())
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().borrow().streaming
    }

    pub fn expected_frame_size(&self) -> usize {
        self.state.lock().borrow().expected_frame_size
    }

    /// Generation of the active pool, if streaming
    pub fn pool_generation(&self) -> Option<u64> {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.pool.as_ref().map(FrameBufferPool::generation)
    }

    /// Buffers of the active pool currently queued in the hardware
    pub fn hardware_owned_buffers(&self) -> usize {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.pool.as_ref().map_or(0, FrameBufferPool::hardware_owned)
    }

    /// Newest frame arrival, or stream start if nothing arrived yet.
    /// `None` when not streaming.
    pub fn last_picture(&self) -> Option<Instant> {
        let guard = self.state.lock();
        let state = guard.borrow();
        if !state.streaming {
            return None;
        }
        match (state.rate.last_arrival(), state.streaming_since) {
            (Some(frame), Some(since)) => Some(frame.max(since)),
            (frame, since) => frame.or(since),
        }
    }

    pub fn stats(&self, now: Instant) -> CaptureStats {
        let guard = self.state.lock();
        let state = guard.borrow();
        CaptureStats {
            frames_delivered: state.frames_delivered,
            frames_dropped_stopped: state.frames_dropped_stopped,
            frames_dropped_size: state.frames_dropped_size,
            stale_buffers: state.stale_buffers,
            current_fps: if state.streaming {
                state.rate.rate(now)
            } else {
                0
            },
            pool_generation: state.last_generation,
        }
    }

    /// Handle a filled buffer from the hardware.
    ///
    /// Discards frames that arrive after stop and frames whose length does
    /// not match the active configuration. Forwards everything else to the
    /// sink, then recycles the buffer into the pool that is active once the
    /// sink returns.
    pub fn on_frame(&self, buffer: FrameBuffer, length: usize) {
        let guard = self.state.lock();

        let forward = {
            let mut state = guard.borrow_mut();
            let state = &mut *state;

            if !state.streaming {
                state.frames_dropped_stopped += 1;
                debug_throttled!(
                    self.throttler,
                    "frame_while_stopped",
                    "Discarding {} byte frame delivered while not streaming",
                    length
                );
                // A prepared pool still owns the buffer
                if let Some(pool) = state.pool.as_mut() {
                    pool.begin_delivery(&buffer);
                    if let Err(e) = pool.reclaim(buffer) {
                        warn!("Failed to return buffer to device: {}", e);
                    }
                }
                return;
            }

            let Some(pool) = state.pool.as_mut() else {
                return;
            };

            if !pool.begin_delivery(&buffer) && buffer.origin() != BufferOrigin::External {
                trace!("Frame arrived in foreign buffer {:?}", buffer.origin());
            }

            if length != state.expected_frame_size || length > buffer.len() {
                state.frames_dropped_size += 1;
                warn_throttled!(
                    self.throttler,
                    "frame_size_mismatch",
                    "Discarding frame: got {} bytes, expected {}",
                    length,
                    state.expected_frame_size
                );
                false
            } else {
                state.delivering = Some(thread::current().id());
                true
            }
        };

        // No borrow is held here so the sink can re-enter
        if forward {
            self.sink
                .deliver_frame(&buffer.as_slice()[..length], length, self.context);
        }

        let mut state = guard.borrow_mut();
        let state = &mut *state;
        if forward {
            state.delivering = None;
            state.frames_delivered += 1;
            state.rate.record(Instant::now());
            trace!("Delivered frame #{} ({} bytes)", state.frames_delivered, length);
        }

        let Some(pool) = state.pool.as_mut() else {
            trace!("Pool released during delivery, dropping buffer");
            return;
        };
        match pool.reclaim(buffer) {
            Ok(Reclaim::Stale) => state.stale_buffers += 1,
            Ok(_) => {}
            Err(e) => warn!("Failed to return buffer to device: {}", e),
        }
    }
}
