//! Virtual capture device
//!
//! An in-process camera that behaves like a buffer-queue driver: empty
//! buffers are queued with `enqueue_buffer`, filled in FIFO order and
//! handed to the registered callback. Frames are produced on demand
//! ([`VirtualDevice::deliver_next`]) or by a generator thread at the
//! configured rate. Faults can be injected per operation.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::buffer::FrameBuffer;
use super::device::{CaptureDevice, DeviceConfig, FrameCallback, OutputTarget};
use crate::error::{CaptureError, Result};

/// Device operation that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    Configure,
    EnqueueBuffer,
    SetFrameCallback,
    SetOutputTarget,
    StartStreaming,
    StopStreaming,
    SetDisplayOrientation,
    Release,
}

impl Fault {
    fn operation(&self) -> &'static str {
        match self {
            Fault::Configure => "configure",
            Fault::EnqueueBuffer => "enqueue_buffer",
            Fault::SetFrameCallback => "set_frame_callback",
            Fault::SetOutputTarget => "set_output_target",
            Fault::StartStreaming => "start_streaming",
            Fault::StopStreaming => "stop_streaming",
            Fault::SetDisplayOrientation => "set_display_orientation",
            Fault::Release => "release",
        }
    }
}

/// Number of times each device call was made
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub configure: u32,
    pub enqueue_buffer: u32,
    pub flush_buffers: u32,
    pub set_frame_callback: u32,
    pub set_output_target: u32,
    pub start_streaming: u32,
    pub stop_streaming: u32,
    pub set_display_orientation: u32,
    pub release: u32,
}

#[derive(Default)]
struct VirtualState {
    config: Option<DeviceConfig>,
    queue: VecDeque<FrameBuffer>,
    callback: Option<FrameCallback>,
    target: Option<OutputTarget>,
    streaming: bool,
    orientation: Option<u32>,
    released: bool,
    faults: HashSet<Fault>,
    calls: CallCounts,
    frame_counter: u64,
    stop_latency: Duration,
    queue_capacity: Option<usize>,
}

impl VirtualState {
    fn check(&self, fault: Fault) -> Result<()> {
        if self.faults.contains(&fault) {
            return Err(CaptureError::device_failure(
                fault.operation(),
                "injected fault",
            ));
        }
        if self.released {
            return Err(CaptureError::device_failure(
                fault.operation(),
                "device released",
            ));
        }
        Ok(())
    }
}

/// A filled buffer taken from the device but not yet handed to the callback
pub struct InFlightFrame {
    buffer: FrameBuffer,
    length: usize,
    callback: FrameCallback,
}

impl InFlightFrame {
    /// Invoke the callback captured when the frame was taken
    pub fn complete(self) {
        (self.callback)(self.buffer, self.length);
    }
}

/// Simulated camera
pub struct VirtualDevice {
    id: String,
    state: Mutex<VirtualState>,
}

impl VirtualDevice {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(VirtualState::default()),
        }
    }

    /// Make every subsequent call of `fault`'s operation fail
    pub fn inject_fault(&self, fault: Fault) {
        self.state.lock().faults.insert(fault);
    }

    pub fn clear_fault(&self, fault: Fault) {
        self.state.lock().faults.remove(&fault);
    }

    /// Make `stop_streaming` block for `latency` before returning
    pub fn set_stop_latency(&self, latency: Duration) {
        self.state.lock().stop_latency = latency;
    }

    /// Limit the input queue; further enqueues fail with a device error
    pub fn set_queue_capacity(&self, capacity: Option<usize>) {
        self.state.lock().queue_capacity = capacity;
    }

    pub fn config(&self) -> Option<DeviceConfig> {
        self.state.lock().config
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().streaming
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    pub fn has_callback(&self) -> bool {
        self.state.lock().callback.is_some()
    }

    pub fn output_target(&self) -> Option<OutputTarget> {
        self.state.lock().target
    }

    pub fn orientation(&self) -> Option<u32> {
        self.state.lock().orientation
    }

    pub fn calls(&self) -> CallCounts {
        self.state.lock().calls
    }

    pub fn queued_buffers(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn queued_sizes(&self) -> Vec<usize> {
        self.state.lock().queue.iter().map(FrameBuffer::len).collect()
    }

    /// Remove the oldest queued buffer without delivering it
    pub fn take_queued(&self) -> Option<FrameBuffer> {
        self.state.lock().queue.pop_front()
    }

    /// Fill the oldest queued buffer with `length` bytes of a counter
    /// pattern. Returns `None` unless streaming with a callback and a free
    /// buffer.
    pub fn capture_in_flight(&self, length: usize) -> Option<InFlightFrame> {
        let mut state = self.state.lock();
        if !state.streaming {
            return None;
        }
        let callback = state.callback.clone()?;
        let mut buffer = state.queue.pop_front()?;
        state.frame_counter += 1;
        let fill = (state.frame_counter % 256) as u8;
        let filled = length.min(buffer.len());
        buffer.as_mut_slice()[..filled].fill(fill);
        Some(InFlightFrame {
            buffer,
            length,
            callback,
        })
    }

    /// Produce one frame and run the callback on the calling thread.
    /// Returns false when no frame could be produced.
    pub fn deliver_next(&self, length: usize) -> bool {
        match self.capture_in_flight(length) {
            Some(frame) => {
                frame.complete();
                true
            }
            None => false,
        }
    }

    /// Deliver an arbitrary buffer through the registered callback, whether
    /// or not the device is streaming
    pub fn deliver_buffer(&self, buffer: FrameBuffer, length: usize) -> bool {
        let callback = self.state.lock().callback.clone();
        match callback {
            Some(callback) => {
                callback(buffer, length);
                true
            }
            None => false,
        }
    }

    fn frame_timing(&self) -> (Duration, Option<usize>) {
        let config = self.state.lock().config;
        match config {
            Some(config) if config.fps > 0 => (
                Duration::from_secs(1) / config.fps,
                config.frame_size().ok(),
            ),
            _ => (Duration::from_millis(33), None),
        }
    }

    /// Start a thread that produces frames at the configured frame rate
    /// until the returned generator is stopped or dropped.
    pub fn spawn_generator(self: &Arc<Self>) -> Result<FrameGenerator> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let device = Arc::downgrade(self);

        let handle = thread::Builder::new()
            .name(format!("virtual-{}", self.id))
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    let Some(device) = device.upgrade() else {
                        break;
                    };
                    let (interval, length) = device.frame_timing();
                    if let Some(length) = length {
                        device.deliver_next(length);
                    }
                    drop(device);
                    thread::sleep(interval);
                }
            })?;

        Ok(FrameGenerator {
            stop,
            handle: Some(handle),
        })
    }
}

impl CaptureDevice for VirtualDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn configure(&self, config: &DeviceConfig) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.configure += 1;
        state.check(Fault::Configure)?;
        debug!("Virtual device {} configured: {}", self.id, config);
        state.config = Some(*config);
        state.queue.clear();
        Ok(())
    }

    fn enqueue_buffer(&self, buffer: FrameBuffer) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.enqueue_buffer += 1;
        state.check(Fault::EnqueueBuffer)?;
        if state.queue_capacity.is_some_and(|capacity| state.queue.len() >= capacity) {
            return Err(CaptureError::device_failure("enqueue_buffer", "input queue full"));
        }
        state.queue.push_back(buffer);
        Ok(())
    }

    fn flush_buffers(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.flush_buffers += 1;
        let flushed = state.queue.len();
        state.queue.clear();
        debug!("Virtual device {} flushed {} buffers", self.id, flushed);
        Ok(())
    }

    fn set_frame_callback(&self, callback: Option<FrameCallback>) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.set_frame_callback += 1;
        state.check(Fault::SetFrameCallback)?;
        state.callback = callback;
        Ok(())
    }

    fn set_output_target(&self, target: Option<OutputTarget>) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.set_output_target += 1;
        state.check(Fault::SetOutputTarget)?;
        state.target = target;
        Ok(())
    }

    fn start_streaming(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.start_streaming += 1;
        state.check(Fault::StartStreaming)?;
        if state.config.is_none() {
            return Err(CaptureError::device_failure(
                "start_streaming",
                "device not configured",
            ));
        }
        if state.target.is_none() {
            return Err(CaptureError::device_failure(
                "start_streaming",
                "no output target bound",
            ));
        }
        state.streaming = true;
        info!("Virtual device {} streaming", self.id);
        Ok(())
    }

    fn stop_streaming(&self) -> Result<()> {
        let latency = {
            let mut state = self.state.lock();
            state.calls.stop_streaming += 1;
            state.check(Fault::StopStreaming)?;
            state.stop_latency
        };
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        let mut state = self.state.lock();
        state.streaming = false;
        state.queue.clear();
        info!("Virtual device {} stopped", self.id);
        Ok(())
    }

    fn set_display_orientation(&self, degrees: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.set_display_orientation += 1;
        state.check(Fault::SetDisplayOrientation)?;
        state.orientation = Some(degrees);
        Ok(())
    }

    fn release(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.release += 1;
        state.check(Fault::Release)?;
        state.released = true;
        state.streaming = false;
        state.callback = None;
        state.queue.clear();
        Ok(())
    }
}

/// Handle to a running frame generator thread
pub struct FrameGenerator {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FrameGenerator {
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FrameGenerator {
    fn drop(&mut self) {
        self.stop();
    }
}
