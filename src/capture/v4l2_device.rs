//! V4L2 capture backend
//!
//! Frames are dequeued from a kernel mmap stream on a dedicated thread and
//! copied into the next buffer the session queued with `enqueue_buffer`.
//! V4L2 capture nodes have no preview surface, so output targets and
//! display orientation are only recorded.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Format;

use super::buffer::FrameBuffer;
use super::device::{CaptureDevice, DeviceConfig, FrameCallback, OutputTarget};
use crate::error::{CaptureError, Result};
use crate::utils::LogThrottler;
use crate::{debug_throttled, warn_throttled};

/// Kernel-side buffers of the mmap stream
const KERNEL_BUFFER_COUNT: u32 = 4;

/// Dequeue timeout, bounds how long a stop waits for the worker
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Default)]
struct V4l2State {
    config: Option<DeviceConfig>,
    queue: VecDeque<FrameBuffer>,
    callback: Option<FrameCallback>,
    target: Option<OutputTarget>,
    orientation: Option<u32>,
    released: bool,
}

struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Camera behind a V4L2 device node
pub struct V4l2Device {
    id: String,
    path: PathBuf,
    device: Arc<Device>,
    state: Arc<Mutex<V4l2State>>,
    worker: Mutex<Option<Worker>>,
}

impl V4l2Device {
    /// Open a video device by path
    pub fn open(id: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug!("Opening video device: {:?}", path);

        let device = Device::with_path(&path).map_err(|e| {
            CaptureError::device_failure("open", format!("{}: {}", path.display(), e))
        })?;

        Ok(Self {
            id: id.into(),
            path,
            device: Arc::new(device),
            state: Arc::new(Mutex::new(V4l2State::default())),
            worker: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last display orientation the session applied
    pub fn orientation(&self) -> Option<u32> {
        self.state.lock().orientation
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        if self.state.lock().released {
            return Err(CaptureError::device_failure(operation, "device released"));
        }
        Ok(())
    }

    fn join_worker(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.stop.store(true, Ordering::Relaxed);
            // Stopped from the frame callback: the loop exits on its own
            if worker.handle.thread().id() == thread::current().id() {
                debug!("Capture thread of {} stopping itself", self.id);
                return;
            }
            if worker.handle.join().is_err() {
                warn!("Capture thread of {} panicked", self.id);
            }
        }
    }
}

impl CaptureDevice for V4l2Device {
    fn id(&self) -> &str {
        &self.id
    }

    fn configure(&self, config: &DeviceConfig) -> Result<()> {
        self.check("configure")?;
        let requested = Format::new(
            config.resolution.width,
            config.resolution.height,
            config.format.to_fourcc(),
        );
        let actual = self
            .device
            .set_format(&requested)
            .map_err(|e| CaptureError::device_failure("configure", e))?;

        if actual.width != requested.width
            || actual.height != requested.height
            || actual.fourcc != requested.fourcc
        {
            return Err(CaptureError::device_failure(
                "configure",
                format!(
                    "requested {}, driver chose {}x{} {}",
                    config, actual.width, actual.height, actual.fourcc
                ),
            ));
        }

        if let Err(e) = self.device.set_params(&Parameters::with_fps(config.fps)) {
            warn!("Failed to set {} fps on {}: {}", config.fps, self.id, e);
        }

        info!("Configured {:?}: {}", self.path, config);
        let mut state = self.state.lock();
        state.config = Some(*config);
        state.queue.clear();
        Ok(())
    }

    fn enqueue_buffer(&self, buffer: FrameBuffer) -> Result<()> {
        let mut state = self.state.lock();
        if state.released {
            return Err(CaptureError::device_failure("enqueue_buffer", "device released"));
        }
        state.queue.push_back(buffer);
        Ok(())
    }

    fn flush_buffers(&self) -> Result<()> {
        let flushed = {
            let mut state = self.state.lock();
            let flushed = state.queue.len();
            state.queue.clear();
            flushed
        };
        debug!("Flushed {} buffers of {}", flushed, self.id);
        Ok(())
    }

    fn set_frame_callback(&self, callback: Option<FrameCallback>) -> Result<()> {
        self.check("set_frame_callback")?;
        self.state.lock().callback = callback;
        Ok(())
    }

    fn set_output_target(&self, target: Option<OutputTarget>) -> Result<()> {
        self.check("set_output_target")?;
        self.state.lock().target = target;
        Ok(())
    }

    fn start_streaming(&self) -> Result<()> {
        {
            let state = self.state.lock();
            if state.released {
                return Err(CaptureError::device_failure("start_streaming", "device released"));
            }
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
        }

        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        // Open the stream here so failures reach the caller
        let mut stream = Stream::with_buffers(&self.device, Type::VideoCapture, KERNEL_BUFFER_COUNT)
            .map_err(|e| CaptureError::device_failure("start_streaming", e))?;
        stream.set_timeout(DEQUEUE_TIMEOUT);

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let state = self.state.clone();
        let id = self.id.clone();
        let handle = thread::Builder::new()
            .name(format!("v4l2-{}", self.id))
            .spawn(move || capture_loop(&id, &mut stream, &state, &stop_flag))?;

        *worker = Some(Worker { stop, handle });
        info!("Streaming from {:?}", self.path);
        Ok(())
    }

    fn stop_streaming(&self) -> Result<()> {
        self.check("stop_streaming")?;
        self.join_worker();
        self.state.lock().queue.clear();
        info!("Stopped streaming from {:?}", self.path);
        Ok(())
    }

    fn set_display_orientation(&self, degrees: u32) -> Result<()> {
        self.check("set_display_orientation")?;
        debug!("Display orientation of {} set to {}", self.id, degrees);
        self.state.lock().orientation = Some(degrees);
        Ok(())
    }

    fn release(&self) -> Result<()> {
        self.check("release")?;
        self.join_worker();
        let mut state = self.state.lock();
        state.released = true;
        state.callback = None;
        state.target = None;
        state.queue.clear();
        Ok(())
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        self.join_worker();
    }
}

/// Dequeue frames until `stop` is set. The stream is turned off when it
/// is dropped at the end of the thread.
fn capture_loop(
    id: &str,
    stream: &mut Stream<'_>,
    state: &Mutex<V4l2State>,
    stop: &AtomicBool,
) {
    let throttler = LogThrottler::with_secs(5);

    while !stop.load(Ordering::Relaxed) {
        let (data, meta) = match stream.next() {
            Ok(frame) => frame,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                debug_throttled!(throttler, "dequeue_timeout", "No frame from {} yet", id);
                continue;
            }
            Err(e) => {
                warn_throttled!(throttler, "dequeue_error", "Capture error on {}: {}", id, e);
                thread::sleep(Duration::from_millis(100));
                continue;
            }
        };

        let length = (meta.bytesused as usize).min(data.len());

        // Never hold the state lock across the callback, it re-enters enqueue_buffer
        let (mut buffer, callback) = {
            let mut state = state.lock();
            let Some(callback) = state.callback.clone() else {
                continue;
            };
            match state.queue.pop_front() {
                Some(buffer) => (buffer, callback),
                None => {
                    debug_throttled!(
                        throttler,
                        "no_free_buffer",
                        "No free buffer on {}, dropping frame",
                        id
                    );
                    continue;
                }
            }
        };

        let copied = length.min(buffer.len());
        buffer.as_mut_slice()[..copied].copy_from_slice(&data[..copied]);
        callback(buffer, length);
    }
}
