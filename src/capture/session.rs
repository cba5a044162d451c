//! Capture session state machine
//!
//! Reconciles the three uncoordinated inputs of a capture device (start/stop
//! commands from the owner, surface lifecycle notifications and the
//! hardware's frame callback) into one [`SessionState`].
//!
//! Two locks are involved:
//! - the capture lock (`SessionInner::control`) serializes every control
//!   plane transition, whether it comes from the owner or a surface event;
//! - the buffer-ownership lock inside [`FrameDelivery`] guards the data
//!   plane (streaming flag, expected frame size, active pool).
//!
//! Lock order is capture lock, then buffer lock, then device-internal locks.
//! The buffer lock is never held while blocking on the capture lock, and is
//! released before the device is asked to stop, except when the sink itself
//! requests the stop from the delivering thread.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use super::buffer::FrameBufferPool;
use super::delivery::{FrameDelivery, FrameSink, SinkContext};
use super::device::{
    CaptureDevice, DeviceConfig, DeviceDescriptor, DeviceInfoProvider, Facing,
};
use super::rotation::Rotation;
use super::stats::{AlarmState, CaptureStats, NoPictureMonitor};
use super::surface::{
    SurfaceAvailability, SurfaceBinding, SurfaceEvents, SurfaceHandle, SurfaceProvider,
};
use crate::config::{CaptureSettings, ReconfigurePolicy};
use crate::error::{CaptureError, Result};
use crate::events::{CaptureEvent, EventBus};

/// Capture session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No device attached (released)
    Detached,
    /// Capture requested, waiting for a render target
    AwaitingSurface,
    /// Device attached, capture not requested
    AwaitingRequest,
    /// Hardware is streaming into the sink
    Streaming,
    /// Hardware teardown in progress
    Stopping,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Detached => "detached",
            SessionState::AwaitingSurface => "awaiting_surface",
            SessionState::AwaitingRequest => "awaiting_request",
            SessionState::Streaming => "streaming",
            SessionState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs of the state machine
#[derive(Debug, Clone, Copy)]
enum SessionEvent {
    Start(DeviceConfig),
    Stop,
    SurfaceReady(SurfaceHandle),
    SurfaceLost,
    Detach,
}

/// Control-plane state, guarded by the capture lock
struct Control {
    device: Option<Arc<dyn CaptureDevice>>,
    state: SessionState,
    /// Latched start request
    requested: Option<DeviceConfig>,
    /// Configuration the hardware is streaming with
    active: Option<DeviceConfig>,
    binding: SurfaceBinding,
    rotation: Option<Rotation>,
    next_placeholder: u64,
    next_generation: u64,
}

pub(crate) struct SessionInner {
    id: String,
    descriptor: DeviceDescriptor,
    settings: CaptureSettings,
    control: Mutex<Control>,
    delivery: Arc<FrameDelivery>,
    surface_provider: Option<Arc<dyn SurfaceProvider>>,
    alarm: Mutex<NoPictureMonitor>,
    state_tx: watch::Sender<SessionState>,
    events: Option<Arc<EventBus>>,
    /// (operation, message) of the last failure nobody was waiting on
    last_error: RwLock<Option<(String, String)>>,
}

impl SessionInner {
    pub(crate) fn surface_ready(&self, handle: SurfaceHandle) {
        self.dispatch_detached(SessionEvent::SurfaceReady(handle));
    }

    pub(crate) fn surface_changed(&self, handle: SurfaceHandle, width: u32, height: u32) {
        if let Err(e) = self.on_surface_changed(handle, width, height) {
            self.record_error(&e);
        }
    }

    pub(crate) fn surface_lost(&self) {
        self.dispatch_detached(SessionEvent::SurfaceLost);
    }

    /// Run an event that has no caller to report a failure to
    fn dispatch_detached(&self, event: SessionEvent) {
        if let Err(e) = self.handle(event) {
            self.record_error(&e);
        }
    }

    fn record_error(&self, e: &CaptureError) {
        error!("Capture session {}: {}", self.id, e);
        let operation = e.operation().map(str::to_string);
        *self.last_error.write() = Some((
            operation.clone().unwrap_or_else(|| "session".to_string()),
            e.to_string(),
        ));
        self.publish(CaptureEvent::DeviceError {
            device: self.id.clone(),
            operation,
            message: e.to_string(),
            at: Utc::now(),
        });
    }

    fn publish(&self, event: CaptureEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    fn handle(&self, event: SessionEvent) -> Result<()> {
        let mut control = self.control.lock();
        self.transition(&mut control, event)
    }

    /// Stop requested by the sink from inside `deliver_frame`.
    ///
    /// This thread already holds the buffer lock, so blocking on the capture
    /// lock could deadlock against a transition waiting for this frame. The
    /// transition runs inline when the capture lock is free; otherwise the
    /// data plane stops here and the transition follows on a helper thread.
    fn stop_from_sink(self: &Arc<Self>) -> Result<()> {
        if let Some(mut control) = self.control.try_lock() {
            return self.transition(&mut control, SessionEvent::Stop);
        }

        if let Some(pool) = self.delivery.end_streaming() {
            debug!(
                "Pool #{} of {} detached by the sink, stop deferred",
                pool.generation(),
                self.id
            );
        }
        let inner = self.clone();
        thread::Builder::new()
            .name(format!("stop-{}", self.id))
            .spawn(move || inner.dispatch_detached(SessionEvent::Stop))?;
        Ok(())
    }

    fn on_surface_changed(&self, handle: SurfaceHandle, width: u32, height: u32) -> Result<()> {
        let mut control = self.control.lock();
        debug!(
            "Surface {} for {} changed to {}x{}",
            handle.id(),
            self.id,
            width,
            height
        );
        if control.binding.surface() == Some(handle) {
            return Ok(());
        }
        self.transition(&mut control, SessionEvent::SurfaceReady(handle))
    }

    /// The single transition function. Must be called with the capture lock held.
    fn transition(&self, control: &mut Control, event: SessionEvent) -> Result<()> {
        let Some(device) = control.device.clone() else {
            return match event {
                SessionEvent::Start(_) | SessionEvent::Stop => Err(CaptureError::DeviceNotAttached),
                SessionEvent::Detach => Ok(()),
                other => {
                    debug!("Ignoring {:?} on detached session {}", other, self.id);
                    Ok(())
                }
            };
        };

        trace!("Session {}: {:?} in {}", self.id, event, control.state);
        match event {
            SessionEvent::Start(config) => self.on_start(control, &device, config),
            SessionEvent::Stop => self.on_stop(control, &device),
            SessionEvent::SurfaceReady(handle) => self.on_surface_ready(control, &device, handle),
            SessionEvent::SurfaceLost => self.on_surface_lost(control, &device),
            SessionEvent::Detach => self.on_detach(control, &device),
        }
    }

    fn set_state(&self, control: &mut Control, state: SessionState) {
        if control.state == state {
            return;
        }
        debug!("Session {}: {} -> {}", self.id, control.state, state);
        control.state = state;
        self.state_tx.send_replace(state);
        self.publish(CaptureEvent::StateChanged {
            device: self.id.clone(),
            state,
        });
    }

    fn on_start(
        &self,
        control: &mut Control,
        device: &Arc<dyn CaptureDevice>,
        config: DeviceConfig,
    ) -> Result<()> {
        config.frame_size()?;

        if control.state == SessionState::Streaming {
            match control.active {
                Some(current) if current == config => {
                    debug!("{} already streaming {}", self.id, config);
                    return Ok(());
                }
                Some(current) if self.settings.reconfigure == ReconfigurePolicy::Reject => {
                    return Err(CaptureError::AlreadyStreamingConflict {
                        current,
                        requested: config,
                    });
                }
                _ => {
                    info!("Reconfiguring {} to {}", self.id, config);
                    if let Err(e) = self.halt(control, device) {
                        warn!("Stop before reconfigure of {} failed: {}", self.id, e);
                    }
                }
            }
        }

        control.requested = Some(config);
        if let Err(e) = self.ensure_target(control, device) {
            control.requested = None;
            self.set_state(control, SessionState::AwaitingRequest);
            return Err(e);
        }
        self.try_start(control, device)
    }

    fn on_stop(&self, control: &mut Control, device: &Arc<dyn CaptureDevice>) -> Result<()> {
        control.requested = None;
        let was_streaming = control.state == SessionState::Streaming;
        let result = if was_streaming {
            self.halt(control, device)
        } else {
            Ok(())
        };

        if control.binding.is_placeholder() {
            if let Err(e) = control.binding.unbind(device.as_ref()) {
                debug!("Failed to clear placeholder on {}: {}", self.id, e);
            }
        }
        self.set_state(control, SessionState::AwaitingRequest);

        match &result {
            Ok(()) if was_streaming => info!("Capture stopped on {}", self.id),
            Ok(()) => {}
            Err(e) => warn!("Capture on {} stopped with device error: {}", self.id, e),
        }
        result
    }

    fn on_surface_ready(
        &self,
        control: &mut Control,
        device: &Arc<dyn CaptureDevice>,
        handle: SurfaceHandle,
    ) -> Result<()> {
        if control.binding.bind_real(device.as_ref(), handle)? {
            self.publish(CaptureEvent::SurfaceBound {
                device: self.id.clone(),
                surface: Some(handle.id()),
            });
        }
        if control.state == SessionState::Streaming {
            return Ok(());
        }
        self.try_start(control, device)
    }

    fn on_surface_lost(&self, control: &mut Control, device: &Arc<dyn CaptureDevice>) -> Result<()> {
        if !control.binding.is_ready() {
            return Ok(());
        }
        if let Err(e) = control.binding.unbind(device.as_ref()) {
            debug!("Clearing lost target on {} failed: {}", self.id, e);
        }
        self.publish(CaptureEvent::SurfaceLost {
            device: self.id.clone(),
        });

        if control.state != SessionState::Streaming {
            let next = if control.requested.is_some() {
                SessionState::AwaitingSurface
            } else {
                SessionState::AwaitingRequest
            };
            self.set_state(control, next);
            return Ok(());
        }

        // Streaming hardware still needs some target
        control.next_placeholder += 1;
        let id = control.next_placeholder;
        match control.binding.install_placeholder(device.as_ref(), id) {
            Ok(_) => {
                info!(
                    "Surface for {} lost, streaming into placeholder #{}",
                    self.id, id
                );
                self.publish(CaptureEvent::SurfaceBound {
                    device: self.id.clone(),
                    surface: None,
                });
                Ok(())
            }
            Err(e) => {
                warn!("No output target left for {}, halting capture", self.id);
                if let Err(stop) = self.halt(control, device) {
                    warn!("Stop of {} failed: {}", self.id, stop);
                }
                self.set_state(control, SessionState::AwaitingSurface);
                Err(e)
            }
        }
    }

    fn on_detach(&self, control: &mut Control, device: &Arc<dyn CaptureDevice>) -> Result<()> {
        control.requested = None;
        if control.state == SessionState::Streaming {
            if let Err(e) = self.halt(control, device) {
                warn!("Stop of {} during detach failed: {}", self.id, e);
            }
        }
        if let Err(e) = control.binding.unbind(device.as_ref()) {
            debug!("Clearing output target of {} failed: {}", self.id, e);
        }

        let released = device.release();
        control.device = None;
        control.active = None;
        self.set_state(control, SessionState::Detached);

        match &released {
            Ok(()) => info!("Device {} released", self.id),
            Err(e) => warn!("Release of {} failed: {}", self.id, e),
        }
        released
    }

    fn surface_availability(&self) -> SurfaceAvailability {
        match &self.surface_provider {
            Some(provider) => provider.availability(),
            None if self.settings.placeholder_when_no_surface => SurfaceAvailability::Unavailable,
            None => SurfaceAvailability::Pending,
        }
    }

    /// Bind whatever target the provider offers, if nothing is bound yet
    fn ensure_target(&self, control: &mut Control, device: &Arc<dyn CaptureDevice>) -> Result<()> {
        if control.binding.is_ready() {
            return Ok(());
        }
        match self.surface_availability() {
            SurfaceAvailability::Ready(handle) => {
                if control.binding.bind_real(device.as_ref(), handle)? {
                    self.publish(CaptureEvent::SurfaceBound {
                        device: self.id.clone(),
                        surface: Some(handle.id()),
                    });
                }
            }
            SurfaceAvailability::Unavailable => {
                control.next_placeholder += 1;
                let id = control.next_placeholder;
                if control.binding.install_placeholder(device.as_ref(), id)? {
                    debug!("No surface provider for {}, using placeholder #{}", self.id, id);
                    self.publish(CaptureEvent::SurfaceBound {
                        device: self.id.clone(),
                        surface: None,
                    });
                }
            }
            SurfaceAvailability::Pending => {}
        }
        Ok(())
    }

    /// Start streaming if a request is latched and a target is bound.
    /// A failed start drops the request.
    fn try_start(&self, control: &mut Control, device: &Arc<dyn CaptureDevice>) -> Result<()> {
        let Some(config) = control.requested else {
            self.set_state(control, SessionState::AwaitingRequest);
            return Ok(());
        };
        if control.state == SessionState::Streaming {
            return Ok(());
        }
        if !control.binding.is_ready() {
            debug!("Start of {} deferred until a surface is bound", self.id);
            self.set_state(control, SessionState::AwaitingSurface);
            return Ok(());
        }

        control.next_generation += 1;
        let generation = control.next_generation;
        match self.start_hardware(device, config, generation) {
            Ok(()) => {
                control.active = Some(config);
                info!(
                    "Capture started on {}: {} (pool #{})",
                    self.id, config, generation
                );
                self.set_state(control, SessionState::Streaming);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to start capture on {}: {}", self.id, e);
                control.requested = None;
                control.active = None;
                self.set_state(control, SessionState::AwaitingRequest);
                Err(e)
            }
        }
    }

    /// Configure, allocate, register and start. On failure nothing is left
    /// streaming, the pool is gone and the hardware queue is empty.
    fn start_hardware(
        &self,
        device: &Arc<dyn CaptureDevice>,
        config: DeviceConfig,
        generation: u64,
    ) -> Result<()> {
        let frame_size = config.frame_size()?;
        if let Err(e) = self.bring_up(device, config, frame_size, generation) {
            self.delivery.end_streaming();
            if let Err(clear) = device.set_frame_callback(None) {
                debug!("Clearing frame callback of {} failed: {}", self.id, clear);
            }
            if let Err(flush) = device.flush_buffers() {
                warn!("Flushing buffers of {} failed: {}", self.id, flush);
            }
            return Err(e);
        }

        self.delivery.begin_streaming();
        Ok(())
    }

    fn bring_up(
        &self,
        device: &Arc<dyn CaptureDevice>,
        config: DeviceConfig,
        frame_size: usize,
        generation: u64,
    ) -> Result<()> {
        device.configure(&config)?;
        let pool = FrameBufferPool::allocate(
            device.clone(),
            self.settings.buffer_count,
            frame_size,
            generation,
        )?;
        self.delivery.prepare(pool, frame_size);
        device.set_frame_callback(Some(self.delivery.callback()))?;
        device.start_streaming()
    }

    /// Stop transition. The streaming flag flips under the buffer lock
    /// first; the device is stopped after that lock is released.
    fn halt(&self, control: &mut Control, device: &Arc<dyn CaptureDevice>) -> Result<()> {
        self.set_state(control, SessionState::Stopping);
        let pool = self.delivery.end_streaming();
        control.active = None;

        let stopped = device.stop_streaming();
        let cleared = device.set_frame_callback(None);
        if let Some(pool) = pool {
            debug!("Released buffer pool #{} of {}", pool.generation(), self.id);
        }
        stopped.and(cleared)
    }
}

/// Builder for [`CaptureSession`]
pub struct CaptureSessionBuilder {
    device: Option<Arc<dyn CaptureDevice>>,
    descriptor: Option<DeviceDescriptor>,
    device_info: Option<Arc<dyn DeviceInfoProvider>>,
    sink: Option<Arc<dyn FrameSink>>,
    context: SinkContext,
    surface_provider: Option<Arc<dyn SurfaceProvider>>,
    settings: CaptureSettings,
    events: Option<Arc<EventBus>>,
}

impl CaptureSessionBuilder {
    pub fn new() -> Self {
        Self {
            device: None,
            descriptor: None,
            device_info: None,
            sink: None,
            context: SinkContext::default(),
            surface_provider: None,
            settings: CaptureSettings::default(),
            events: None,
        }
    }

    pub fn device(mut self, device: Arc<dyn CaptureDevice>) -> Self {
        self.device = Some(device);
        self
    }

    /// Explicit device metadata; takes precedence over `device_info`
    pub fn descriptor(mut self, descriptor: DeviceDescriptor) -> Self {
        self.descriptor = Some(descriptor);
        self
    }

    pub fn device_info(mut self, device_info: Arc<dyn DeviceInfoProvider>) -> Self {
        self.device_info = Some(device_info);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn FrameSink>, context: SinkContext) -> Self {
        self.sink = Some(sink);
        self.context = context;
        self
    }

    pub fn surface_provider(mut self, provider: Arc<dyn SurfaceProvider>) -> Self {
        self.surface_provider = Some(provider);
        self
    }

    pub fn settings(mut self, settings: CaptureSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<CaptureSession> {
        let device = self.device.ok_or(CaptureError::DeviceNotAttached)?;
        let sink = self.sink.ok_or_else(|| {
            CaptureError::InvalidConfiguration("a frame sink is required".to_string())
        })?;
        self.settings.validate()?;

        let id = device.id().to_string();
        let descriptor = self
            .descriptor
            .or_else(|| self.device_info.as_ref().and_then(|info| info.describe(&id)))
            .unwrap_or_else(|| DeviceDescriptor::new(id.clone(), Facing::default()));

        let delivery = Arc::new(FrameDelivery::new(
            sink,
            self.context,
            Duration::from_millis(self.settings.frame_rate_window_ms),
        ));
        let (state_tx, _state_rx) = watch::channel(SessionState::AwaitingRequest);

        let inner = Arc::new(SessionInner {
            id,
            descriptor,
            alarm: Mutex::new(NoPictureMonitor::new(Duration::from_millis(
                self.settings.no_picture_timeout_ms,
            ))),
            settings: self.settings,
            control: Mutex::new(Control {
                device: Some(device),
                state: SessionState::AwaitingRequest,
                requested: None,
                active: None,
                binding: SurfaceBinding::default(),
                rotation: None,
                next_placeholder: 0,
                next_generation: 0,
            }),
            delivery,
            surface_provider: self.surface_provider,
            state_tx,
            events: self.events,
            last_error: RwLock::new(None),
        });

        if let Some(provider) = &inner.surface_provider {
            provider.subscribe(SurfaceEvents::new(Arc::downgrade(&inner)));
        }

        info!(
            "Capture session created for {} ({:?}, mirror quirk: {})",
            inner.id, inner.descriptor.facing, inner.descriptor.mirror_quirk
        );
        Ok(CaptureSession { inner })
    }
}

impl Default for CaptureSessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Capture session for one attached device
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct CaptureSession {
    inner: Arc<SessionInner>,
}

impl CaptureSession {
    pub fn builder() -> CaptureSessionBuilder {
        CaptureSessionBuilder::new()
    }

    /// Request capture at `width`x`height`@`fps` in the configured pixel format.
    ///
    /// Starts immediately when a target is bound (or a placeholder can be
    /// installed), otherwise latches the request until a surface is ready.
    pub fn request_start(&self, width: u32, height: u32, fps: u32) -> Result<()> {
        let config = DeviceConfig::new(width, height, fps, self.inner.settings.pixel_format);
        self.request_start_with(config)
    }

    pub fn request_start_with(&self, config: DeviceConfig) -> Result<()> {
        self.inner.handle(SessionEvent::Start(config))
    }

    /// Drop the capture request and stop the hardware if it is streaming.
    ///
    /// Once this returns no further frame reaches the sink. A failed device
    /// stop is reported, but the session is stopped regardless. May be
    /// called by the sink from inside `deliver_frame`.
    pub fn request_stop(&self) -> Result<()> {
        if self.inner.delivery.is_delivering_on_current_thread() {
            return self.inner.stop_from_sink();
        }
        self.inner.handle(SessionEvent::Stop)
    }

    pub fn notify_surface_ready(&self, handle: SurfaceHandle) -> Result<()> {
        self.inner.handle(SessionEvent::SurfaceReady(handle))
    }

    pub fn notify_surface_changed(
        &self,
        handle: SurfaceHandle,
        width: u32,
        height: u32,
    ) -> Result<()> {
        self.inner.on_surface_changed(handle, width, height)
    }

    pub fn notify_surface_lost(&self) -> Result<()> {
        self.inner.handle(SessionEvent::SurfaceLost)
    }

    /// Apply a display rotation. Does nothing once the device is detached.
    pub fn set_rotation(&self, degrees: u32) -> Result<()> {
        let mut control = self.inner.control.lock();
        let Some(device) = control.device.clone() else {
            debug!("Rotation {} ignored, {} is detached", degrees, self.inner.id);
            return Ok(());
        };
        let rotation = Rotation::for_device(degrees, &self.inner.descriptor);
        device.set_display_orientation(rotation.effective)?;
        debug!(
            "Display rotation of {}: requested {}, applied {}",
            self.inner.id, rotation.requested, rotation.effective
        );
        control.rotation = Some(rotation);
        Ok(())
    }

    /// Stop (best effort), unbind and release the device
    pub fn detach(&self) -> Result<()> {
        self.inner.handle(SessionEvent::Detach)
    }

    /// Periodic housekeeping: evaluates the no-picture alarm and reports
    /// the frame rate. Call about once per second.
    pub fn process(&self) {
        let inner = &self.inner;
        let now = Instant::now();

        let alarm = if inner.settings.no_picture_alarm {
            let last_picture = inner.delivery.last_picture();
            inner.alarm.lock().check(now, last_picture)
        } else {
            None
        };
        if let Some(alarm) = alarm {
            match alarm {
                AlarmState::Raised => warn!(
                    "No picture from {} for {} ms",
                    inner.id, inner.settings.no_picture_timeout_ms
                ),
                AlarmState::Cleared => info!("Picture from {} resumed", inner.id),
            }
            inner.publish(CaptureEvent::NoPictureAlarm {
                device: inner.id.clone(),
                alarm,
            });
        }

        if inner.settings.frame_rate_events && inner.delivery.is_streaming() {
            let fps = inner.delivery.stats(now).current_fps;
            trace!("{} at {} fps", inner.id, fps);
            inner.publish(CaptureEvent::FrameRate {
                device: inner.id.clone(),
                fps,
            });
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.inner.descriptor
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.inner.settings
    }

    /// Current state, without taking the capture lock
    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == SessionState::Streaming
    }

    pub fn is_capture_requested(&self) -> bool {
        self.inner.control.lock().requested.is_some()
    }

    pub fn surface_binding(&self) -> SurfaceBinding {
        self.inner.control.lock().binding
    }

    /// Configuration the hardware is streaming with
    pub fn active_config(&self) -> Option<DeviceConfig> {
        self.inner.control.lock().active
    }

    pub fn rotation(&self) -> Option<Rotation> {
        self.inner.control.lock().rotation
    }

    /// Generation of the buffer pool in use, if streaming
    pub fn pool_generation(&self) -> Option<u64> {
        self.inner.delivery.pool_generation()
    }

    pub fn hardware_owned_buffers(&self) -> usize {
        self.inner.delivery.hardware_owned_buffers()
    }

    pub fn stats(&self) -> CaptureStats {
        self.inner.delivery.stats(Instant::now())
    }

    /// Last failure of a transition triggered by a surface event,
    /// as (operation, message)
    pub fn last_error(&self) -> Option<(String, String)> {
        self.inner.last_error.read().clone()
    }

    pub fn clear_error(&self) {
        *self.inner.last_error.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::buffer::FrameBuffer;
    use crate::capture::device::{OutputTarget, StaticDeviceInfo};
    use crate::capture::surface::LocalSurface;
    use crate::capture::virtual_device::{Fault, VirtualDevice};
    use crate::video::format::PixelFormat;
    use std::sync::Barrier;
    use std::thread;
    use tokio::sync::broadcast;

    /// 640x480 NV21
    const FRAME: usize = 460_800;

    #[derive(Default)]
    struct CollectingSink {
        frames: Mutex<Vec<(Vec<u8>, usize, SinkContext)>>,
    }

    impl CollectingSink {
        fn count(&self) -> usize {
            self.frames.lock().len()
        }
    }

    impl FrameSink for CollectingSink {
        fn deliver_frame(&self, data: &[u8], length: usize, context: SinkContext) {
            self.frames.lock().push((data.to_vec(), length, context));
        }
    }

    fn builder(device: &Arc<VirtualDevice>, sink: &Arc<CollectingSink>) -> CaptureSessionBuilder {
        CaptureSession::builder()
            .device(device.clone())
            .sink(sink.clone(), SinkContext(42))
    }

    fn placeholder_session() -> (Arc<VirtualDevice>, Arc<CollectingSink>, CaptureSession) {
        let device = Arc::new(VirtualDevice::new("cam0"));
        let sink = Arc::new(CollectingSink::default());
        let session = builder(&device, &sink).build().unwrap();
        (device, sink, session)
    }

    fn surface_session() -> (
        Arc<VirtualDevice>,
        Arc<CollectingSink>,
        Arc<LocalSurface>,
        CaptureSession,
    ) {
        let device = Arc::new(VirtualDevice::new("cam0"));
        let sink = Arc::new(CollectingSink::default());
        let surface = LocalSurface::new();
        let session = builder(&device, &sink)
            .surface_provider(surface.clone())
            .build()
            .unwrap();
        (device, sink, surface, session)
    }

    fn drain(rx: &mut broadcast::Receiver<CaptureEvent>) -> Vec<CaptureEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn assert_consistent(session: &CaptureSession, device: &VirtualDevice) {
        if session.state() == SessionState::Streaming {
            assert!(session.is_capture_requested());
            assert!(session.surface_binding().is_ready());
            assert!(device.is_streaming());
            assert!(session.inner.delivery.is_streaming());
        } else {
            assert!(!device.is_streaming());
            assert!(!session.inner.delivery.is_streaming());
        }
    }

    #[test]
    fn test_start_without_surface_provider() {
        let (device, sink, session) = placeholder_session();
        assert_eq!(session.state(), SessionState::AwaitingRequest);

        session.request_start(640, 480, 30).unwrap();

        assert_eq!(session.state(), SessionState::Streaming);
        assert!(session.surface_binding().is_placeholder());
        assert!(matches!(
            device.output_target(),
            Some(OutputTarget::Placeholder(_))
        ));
        assert_eq!(device.queued_sizes(), vec![FRAME; 3]);

        assert!(device.deliver_next(FRAME));
        {
            let frames = sink.frames.lock();
            assert_eq!(frames.len(), 1);
            let (data, length, context) = &frames[0];
            assert_eq!(*length, FRAME);
            assert_eq!(data.len(), FRAME);
            assert!(data.iter().all(|b| *b == 1));
            assert_eq!(*context, SinkContext(42));
        }
        assert_eq!(session.hardware_owned_buffers(), 3);

        session.request_stop().unwrap();
        assert_eq!(session.state(), SessionState::AwaitingRequest);
        assert!(!device.deliver_next(FRAME));
        assert!(!device.deliver_buffer(FrameBuffer::external(vec![0; FRAME]), FRAME));
        assert_eq!(sink.count(), 1);
        assert!(!session.surface_binding().is_ready());
        assert_eq!(device.output_target(), None);
    }

    #[test]
    fn test_start_is_idempotent() {
        let (device, _sink, session) = placeholder_session();
        session.request_start(640, 480, 30).unwrap();
        let generation = session.pool_generation();
        let calls = device.calls();

        session.request_start(640, 480, 30).unwrap();

        assert_eq!(session.pool_generation(), generation);
        assert_eq!(device.calls(), calls);
        assert_eq!(session.state(), SessionState::Streaming);
    }

    #[test]
    fn test_reconfigure_rejected_by_default() {
        let (device, _sink, session) = placeholder_session();
        session.request_start(640, 480, 30).unwrap();

        let err = session.request_start(320, 240, 30).unwrap_err();
        match err {
            CaptureError::AlreadyStreamingConflict { current, requested } => {
                assert_eq!(current, DeviceConfig::new(640, 480, 30, PixelFormat::Nv21));
                assert_eq!(requested, DeviceConfig::new(320, 240, 30, PixelFormat::Nv21));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(device.calls().configure, 1);
        assert_eq!(session.pool_generation(), Some(1));
    }

    #[test]
    fn test_reconfigure_restart_drops_stale_buffers() {
        let device = Arc::new(VirtualDevice::new("cam0"));
        let sink = Arc::new(CollectingSink::default());
        let settings = CaptureSettings {
            reconfigure: ReconfigurePolicy::Restart,
            ..Default::default()
        };
        let session = builder(&device, &sink).settings(settings).build().unwrap();
        session.request_start(640, 480, 30).unwrap();

        // Filled under the old configuration, delivered after the switch
        let stale = device.capture_in_flight(FRAME).unwrap();
        session.request_start(320, 240, 15).unwrap();

        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(session.pool_generation(), Some(2));
        assert_eq!(
            session.active_config(),
            Some(DeviceConfig::new(320, 240, 15, PixelFormat::Nv21))
        );
        assert_eq!(device.queued_sizes(), vec![115_200; 3]);

        stale.complete();
        assert_eq!(sink.count(), 0);
        let stats = session.stats();
        assert_eq!(stats.frames_dropped_size, 1);
        assert_eq!(stats.stale_buffers, 1);
        assert_eq!(device.queued_sizes(), vec![115_200; 3]);

        assert!(device.deliver_next(115_200));
        assert_eq!(sink.count(), 1);
    }

    #[test]
    fn test_start_deferred_until_surface_ready() {
        let (device, sink, surface, session) = surface_session();

        session.request_start(640, 480, 30).unwrap();
        assert_eq!(session.state(), SessionState::AwaitingSurface);
        assert!(session.is_capture_requested());
        assert_eq!(device.calls().configure, 0);
        assert!(!device.is_streaming());

        surface.create(SurfaceHandle::new(7));
        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(
            device.output_target(),
            Some(OutputTarget::Surface(SurfaceHandle::new(7)))
        );
        assert!(device.deliver_next(FRAME));
        assert_eq!(sink.count(), 1);
    }

    #[test]
    fn test_surface_ready_before_request() {
        let (device, _sink, surface, session) = surface_session();
        surface.create(SurfaceHandle::new(3));
        assert_eq!(session.state(), SessionState::AwaitingRequest);
        assert_eq!(session.surface_binding().surface(), Some(SurfaceHandle::new(3)));
        assert_eq!(device.calls().configure, 0);

        session.request_start(640, 480, 30).unwrap();
        assert_eq!(session.state(), SessionState::Streaming);
    }

    #[test]
    fn test_surface_lost_while_streaming_falls_back_to_placeholder() {
        let events = Arc::new(EventBus::new());
        let mut rx = events.subscribe();
        let device = Arc::new(VirtualDevice::new("cam0"));
        let sink = Arc::new(CollectingSink::default());
        let surface = LocalSurface::new();
        let session = builder(&device, &sink)
            .surface_provider(surface.clone())
            .events(events.clone())
            .build()
            .unwrap();

        surface.create(SurfaceHandle::new(1));
        session.request_start(640, 480, 30).unwrap();
        drain(&mut rx);

        surface.destroy();
        assert_eq!(session.state(), SessionState::Streaming);
        assert!(session.surface_binding().is_placeholder());
        assert!(matches!(
            device.output_target(),
            Some(OutputTarget::Placeholder(_))
        ));
        assert!(device.deliver_next(FRAME));
        assert_eq!(sink.count(), 1);

        let names: Vec<_> = drain(&mut rx).iter().map(CaptureEvent::event_name).collect();
        assert_eq!(names, vec!["surface.lost", "surface.bound"]);

        // A new surface replaces the placeholder without restarting
        surface.create(SurfaceHandle::new(2));
        assert_eq!(session.surface_binding().surface(), Some(SurfaceHandle::new(2)));
        assert_eq!(device.calls().start_streaming, 1);
    }

    #[test]
    fn test_surface_lost_while_idle_unbinds() {
        let (device, _sink, surface, session) = surface_session();
        surface.create(SurfaceHandle::new(1));
        surface.destroy();
        assert_eq!(session.surface_binding(), SurfaceBinding::Unbound);
        assert_eq!(device.output_target(), None);
        assert_eq!(session.state(), SessionState::AwaitingRequest);

        // Losing nothing is a no-op
        session.notify_surface_lost().unwrap();
        assert_eq!(session.state(), SessionState::AwaitingRequest);
    }

    #[test]
    fn test_target_failure_on_surface_loss_halts_and_resumes() {
        let (device, _sink, surface, session) = surface_session();
        surface.create(SurfaceHandle::new(1));
        session.request_start(640, 480, 30).unwrap();

        device.inject_fault(Fault::SetOutputTarget);
        surface.destroy();

        assert_eq!(session.state(), SessionState::AwaitingSurface);
        assert!(session.is_capture_requested());
        assert!(!device.is_streaming());
        assert_eq!(session.pool_generation(), None);
        let (operation, _) = session.last_error().unwrap();
        assert_eq!(operation, "set_output_target");

        device.clear_fault(Fault::SetOutputTarget);
        surface.create(SurfaceHandle::new(2));
        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(session.pool_generation(), Some(2));
    }

    #[test]
    fn test_surface_changed_rebinds_new_handle() {
        let (device, _sink, session) = placeholder_session();
        session.notify_surface_ready(SurfaceHandle::new(1)).unwrap();
        session.request_start(640, 480, 30).unwrap();
        let calls = device.calls();

        session
            .notify_surface_changed(SurfaceHandle::new(1), 1280, 720)
            .unwrap();
        assert_eq!(device.calls(), calls);

        session
            .notify_surface_changed(SurfaceHandle::new(5), 1280, 720)
            .unwrap();
        assert_eq!(
            device.output_target(),
            Some(OutputTarget::Surface(SurfaceHandle::new(5)))
        );
        assert_eq!(session.state(), SessionState::Streaming);
    }

    #[test]
    fn test_start_failure_rolls_back() {
        for fault in [
            Fault::Configure,
            Fault::EnqueueBuffer,
            Fault::SetFrameCallback,
            Fault::StartStreaming,
        ] {
            let (device, _sink, session) = placeholder_session();
            device.inject_fault(fault);

            let err = session.request_start(640, 480, 30).unwrap_err();
            assert!(
                matches!(err, CaptureError::DeviceFailure { .. }),
                "{fault:?}: {err}"
            );
            assert_eq!(session.state(), SessionState::AwaitingRequest, "{fault:?}");
            assert!(!session.is_capture_requested());
            assert!(!device.is_streaming());
            assert!(!device.has_callback(), "{fault:?}");
            assert_eq!(session.pool_generation(), None);
            assert_eq!(session.active_config(), None);
            assert_eq!(device.queued_buffers(), 0, "{fault:?}");

            // Recovers once the device behaves
            device.clear_fault(fault);
            session.request_start(640, 480, 30).unwrap();
            assert_eq!(session.state(), SessionState::Streaming, "{fault:?}");
        }
    }

    #[test]
    fn test_partial_allocation_is_flushed() {
        let (device, _sink, session) = placeholder_session();
        device.set_queue_capacity(Some(2));

        let err = session.request_start(640, 480, 30).unwrap_err();
        assert_eq!(err.operation(), Some("enqueue_buffer"));
        assert_eq!(device.calls().enqueue_buffer, 3);
        assert_eq!(device.calls().flush_buffers, 1);
        assert_eq!(device.queued_buffers(), 0);
        assert_eq!(session.hardware_owned_buffers(), 0);
        assert_eq!(session.state(), SessionState::AwaitingRequest);

        device.set_queue_capacity(None);
        session.request_start(640, 480, 30).unwrap();
        assert_eq!(device.queued_buffers(), 3);
        assert_eq!(session.hardware_owned_buffers(), 3);
    }

    #[test]
    fn test_surface_triggered_start_failure_is_recorded() {
        let events = Arc::new(EventBus::new());
        let mut rx = events.subscribe();
        let device = Arc::new(VirtualDevice::new("cam0"));
        let sink = Arc::new(CollectingSink::default());
        let surface = LocalSurface::new();
        let session = builder(&device, &sink)
            .surface_provider(surface.clone())
            .events(events.clone())
            .build()
            .unwrap();

        session.request_start(640, 480, 30).unwrap();
        device.inject_fault(Fault::StartStreaming);
        surface.create(SurfaceHandle::new(1));

        assert_eq!(session.state(), SessionState::AwaitingRequest);
        assert_eq!(
            session.last_error().map(|(operation, _)| operation),
            Some("start_streaming".to_string())
        );
        assert!(drain(&mut rx).iter().any(|event| matches!(
            event,
            CaptureEvent::DeviceError { operation: Some(op), .. } if op == "start_streaming"
        )));

        session.clear_error();
        assert!(session.last_error().is_none());
    }

    #[test]
    fn test_invalid_configuration() {
        let (device, _sink, session) = placeholder_session();

        assert!(matches!(
            session.request_start(0, 480, 30),
            Err(CaptureError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            session.request_start(640, 480, 0),
            Err(CaptureError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            session.request_start_with(DeviceConfig::new(640, 480, 30, PixelFormat::Mjpeg)),
            Err(CaptureError::InvalidConfiguration(_))
        ));
        assert_eq!(session.state(), SessionState::AwaitingRequest);
        assert_eq!(device.calls().configure, 0);
    }

    #[test]
    fn test_stop_failure_still_stops() {
        let (device, sink, session) = placeholder_session();
        session.request_start(640, 480, 30).unwrap();
        let in_flight = device.capture_in_flight(FRAME).unwrap();
        device.inject_fault(Fault::StopStreaming);

        let err = session.request_stop().unwrap_err();
        assert_eq!(err.operation(), Some("stop_streaming"));
        assert_eq!(session.state(), SessionState::AwaitingRequest);
        assert!(!session.is_capture_requested());

        in_flight.complete();
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_stop_when_not_streaming() {
        let (device, _sink, surface, session) = surface_session();
        session.request_start(640, 480, 30).unwrap();
        assert_eq!(session.state(), SessionState::AwaitingSurface);

        session.request_stop().unwrap();
        assert_eq!(session.state(), SessionState::AwaitingRequest);
        assert_eq!(device.calls().stop_streaming, 0);

        // Request is gone, a surface alone does not start capture
        surface.create(SurfaceHandle::new(1));
        assert_eq!(session.state(), SessionState::AwaitingRequest);
    }

    #[test]
    fn test_frame_in_flight_during_stop_is_discarded() {
        let (device, sink, session) = placeholder_session();
        session.request_start(640, 480, 30).unwrap();

        let frame = device.capture_in_flight(FRAME).unwrap();
        session.request_stop().unwrap();
        frame.complete();

        assert_eq!(sink.count(), 0);
        assert_eq!(session.stats().frames_dropped_stopped, 1);
    }

    #[test]
    fn test_no_frame_forwarded_after_stop_returns() {
        let (device, sink, session) = placeholder_session();
        session.request_start(640, 480, 30).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let producer = {
            let device = device.clone();
            let barrier = barrier.clone();
            let done = done.clone();
            thread::spawn(move || {
                barrier.wait();
                while !done.load(std::sync::atomic::Ordering::Relaxed) {
                    device.deliver_next(FRAME);
                }
            })
        };

        barrier.wait();
        thread::sleep(Duration::from_millis(5));
        session.request_stop().unwrap();
        let forwarded = sink.count();

        thread::sleep(Duration::from_millis(5));
        done.store(true, std::sync::atomic::Ordering::Relaxed);
        producer.join().unwrap();

        assert_eq!(sink.count(), forwarded);
        assert_consistent(&session, &device);
    }

    #[test]
    fn test_slow_stop_does_not_block_callbacks() {
        let (device, sink, session) = placeholder_session();
        session.request_start(640, 480, 30).unwrap();
        device.set_stop_latency(Duration::from_millis(300));

        let stopper = {
            let session = session.clone();
            thread::spawn(move || session.request_stop())
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while !(session.state() == SessionState::Stopping
            && !session.inner.delivery.is_streaming())
        {
            assert!(Instant::now() < deadline, "stop never reached the device");
            thread::yield_now();
        }
        let started = Instant::now();
        assert!(device.deliver_buffer(FrameBuffer::external(vec![0; FRAME]), FRAME));
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(sink.count(), 0);

        stopper.join().unwrap().unwrap();
        assert_eq!(session.state(), SessionState::AwaitingRequest);
    }

    #[test]
    fn test_concurrent_start_from_request_and_surface() {
        for _ in 0..20 {
            let (device, _sink, surface, session) = surface_session();
            let barrier = Arc::new(Barrier::new(2));

            let requester = {
                let session = session.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    session.request_start(640, 480, 30)
                })
            };
            let presenter = {
                let surface = surface.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    surface.create(SurfaceHandle::new(1));
                })
            };

            requester.join().unwrap().unwrap();
            presenter.join().unwrap();

            assert_eq!(session.state(), SessionState::Streaming);
            assert_eq!(device.calls().configure, 1);
            assert_eq!(device.calls().start_streaming, 1);
            assert_eq!(session.pool_generation(), Some(1));
        }
    }

    #[test]
    fn test_streaming_implies_request_and_surface() {
        let (device, _sink, surface, session) = surface_session();
        let mut seed: u64 = 0x5eed;
        let mut next_handle = 1;

        for _ in 0..400 {
            seed = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            match (seed >> 33) % 5 {
                0 => session.request_start(640, 480, 30).unwrap(),
                1 => session.request_stop().unwrap(),
                2 => {
                    next_handle += 1;
                    surface.create(SurfaceHandle::new(next_handle));
                }
                3 => surface.destroy(),
                _ => {
                    device.deliver_next(FRAME);
                }
            }
            assert_consistent(&session, &device);
        }
        assert!(session.last_error().is_none());
    }

    #[test]
    fn test_rotation_compensation() {
        let device = Arc::new(VirtualDevice::new("front0"));
        let sink = Arc::new(CollectingSink::default());
        let info = StaticDeviceInfo::new()
            .with_device(DeviceDescriptor::new("front0", Facing::Front).with_mirror_quirk(true));
        let session = builder(&device, &sink)
            .device_info(Arc::new(info))
            .build()
            .unwrap();
        assert!(session.descriptor().is_front_facing_with_mirror());

        session.set_rotation(90).unwrap();
        assert_eq!(device.orientation(), Some(270));
        assert_eq!(
            session.rotation(),
            Some(Rotation {
                requested: 90,
                effective: 270
            })
        );

        let (back, _sink, session) = placeholder_session();
        session.set_rotation(450).unwrap();
        assert_eq!(back.orientation(), Some(90));
        // Rotation never touches streaming state
        assert_eq!(session.state(), SessionState::AwaitingRequest);
        assert_eq!(back.calls().configure, 0);
    }

    #[test]
    fn test_rotation_failure_is_reported() {
        let (device, _sink, session) = placeholder_session();
        device.inject_fault(Fault::SetDisplayOrientation);
        assert_eq!(
            session.set_rotation(180).unwrap_err().operation(),
            Some("set_display_orientation")
        );
        assert_eq!(session.rotation(), None);
    }

    #[test]
    fn test_detach() {
        let (device, sink, session) = placeholder_session();
        session.request_start(640, 480, 30).unwrap();

        session.detach().unwrap();
        assert_eq!(session.state(), SessionState::Detached);
        assert!(device.is_released());
        assert!(!device.deliver_next(FRAME));
        assert_eq!(sink.count(), 0);

        assert!(matches!(
            session.request_start(640, 480, 30),
            Err(CaptureError::DeviceNotAttached)
        ));
        assert!(matches!(
            session.request_stop(),
            Err(CaptureError::DeviceNotAttached)
        ));
        session.set_rotation(90).unwrap();
        assert_eq!(device.orientation(), None);
        session.notify_surface_ready(SurfaceHandle::new(1)).unwrap();
        session.detach().unwrap();
        assert_eq!(device.calls().release, 1);
    }

    #[test]
    fn test_state_events_and_watch() {
        let events = Arc::new(EventBus::new());
        let mut rx = events.subscribe();
        let device = Arc::new(VirtualDevice::new("cam0"));
        let sink = Arc::new(CollectingSink::default());
        let session = builder(&device, &sink)
            .events(events.clone())
            .build()
            .unwrap();
        let watch = session.state_watch();

        session.request_start(640, 480, 30).unwrap();
        assert_eq!(*watch.borrow(), SessionState::Streaming);
        session.request_stop().unwrap();
        assert_eq!(*watch.borrow(), SessionState::AwaitingRequest);

        let states: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                CaptureEvent::StateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                SessionState::Streaming,
                SessionState::Stopping,
                SessionState::AwaitingRequest
            ]
        );
    }

    #[test]
    fn test_process_no_picture_alarm() {
        let events = Arc::new(EventBus::new());
        let mut rx = events.subscribe();
        let device = Arc::new(VirtualDevice::new("cam0"));
        let sink = Arc::new(CollectingSink::default());
        let settings = CaptureSettings {
            no_picture_timeout_ms: 20,
            ..Default::default()
        };
        let session = builder(&device, &sink)
            .settings(settings)
            .events(events.clone())
            .build()
            .unwrap();

        session.request_start(640, 480, 30).unwrap();
        thread::sleep(Duration::from_millis(40));
        session.process();

        let alarms = |events: Vec<CaptureEvent>| -> Vec<AlarmState> {
            events
                .into_iter()
                .filter_map(|event| match event {
                    CaptureEvent::NoPictureAlarm { alarm, .. } => Some(alarm),
                    _ => None,
                })
                .collect()
        };
        let raised = drain(&mut rx);
        assert!(raised
            .iter()
            .any(|event| event.event_name() == "capture.frame_rate"));
        assert_eq!(alarms(raised), vec![AlarmState::Raised]);

        assert!(device.deliver_next(FRAME));
        session.process();
        assert_eq!(alarms(drain(&mut rx)), vec![AlarmState::Cleared]);
        assert_eq!(session.stats().frames_delivered, 1);
    }

    #[test]
    fn test_process_reports_can_be_disabled() {
        let events = Arc::new(EventBus::new());
        let mut rx = events.subscribe();
        let device = Arc::new(VirtualDevice::new("cam0"));
        let sink = Arc::new(CollectingSink::default());
        let settings = CaptureSettings {
            no_picture_timeout_ms: 20,
            no_picture_alarm: false,
            frame_rate_events: false,
            ..Default::default()
        };
        let session = builder(&device, &sink)
            .settings(settings)
            .events(events.clone())
            .build()
            .unwrap();

        session.request_start(640, 480, 30).unwrap();
        drain(&mut rx);
        thread::sleep(Duration::from_millis(40));
        session.process();

        assert!(drain(&mut rx).is_empty());
        assert_eq!(session.inner.alarm.lock().state(), AlarmState::Cleared);
    }

    #[test]
    fn test_builder_requirements() {
        let sink = Arc::new(CollectingSink::default());
        assert!(matches!(
            CaptureSession::builder()
                .sink(sink.clone(), SinkContext(0))
                .build(),
            Err(CaptureError::DeviceNotAttached)
        ));

        let device = Arc::new(VirtualDevice::new("cam0"));
        assert!(matches!(
            CaptureSession::builder().device(device.clone()).build(),
            Err(CaptureError::InvalidConfiguration(_))
        ));

        let settings = CaptureSettings {
            buffer_count: 0,
            ..Default::default()
        };
        assert!(matches!(
            builder(&device, &sink).settings(settings).build(),
            Err(CaptureError::Config(_))
        ));

        let session = builder(&device, &sink).build().unwrap();
        assert_eq!(session.id(), "cam0");
        assert_eq!(session.descriptor().facing, Facing::Back);
    }

    #[test]
    fn test_no_placeholder_without_opt_in() {
        let device = Arc::new(VirtualDevice::new("cam0"));
        let sink = Arc::new(CollectingSink::default());
        let settings = CaptureSettings {
            placeholder_when_no_surface: false,
            ..Default::default()
        };
        let session = builder(&device, &sink).settings(settings).build().unwrap();

        session.request_start(640, 480, 30).unwrap();
        assert_eq!(session.state(), SessionState::AwaitingSurface);

        session.notify_surface_ready(SurfaceHandle::new(9)).unwrap();
        assert_eq!(session.state(), SessionState::Streaming);
    }

    /// Sink that calls back into its own session from `deliver_frame`
    #[derive(Default)]
    struct CallbackSink {
        session: Mutex<Option<CaptureSession>>,
        stop: bool,
        seen: Mutex<Vec<CaptureStats>>,
        stop_results: Mutex<Vec<bool>>,
    }

    impl FrameSink for CallbackSink {
        fn deliver_frame(&self, _data: &[u8], _length: usize, _context: SinkContext) {
            let Some(session) = self.session.lock().clone() else {
                return;
            };
            self.seen.lock().push(session.stats());
            if self.stop {
                let stopped = session.request_stop().is_ok();
                self.stop_results.lock().push(stopped);
            }
        }
    }

    fn callback_session(stop: bool) -> (Arc<VirtualDevice>, Arc<CallbackSink>, CaptureSession) {
        let device = Arc::new(VirtualDevice::new("cam0"));
        let sink = Arc::new(CallbackSink {
            stop,
            ..Default::default()
        });
        let session = CaptureSession::builder()
            .device(device.clone())
            .sink(sink.clone(), SinkContext(0))
            .build()
            .unwrap();
        *sink.session.lock() = Some(session.clone());
        (device, sink, session)
    }

    #[test]
    fn test_sink_reading_stats_does_not_block() {
        let (device, sink, session) = callback_session(false);
        session.request_start(640, 480, 30).unwrap();

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let producer = device.clone();
        thread::spawn(move || {
            let delivered = producer.deliver_next(FRAME);
            let _ = done_tx.send(delivered);
        });

        assert_eq!(done_rx.recv_timeout(Duration::from_secs(2)), Ok(true));
        assert_eq!(sink.seen.lock().len(), 1);
        assert_eq!(sink.seen.lock()[0].frames_delivered, 0);
        assert_eq!(session.stats().frames_delivered, 1);
        assert_eq!(device.queued_buffers(), 3);

        sink.session.lock().take();
    }

    #[test]
    fn test_sink_can_stop_session() {
        let (device, sink, session) = callback_session(true);
        session.request_start(640, 480, 30).unwrap();

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let producer = device.clone();
        thread::spawn(move || {
            let delivered = producer.deliver_next(FRAME);
            let _ = done_tx.send(delivered);
        });

        assert_eq!(done_rx.recv_timeout(Duration::from_secs(2)), Ok(true));
        assert_eq!(*sink.stop_results.lock(), vec![true]);
        assert_eq!(session.state(), SessionState::AwaitingRequest);
        assert!(!session.is_capture_requested());
        assert!(!device.is_streaming());
        assert!(!device.has_callback());
        assert_eq!(session.pool_generation(), None);
        assert!(!device.deliver_next(FRAME));
        assert_consistent(&session, &device);

        sink.session.lock().take();
    }

    #[test]
    fn test_sink_stop_deferred_while_capture_lock_busy() {
        let (device, sink, session) = callback_session(true);
        session.request_start(640, 480, 30).unwrap();

        let busy = session.inner.control.lock();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let producer = device.clone();
        thread::spawn(move || {
            let delivered = producer.deliver_next(FRAME);
            let _ = done_tx.send(delivered);
        });

        // Returns without the capture lock; the data plane is already stopped
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(2)), Ok(true));
        assert_eq!(*sink.stop_results.lock(), vec![true]);
        assert!(!session.inner.delivery.is_streaming());
        assert_eq!(session.pool_generation(), None);
        drop(busy);

        let deadline = Instant::now() + Duration::from_secs(5);
        while session.state() != SessionState::AwaitingRequest {
            assert!(Instant::now() < deadline, "deferred stop never completed");
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!session.is_capture_requested());
        assert!(!device.is_streaming());
        assert_consistent(&session, &device);

        sink.session.lock().take();
    }
}
