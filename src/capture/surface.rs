//! Render surface coordination
//!
//! Tracks which output target is bound to the device. Three states:
//!
//! ```text
//!             created(h)                 destroyed
//!   Unbound ─────────────► RealBound ──────────────► Unbound
//!      │                       ▲
//!      │ no provider           │ created(h)
//!      ▼                       │
//!   PlaceholderBound ──────────┘
//! ```
//!
//! A placeholder only satisfies the hardware's "some target must be set"
//! precondition. Nothing ever reads frames back from it.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::device::{CaptureDevice, OutputTarget};
use super::session::SessionInner;
use crate::error::Result;

/// Opaque handle to a render surface owned by the surface provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SurfaceHandle(u64);

impl SurfaceHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// What the surface provider can offer right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceAvailability {
    /// No provider-managed surface will ever appear; install a placeholder
    Unavailable,
    /// A surface exists but is not valid yet; wait for `created`
    Pending,
    /// A valid surface is ready to bind
    Ready(SurfaceHandle),
}

/// Supplier of render surfaces.
///
/// `subscribe` is called once per session; the provider keeps the
/// [`SurfaceEvents`] handle and reports lifecycle changes through it from
/// its own thread.
pub trait SurfaceProvider: Send + Sync {
    fn availability(&self) -> SurfaceAvailability;

    fn subscribe(&self, events: SurfaceEvents);
}

/// Surface lifecycle notifications routed into a capture session
#[derive(Clone)]
pub struct SurfaceEvents {
    session: Weak<SessionInner>,
}

impl SurfaceEvents {
    pub(crate) fn new(session: Weak<SessionInner>) -> Self {
        Self { session }
    }

    /// Surface became valid
    pub fn created(&self, handle: SurfaceHandle) {
        if let Some(session) = self.session.upgrade() {
            session.surface_ready(handle);
        }
    }

    /// Surface geometry or identity changed
    pub fn changed(&self, handle: SurfaceHandle, width: u32, height: u32) {
        if let Some(session) = self.session.upgrade() {
            session.surface_changed(handle, width, height);
        }
    }

    /// Surface was torn down
    pub fn destroyed(&self) {
        if let Some(session) = self.session.upgrade() {
            session.surface_lost();
        }
    }

    /// Whether the session behind this handle still exists
    pub fn is_connected(&self) -> bool {
        self.session.strong_count() > 0
    }
}

/// Output target currently bound to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SurfaceBinding {
    #[default]
    Unbound,
    PlaceholderBound(u64),
    RealBound(SurfaceHandle),
}

impl SurfaceBinding {
    /// Whether some target is bound (placeholders count)
    pub fn is_ready(&self) -> bool {
        !matches!(self, SurfaceBinding::Unbound)
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, SurfaceBinding::PlaceholderBound(_))
    }

    pub fn surface(&self) -> Option<SurfaceHandle> {
        match self {
            SurfaceBinding::RealBound(handle) => Some(*handle),
            _ => None,
        }
    }

    pub fn target(&self) -> Option<OutputTarget> {
        match self {
            SurfaceBinding::Unbound => None,
            SurfaceBinding::PlaceholderBound(id) => Some(OutputTarget::Placeholder(*id)),
            SurfaceBinding::RealBound(handle) => Some(OutputTarget::Surface(*handle)),
        }
    }

    /// Bind a real surface, replacing whatever was bound.
    /// Returns false if `handle` was already bound.
    pub fn bind_real(&mut self, device: &dyn CaptureDevice, handle: SurfaceHandle) -> Result<bool> {
        if *self == SurfaceBinding::RealBound(handle) {
            return Ok(false);
        }
        device.set_output_target(Some(OutputTarget::Surface(handle)))?;
        debug!("Bound surface {} (was {:?})", handle.id(), self);
        *self = SurfaceBinding::RealBound(handle);
        Ok(true)
    }

    /// Install a disposable target. Only valid from `Unbound`.
    pub fn install_placeholder(&mut self, device: &dyn CaptureDevice, id: u64) -> Result<bool> {
        if self.is_ready() {
            return Ok(false);
        }
        device.set_output_target(Some(OutputTarget::Placeholder(id)))?;
        debug!("Installed placeholder target #{}", id);
        *self = SurfaceBinding::PlaceholderBound(id);
        Ok(true)
    }

    /// Clear the bound target. The binding is reset even if the device
    /// call fails, since the target is gone either way.
    pub fn unbind(&mut self, device: &dyn CaptureDevice) -> Result<()> {
        if !self.is_ready() {
            return Ok(());
        }
        let previous = std::mem::take(self);
        debug!("Unbinding {:?}", previous);
        device.set_output_target(None)
    }
}

#[derive(Default)]
struct LocalSurfaceState {
    availability: Option<SurfaceAvailability>,
    subscribers: Vec<SurfaceEvents>,
}

/// In-process surface provider driven by the embedding application.
///
/// Starts out `Pending`; call [`LocalSurface::create`] and
/// [`LocalSurface::destroy`] from the UI thread as the real surface comes
/// and goes.
#[derive(Default)]
pub struct LocalSurface {
    state: Mutex<LocalSurfaceState>,
}

impl LocalSurface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publish a valid surface and notify subscribers
    pub fn create(&self, handle: SurfaceHandle) {
        let subscribers = {
            let mut state = self.state.lock();
            state.availability = Some(SurfaceAvailability::Ready(handle));
            state.subscribers.retain(SurfaceEvents::is_connected);
            state.subscribers.clone()
        };
        for events in subscribers {
            events.created(handle);
        }
    }

    /// Report new geometry for the current surface
    pub fn resize(&self, width: u32, height: u32) {
        let (handle, subscribers) = {
            let state = self.state.lock();
            match state.availability {
                Some(SurfaceAvailability::Ready(handle)) => (handle, state.subscribers.clone()),
                _ => return,
            }
        };
        for events in subscribers {
            events.changed(handle, width, height);
        }
    }

    /// Tear the surface down and notify subscribers
    pub fn destroy(&self) {
        let subscribers = {
            let mut state = self.state.lock();
            state.availability = Some(SurfaceAvailability::Pending);
            state.subscribers.clone()
        };
        for events in subscribers {
            events.destroyed();
        }
    }
}

impl SurfaceProvider for LocalSurface {
    fn availability(&self) -> SurfaceAvailability {
        self.state
            .lock()
            .availability
            .unwrap_or(SurfaceAvailability::Pending)
    }

    fn subscribe(&self, events: SurfaceEvents) {
        self.state.lock().subscribers.push(events);
    }
}
