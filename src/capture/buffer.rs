//! Frame buffer arena shared between the hardware and frame delivery
//!
//! A pool is a fixed set of equally sized slots. Each slot's bytes travel
//! by value: into the device on enqueue, back out through the frame
//! callback, and into the device again on reclaim. The pool only tracks
//! who owns each slot right now.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use super::device::CaptureDevice;
use crate::error::{CaptureError, Result};

/// Number of buffers cycled between hardware and delivery
pub const DEFAULT_BUFFER_COUNT: usize = 3;

/// Where a buffer's memory came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOrigin {
    /// Slot `slot` of the pool allocated as `generation`
    Pool { generation: u64, slot: usize },
    /// Memory supplied by the device itself (zero-copy target)
    External,
}

/// A byte buffer in transit between the hardware and the sink
pub struct FrameBuffer {
    data: Vec<u8>,
    origin: BufferOrigin,
}

impl FrameBuffer {
    fn pooled(size: usize, generation: u64, slot: usize) -> Self {
        Self {
            data: vec![0u8; size],
            origin: BufferOrigin::Pool { generation, slot },
        }
    }

    /// Wrap device-owned memory
    pub fn external(data: Vec<u8>) -> Self {
        Self {
            data,
            origin: BufferOrigin::External,
        }
    }

    pub fn origin(&self) -> BufferOrigin {
        self.origin
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("origin", &self.origin)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Current owner of a pool slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOwner {
    /// Queued in the device, waiting to be filled
    Hardware,
    /// Handed out by the frame callback, on its way to the sink
    Delivery,
}

/// Outcome of returning a buffer to the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclaim {
    /// Buffer went back into the hardware queue
    Requeued,
    /// Buffer belongs to an earlier pool and was dropped
    Stale,
    /// Buffer is device memory; nothing to recycle
    External,
}

/// Fixed-size arena of frame buffers bound to one device configuration
pub struct FrameBufferPool {
    device: Arc<dyn CaptureDevice>,
    generation: u64,
    buffer_size: usize,
    slots: Vec<SlotOwner>,
}

impl FrameBufferPool {
    /// Allocate `count` zeroed buffers of `size` bytes and queue all of them
    /// into `device`.
    pub fn allocate(
        device: Arc<dyn CaptureDevice>,
        count: usize,
        size: usize,
        generation: u64,
    ) -> Result<Self> {
        if count == 0 || size == 0 {
            return Err(CaptureError::InvalidConfiguration(format!(
                "cannot allocate {} buffers of {} bytes",
                count, size
            )));
        }

        let mut slots = Vec::with_capacity(count);
        for slot in 0..count {
            device.enqueue_buffer(FrameBuffer::pooled(size, generation, slot))?;
            slots.push(SlotOwner::Hardware);
        }

        debug!(
            "Allocated buffer pool #{}: {} x {} bytes",
            generation, count, size
        );

        Ok(Self {
            device,
            generation,
            buffer_size: size,
            slots,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn owner(&self, slot: usize) -> Option<SlotOwner> {
        self.slots.get(slot).copied()
    }

    /// Number of slots currently queued in the hardware
    pub fn hardware_owned(&self) -> usize {
        self.slots
            .iter()
            .filter(|owner| **owner == SlotOwner::Hardware)
            .count()
    }

    /// Slot index of `buffer` if it belongs to this pool
    fn slot_of(&self, buffer: &FrameBuffer) -> Option<usize> {
        match buffer.origin {
            BufferOrigin::Pool { generation, slot }
                if generation == self.generation && slot < self.slots.len() =>
            {
                Some(slot)
            }
            _ => None,
        }
    }

    /// Record that the hardware handed `buffer` back for delivery.
    /// Returns false when the buffer is not a hardware-owned slot of this pool.
    pub fn begin_delivery(&mut self, buffer: &FrameBuffer) -> bool {
        match self.slot_of(buffer) {
            Some(slot) if self.slots[slot] == SlotOwner::Hardware => {
                self.slots[slot] = SlotOwner::Delivery;
                true
            }
            _ => false,
        }
    }

    /// Return a delivered buffer to the hardware queue.
    ///
    /// Buffers from another pool generation are dropped instead of being fed
    /// to hardware configured for a different frame size.
    pub fn reclaim(&mut self, buffer: FrameBuffer) -> Result<Reclaim> {
        if buffer.origin == BufferOrigin::External {
            return Ok(Reclaim::External);
        }
        let Some(slot) = self.slot_of(&buffer) else {
            trace!(
                "Dropping stale buffer {:?} (active pool #{})",
                buffer.origin,
                self.generation
            );
            return Ok(Reclaim::Stale);
        };

        self.device.enqueue_buffer(buffer)?;
        self.slots[slot] = SlotOwner::Hardware;
        Ok(Reclaim::Requeued)
    }
}

impl fmt::Debug for FrameBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBufferPool")
            .field("device", &self.device.id())
            .field("generation", &self.generation)
            .field("buffer_size", &self.buffer_size)
            .field("slots", &self.slots)
            .finish()
    }
}
