//! Buffer binding
//!
//! Imports opaque buffer handles into device-visible addresses and owns
//! their release. A [`BufferBinding`] unmaps itself exactly once: either
//! through an explicit [`BufferBinding::release`] or when it is dropped.

use log::trace;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::fence::Fence;

/// Opaque handle naming a buffer owned by a producer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferHandle(pub u64);

/// Device a buffer is mapped for (the DMA channel that reads it)
pub type DeviceId = u32;

/// Result of a successful import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMapping {
    pub handle: BufferHandle,
    pub device: DeviceId,
    pub dma_addr: u64,
    pub size: u64,
}

/// Provider of buffer imports, implemented by the platform allocator
pub trait BufferProvider: Send + Sync {
    /// Map `handle` for `device`
    fn import(&self, handle: BufferHandle, device: DeviceId) -> Result<DeviceMapping>;

    /// Undo a mapping returned by [`import`](Self::import)
    fn unmap(&self, mapping: &DeviceMapping);
}

/// A buffer mapped for one device, with the fence its producer signals
/// once the contents are written.
pub struct BufferBinding {
    mapping: Option<DeviceMapping>,
    acquire: Option<Fence>,
    provider: Option<Arc<dyn BufferProvider>>,
}

impl BufferBinding {
    pub fn import(
        provider: &Arc<dyn BufferProvider>,
        handle: BufferHandle,
        device: DeviceId,
        acquire: Option<Fence>,
    ) -> Result<Self> {
        let mapping = provider.import(handle, device)?;
        trace!(
            target: "shadowcommit::buffer",
            "map {:?} dev={} dva={:#x} size={}",
            mapping.handle,
            mapping.device,
            mapping.dma_addr,
            mapping.size
        );
        Ok(Self {
            mapping: Some(mapping),
            acquire,
            provider: Some(Arc::clone(provider)),
        })
    }

    /// A binding that owns nothing; releasing it is a no-op
    pub fn empty() -> Self {
        Self {
            mapping: None,
            acquire: None,
            provider: None,
        }
    }

    /// Unmap the buffer. Safe to call any number of times.
    pub fn release(&mut self) {
        self.acquire = None;
        let (Some(mapping), Some(provider)) = (self.mapping.take(), self.provider.take()) else {
            return;
        };
        trace!(
            target: "shadowcommit::buffer",
            "unmap {:?} dev={} dva={:#x} size={}",
            mapping.handle,
            mapping.device,
            mapping.dma_addr,
            mapping.size
        );
        provider.unmap(&mapping);
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    pub fn handle(&self) -> Option<BufferHandle> {
        self.mapping.as_ref().map(|m| m.handle)
    }

    pub fn dma_addr(&self) -> u64 {
        self.mapping.as_ref().map(|m| m.dma_addr).unwrap_or(0)
    }

    pub fn size(&self) -> u64 {
        self.mapping.as_ref().map(|m| m.size).unwrap_or(0)
    }

    pub fn acquire(&self) -> Option<&Fence> {
        self.acquire.as_ref()
    }
}

impl Drop for BufferBinding {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for BufferBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferBinding")
            .field("mapping", &self.mapping)
            .field("acquire", &self.acquire.as_ref().map(|a| a.seqno()))
            .finish()
    }
}

/// Import every plane of one window. The acquire fence is attached to the
/// first plane. A failure unmaps the planes imported so far.
pub fn import_planes(
    provider: &Arc<dyn BufferProvider>,
    handles: &[BufferHandle],
    device: DeviceId,
    acquire: Option<Fence>,
) -> Result<Vec<BufferBinding>> {
    let mut planes = Vec::with_capacity(handles.len());
    let mut acquire = acquire;
    for &handle in handles {
        // on error the partial `planes` vec drops and unmaps
        planes.push(BufferBinding::import(provider, handle, device, acquire.take())?);
    }
    Ok(planes)
}

/// Bindings of a frame that the hardware may still scan out. Released only
/// once the following frame's latch is confirmed.
#[derive(Debug, Default)]
pub struct StaleBuffers {
    bindings: Vec<BufferBinding>,
}

impl StaleBuffers {
    pub fn new(bindings: Vec<BufferBinding>) -> Self {
        Self { bindings }
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Take over more bindings
    pub fn absorb(&mut self, bindings: impl IntoIterator<Item = BufferBinding>) {
        self.bindings.extend(bindings);
    }

    pub fn release_all(&mut self) {
        for binding in &mut self.bindings {
            binding.release();
        }
        self.bindings.clear();
    }
}
