//! Capture device contexts and the bounded device registry

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::buffer_pool::{BufferDescriptor, BufferPool, BufferState};
use super::driver::{CaptureBackend, CaptureDriver, WaitTimeout};
use super::format::{FormatDescriptor, PlaneMode, MAX_PLANES};
use crate::error::{MediaError, Result};

/// Default number of slots in a [`DeviceRegistry`]
pub const MAX_DEVICES: usize = 16;

/// One open capture endpoint with its negotiated format and buffer pool
pub struct DeviceContext<D: CaptureDriver> {
    driver: D,
    path: PathBuf,
    plane_mode: PlaneMode,
    format: Option<FormatDescriptor>,
    pool: Option<BufferPool<D::Mapping>>,
    streaming: bool,
    closed: bool,
}

impl<D: CaptureDriver> DeviceContext<D> {
    /// Open the endpoint at `path`
    pub fn open<B>(
        backend: &B,
        path: impl AsRef<Path>,
        plane_mode: PlaneMode,
        nonblocking: bool,
    ) -> Result<Self>
    where
        B: CaptureBackend<Driver = D>,
    {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(MediaError::InvalidParam("Empty device path".to_string()));
        }
        let driver = backend.open(path, nonblocking)?;
        info!("Opened {:?} ({})", path, plane_mode);
        Ok(Self {
            driver,
            path: path.to_path_buf(),
            plane_mode,
            format: None,
            pool: None,
            streaming: false,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn plane_mode(&self) -> PlaneMode {
        self.plane_mode
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Negotiated format, once `set_format` succeeded
    pub fn format(&self) -> Option<&FormatDescriptor> {
        self.format.as_ref()
    }

    pub fn pool(&self) -> Option<&BufferPool<D::Mapping>> {
        self.pool.as_ref()
    }

    pub fn buffer_count(&self) -> usize {
        self.pool.as_ref().map(|p| p.len()).unwrap_or(0)
    }

    /// Negotiate a capture format
    ///
    /// The returned descriptor holds what the driver applied, which may
    /// differ from `requested`.
    pub fn set_format(&mut self, requested: &FormatDescriptor) -> Result<&FormatDescriptor> {
        requested.validate(self.plane_mode)?;
        if self.pool.is_some() {
            return Err(MediaError::DeviceBusy(format!(
                "{:?}: cannot change format while buffers are allocated",
                self.path
            )));
        }

        let applied = self.driver.set_format(requested, self.plane_mode)?;
        let planes = applied.num_planes();
        if planes == 0
            || planes > MAX_PLANES
            || (self.plane_mode == PlaneMode::Single && planes != 1)
        {
            return Err(MediaError::FormatError(format!(
                "Driver negotiated {} planes in {} mode",
                planes, self.plane_mode
            )));
        }
        if applied != *requested {
            debug!("Driver adjusted format {} -> {}", requested, applied);
        }
        info!("Format set: {}", applied);
        Ok(self.format.insert(applied))
    }

    /// Allocate and map `count` buffers; returns the number granted
    pub fn request_buffers(&mut self, count: u32) -> Result<usize> {
        let planes = match &self.format {
            Some(fmt) => fmt.num_planes(),
            None => {
                return Err(MediaError::FormatError(
                    "Format must be set before requesting buffers".to_string(),
                ))
            }
        };
        if self.pool.is_some() {
            return Err(MediaError::DeviceBusy(format!(
                "{:?}: buffers already allocated",
                self.path
            )));
        }
        let pool = BufferPool::allocate(&mut self.driver, count, planes)?;
        let granted = pool.len();
        self.pool = Some(pool);
        Ok(granted)
    }

    /// Unmap and release all buffers
    pub fn free_buffers(&mut self) -> Result<()> {
        if self.streaming {
            return Err(MediaError::DeviceBusy(format!(
                "{:?}: cannot free buffers while streaming",
                self.path
            )));
        }
        match self.pool.as_mut() {
            Some(pool) => {
                pool.free(&mut self.driver)?;
                self.pool = None;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn pool_mut(&mut self) -> Result<&mut BufferPool<D::Mapping>> {
        self.pool
            .as_mut()
            .ok_or_else(|| MediaError::BufferError("No buffers allocated".to_string()))
    }

    pub(crate) fn queue_buffer(&mut self, index: u32) -> Result<()> {
        let pool = self
            .pool
            .as_mut()
            .ok_or_else(|| MediaError::BufferError("No buffers allocated".to_string()))?;
        pool.queue(&mut self.driver, index)
    }

    pub(crate) fn dequeue_buffer(&mut self) -> Result<BufferDescriptor> {
        let pool = self
            .pool
            .as_mut()
            .ok_or_else(|| MediaError::BufferError("No buffers allocated".to_string()))?;
        pool.dequeue(&mut self.driver).cloned()
    }

    pub(crate) fn release_filled(&mut self, index: u32) -> Result<()> {
        self.pool_mut()?.release_filled(index)
    }

    /// Wait for a filled buffer; `Ok(false)` on timeout or signal interruption
    pub fn wait_for_frame(&mut self, timeout: WaitTimeout) -> Result<bool> {
        if !self.streaming {
            return Err(MediaError::StreamingError(format!(
                "{:?} is not streaming",
                self.path
            )));
        }
        self.driver.wait_ready(timeout.as_duration())
    }

    /// Bounded readiness wait used by interruptible callers
    pub(crate) fn wait_slice(&mut self, slice: Duration) -> Result<bool> {
        self.driver.wait_ready(Some(slice))
    }

    pub fn start_streaming(&mut self) -> Result<()> {
        if self.streaming {
            return Ok(());
        }
        if self.pool.as_ref().map_or(true, |p| p.is_empty()) {
            return Err(MediaError::StreamingError(
                "No buffers allocated".to_string(),
            ));
        }
        self.driver.stream_on()?;
        self.streaming = true;
        debug!("Streaming on {:?}", self.path);
        Ok(())
    }

    /// Disable streaming; every QUEUED buffer becomes FREE
    ///
    /// STREAMOFF is issued whenever the driver may hold buffers, including
    /// after a failed STREAMON. Queued buffers are reclaimed only once the
    /// driver has given them back.
    pub fn stop_streaming(&mut self) -> Result<()> {
        let queued = self
            .pool
            .as_ref()
            .map_or(0, |p| p.count_in(BufferState::Queued));
        if !self.streaming && queued == 0 {
            return Ok(());
        }
        self.driver.stream_off()?;
        self.streaming = false;
        if let Some(pool) = self.pool.as_mut() {
            let reclaimed = pool.reclaim_queued();
            if reclaimed > 0 {
                debug!("Reclaimed {} queued buffers", reclaimed);
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let stopped = self.stop_streaming();
        self.streaming = false;
        let freed = match self.pool.take() {
            Some(mut pool) => {
                if pool.count_in(BufferState::Queued) > 0 {
                    pool.reclaim_queued();
                }
                pool.free(&mut self.driver)
            }
            None => Ok(()),
        };
        info!("Closed {:?}", self.path);
        stopped.and(freed)
    }

    /// Stop streaming, free buffers and close the endpoint
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }
}

impl<D: CaptureDriver> Drop for DeviceContext<D> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Error closing {:?}: {}", self.path, e);
        }
    }
}

/// Opaque reference to a registry slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    index: u32,
    generation: u32,
}

impl DeviceHandle {
    pub fn index(&self) -> u32 {
        self.index
    }
}

fn closed_handle(handle: DeviceHandle) -> MediaError {
    MediaError::DeviceNotFound(format!("Device handle {} is closed", handle.index))
}

struct RegistrySlot<D: CaptureDriver> {
    generation: u32,
    device: Option<DeviceContext<D>>,
}

/// Caller-owned arena of open device contexts
///
/// Handles carry a generation, so a handle to a closed slot stays invalid
/// after the slot is reused.
pub struct DeviceRegistry<D: CaptureDriver> {
    slots: Vec<RegistrySlot<D>>,
    capacity: usize,
}

impl<D: CaptureDriver> Default for DeviceRegistry<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: CaptureDriver> DeviceRegistry<D> {
    pub fn new() -> Self {
        Self::with_capacity(MAX_DEVICES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.device.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn vacant_slot(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.device.is_none())
            .or_else(|| (self.slots.len() < self.capacity).then_some(self.slots.len()))
    }

    fn full_error(&self) -> MediaError {
        MediaError::OutOfMemory(format!(
            "Device registry full ({} devices open)",
            self.capacity
        ))
    }

    /// Open a device into a free slot
    pub fn open<B>(
        &mut self,
        backend: &B,
        path: impl AsRef<Path>,
        plane_mode: PlaneMode,
        nonblocking: bool,
    ) -> Result<DeviceHandle>
    where
        B: CaptureBackend<Driver = D>,
    {
        if self.vacant_slot().is_none() {
            return Err(self.full_error());
        }
        let device = DeviceContext::open(backend, path, plane_mode, nonblocking)?;
        self.insert(device)
    }

    /// Register an already open context
    pub fn insert(&mut self, device: DeviceContext<D>) -> Result<DeviceHandle> {
        let index = self.vacant_slot().ok_or_else(|| self.full_error())?;
        if index == self.slots.len() {
            self.slots.push(RegistrySlot {
                generation: 0,
                device: None,
            });
        }
        let slot = &mut self.slots[index];
        slot.device = Some(device);
        Ok(DeviceHandle {
            index: index as u32,
            generation: slot.generation,
        })
    }

    fn slot(&self, handle: DeviceHandle) -> Result<&RegistrySlot<D>> {
        if handle.index as usize >= self.capacity {
            return Err(MediaError::InvalidParam(format!(
                "Device handle {} out of range",
                handle.index
            )));
        }
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation && s.device.is_some())
            .ok_or_else(|| closed_handle(handle))
    }

    pub fn get(&self, handle: DeviceHandle) -> Result<&DeviceContext<D>> {
        self.slot(handle)?
            .device
            .as_ref()
            .ok_or_else(|| closed_handle(handle))
    }

    pub fn get_mut(&mut self, handle: DeviceHandle) -> Result<&mut DeviceContext<D>> {
        self.slot(handle)?;
        self.slots[handle.index as usize]
            .device
            .as_mut()
            .ok_or_else(|| closed_handle(handle))
    }

    /// Remove a context from the registry without closing it
    pub fn take(&mut self, handle: DeviceHandle) -> Result<DeviceContext<D>> {
        self.slot(handle)?;
        let slot = &mut self.slots[handle.index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        slot.device
            .take()
            .ok_or_else(|| closed_handle(handle))
    }

    pub fn close(&mut self, handle: DeviceHandle) -> Result<()> {
        self.take(handle)?.close()
    }

    /// Close every open device; returns how many were open
    pub fn close_all(&mut self) -> usize {
        let mut closed = 0;
        for slot in self.slots.iter_mut() {
            if let Some(device) = slot.device.take() {
                slot.generation = slot.generation.wrapping_add(1);
                if let Err(e) = device.close() {
                    warn!("close_all: {}", e);
                }
                closed += 1;
            }
        }
        closed
    }
}
