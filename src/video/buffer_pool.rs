//! Mmap buffer pool with per-buffer ownership tracking

use std::fmt;

use tracing::{debug, warn};

use super::driver::{CaptureDriver, DequeuedBuffer};
use crate::error::{MediaError, Result};

/// Who owns a buffer's memory right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Mapped and idle, may be queued
    Free,
    /// Submitted to the driver; memory must not be touched
    Queued,
    /// Written by the driver and held by the application
    Filled,
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferState::Free => write!(f, "free"),
            BufferState::Queued => write!(f, "queued"),
            BufferState::Filled => write!(f, "filled"),
        }
    }
}

/// Layout and fill information of one buffer
///
/// Byte counts, timestamp and sequence are only meaningful while the
/// buffer is [`BufferState::Filled`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub index: u32,
    pub plane_lengths: Vec<usize>,
    pub plane_bytes_used: Vec<usize>,
    pub plane_offsets: Vec<usize>,
    pub bytes_used: usize,
    pub timestamp_ns: u64,
    pub driver_sequence: u32,
    /// Increments on every dequeue of any buffer in the pool
    pub fill_id: u64,
}

impl BufferDescriptor {
    pub fn num_planes(&self) -> usize {
        self.plane_lengths.len()
    }
}

struct BufferSlot<M> {
    desc: BufferDescriptor,
    planes: Vec<M>,
    state: BufferState,
}

/// Fixed set of driver buffers mapped into process memory
pub struct BufferPool<M> {
    slots: Vec<BufferSlot<M>>,
    fills: u64,
}

impl<M: AsRef<[u8]>> BufferPool<M> {
    /// Request, query and map `count` buffers
    ///
    /// Every buffer must expose `expected_planes` planes. On any failure the
    /// mappings made so far are dropped and the driver allocation released.
    pub fn allocate<D>(driver: &mut D, count: u32, expected_planes: usize) -> Result<Self>
    where
        D: CaptureDriver<Mapping = M>,
    {
        if count == 0 {
            return Err(MediaError::InvalidParam(
                "Buffer count must be at least 1".to_string(),
            ));
        }

        let granted = driver.request_buffers(count)?;
        if granted == 0 {
            return Err(MediaError::BufferError(
                "Driver granted zero buffers".to_string(),
            ));
        }
        if granted < count {
            warn!("Requested {} buffers, driver granted {}", count, granted);
        }

        let mut slots = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            match Self::map_buffer(driver, index, expected_planes) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    drop(slots);
                    if let Err(release_err) = driver.release_buffers() {
                        warn!(
                            "Failed to release buffers after allocation error: {}",
                            release_err
                        );
                    }
                    return Err(e);
                }
            }
        }

        debug!(
            "Allocated {} buffers with {} plane(s) each",
            granted, expected_planes
        );
        Ok(Self { slots, fills: 0 })
    }

    fn map_buffer<D>(driver: &mut D, index: u32, expected_planes: usize) -> Result<BufferSlot<M>>
    where
        D: CaptureDriver<Mapping = M>,
    {
        let infos = driver.query_buffer(index)?;
        if infos.len() != expected_planes {
            return Err(MediaError::BufferError(format!(
                "Buffer {} has {} planes, format negotiated {}",
                index,
                infos.len(),
                expected_planes
            )));
        }

        let mut planes = Vec::with_capacity(infos.len());
        for (plane_idx, info) in infos.iter().enumerate() {
            planes.push(driver.map_plane(index, plane_idx, info)?);
        }

        let plane_lengths: Vec<usize> = infos.iter().map(|i| i.length as usize).collect();
        let n = plane_lengths.len();
        Ok(BufferSlot {
            desc: BufferDescriptor {
                index,
                plane_lengths,
                plane_bytes_used: vec![0; n],
                plane_offsets: vec![0; n],
                bytes_used: 0,
                timestamp_ns: 0,
                driver_sequence: 0,
                fill_id: 0,
            },
            planes,
            state: BufferState::Free,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn state(&self, index: u32) -> Option<BufferState> {
        self.slots.get(index as usize).map(|s| s.state)
    }

    pub fn descriptor(&self, index: u32) -> Option<&BufferDescriptor> {
        self.slots.get(index as usize).map(|s| &s.desc)
    }

    pub fn count_in(&self, state: BufferState) -> usize {
        self.slots.iter().filter(|s| s.state == state).count()
    }

    fn slot(&self, index: u32) -> Result<&BufferSlot<M>> {
        self.slots.get(index as usize).ok_or_else(|| {
            MediaError::InvalidParam(format!(
                "Buffer index {} out of range (pool has {})",
                index,
                self.slots.len()
            ))
        })
    }

    /// Submit a FREE or FILLED buffer to the driver
    pub(crate) fn queue<D>(&mut self, driver: &mut D, index: u32) -> Result<()>
    where
        D: CaptureDriver<Mapping = M>,
    {
        let slot = self.slot(index)?;
        if slot.state == BufferState::Queued {
            return Err(MediaError::BufferError(format!(
                "Buffer {} is already queued",
                index
            )));
        }
        let lengths: Vec<usize> = slot.planes.iter().map(|p| p.as_ref().len()).collect();
        driver.queue_buffer(index, &lengths)?;
        self.slots[index as usize].state = BufferState::Queued;
        Ok(())
    }

    /// Take the next filled buffer from the driver
    pub(crate) fn dequeue<D>(&mut self, driver: &mut D) -> Result<&BufferDescriptor>
    where
        D: CaptureDriver<Mapping = M>,
    {
        if self.count_in(BufferState::Queued) == 0 {
            return Err(MediaError::BufferError(
                "No buffers queued to the driver".to_string(),
            ));
        }

        let DequeuedBuffer {
            index,
            planes,
            timestamp_ns,
            sequence,
        } = driver.dequeue_buffer()?;

        let pool_size = self.slots.len();
        let slot = self.slots.get_mut(index as usize).ok_or_else(|| {
            MediaError::BufferError(format!(
                "Driver returned buffer {} outside a pool of {}",
                index, pool_size
            ))
        })?;
        if slot.state != BufferState::Queued {
            return Err(MediaError::BufferError(format!(
                "Driver returned buffer {} which is {}",
                index, slot.state
            )));
        }

        let mut total = 0;
        for (plane_idx, length) in slot.desc.plane_lengths.iter().enumerate() {
            let usage = planes.get(plane_idx).copied().unwrap_or_default();
            let offset = usage.data_offset.min(*length);
            let used = usage.bytes_used.min(*length - offset);
            slot.desc.plane_offsets[plane_idx] = offset;
            slot.desc.plane_bytes_used[plane_idx] = used;
            total += used;
        }

        self.fills += 1;
        slot.desc.bytes_used = total;
        slot.desc.timestamp_ns = timestamp_ns;
        slot.desc.driver_sequence = sequence;
        slot.desc.fill_id = self.fills;
        slot.state = BufferState::Filled;
        Ok(&slot.desc)
    }

    /// Mark every QUEUED buffer FREE once the driver has dropped them
    pub(crate) fn reclaim_queued(&mut self) -> usize {
        let mut reclaimed = 0;
        for slot in self.slots.iter_mut().filter(|s| s.state == BufferState::Queued) {
            slot.state = BufferState::Free;
            reclaimed += 1;
        }
        reclaimed
    }

    /// Hand a FILLED buffer back without queuing it
    pub(crate) fn release_filled(&mut self, index: u32) -> Result<()> {
        let slot = self.slot(index)?;
        if slot.state != BufferState::Filled {
            return Err(MediaError::BufferError(format!(
                "Buffer {} is {}, not filled",
                index, slot.state
            )));
        }
        self.slots[index as usize].state = BufferState::Free;
        Ok(())
    }

    /// Filled bytes of each plane of a FILLED buffer
    pub fn plane_data(&self, index: u32) -> Result<Vec<&[u8]>> {
        let slot = self.slot(index)?;
        if slot.state != BufferState::Filled {
            return Err(MediaError::BufferError(format!(
                "Buffer {} is {}; its memory is not readable",
                index, slot.state
            )));
        }
        Ok(slot
            .planes
            .iter()
            .enumerate()
            .map(|(i, mapping)| {
                let data = mapping.as_ref();
                let start = slot.desc.plane_offsets[i].min(data.len());
                let end = (start + slot.desc.plane_bytes_used[i]).min(data.len());
                &data[start..end]
            })
            .collect())
    }

    /// Owned copy of a FILLED buffer, planes concatenated
    pub fn copy_data(&self, index: u32) -> Result<Vec<u8>> {
        let planes = self.plane_data(index)?;
        let mut out = Vec::with_capacity(planes.iter().map(|p| p.len()).sum());
        for plane in planes {
            out.extend_from_slice(plane);
        }
        Ok(out)
    }

    /// Unmap every plane and release the driver allocation
    ///
    /// Fails without side effects while any buffer is QUEUED; on success the
    /// pool is empty.
    pub(crate) fn free<D>(&mut self, driver: &mut D) -> Result<()>
    where
        D: CaptureDriver<Mapping = M>,
    {
        let queued = self.count_in(BufferState::Queued);
        if queued > 0 {
            return Err(MediaError::BufferError(format!(
                "Cannot free pool with {} buffer(s) queued",
                queued
            )));
        }
        let count = self.slots.len();
        self.slots.clear();
        driver.release_buffers()?;
        debug!("Freed {} buffers", count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::driver::CaptureBackend;
    use crate::video::format::{FormatDescriptor, PixelFormat, PlaneMode};
    use crate::video::sim::{SimulatedBackend, SimulatedDriver, SimulatedFaults, SimulatedMapping};
    use std::path::Path;

    fn open(backend: &SimulatedBackend, fmt: &FormatDescriptor, mode: PlaneMode) -> SimulatedDriver {
        let mut drv = backend.open(Path::new("/dev/sim0"), false).unwrap();
        drv.set_format(fmt, mode).unwrap();
        drv
    }

    fn nv12() -> FormatDescriptor {
        FormatDescriptor::multi(64, 32, PixelFormat::NV12, vec![2048, 1024])
    }

    #[test]
    fn test_allocate_maps_distinct_indices() {
        let backend = SimulatedBackend::new();
        let mut drv = open(&backend, &nv12(), PlaneMode::Multi);
        let pool: BufferPool<SimulatedMapping> = BufferPool::allocate(&mut drv, 4, 2).unwrap();

        assert_eq!(pool.len(), 4);
        for i in 0..4 {
            let desc = pool.descriptor(i).unwrap();
            assert_eq!(desc.index, i);
            assert_eq!(desc.num_planes(), 2);
            assert_eq!(desc.plane_lengths, vec![2048, 1024]);
            assert_eq!(pool.state(i), Some(BufferState::Free));
        }
        assert_eq!(backend.live_mappings(), 8);
    }

    #[test]
    fn test_allocate_rolls_back_on_map_failure() {
        let backend = SimulatedBackend::new().with_faults(SimulatedFaults {
            fail_map_at: Some((2, 1)),
            ..Default::default()
        });
        let mut drv = open(&backend, &nv12(), PlaneMode::Multi);
        let err = BufferPool::allocate(&mut drv, 4, 2).err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::OutOfMemory);
        assert_eq!(backend.live_mappings(), 0);

        // Driver allocation was released, so a new request succeeds
        assert!(BufferPool::allocate(&mut drv, 2, 2).is_ok());
    }

    #[test]
    fn test_allocate_rejects_zero_grant_and_plane_mismatch() {
        let backend = SimulatedBackend::new().with_faults(SimulatedFaults {
            grant_buffers: Some(0),
            ..Default::default()
        });
        let mut drv = open(&backend, &nv12(), PlaneMode::Multi);
        let err = BufferPool::allocate(&mut drv, 4, 2).err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::BufferError);

        let backend = SimulatedBackend::new();
        let mut drv = open(&backend, &nv12(), PlaneMode::Multi);
        let err = BufferPool::allocate(&mut drv, 4, 1).err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::BufferError);
        assert_eq!(backend.live_mappings(), 0);
    }

    #[test]
    fn test_queue_dequeue_requeue() {
        let backend = SimulatedBackend::new();
        let mut drv = open(&backend, &nv12(), PlaneMode::Multi);
        let mut pool = BufferPool::allocate(&mut drv, 2, 2).unwrap();

        pool.queue(&mut drv, 0).unwrap();
        assert!(pool.queue(&mut drv, 0).is_err());
        assert_eq!(pool.state(0), Some(BufferState::Queued));
        assert_eq!(pool.count_in(BufferState::Queued), 1);
        assert_eq!(
            pool.queue(&mut drv, 9).unwrap_err().kind(),
            crate::error::ErrorKind::InvalidParam
        );

        drv.stream_on().unwrap();
        let desc = pool.dequeue(&mut drv).unwrap();
        assert_eq!(desc.index, 0);
        assert_eq!(desc.bytes_used, 3072);
        assert_eq!(pool.state(0), Some(BufferState::Filled));

        let planes = pool.plane_data(0).unwrap();
        assert_eq!(planes.len(), 2);
        assert!(planes[0].iter().all(|b| *b == 0));
        assert_eq!(pool.copy_data(0).unwrap().len(), 3072);

        pool.queue(&mut drv, 0).unwrap();
        assert_eq!(pool.state(0), Some(BufferState::Queued));
        assert!(pool.plane_data(0).is_err());
    }

    #[test]
    fn test_dequeue_without_queued_buffers() {
        let backend = SimulatedBackend::new();
        let mut drv = open(&backend, &nv12(), PlaneMode::Multi);
        let mut pool = BufferPool::allocate(&mut drv, 2, 2).unwrap();
        assert_eq!(
            pool.dequeue(&mut drv).unwrap_err().kind(),
            crate::error::ErrorKind::BufferError
        );
    }

    #[test]
    fn test_free_rejected_while_queued() {
        let backend = SimulatedBackend::new();
        let mut drv = open(&backend, &nv12(), PlaneMode::Multi);
        let mut pool = BufferPool::allocate(&mut drv, 3, 2).unwrap();
        pool.queue(&mut drv, 1).unwrap();

        assert!(pool.free(&mut drv).is_err());
        assert_eq!(pool.len(), 3);

        drv.stream_off().unwrap();
        assert_eq!(pool.reclaim_queued(), 1);
        pool.free(&mut drv).unwrap();
        assert!(pool.is_empty());
        assert_eq!(backend.live_mappings(), 0);
    }
}
