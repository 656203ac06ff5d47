//! Simulated capture endpoint
//!
//! Behaves like a V4L2 mmap capture queue without touching hardware.
//! Used by `--simulate` and by the buffer, session and loop tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use super::driver::{
    monotonic_ns, CaptureBackend, CaptureDriver, DequeuedBuffer, PlaneInfo, PlaneUsage,
};
use super::format::{FormatDescriptor, PlaneMode, FIELD_ANY, FIELD_NONE};
use crate::error::{MediaError, Result};

/// Failures the simulated device injects on request
#[derive(Debug, Clone, Default)]
pub struct SimulatedFaults {
    pub fail_open: bool,
    pub reject_format: bool,
    /// Fail mmap of (buffer index, plane index)
    pub fail_map_at: Option<(u32, usize)>,
    pub fail_stream_on: bool,
    /// Grant at most this many buffers on REQBUFS
    pub grant_buffers: Option<u32>,
}

/// Backend creating simulated capture endpoints
#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    faults: SimulatedFaults,
    frame_interval: Duration,
    live_mappings: Arc<AtomicUsize>,
    open_devices: Arc<AtomicUsize>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            faults: SimulatedFaults::default(),
            frame_interval: Duration::ZERO,
            live_mappings: Arc::new(AtomicUsize::new(0)),
            open_devices: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_faults(mut self, faults: SimulatedFaults) -> Self {
        self.faults = faults;
        self
    }

    /// Minimum time between two queued buffers becoming ready
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Plane mappings currently alive across all endpoints of this backend
    pub fn live_mappings(&self) -> usize {
        self.live_mappings.load(Ordering::SeqCst)
    }

    /// Endpoints opened and not yet dropped
    pub fn open_devices(&self) -> usize {
        self.open_devices.load(Ordering::SeqCst)
    }
}

impl CaptureBackend for SimulatedBackend {
    type Driver = SimulatedDriver;

    fn open(&self, path: &Path, nonblocking: bool) -> Result<SimulatedDriver> {
        if self.faults.fail_open {
            return Err(MediaError::DeviceNotFound(format!(
                "{}: No such device",
                path.display()
            )));
        }
        self.open_devices.fetch_add(1, Ordering::SeqCst);
        debug!("Opened simulated device {:?} (nonblocking={})", path, nonblocking);
        Ok(SimulatedDriver {
            faults: self.faults.clone(),
            frame_interval: self.frame_interval,
            live_mappings: self.live_mappings.clone(),
            mapped: Arc::new(AtomicUsize::new(0)),
            open_devices: self.open_devices.clone(),
            nonblocking,
            format: None,
            buffers: Vec::new(),
            queued: VecDeque::new(),
            streaming: false,
            sequence: 0,
            last_ready: None,
        })
    }
}

/// One plane of simulated buffer memory
pub struct SimulatedMapping {
    data: Vec<u8>,
    live: Arc<AtomicUsize>,
    local: Arc<AtomicUsize>,
}

impl AsRef<[u8]> for SimulatedMapping {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for SimulatedMapping {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.local.fetch_sub(1, Ordering::SeqCst);
    }
}

struct SimBuffer {
    plane_lengths: Vec<u32>,
    queued: bool,
}

/// Simulated capture endpoint
pub struct SimulatedDriver {
    faults: SimulatedFaults,
    frame_interval: Duration,
    live_mappings: Arc<AtomicUsize>,
    mapped: Arc<AtomicUsize>,
    open_devices: Arc<AtomicUsize>,
    nonblocking: bool,
    format: Option<FormatDescriptor>,
    buffers: Vec<SimBuffer>,
    queued: VecDeque<u32>,
    streaming: bool,
    sequence: u32,
    last_ready: Option<Instant>,
}

impl SimulatedDriver {
    fn frame_ready(&self) -> bool {
        if !self.streaming || self.queued.is_empty() {
            return false;
        }
        match self.last_ready {
            Some(at) => at.elapsed() >= self.frame_interval,
            None => true,
        }
    }

    fn buffer(&self, index: u32) -> Result<&SimBuffer> {
        self.buffers.get(index as usize).ok_or_else(|| {
            MediaError::BufferError(format!("Buffer index {} out of range", index))
        })
    }
}

impl CaptureDriver for SimulatedDriver {
    type Mapping = SimulatedMapping;

    fn set_format(
        &mut self,
        requested: &FormatDescriptor,
        mode: PlaneMode,
    ) -> Result<FormatDescriptor> {
        if self.faults.reject_format {
            return Err(MediaError::FormatError(format!(
                "Simulated device rejected {}",
                requested
            )));
        }
        if !self.buffers.is_empty() {
            return Err(MediaError::DeviceBusy(
                "Format change while buffers are allocated".to_string(),
            ));
        }

        let default_size = requested.width.saturating_mul(requested.height).saturating_mul(2);
        let mut plane_sizes: Vec<u32> = requested
            .plane_sizes
            .iter()
            .map(|s| if *s == 0 { default_size } else { *s })
            .collect();
        if mode == PlaneMode::Single {
            plane_sizes.truncate(1);
        }

        let applied = FormatDescriptor {
            width: requested.width,
            height: requested.height,
            pixel_format: requested.pixel_format,
            field: if requested.field == FIELD_ANY {
                FIELD_NONE
            } else {
                requested.field
            },
            plane_sizes,
        };
        self.format = Some(applied.clone());
        Ok(applied)
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        let format = self.format.as_ref().ok_or_else(|| {
            MediaError::BufferError("VIDIOC_REQBUFS before VIDIOC_S_FMT".to_string())
        })?;
        if !self.buffers.is_empty() {
            return Err(MediaError::DeviceBusy(
                "Buffers already allocated".to_string(),
            ));
        }
        let granted = match self.faults.grant_buffers {
            Some(limit) => count.min(limit),
            None => count,
        };
        self.buffers = (0..granted)
            .map(|_| SimBuffer {
                plane_lengths: format.plane_sizes.clone(),
                queued: false,
            })
            .collect();
        Ok(granted)
    }

    fn query_buffer(&mut self, index: u32) -> Result<Vec<PlaneInfo>> {
        let buffer = self.buffer(index)?;
        let mut offset = index.saturating_mul(0x0100_0000);
        Ok(buffer
            .plane_lengths
            .iter()
            .map(|length| {
                let info = PlaneInfo {
                    length: *length,
                    mem_offset: offset,
                };
                offset = offset.saturating_add(*length);
                info
            })
            .collect())
    }

    fn map_plane(&mut self, index: u32, plane: usize, info: &PlaneInfo) -> Result<SimulatedMapping> {
        if self.faults.fail_map_at == Some((index, plane)) {
            return Err(MediaError::OutOfMemory(format!(
                "mmap failed for buffer {} plane {}",
                index, plane
            )));
        }
        self.buffer(index)?;
        self.live_mappings.fetch_add(1, Ordering::SeqCst);
        self.mapped.fetch_add(1, Ordering::SeqCst);
        Ok(SimulatedMapping {
            data: vec![index as u8; info.length as usize],
            live: self.live_mappings.clone(),
            local: self.mapped.clone(),
        })
    }

    fn release_buffers(&mut self) -> Result<()> {
        if self.streaming {
            return Err(MediaError::DeviceBusy(
                "VIDIOC_REQBUFS(0) while streaming".to_string(),
            ));
        }
        if self.mapped.load(Ordering::SeqCst) > 0 {
            return Err(MediaError::DeviceBusy(
                "VIDIOC_REQBUFS(0) with live mappings".to_string(),
            ));
        }
        self.buffers.clear();
        self.queued.clear();
        Ok(())
    }

    fn queue_buffer(&mut self, index: u32, plane_lengths: &[usize]) -> Result<()> {
        let buffer = self.buffer(index)?;
        if buffer.queued {
            return Err(MediaError::BufferError(format!(
                "VIDIOC_QBUF: buffer {} already queued",
                index
            )));
        }
        if plane_lengths.len() != buffer.plane_lengths.len() {
            return Err(MediaError::BufferError(format!(
                "VIDIOC_QBUF: buffer {} expects {} planes, got {}",
                index,
                buffer.plane_lengths.len(),
                plane_lengths.len()
            )));
        }
        self.buffers[index as usize].queued = true;
        self.queued.push_back(index);
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> Result<DequeuedBuffer> {
        if !self.streaming {
            return Err(MediaError::BufferError(
                "VIDIOC_DQBUF while not streaming".to_string(),
            ));
        }
        if !self.frame_ready() {
            // EAGAIN on a non-blocking fd; a blocking one sleeps in DQBUF
            if self.nonblocking || self.queued.is_empty() {
                return Err(MediaError::Timeout);
            }
            self.wait_ready(None)?;
        }
        let index = self.queued.pop_front().ok_or(MediaError::Timeout)?;
        self.buffers[index as usize].queued = false;
        self.last_ready = Some(Instant::now());

        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);

        let planes = self.buffers[index as usize]
            .plane_lengths
            .iter()
            .map(|length| PlaneUsage {
                bytes_used: *length as usize,
                data_offset: 0,
            })
            .collect();

        Ok(DequeuedBuffer {
            index,
            planes,
            timestamp_ns: monotonic_ns(),
            sequence,
        })
    }

    fn wait_ready(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.frame_ready() {
                return Ok(true);
            }
            // Not streaming or nothing queued: no frame will ever arrive
            if !self.streaming || self.queued.is_empty() {
                if let Some(t) = timeout {
                    std::thread::sleep(t.min(Duration::from_millis(10)));
                }
                return Ok(false);
            }
            let now = Instant::now();
            if let Some(deadline) = deadline {
                if now >= deadline {
                    return Ok(false);
                }
            }
            let until_ready = self
                .last_ready
                .map(|at| self.frame_interval.saturating_sub(at.elapsed()))
                .unwrap_or(Duration::ZERO);
            let nap = match deadline {
                Some(deadline) => until_ready.min(deadline - now),
                None => until_ready,
            };
            std::thread::sleep(nap.max(Duration::from_micros(100)));
        }
    }

    fn stream_on(&mut self) -> Result<()> {
        if self.faults.fail_stream_on {
            return Err(MediaError::StreamingError(
                "VIDIOC_STREAMON failed: Input/output error".to_string(),
            ));
        }
        if self.buffers.is_empty() {
            return Err(MediaError::StreamingError(
                "VIDIOC_STREAMON without buffers".to_string(),
            ));
        }
        self.streaming = true;
        self.last_ready = None;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.streaming = false;
        for index in self.queued.drain(..) {
            self.buffers[index as usize].queued = false;
        }
        Ok(())
    }
}

impl Drop for SimulatedDriver {
    fn drop(&mut self) {
        self.open_devices.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::PixelFormat;

    fn vga() -> FormatDescriptor {
        FormatDescriptor::single(640, 480, PixelFormat::YUYV, 0)
    }

    #[test]
    fn test_zero_plane_size_is_filled_in() {
        let backend = SimulatedBackend::new();
        let mut drv = backend.open(Path::new("/dev/sim0"), false).unwrap();
        let fmt = drv.set_format(&vga(), PlaneMode::Single).unwrap();
        assert_eq!(fmt.plane_sizes, vec![640 * 480 * 2]);
        assert_eq!(fmt.field, FIELD_NONE);
    }

    #[test]
    fn test_double_queue_rejected() {
        let backend = SimulatedBackend::new();
        let mut drv = backend.open(Path::new("/dev/sim0"), false).unwrap();
        drv.set_format(&vga(), PlaneMode::Single).unwrap();
        assert_eq!(drv.request_buffers(2).unwrap(), 2);
        drv.queue_buffer(0, &[614_400]).unwrap();
        assert!(drv.queue_buffer(0, &[614_400]).is_err());
    }

    #[test]
    fn test_dequeue_follows_queue_order() {
        let backend = SimulatedBackend::new();
        let mut drv = backend.open(Path::new("/dev/sim0"), false).unwrap();
        drv.set_format(&vga(), PlaneMode::Single).unwrap();
        drv.request_buffers(3).unwrap();
        drv.queue_buffer(2, &[614_400]).unwrap();
        drv.queue_buffer(0, &[614_400]).unwrap();

        assert!(!drv.dequeue_buffer().unwrap_err().is_timeout());
        drv.stream_on().unwrap();

        let first = drv.dequeue_buffer().unwrap();
        let second = drv.dequeue_buffer().unwrap();
        assert_eq!((first.index, second.index), (2, 0));
        assert_eq!(second.sequence, first.sequence + 1);
        assert!(!drv.wait_ready(Some(Duration::ZERO)).unwrap());
    }

    #[test]
    fn test_nonblocking_dequeue_does_not_wait() {
        let backend = SimulatedBackend::new().with_frame_interval(Duration::from_secs(30));
        let mut drv = backend.open(Path::new("/dev/sim0"), true).unwrap();
        drv.set_format(&vga(), PlaneMode::Single).unwrap();
        drv.request_buffers(2).unwrap();
        drv.queue_buffer(0, &[614_400]).unwrap();
        drv.queue_buffer(1, &[614_400]).unwrap();
        drv.stream_on().unwrap();

        assert_eq!(drv.dequeue_buffer().unwrap().index, 0);
        let started = Instant::now();
        assert!(drv.dequeue_buffer().unwrap_err().is_timeout());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_blocking_dequeue_waits_for_next_frame() {
        let backend = SimulatedBackend::new().with_frame_interval(Duration::from_millis(50));
        let mut drv = backend.open(Path::new("/dev/sim0"), false).unwrap();
        drv.set_format(&vga(), PlaneMode::Single).unwrap();
        drv.request_buffers(2).unwrap();
        drv.queue_buffer(0, &[614_400]).unwrap();
        drv.queue_buffer(1, &[614_400]).unwrap();
        drv.stream_on().unwrap();

        assert_eq!(drv.dequeue_buffer().unwrap().index, 0);
        let started = Instant::now();
        assert_eq!(drv.dequeue_buffer().unwrap().index, 1);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_release_requires_unmapped_buffers() {
        let backend = SimulatedBackend::new();
        let mut drv = backend.open(Path::new("/dev/sim0"), false).unwrap();
        drv.set_format(&vga(), PlaneMode::Single).unwrap();
        drv.request_buffers(1).unwrap();
        let info = drv.query_buffer(0).unwrap()[0];
        let mapping = drv.map_plane(0, 0, &info).unwrap();
        assert_eq!(backend.live_mappings(), 1);
        assert!(drv.release_buffers().is_err());
        drop(mapping);
        assert_eq!(backend.live_mappings(), 0);
        drv.release_buffers().unwrap();
        drop(drv);
        assert_eq!(backend.open_devices(), 0);
    }
}
