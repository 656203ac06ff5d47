//! Capture driver seam
//!
//! Buffer bookkeeping (`BufferPool`, `DeviceContext`, `CaptureSession`)
//! is written against these traits. The V4L2 ioctl implementation lives in
//! `v4l2r_capture`, a simulated endpoint in `sim`.

use std::path::Path;
use std::time::Duration;

use nix::time::{clock_gettime, ClockId};

use super::format::{FormatDescriptor, PlaneMode};
use crate::error::Result;

/// Location of one plane inside the driver's buffer memory (QUERYBUF result)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneInfo {
    pub length: u32,
    pub mem_offset: u32,
}

/// Per-plane payload reported by DQBUF
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaneUsage {
    pub bytes_used: usize,
    pub data_offset: usize,
}

/// A buffer handed back by the driver
#[derive(Debug, Clone)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub planes: Vec<PlaneUsage>,
    /// Driver timestamp in nanoseconds (0 if the driver does not stamp)
    pub timestamp_ns: u64,
    /// Driver frame counter
    pub sequence: u32,
}

/// Readiness wait bound, derived from the signed millisecond convention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTimeout {
    /// Negative milliseconds: block until a frame is ready
    Infinite,
    /// Zero: check once and return
    Immediate,
    Millis(u32),
}

impl WaitTimeout {
    pub fn from_millis(timeout_ms: i32) -> Self {
        match timeout_ms {
            t if t < 0 => WaitTimeout::Infinite,
            0 => WaitTimeout::Immediate,
            t => WaitTimeout::Millis(t as u32),
        }
    }

    /// `None` means unbounded
    pub fn as_duration(self) -> Option<Duration> {
        match self {
            WaitTimeout::Infinite => None,
            WaitTimeout::Immediate => Some(Duration::ZERO),
            WaitTimeout::Millis(ms) => Some(Duration::from_millis(ms as u64)),
        }
    }
}

/// Low-level operations on one open capture endpoint
///
/// Implementations report failures with the matching `MediaError` kind:
/// format negotiation failures as `FormatError`, buffer ioctls as
/// `BufferError`, mapping failures as `OutOfMemory`, stream on/off as
/// `StreamingError`, and "nothing to dequeue" as `Timeout`.
pub trait CaptureDriver {
    /// Process-visible mapping of one plane; unmapped on drop
    type Mapping: AsRef<[u8]>;

    /// Negotiate a format; returns the values the driver actually applied
    fn set_format(&mut self, requested: &FormatDescriptor, mode: PlaneMode)
        -> Result<FormatDescriptor>;

    /// Request `count` mmap buffers; returns the number granted.
    /// `count == 0` is handled by `release_buffers`.
    fn request_buffers(&mut self, count: u32) -> Result<u32>;

    fn query_buffer(&mut self, index: u32) -> Result<Vec<PlaneInfo>>;

    fn map_plane(&mut self, index: u32, plane: usize, info: &PlaneInfo) -> Result<Self::Mapping>;

    /// Give the buffer allocation back to the driver. All mappings must
    /// have been dropped first.
    fn release_buffers(&mut self) -> Result<()>;

    fn queue_buffer(&mut self, index: u32, plane_lengths: &[usize]) -> Result<()>;

    fn dequeue_buffer(&mut self) -> Result<DequeuedBuffer>;

    /// Wait until a filled buffer can be dequeued.
    /// Returns `Ok(false)` on timeout or signal interruption.
    fn wait_ready(&mut self, timeout: Option<Duration>) -> Result<bool>;

    fn stream_on(&mut self) -> Result<()>;

    /// Stop streaming; the driver implicitly returns every queued buffer
    fn stream_off(&mut self) -> Result<()>;
}

/// Opens capture endpoints
pub trait CaptureBackend {
    type Driver: CaptureDriver;

    fn open(&self, path: &Path, nonblocking: bool) -> Result<Self::Driver>;
}

/// Current `CLOCK_MONOTONIC` time in nanoseconds
pub fn monotonic_ns() -> u64 {
    clock_gettime(ClockId::CLOCK_MONOTONIC)
        .map(|ts| ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64)
        .unwrap_or(0)
}
