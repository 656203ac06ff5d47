//! Capture session: device + buffers behind a start/stop/capture/release
//! state machine

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::buffer_pool::BufferState;
use super::device::DeviceContext;
use super::driver::{CaptureBackend, CaptureDriver, WaitTimeout};
use super::format::{FormatDescriptor, PixelFormat, PlaneMode};
use crate::error::{MediaError, Result};

/// Largest buffer count a session may request
pub const MAX_BUFFERS: u32 = 32;

/// Upper bound of one readiness wait, so long waits notice interrupts
const WAIT_SLICE: Duration = Duration::from_millis(100);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Declarative description of a capture session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub device_path: PathBuf,
    pub format: FormatDescriptor,
    pub buffer_count: u32,
    pub plane_mode: PlaneMode,
    pub nonblocking: bool,
}

impl SessionConfig {
    /// 4 buffers, multi-plane, blocking
    pub fn new(device_path: impl Into<PathBuf>, format: FormatDescriptor) -> Self {
        Self {
            device_path: device_path.into(),
            format,
            buffer_count: 4,
            plane_mode: PlaneMode::Multi,
            nonblocking: false,
        }
    }

    pub fn with_buffer_count(mut self, count: u32) -> Self {
        self.buffer_count = count;
        self
    }

    pub fn with_plane_mode(mut self, mode: PlaneMode) -> Self {
        self.plane_mode = mode;
        self
    }

    pub fn with_nonblocking(mut self, nonblocking: bool) -> Self {
        self.nonblocking = nonblocking;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.device_path.as_os_str().is_empty() {
            return Err(MediaError::InvalidParam("Device path is empty".to_string()));
        }
        if self.buffer_count == 0 || self.buffer_count > MAX_BUFFERS {
            return Err(MediaError::InvalidParam(format!(
                "Buffer count must be 1..={}, got {}",
                MAX_BUFFERS, self.buffer_count
            )));
        }
        self.format.validate(self.plane_mode)
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Streaming,
    Stopped,
    /// `start` failed part way; only `destroy` is meaningful
    Faulted,
    Destroyed,
}

/// One captured frame, valid until released
///
/// The frame does not borrow the session; its memory is read through
/// [`CaptureSession::frame_planes`] / [`CaptureSession::frame_bytes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    session_id: u64,
    buffer_index: u32,
    fill_id: u64,
    sequence: u64,
    driver_sequence: u32,
    size: usize,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    timestamp_ns: u64,
}

impl Frame {
    pub fn buffer_index(&self) -> u32 {
        self.buffer_index
    }

    /// Per-session capture counter, starting at 0
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn driver_sequence(&self) -> u32 {
        self.driver_sequence
    }

    /// Filled bytes across all planes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }
}

/// Makes in-progress and future waits of a session return `Timeout`
///
/// The next [`CaptureSession::start`] clears it.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Capture session owning one device context
pub struct CaptureSession<D: CaptureDriver> {
    id: u64,
    config: SessionConfig,
    format: FormatDescriptor,
    device: Option<DeviceContext<D>>,
    state: SessionState,
    frames_captured: u64,
    interrupt: InterruptHandle,
}

impl<D: CaptureDriver> CaptureSession<D> {
    /// Open the device, negotiate the format and allocate buffers
    ///
    /// If any step fails, everything acquired so far is released before the
    /// error is returned.
    pub fn create<B>(backend: &B, config: SessionConfig) -> Result<Self>
    where
        B: CaptureBackend<Driver = D>,
    {
        config.validate()?;

        let mut device = DeviceContext::open(
            backend,
            &config.device_path,
            config.plane_mode,
            config.nonblocking,
        )?;
        let format = device.set_format(&config.format)?.clone();
        let granted = device.request_buffers(config.buffer_count)?;

        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        info!(
            "Capture session {} created on {:?}: {}, {} buffers",
            id, config.device_path, format, granted
        );

        Ok(Self {
            id,
            config,
            format,
            device: Some(device),
            state: SessionState::Created,
            frames_captured: 0,
            interrupt: InterruptHandle::default(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Format the driver actually applied
    pub fn format(&self) -> &FormatDescriptor {
        &self.format
    }

    pub fn buffer_count(&self) -> usize {
        self.device.as_ref().map(|d| d.buffer_count()).unwrap_or(0)
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    fn device_mut(&mut self) -> Result<&mut DeviceContext<D>> {
        self.device
            .as_mut()
            .ok_or_else(|| MediaError::StreamingError("Session destroyed".to_string()))
    }

    /// Queue every FREE buffer and stream on
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            SessionState::Created | SessionState::Stopped => {}
            SessionState::Streaming => {
                return Err(MediaError::StreamingError(
                    "Session already streaming".to_string(),
                ))
            }
            SessionState::Faulted => {
                return Err(MediaError::StreamingError(
                    "Session faulted; destroy and recreate it".to_string(),
                ))
            }
            SessionState::Destroyed => {
                return Err(MediaError::StreamingError("Session destroyed".to_string()))
            }
        }

        self.interrupt.clear();
        if let Err(e) = self.queue_free_and_stream_on() {
            warn!("Session {} failed to start: {}", self.id, e);
            if let Some(device) = self.device.as_mut() {
                if let Err(off_err) = device.stop_streaming() {
                    warn!("Stream off after failed start: {}", off_err);
                }
            }
            self.state = SessionState::Faulted;
            return Err(e);
        }

        self.state = SessionState::Streaming;
        info!("Capture session {} streaming", self.id);
        Ok(())
    }

    /// FILLED buffers still belong to unreleased frames and are queued by
    /// `release_frame` instead
    fn queue_free_and_stream_on(&mut self) -> Result<()> {
        let device = self.device_mut()?;
        let count = device.buffer_count() as u32;
        for index in 0..count {
            let state = device.pool().and_then(|p| p.state(index));
            if state == Some(BufferState::Free) {
                device.queue_buffer(index)?;
            }
        }
        device.start_streaming()
    }

    /// Wait up to `timeout_ms` for a filled buffer
    ///
    /// Negative waits indefinitely, zero checks once. No frame in time, or an
    /// interrupt, yields [`MediaError::Timeout`].
    pub fn capture_frame(&mut self, timeout_ms: i32) -> Result<Frame> {
        if self.state != SessionState::Streaming {
            return Err(MediaError::StreamingError(format!(
                "Cannot capture in state {:?}",
                self.state
            )));
        }

        let timeout = WaitTimeout::from_millis(timeout_ms);
        let interrupt = self.interrupt.clone();
        let device = self.device_mut()?;

        match timeout {
            WaitTimeout::Immediate => {
                if !device.wait_slice(Duration::ZERO)? {
                    return Err(MediaError::Timeout);
                }
            }
            WaitTimeout::Infinite | WaitTimeout::Millis(_) => {
                let deadline = timeout.as_duration().map(|d| Instant::now() + d);
                loop {
                    if interrupt.is_interrupted() {
                        return Err(MediaError::Timeout);
                    }
                    let slice = match deadline {
                        Some(deadline) => {
                            let now = Instant::now();
                            if now >= deadline {
                                return Err(MediaError::Timeout);
                            }
                            (deadline - now).min(WAIT_SLICE)
                        }
                        None => WAIT_SLICE,
                    };
                    if device.wait_slice(slice)? {
                        break;
                    }
                }
            }
        }

        let desc = device.dequeue_buffer()?;
        let frame = Frame {
            session_id: self.id,
            buffer_index: desc.index,
            fill_id: desc.fill_id,
            sequence: self.frames_captured,
            driver_sequence: desc.driver_sequence,
            size: desc.bytes_used,
            width: self.format.width,
            height: self.format.height,
            pixel_format: self.format.pixel_format,
            timestamp_ns: desc.timestamp_ns,
        };
        self.frames_captured += 1;
        debug!(
            "Captured frame {} from buffer {} ({} bytes)",
            frame.sequence, frame.buffer_index, frame.size
        );
        Ok(frame)
    }

    /// Check that `frame` is an outstanding frame of this session
    fn check_outstanding(&self, frame: &Frame) -> Result<&DeviceContext<D>> {
        if frame.session_id != self.id {
            return Err(MediaError::InvalidParam(format!(
                "Frame belongs to session {}, not {}",
                frame.session_id, self.id
            )));
        }
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| MediaError::InvalidParam("Session destroyed".to_string()))?;
        let pool = device
            .pool()
            .ok_or_else(|| MediaError::InvalidParam("Session has no buffers".to_string()))?;

        let outstanding = pool.state(frame.buffer_index) == Some(BufferState::Filled)
            && pool.descriptor(frame.buffer_index).map(|d| d.fill_id) == Some(frame.fill_id);
        if !outstanding {
            return Err(MediaError::InvalidParam(format!(
                "Frame {} (buffer {}) was already released",
                frame.sequence, frame.buffer_index
            )));
        }
        Ok(device)
    }

    /// Per-plane filled bytes of an outstanding frame
    pub fn frame_planes(&self, frame: &Frame) -> Result<Vec<&[u8]>> {
        let device = self.check_outstanding(frame)?;
        match device.pool() {
            Some(pool) => pool.plane_data(frame.buffer_index),
            None => Err(MediaError::InvalidParam("Session has no buffers".to_string())),
        }
    }

    /// Owned copy of an outstanding frame, planes concatenated
    pub fn frame_bytes(&self, frame: &Frame) -> Result<Bytes> {
        let device = self.check_outstanding(frame)?;
        match device.pool() {
            Some(pool) => pool.copy_data(frame.buffer_index).map(Bytes::from),
            None => Err(MediaError::InvalidParam("Session has no buffers".to_string())),
        }
    }

    /// Give a frame's buffer back
    ///
    /// While streaming the buffer is re-queued; otherwise it becomes FREE and
    /// the next `start` queues it.
    pub fn release_frame(&mut self, frame: &Frame) -> Result<()> {
        self.check_outstanding(frame)?;
        let streaming = self.state == SessionState::Streaming;
        let device = self.device_mut()?;
        if streaming {
            device.queue_buffer(frame.buffer_index)
        } else {
            device.release_filled(frame.buffer_index)
        }
    }

    /// Stream off; buffers stay allocated
    pub fn stop(&mut self) -> Result<()> {
        if self.state != SessionState::Streaming {
            return Err(MediaError::StreamingError(format!(
                "Cannot stop in state {:?}",
                self.state
            )));
        }
        let result = self.device_mut()?.stop_streaming();
        self.state = SessionState::Stopped;
        info!(
            "Capture session {} stopped after {} frames",
            self.id, self.frames_captured
        );
        result
    }

    /// Stop, free buffers and close the device. Idempotent.
    pub fn destroy(&mut self) -> Result<()> {
        if self.state == SessionState::Destroyed {
            return Ok(());
        }
        self.interrupt.interrupt();
        self.state = SessionState::Destroyed;
        match self.device.take() {
            Some(device) => device.close(),
            None => Ok(()),
        }
    }
}

impl<D: CaptureDriver> Drop for CaptureSession<D> {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            warn!("Error destroying capture session {}: {}", self.id, e);
        }
    }
}
