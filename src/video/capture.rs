//! Capture worker
//!
//! Runs a [`CaptureSession`] on a blocking thread, publishing frames into
//! the stream mailbox while a client is connected.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use super::driver::{monotonic_ns, CaptureBackend, CaptureDriver};
use super::session::{CaptureSession, InterruptHandle, SessionConfig};
use crate::error::{ErrorKind, MediaError, Result};
use crate::stream::{FrameMailbox, StreamFrame};
use crate::utils::LogThrottler;

/// Pause after a non-timeout capture error
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Capture loop tuning
#[derive(Debug, Clone)]
pub struct CaptureLoopConfig {
    /// Per-frame wait passed to `capture_frame` (negative = unbounded)
    pub timeout_ms: i32,
    /// How often FPS statistics are logged
    pub stats_interval: Duration,
}

impl Default for CaptureLoopConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            stats_interval: Duration::from_secs(5),
        }
    }
}

/// Capture statistics
#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub frames_published: u64,
    pub timeouts: u64,
    pub errors: u64,
    /// FPS over the last statistics window
    pub current_fps: f32,
    pub last_frame_size: usize,
}

/// Capture worker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Stopped,
    /// Opening the device and allocating buffers
    Starting,
    Running,
    /// Frame waits are timing out
    NoSignal,
    /// The session failed and the worker exited
    Error,
}

/// Handles shared between the capturer and its worker thread
struct Shared {
    state: watch::Sender<CaptureState>,
    stats: Mutex<CaptureStats>,
    stop_flag: AtomicBool,
}

/// Owns the capture worker thread
pub struct VideoCapturer {
    shared: Arc<Shared>,
    state_rx: watch::Receiver<CaptureState>,
    interrupt: Mutex<Option<InterruptHandle>>,
    capture_handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Default for VideoCapturer {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoCapturer {
    pub fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(CaptureState::Stopped);
        Self {
            shared: Arc::new(Shared {
                state: state_tx,
                stats: Mutex::new(CaptureStats::default()),
                stop_flag: AtomicBool::new(false),
            }),
            state_rx,
            interrupt: Mutex::new(None),
            capture_handle: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> CaptureState {
        *self.state_rx.borrow()
    }

    /// Subscribe to state changes
    pub fn state_watch(&self) -> watch::Receiver<CaptureState> {
        self.state_rx.clone()
    }

    pub fn stats(&self) -> CaptureStats {
        self.shared.stats.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), CaptureState::Running | CaptureState::NoSignal)
    }

    /// Create and start a session on a blocking thread
    ///
    /// Returns once the session is streaming, or with the error that
    /// prevented it.
    pub async fn start<B>(
        &self,
        backend: B,
        session_config: SessionConfig,
        loop_config: CaptureLoopConfig,
        mailbox: Arc<FrameMailbox<StreamFrame>>,
        connected: Arc<AtomicBool>,
    ) -> Result<()>
    where
        B: CaptureBackend + Send + 'static,
    {
        let mut handle_slot = self.capture_handle.lock().await;
        if handle_slot.is_some() {
            return Ok(());
        }

        info!(
            "Starting capture on {:?}: {}",
            session_config.device_path, session_config.format
        );
        let _ = self.shared.state.send(CaptureState::Starting);
        self.shared.stop_flag.store(false, Ordering::SeqCst);
        *self.shared.stats.lock() = CaptureStats::default();

        let (ready_tx, ready_rx) = oneshot::channel();
        let shared = self.shared.clone();
        let handle = tokio::task::spawn_blocking(move || {
            capture_worker(
                backend,
                session_config,
                loop_config,
                shared,
                mailbox,
                connected,
                ready_tx,
            );
        });

        match ready_rx.await {
            Ok(Ok(interrupt)) => {
                *self.interrupt.lock() = Some(interrupt);
                *handle_slot = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.await;
                Err(e)
            }
            Err(_) => {
                let _ = handle.await;
                let _ = self.shared.state.send(CaptureState::Error);
                Err(MediaError::StreamingError(
                    "Capture worker exited during startup".to_string(),
                ))
            }
        }
    }

    /// Stop the worker and wait for it to release the device
    pub async fn stop(&self) -> Result<()> {
        self.shared.stop_flag.store(true, Ordering::SeqCst);
        if let Some(interrupt) = self.interrupt.lock().take() {
            interrupt.interrupt();
        }

        if let Some(handle) = self.capture_handle.lock().await.take() {
            info!("Stopping capture");
            handle
                .await
                .map_err(|e| MediaError::StreamingError(format!("Capture task failed: {}", e)))?;
        }

        if *self.state_rx.borrow() != CaptureState::Error {
            let _ = self.shared.state.send(CaptureState::Stopped);
        }
        Ok(())
    }
}

fn capture_worker<B: CaptureBackend>(
    backend: B,
    session_config: SessionConfig,
    loop_config: CaptureLoopConfig,
    shared: Arc<Shared>,
    mailbox: Arc<FrameMailbox<StreamFrame>>,
    connected: Arc<AtomicBool>,
    ready: oneshot::Sender<Result<InterruptHandle>>,
) {
    let mut session = match CaptureSession::create(&backend, session_config) {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to create capture session: {}", e);
            let _ = shared.state.send(CaptureState::Error);
            let _ = ready.send(Err(e));
            return;
        }
    };
    if let Err(e) = session.start() {
        error!("Failed to start capture session: {}", e);
        let _ = shared.state.send(CaptureState::Error);
        let _ = ready.send(Err(e));
        return;
    }

    let _ = shared.state.send(CaptureState::Running);
    let _ = ready.send(Ok(session.interrupt_handle()));

    let result = run_capture_loop(
        &mut session,
        &loop_config,
        &mailbox,
        &connected,
        &shared.stop_flag,
        &shared.state,
        &shared.stats,
    );

    match result {
        Ok(()) => {
            let _ = shared.state.send(CaptureState::Stopped);
        }
        Err(e) => {
            error!("Capture stopped on error: {}", e);
            let _ = shared.state.send(CaptureState::Error);
        }
    }

    if let Err(e) = session.destroy() {
        warn!("Failed to destroy capture session: {}", e);
    }
}

/// Capture until `stop_flag` is set or the session fails
///
/// Every captured buffer is released before the next capture. Frames are
/// copied into the mailbox only while `connected` is set.
pub fn run_capture_loop<D: CaptureDriver>(
    session: &mut CaptureSession<D>,
    config: &CaptureLoopConfig,
    mailbox: &FrameMailbox<StreamFrame>,
    connected: &AtomicBool,
    stop_flag: &AtomicBool,
    state: &watch::Sender<CaptureState>,
    stats: &Mutex<CaptureStats>,
) -> Result<()> {
    let throttler = LogThrottler::with_secs(5);
    let mut window_frames = 0u64;
    let mut window_start = Instant::now();

    info!("Capture loop started");

    while !stop_flag.load(Ordering::Relaxed) {
        let frame = match session.capture_frame(config.timeout_ms) {
            Ok(frame) => frame,
            Err(e) if e.is_timeout() => {
                if stop_flag.load(Ordering::Relaxed) {
                    break;
                }
                stats.lock().timeouts += 1;
                if *state.borrow() == CaptureState::Running {
                    let _ = state.send(CaptureState::NoSignal);
                }
                if let Some(suppressed) = throttler.should_log("capture_timeout") {
                    if suppressed > 0 {
                        warn!("Timeout waiting for frame (suppressed {} repeats)", suppressed);
                    } else {
                        warn!("Timeout waiting for frame");
                    }
                }
                // A zero timeout polls without sleeping
                if config.timeout_ms == 0 {
                    std::thread::sleep(ERROR_BACKOFF);
                }
                continue;
            }
            Err(e) => {
                stats.lock().errors += 1;
                if matches!(e.kind(), ErrorKind::StreamingError | ErrorKind::DeviceNotFound) {
                    return Err(e);
                }
                let key = format!("capture_{:?}", e.kind());
                if let Some(suppressed) = throttler.should_log(&key) {
                    if suppressed > 0 {
                        error!("Frame capture failed: {} (suppressed {} repeats)", e, suppressed);
                    } else {
                        error!("Frame capture failed: {}", e);
                    }
                }
                std::thread::sleep(ERROR_BACKOFF);
                continue;
            }
        };

        if *state.borrow() == CaptureState::NoSignal {
            let _ = state.send(CaptureState::Running);
            throttler.clear("capture_timeout");
        }

        let timestamp_ns = monotonic_ns();
        let published = if connected.load(Ordering::Acquire) {
            match session.frame_bytes(&frame) {
                Ok(payload) => {
                    mailbox.publish(StreamFrame {
                        payload,
                        frame_id: frame.sequence() as u32,
                        width: frame.width(),
                        height: frame.height(),
                        pixel_format: frame.pixel_format(),
                        timestamp_ns,
                    });
                    true
                }
                Err(e) => {
                    warn!("Failed to copy frame {}: {}", frame.sequence(), e);
                    false
                }
            }
        } else {
            false
        };

        session.release_frame(&frame)?;

        window_frames += 1;
        let mut s = stats.lock();
        s.frames_captured += 1;
        if published {
            s.frames_published += 1;
        }
        s.last_frame_size = frame.size();

        let elapsed = window_start.elapsed();
        if elapsed >= config.stats_interval {
            s.current_fps = window_frames as f32 / elapsed.as_secs_f32();
            info!(
                "Frame {}, FPS: {:.1}, Bytes: {}, Connected: {}",
                s.frames_captured,
                s.current_fps,
                frame.size(),
                if connected.load(Ordering::Relaxed) { "YES" } else { "NO" }
            );
            window_frames = 0;
            window_start = Instant::now();
        }
        drop(s);

        debug!("Frame {} released", frame.sequence());
    }

    session.stop().or_else(|e| match e.kind() {
        ErrorKind::StreamingError => Ok(()),
        _ => Err(e),
    })?;
    info!("Capture loop stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::{FormatDescriptor, PixelFormat, PlaneMode};
    use crate::video::sim::{SimulatedBackend, SimulatedFaults};
    use crate::video::session::SessionState;

    fn vga_config() -> SessionConfig {
        SessionConfig::new(
            "/dev/sim0",
            FormatDescriptor::single(640, 480, PixelFormat::YUYV, 0),
        )
        .with_plane_mode(PlaneMode::Single)
    }

    #[test]
    fn test_loop_publishes_only_when_connected() {
        let backend = SimulatedBackend::new().with_frame_interval(Duration::from_millis(1));
        let mut session = CaptureSession::create(&backend, vga_config()).unwrap();
        session.start().unwrap();

        let mailbox = Arc::new(FrameMailbox::new());
        let connected = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::new(AtomicBool::new(false));
        let (state_tx, _state_rx) = watch::channel(CaptureState::Running);
        let stats = Mutex::new(CaptureStats::default());

        let stopper = {
            let stop_flag = stop_flag.clone();
            let connected = connected.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                connected.store(true, Ordering::Release);
                std::thread::sleep(Duration::from_millis(30));
                stop_flag.store(true, Ordering::SeqCst);
            })
        };

        let config = CaptureLoopConfig {
            timeout_ms: 100,
            stats_interval: Duration::from_millis(10),
        };
        run_capture_loop(
            &mut session,
            &config,
            &mailbox,
            &connected,
            &stop_flag,
            &state_tx,
            &stats,
        )
        .unwrap();
        stopper.join().unwrap();

        let stats = stats.lock().clone();
        assert!(stats.frames_captured > stats.frames_published);
        assert!(stats.frames_published > 0);
        assert_eq!(stats.last_frame_size, 640 * 480 * 2);

        let frame = mailbox.try_take().unwrap();
        assert_eq!(frame.len(), 640 * 480 * 2);
        assert_eq!((frame.width, frame.height), (640, 480));
        assert!((frame.frame_id as u64) < stats.frames_captured);

        // Every buffer went back to the pool
        assert_eq!(session.state(), SessionState::Stopped);
        session.destroy().unwrap();
        assert_eq!(backend.live_mappings(), 0);
    }

    #[test]
    fn test_zero_timeout_backs_off() {
        let backend = SimulatedBackend::new().with_frame_interval(Duration::from_secs(30));
        let mut session = CaptureSession::create(&backend, vga_config()).unwrap();
        session.start().unwrap();

        let mailbox = FrameMailbox::new();
        let connected = AtomicBool::new(false);
        let stop_flag = Arc::new(AtomicBool::new(false));
        let (state_tx, state_rx) = watch::channel(CaptureState::Running);
        let stats = Mutex::new(CaptureStats::default());

        let stopper = {
            let stop_flag = stop_flag.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                stop_flag.store(true, Ordering::SeqCst);
            })
        };

        let config = CaptureLoopConfig {
            timeout_ms: 0,
            stats_interval: Duration::from_secs(5),
        };
        run_capture_loop(
            &mut session,
            &config,
            &mailbox,
            &connected,
            &stop_flag,
            &state_tx,
            &stats,
        )
        .unwrap();
        stopper.join().unwrap();

        let stats = stats.lock().clone();
        assert_eq!(stats.frames_captured, 1);
        assert!(stats.timeouts > 0);
        assert!(stats.timeouts <= 15, "{} timeouts in 100ms", stats.timeouts);
        assert_eq!(*state_rx.borrow(), CaptureState::NoSignal);
    }

    #[tokio::test]
    async fn test_capturer_start_stop() {
        let backend = SimulatedBackend::new().with_frame_interval(Duration::from_millis(5));
        let capturer = VideoCapturer::new();
        let mailbox = Arc::new(FrameMailbox::new());
        let connected = Arc::new(AtomicBool::new(true));

        capturer
            .start(
                backend.clone(),
                vga_config(),
                CaptureLoopConfig::default(),
                mailbox.clone(),
                connected,
            )
            .await
            .unwrap();
        assert!(capturer.is_running());

        let frame = tokio::time::timeout(Duration::from_secs(2), mailbox.consume())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.pixel_format, PixelFormat::YUYV);

        capturer.stop().await.unwrap();
        assert_eq!(capturer.state(), CaptureState::Stopped);
        assert!(capturer.stats().frames_captured > 0);
        assert_eq!(backend.open_devices(), 0);
        assert_eq!(backend.live_mappings(), 0);
    }

    #[tokio::test]
    async fn test_capturer_reports_startup_error() {
        let backend = SimulatedBackend::new().with_faults(SimulatedFaults {
            fail_open: true,
            ..Default::default()
        });
        let capturer = VideoCapturer::new();
        let err = capturer
            .start(
                backend,
                vga_config(),
                CaptureLoopConfig::default(),
                Arc::new(FrameMailbox::new()),
                Arc::new(AtomicBool::new(false)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceNotFound);
        assert_eq!(capturer.state(), CaptureState::Error);
    }
}
