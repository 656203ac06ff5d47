//! Video capture
//!
//! Buffer pool, device contexts, capture sessions and the capture worker,
//! written against the [`CaptureDriver`] seam. V4L2 access goes through
//! `v4l2r`.

pub mod buffer_pool;
pub mod capture;
pub mod device;
pub mod driver;
pub mod format;
pub mod session;
pub mod sim;
pub mod v4l2r_capture;

pub use buffer_pool::{BufferDescriptor, BufferPool, BufferState};
pub use capture::{CaptureLoopConfig, CaptureState, CaptureStats, VideoCapturer};
pub use device::{DeviceContext, DeviceHandle, DeviceRegistry, MAX_DEVICES};
pub use driver::{monotonic_ns, CaptureBackend, CaptureDriver, WaitTimeout};
pub use format::{FormatDescriptor, PixelFormat, PlaneMode, Resolution};
pub use session::{CaptureSession, Frame, InterruptHandle, SessionConfig, SessionState};
pub use sim::{SimulatedBackend, SimulatedFaults};
pub use v4l2r_capture::{V4l2Backend, V4l2Driver};
