//! vcap-stream - V4L2 capture and raw frame streaming
//!
//! Captures frames from a V4L2 device through mmap buffers and streams them
//! to a single TCP client with a fixed per-frame header.

pub mod config;
pub mod error;
pub mod stream;
pub mod utils;
pub mod video;

pub use error::{MediaError, Result};
