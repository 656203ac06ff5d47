use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{MediaError, Result};
use crate::stream::server::DEFAULT_PORT;
use crate::video::format::{FormatDescriptor, PixelFormat, PlaneMode, FIELD_ANY, MAX_PLANES};
use crate::video::session::{SessionConfig, MAX_BUFFERS};

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Capture device and format
    pub capture: CaptureConfig,
    /// Streaming server
    pub stream: StreamConfig,
}

/// Capture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device node, e.g. /dev/video0
    pub device: PathBuf,
    pub width: u32,
    pub height: u32,
    /// FourCC (`BG10`) or `0x`-prefixed code
    pub pixel_format: PixelFormat,
    /// V4L2 field order code; 0 lets the driver choose
    pub field: u32,
    /// Bytes per plane; empty means one plane of width * height * 2
    pub plane_sizes: Vec<u32>,
    pub buffer_count: u32,
    pub plane_mode: PlaneMode,
    pub nonblocking: bool,
    /// Per-frame wait in milliseconds; negative waits indefinitely
    pub timeout_ms: i32,
    /// Seconds between FPS log lines
    pub stats_interval_secs: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/video0"),
            width: 1920,
            height: 1080,
            pixel_format: PixelFormat::SBGGR10,
            field: FIELD_ANY,
            plane_sizes: Vec::new(),
            buffer_count: 4,
            plane_mode: PlaneMode::Multi,
            nonblocking: false,
            timeout_ms: 1000,
            stats_interval_secs: 5,
        }
    }
}

impl CaptureConfig {
    /// Plane sizes to request, filling in the default single plane
    pub fn effective_plane_sizes(&self) -> Vec<u32> {
        if self.plane_sizes.is_empty() {
            vec![self.width.saturating_mul(self.height).saturating_mul(2)]
        } else {
            self.plane_sizes.clone()
        }
    }

    pub fn format(&self) -> FormatDescriptor {
        FormatDescriptor {
            width: self.width,
            height: self.height,
            pixel_format: self.pixel_format,
            field: self.field,
            plane_sizes: self.effective_plane_sizes(),
        }
    }
}

/// Streaming server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub bind_address: IpAddr,
    pub port: u16,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
        }
    }
}

impl StreamConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        let capture = &self.capture;
        if capture.device.as_os_str().is_empty() {
            return Err(MediaError::Config("capture.device must not be empty".to_string()));
        }
        if capture.width == 0 || capture.height == 0 {
            return Err(MediaError::Config(format!(
                "capture resolution {}x{} is invalid",
                capture.width, capture.height
            )));
        }
        if capture.buffer_count == 0 || capture.buffer_count > MAX_BUFFERS {
            return Err(MediaError::Config(format!(
                "capture.buffer_count must be 1..={}, got {}",
                MAX_BUFFERS, capture.buffer_count
            )));
        }
        let planes = capture.effective_plane_sizes();
        if planes.len() > MAX_PLANES {
            return Err(MediaError::Config(format!(
                "capture.plane_sizes has {} entries, at most {} allowed",
                planes.len(),
                MAX_PLANES
            )));
        }
        if capture.plane_mode == PlaneMode::Single && planes.len() != 1 {
            return Err(MediaError::Config(
                "single plane mode takes exactly one plane size".to_string(),
            ));
        }
        if capture.timeout_ms == 0 {
            return Err(MediaError::Config(
                "capture.timeout_ms must be positive, or negative to wait indefinitely"
                    .to_string(),
            ));
        }
        if capture.stats_interval_secs == 0 {
            return Err(MediaError::Config(
                "capture.stats_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig::new(self.capture.device.clone(), self.capture.format())
            .with_buffer_count(self.capture.buffer_count)
            .with_plane_mode(self.capture.plane_mode)
            .with_nonblocking(self.capture.nonblocking)
    }
}
