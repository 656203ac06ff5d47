//! Configuration file loading

mod schema;

pub use schema::{AppConfig, CaptureConfig, StreamConfig};

use std::path::Path;

use tracing::debug;

use crate::error::{MediaError, Result};

/// Read and validate a TOML configuration file
///
/// Missing sections and keys take their defaults.
pub fn load(path: &Path) -> Result<AppConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        MediaError::Config(format!("Failed to read {}: {}", path.display(), e))
    })?;
    let config: AppConfig = toml::from_str(&text)
        .map_err(|e| MediaError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
    config.validate()?;
    debug!("Loaded configuration from {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::video::{PixelFormat, PlaneMode};
    use std::io::Write;
    use std::time::Duration;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stream.port, 8888);
        assert_eq!(config.stream.socket_addr().to_string(), "0.0.0.0:8888");

        let session = config.to_session_config();
        assert_eq!(session.device_path.to_str(), Some("/dev/video0"));
        assert_eq!(session.format.pixel_format, PixelFormat::SBGGR10);
        assert_eq!(session.format.plane_sizes, vec![1920 * 1080 * 2]);
        assert_eq!(session.buffer_count, 4);
        assert_eq!(session.plane_mode, PlaneMode::Multi);
        assert!(!session.nonblocking);
        assert_eq!(config.capture.timeout_ms, 1000);
        assert_eq!(
            Duration::from_secs(config.capture.stats_interval_secs),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_load_partial_file() {
        let file = write_config(
            r#"
[capture]
device = "/dev/video2"
width = 640
height = 480
pixel_format = "YUYV"
plane_mode = "single"

[stream]
port = 9000
"#,
        );
        let config = load(file.path()).unwrap();
        assert_eq!(config.capture.width, 640);
        assert_eq!(config.capture.pixel_format, PixelFormat::YUYV);
        assert_eq!(config.capture.plane_mode, PlaneMode::Single);
        assert_eq!(config.capture.buffer_count, 4);
        assert_eq!(config.stream.port, 9000);
        assert_eq!(config.to_session_config().format.frame_size(), 640 * 480 * 2);
    }

    #[test]
    fn test_hex_pixel_format_and_planes() {
        let file = write_config(
            r#"
[capture]
pixel_format = "0x3231564e"
plane_sizes = [2073600, 1036800]
"#,
        );
        let config = load(file.path()).unwrap();
        assert_eq!(config.capture.pixel_format, PixelFormat::NV12);
        assert_eq!(config.to_session_config().format.num_planes(), 2);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let file = write_config("[capture]\nbuffer_count = 64\n");
        assert_eq!(load(file.path()).unwrap_err().kind(), ErrorKind::Config);

        let file = write_config("[capture]\npixel_format = \"TOOLONG\"\n");
        assert_eq!(load(file.path()).unwrap_err().kind(), ErrorKind::Config);

        let file = write_config("[capture]\ntimeout_ms = 0\n");
        assert_eq!(load(file.path()).unwrap_err().kind(), ErrorKind::Config);
        let file = write_config("[capture]\ntimeout_ms = -1\n");
        assert!(load(file.path()).is_ok());

        let file = write_config(
            "[capture]\nplane_mode = \"single\"\nplane_sizes = [100, 200]\n",
        );
        assert!(load(file.path()).is_err());

        assert!(load(Path::new("/nonexistent/vcap.toml")).is_err());
    }
}
