use nix::errno::Errno;
use thiserror::Error;

/// Crate-wide error type
///
/// Every capture, buffer and streaming operation returns its failure
/// directly; there is no shared "last error" slot.
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("IOCTL operation failed: {0}")]
    IoctlFailed(String),

    /// Non-fatal: no frame became ready in time. Callers retry.
    #[error("Operation timeout")]
    Timeout,

    #[error("Buffer error: {0}")]
    BufferError(String),

    #[error("Format error: {0}")]
    FormatError(String),

    #[error("Streaming error: {0}")]
    StreamingError(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error classification, one entry per failure kind a caller may branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidParam,
    DeviceNotFound,
    DeviceBusy,
    NotSupported,
    OutOfMemory,
    IoctlFailed,
    Timeout,
    BufferError,
    FormatError,
    StreamingError,
    Config,
    Io,
}

impl ErrorKind {
    /// Stable negative status code, -1 (invalid parameter) through -10
    /// (streaming error). Config and IO errors report as ioctl failures (-6).
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::InvalidParam => -1,
            ErrorKind::DeviceNotFound => -2,
            ErrorKind::DeviceBusy => -3,
            ErrorKind::NotSupported => -4,
            ErrorKind::OutOfMemory => -5,
            ErrorKind::IoctlFailed | ErrorKind::Config | ErrorKind::Io => -6,
            ErrorKind::Timeout => -7,
            ErrorKind::BufferError => -8,
            ErrorKind::FormatError => -9,
            ErrorKind::StreamingError => -10,
        }
    }
}

impl MediaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MediaError::InvalidParam(_) => ErrorKind::InvalidParam,
            MediaError::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            MediaError::DeviceBusy(_) => ErrorKind::DeviceBusy,
            MediaError::NotSupported(_) => ErrorKind::NotSupported,
            MediaError::OutOfMemory(_) => ErrorKind::OutOfMemory,
            MediaError::IoctlFailed(_) => ErrorKind::IoctlFailed,
            MediaError::Timeout => ErrorKind::Timeout,
            MediaError::BufferError(_) => ErrorKind::BufferError,
            MediaError::FormatError(_) => ErrorKind::FormatError,
            MediaError::StreamingError(_) => ErrorKind::StreamingError,
            MediaError::Config(_) => ErrorKind::Config,
            MediaError::Io(_) => ErrorKind::Io,
        }
    }

    pub fn code(&self) -> i32 {
        self.kind().code()
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, MediaError::Timeout)
    }

    /// Map an errno from `open(2)` on a device node
    pub fn from_open_errno(path: &str, errno: Errno) -> Self {
        match errno {
            Errno::ENOENT | Errno::ENODEV | Errno::ENXIO => {
                MediaError::DeviceNotFound(format!("{}: {}", path, errno))
            }
            Errno::EBUSY => MediaError::DeviceBusy(format!("{}: {}", path, errno)),
            Errno::ENOMEM => MediaError::OutOfMemory(format!("{}: {}", path, errno)),
            _ => MediaError::DeviceNotFound(format!("{}: {}", path, errno)),
        }
    }

    /// Map an errno from a buffer ioctl (REQBUFS/QUERYBUF/QBUF/DQBUF)
    pub fn from_buffer_errno(op: &str, errno: Errno) -> Self {
        match errno {
            Errno::EAGAIN => MediaError::Timeout,
            Errno::ENOMEM => MediaError::OutOfMemory(format!("{} failed: {}", op, errno)),
            Errno::EBUSY => MediaError::DeviceBusy(format!("{} failed: {}", op, errno)),
            Errno::ENODEV => MediaError::DeviceNotFound(format!("{} failed: {}", op, errno)),
            _ => MediaError::BufferError(format!("{} failed: {}", op, errno)),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, MediaError>;
