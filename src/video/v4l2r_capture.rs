//! V4L2 capture driver using v4l2r (ioctl layer).

use std::fmt::Debug;
use std::fs::File;
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info};
use v4l2r::bindings::v4l2_requestbuffers;
use v4l2r::ioctl::{
    self, Capabilities, Capability as V4l2rCapability, IoctlConvertError, MemoryConsistency,
    PlaneMapping, QBufPlane, QBuffer, QueryBuffer, V4l2Buffer,
};
use v4l2r::memory::{MemoryType, MmapHandle};
use v4l2r::{Format as V4l2rFormat, PixelFormat as V4l2rPixelFormat, QueueType};

use super::driver::{
    CaptureBackend, CaptureDriver, DequeuedBuffer, PlaneInfo, PlaneUsage,
};
use super::format::{FormatDescriptor, PixelFormat, PlaneMode};
use crate::error::{MediaError, Result};

/// Errno behind a failed buffer ioctl; conversion failures count as EINVAL
fn convert_errno<IE, CE>(err: IoctlConvertError<IE, CE>) -> Errno
where
    IE: Debug + Into<Errno>,
    CE: Debug,
{
    match err {
        IoctlConvertError::IoctlError(e) => e.into(),
        IoctlConvertError::ConversionError(_) => Errno::EINVAL,
    }
}

/// Opens `/dev/videoN` nodes
#[derive(Debug, Clone, Copy, Default)]
pub struct V4l2Backend;

impl CaptureBackend for V4l2Backend {
    type Driver = V4l2Driver;

    fn open(&self, path: &Path, nonblocking: bool) -> Result<V4l2Driver> {
        V4l2Driver::open(path, nonblocking)
    }
}

/// One mmap'ed plane
pub struct MmapPlane(PlaneMapping);

impl AsRef<[u8]> for MmapPlane {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

/// V4L2 capture endpoint backed by v4l2r ioctls
pub struct V4l2Driver {
    fd: File,
    path: PathBuf,
    queue: QueueType,
    nonblocking: bool,
}

impl V4l2Driver {
    pub fn open(path: &Path, nonblocking: bool) -> Result<Self> {
        let mut options = File::options();
        options.read(true).write(true);
        if nonblocking {
            options.custom_flags(OFlag::O_NONBLOCK.bits());
        }
        let fd = options.open(path).map_err(|e| {
            let errno = e
                .raw_os_error()
                .map(Errno::from_raw)
                .unwrap_or(Errno::UnknownErrno);
            MediaError::from_open_errno(&path.display().to_string(), errno)
        })?;

        debug!("Opened capture device {:?} (nonblocking={})", path, nonblocking);
        Ok(Self {
            fd,
            path: path.to_path_buf(),
            queue: QueueType::VideoCaptureMplane,
            nonblocking,
        })
    }

    fn check_capabilities(&self, mode: PlaneMode) -> Result<()> {
        let caps: V4l2rCapability = ioctl::querycap(&self.fd)
            .map_err(|e| MediaError::IoctlFailed(format!("VIDIOC_QUERYCAP failed: {}", e)))?;
        let flags = caps.device_caps();
        info!("Device: {} (driver {})", caps.card, caps.driver);

        let required = match mode {
            PlaneMode::Single => Capabilities::VIDEO_CAPTURE,
            PlaneMode::Multi => Capabilities::VIDEO_CAPTURE_MPLANE,
        };
        if !flags.contains(required) {
            return Err(MediaError::NotSupported(format!(
                "{:?} does not support {} video capture",
                self.path, mode
            )));
        }
        if !flags.contains(Capabilities::STREAMING) {
            return Err(MediaError::NotSupported(format!(
                "{:?} does not support streaming I/O",
                self.path
            )));
        }
        Ok(())
    }
}

impl CaptureDriver for V4l2Driver {
    type Mapping = MmapPlane;

    fn set_format(
        &mut self,
        requested: &FormatDescriptor,
        mode: PlaneMode,
    ) -> Result<FormatDescriptor> {
        self.check_capabilities(mode)?;

        let queue = match mode {
            PlaneMode::Single => QueueType::VideoCapture,
            PlaneMode::Multi => QueueType::VideoCaptureMplane,
        };

        let mut fmt: V4l2rFormat = ioctl::g_fmt(&self.fd, queue)
            .map_err(|e| MediaError::FormatError(format!("VIDIOC_G_FMT failed: {}", e)))?;

        fmt.width = requested.width;
        fmt.height = requested.height;
        fmt.pixelformat = V4l2rPixelFormat::from(requested.pixel_format.as_u32());

        let actual: V4l2rFormat = ioctl::s_fmt(&mut self.fd, (queue, &fmt))
            .map_err(|e| MediaError::FormatError(format!("VIDIOC_S_FMT failed: {}", e)))?;

        self.queue = queue;

        let plane_sizes: Vec<u32> = actual.plane_fmt.iter().map(|p| p.sizeimage).collect();
        if plane_sizes.is_empty() {
            return Err(MediaError::FormatError(
                "Driver reported a format without planes".to_string(),
            ));
        }

        Ok(FormatDescriptor {
            width: actual.width,
            height: actual.height,
            pixel_format: PixelFormat::from_u32(u32::from(actual.pixelformat)),
            field: requested.field,
            plane_sizes,
        })
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        let req: v4l2_requestbuffers = ioctl::reqbufs(
            &self.fd,
            self.queue,
            MemoryType::Mmap,
            count,
            MemoryConsistency::empty(),
        )
        .map_err(|e| MediaError::from_buffer_errno("VIDIOC_REQBUFS", Errno::from(e)))?;
        Ok(req.count)
    }

    fn query_buffer(&mut self, index: u32) -> Result<Vec<PlaneInfo>> {
        let query: QueryBuffer = ioctl::querybuf(&self.fd, self.queue, index as usize)
            .map_err(|e| {
                MediaError::from_buffer_errno(
                    &format!("VIDIOC_QUERYBUF({})", index),
                    convert_errno(e),
                )
            })?;

        Ok(query
            .planes
            .iter()
            .map(|plane| PlaneInfo {
                length: plane.length,
                mem_offset: plane.mem_offset,
            })
            .collect())
    }

    fn map_plane(&mut self, index: u32, plane: usize, info: &PlaneInfo) -> Result<MmapPlane> {
        ioctl::mmap(&self.fd, info.mem_offset, info.length)
            .map(MmapPlane)
            .map_err(|e| {
                MediaError::OutOfMemory(format!(
                    "mmap failed for buffer {} plane {}: {}",
                    index, plane, e
                ))
            })
    }

    fn release_buffers(&mut self) -> Result<()> {
        let _req: v4l2_requestbuffers = ioctl::reqbufs(
            &self.fd,
            self.queue,
            MemoryType::Mmap,
            0,
            MemoryConsistency::empty(),
        )
        .map_err(|e| MediaError::from_buffer_errno("VIDIOC_REQBUFS(0)", Errno::from(e)))?;
        Ok(())
    }

    fn queue_buffer(&mut self, index: u32, plane_lengths: &[usize]) -> Result<()> {
        let handle = MmapHandle::default();
        let planes = plane_lengths
            .iter()
            .map(|len| {
                let mut plane = QBufPlane::new_from_handle(&handle, 0);
                plane.0.length = *len as u32;
                plane
            })
            .collect();
        let mut qbuf: QBuffer<MmapHandle> = QBuffer::new(self.queue, index);
        qbuf.planes = planes;
        ioctl::qbuf::<_, ()>(&self.fd, qbuf).map_err(|e| {
            MediaError::from_buffer_errno(&format!("VIDIOC_QBUF({})", index), convert_errno(e))
        })?;
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> Result<DequeuedBuffer> {
        // A blocking fd would sleep inside DQBUF; report "not ready" instead.
        // A non-blocking fd answers EAGAIN on its own.
        if !self.nonblocking && !self.wait_ready(Some(Duration::ZERO))? {
            return Err(MediaError::Timeout);
        }

        let dqbuf: V4l2Buffer = ioctl::dqbuf(&self.fd, self.queue)
            .map_err(|e| MediaError::from_buffer_errno("VIDIOC_DQBUF", convert_errno(e)))?;
        let raw = dqbuf.as_v4l2_buffer();
        let timestamp_ns =
            raw.timestamp.tv_sec as u64 * 1_000_000_000 + raw.timestamp.tv_usec as u64 * 1_000;

        let planes = dqbuf
            .planes_iter()
            .map(|plane| PlaneUsage {
                bytes_used: *plane.bytesused as usize,
                data_offset: plane.data_offset.copied().unwrap_or(0) as usize,
            })
            .collect();

        Ok(DequeuedBuffer {
            index: raw.index,
            planes,
            timestamp_ns,
            sequence: raw.sequence,
        })
    }

    fn wait_ready(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        let poll_timeout = match timeout {
            None => PollTimeout::NONE,
            Some(t) => PollTimeout::from(t.as_millis().min(u16::MAX as u128) as u16),
        };
        match poll(&mut fds, poll_timeout) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(MediaError::IoctlFailed(format!("poll failed: {}", e))),
        }
    }

    fn stream_on(&mut self) -> Result<()> {
        ioctl::streamon(&self.fd, self.queue)
            .map_err(|e| MediaError::StreamingError(format!("VIDIOC_STREAMON failed: {}", e)))
    }

    fn stream_off(&mut self) -> Result<()> {
        ioctl::streamoff(&self.fd, self.queue)
            .map_err(|e| MediaError::StreamingError(format!("VIDIOC_STREAMOFF failed: {}", e)))
    }
}

impl Drop for V4l2Driver {
    fn drop(&mut self) {
        debug!("Closing capture device {:?}", self.path);
    }
}
