//! Raw frame wire format
//!
//! Each frame is a fixed [`FrameHeader`] immediately followed by
//! `payload_size` bytes of frame data. All fields are in host byte order.

use bytemuck::{Pod, Zeroable};
use bytes::Bytes;

use crate::error::{MediaError, Result};
use crate::video::PixelFormat;

pub const FRAME_MAGIC: u32 = 0xDEAD_BEEF;

/// Bytes on the wire for one header
pub const FRAME_HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();

/// Per-frame header
///
/// | offset | field |
/// |---|---|
/// | 0 | magic |
/// | 4 | frame_id |
/// | 8 | width |
/// | 12 | height |
/// | 16 | pixel_format |
/// | 20 | payload_size |
/// | 24 | timestamp_ns |
/// | 32 | reserved (2 x u32) |
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct FrameHeader {
    pub magic: u32,
    pub frame_id: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
    pub payload_size: u32,
    pub timestamp_ns: u64,
    pub reserved: [u32; 2],
}

impl FrameHeader {
    pub fn new(
        frame_id: u32,
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        payload_size: u32,
        timestamp_ns: u64,
    ) -> Self {
        Self {
            magic: FRAME_MAGIC,
            frame_id,
            width,
            height,
            pixel_format: pixel_format.as_u32(),
            payload_size,
            timestamp_ns,
            reserved: [0; 2],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Parse a header from the start of `buf`, checking the magic
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(MediaError::InvalidParam(format!(
                "Frame header needs {} bytes, got {}",
                FRAME_HEADER_LEN,
                buf.len()
            )));
        }
        let header: FrameHeader = bytemuck::pod_read_unaligned(&buf[..FRAME_HEADER_LEN]);
        if header.magic != FRAME_MAGIC {
            return Err(MediaError::InvalidParam(format!(
                "Bad frame magic 0x{:08x}",
                header.magic
            )));
        }
        Ok(header)
    }
}

/// A frame ready for transmission: owned payload plus header fields
#[derive(Debug, Clone)]
pub struct StreamFrame {
    pub payload: Bytes,
    pub frame_id: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub timestamp_ns: u64,
}

impl StreamFrame {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader::new(
            self.frame_id,
            self.width,
            self.height,
            self.pixel_format,
            self.payload.len() as u32,
            self.timestamp_ns,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        assert_eq!(FRAME_HEADER_LEN, 40);

        let header = FrameHeader::new(7, 1920, 1080, PixelFormat::SBGGR10, 4096, 123_456_789);
        let bytes = header.as_bytes();
        assert_eq!(&bytes[0..4], &FRAME_MAGIC.to_ne_bytes());
        assert_eq!(&bytes[4..8], &7u32.to_ne_bytes());
        assert_eq!(&bytes[16..20], &PixelFormat::SBGGR10.as_u32().to_ne_bytes());
        assert_eq!(&bytes[20..24], &4096u32.to_ne_bytes());
        assert_eq!(&bytes[24..32], &123_456_789u64.to_ne_bytes());
        assert_eq!(&bytes[32..40], &[0u8; 8]);
    }

    #[test]
    fn test_header_decode() {
        let header = FrameHeader::new(7, 1920, 1080, PixelFormat::SBGGR10, 4096, 42);
        let decoded = FrameHeader::decode(header.as_bytes()).unwrap();
        assert_eq!(decoded, header);

        let mut corrupt = header.as_bytes().to_vec();
        corrupt[0] ^= 0xff;
        assert!(FrameHeader::decode(&corrupt).is_err());
        assert!(FrameHeader::decode(&corrupt[..10]).is_err());
    }

    #[test]
    fn test_header_len_independent_of_payload() {
        for size in [0usize, 1, 65_536, 4_147_200] {
            let frame = StreamFrame {
                payload: Bytes::from(vec![0u8; size]),
                frame_id: 1,
                width: 1920,
                height: 1080,
                pixel_format: PixelFormat::SBGGR10,
                timestamp_ns: 0,
            };
            let header = frame.header();
            assert_eq!(header.as_bytes().len(), FRAME_HEADER_LEN);
            assert_eq!(header.payload_size as usize, size);
        }
    }
}
