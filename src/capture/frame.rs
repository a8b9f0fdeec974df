use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every frame handed out by this crate is interleaved BGR.
pub const CHANNELS: u32 = 3;

/// An owned, interleaved BGR raster.
///
/// `Clone` performs a deep copy of the pixel buffer, so a cloned frame never
/// aliases the capture slot or the mailbox region it came from.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    /// `width * height * channels` bytes, row-major, B G R per pixel
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    /// Position in the capture stream; 0 for frames not produced by a source
    pub sequence: u64,
    /// Monotonic instant the frame was produced
    pub timestamp: Instant,
}

/// Device-side pixel formats the V4L2 backend can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Bgr24,
    Rgb24,
    Yuyv4,
    Mjpeg,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("frame buffer holds {actual} bytes, {width}x{height}x3 needs {expected}")]
pub struct FrameSizeError {
    pub width: u32,
    pub height: u32,
    pub expected: usize,
    pub actual: usize,
}

impl Frame {
    /// Wrap a BGR buffer, checking that its length matches the dimensions.
    pub fn from_bgr(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameSizeError> {
        let expected = raster_len(width, height);
        if data.len() != expected {
            return Err(FrameSizeError {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            data,
            width,
            height,
            channels: CHANNELS,
            sequence: 0,
            timestamp: Instant::now(),
        })
    }

    /// A frame of a single solid colour, handy for probes and tests.
    pub fn filled(width: u32, height: u32, bgr: [u8; 3]) -> Self {
        let data = bgr
            .iter()
            .copied()
            .cycle()
            .take(raster_len(width, height))
            .collect();

        Self {
            data,
            width,
            height,
            channels: CHANNELS,
            sequence: 0,
            timestamp: Instant::now(),
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Row stride in bytes.
    pub fn stride(&self) -> usize {
        self.width as usize * self.channels as usize
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channels", &self.channels)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish_non_exhaustive()
    }
}

pub(crate) fn raster_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * CHANNELS as usize
}
