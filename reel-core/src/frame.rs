//! # Frames and Packets
//!
//! Compressed packets coming out of the demuxer, decoded video/audio frames
//! going into the queues, and the converted RGBA [`Picture`] handed to the
//! host for upload.
//!
//! Decoded frames are reused in place: `alloc` keeps existing allocations
//! when the geometry fits, `unref` only marks the frame empty.

use bytes::Bytes;

use crate::format::{PixelFormat, SourceSampleFormat};

// ============================================================================
// Packet
// ============================================================================

/// A compressed, demuxed unit of one stream.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    /// Index of the stream in the container
    pub stream_index: usize,
    /// Presentation timestamp in stream time-base ticks
    pub pts: Option<i64>,
    /// Decode timestamp in stream time-base ticks
    pub dts: Option<i64>,
    /// Duration in stream time-base ticks
    pub duration: i64,
    pub keyframe: bool,
    pub data: Bytes,
}

impl Packet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the payload reference, keeping the packet object for reuse.
    pub fn unref(&mut self) {
        self.data = Bytes::new();
        self.pts = None;
        self.dts = None;
        self.duration = 0;
        self.keyframe = false;
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// ============================================================================
// Video Frame
// ============================================================================

/// A decoded picture in the decoder's native pixel format.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    planes: [Vec<u8>; 3],
    linesize: [usize; 3],
    /// Best-effort presentation timestamp in stream ticks
    pub pts: Option<i64>,
    pub key_frame: bool,
    filled: bool,
}

impl VideoFrame {
    pub fn new() -> Self {
        Self {
            width: 0,
            height: 0,
            format: PixelFormat::Yuv420p,
            planes: Default::default(),
            linesize: [0; 3],
            pts: None,
            key_frame: false,
            filled: false,
        }
    }

    /// Size planes for the given geometry, reusing the current buffers.
    pub fn alloc(&mut self, width: u32, height: u32, format: PixelFormat) {
        self.width = width;
        self.height = height;
        self.format = format;
        for plane in 0..3 {
            if plane < format.plane_count() {
                let line = format.line_size(plane, width);
                let rows = format.plane_height(plane, height);
                self.linesize[plane] = line;
                self.planes[plane].resize(line * rows, 0);
            } else {
                self.linesize[plane] = 0;
                self.planes[plane].clear();
            }
        }
        self.filled = true;
    }

    /// Mark the frame as holding no picture. Buffers stay allocated.
    pub fn unref(&mut self) {
        self.filled = false;
        self.pts = None;
        self.key_frame = false;
    }

    /// Free the plane buffers.
    pub fn release(&mut self) {
        self.unref();
        self.planes = Default::default();
        self.linesize = [0; 3];
    }

    pub fn is_empty(&self) -> bool {
        !self.filled
    }

    pub fn plane(&self, index: usize) -> &[u8] {
        self.planes.get(index).map(|p| p.as_slice()).unwrap_or(&[])
    }

    pub fn plane_mut(&mut self, index: usize) -> &mut [u8] {
        match self.planes.get_mut(index) {
            Some(p) => p.as_mut_slice(),
            None => &mut [],
        }
    }

    pub fn linesize(&self, index: usize) -> usize {
        self.linesize.get(index).copied().unwrap_or(0)
    }

    /// Bytes currently reserved across all planes.
    pub fn allocated_bytes(&self) -> usize {
        self.planes.iter().map(|p| p.capacity()).sum()
    }
}

impl Default for VideoFrame {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Audio Frame
// ============================================================================

/// A block of decoded audio samples in the decoder's native layout.
///
/// Packed formats keep everything in plane 0; planar formats hold one plane
/// per channel.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub format: SourceSampleFormat,
    pub channels: u16,
    pub sample_rate: u32,
    pub nb_samples: usize,
    pub pts: Option<i64>,
    planes: Vec<Vec<u8>>,
}

impl AudioFrame {
    pub fn new() -> Self {
        Self {
            format: SourceSampleFormat::F32,
            channels: 0,
            sample_rate: 0,
            nb_samples: 0,
            pts: None,
            planes: Vec::new(),
        }
    }

    /// Size the sample planes, reusing the current buffers.
    pub fn alloc(&mut self, format: SourceSampleFormat, channels: u16, sample_rate: u32, nb_samples: usize) {
        self.format = format;
        self.channels = channels;
        self.sample_rate = sample_rate;
        self.nb_samples = nb_samples;

        let bps = format.bytes_per_sample();
        let (count, len) = if format.is_planar() {
            (channels as usize, nb_samples * bps)
        } else {
            (1, nb_samples * bps * channels as usize)
        };
        self.planes.resize_with(count, Vec::new);
        for plane in &mut self.planes {
            plane.resize(len, 0);
        }
    }

    pub fn unref(&mut self) {
        self.nb_samples = 0;
        self.pts = None;
    }

    pub fn is_empty(&self) -> bool {
        self.nb_samples == 0
    }

    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    pub fn plane(&self, index: usize) -> &[u8] {
        self.planes.get(index).map(|p| p.as_slice()).unwrap_or(&[])
    }

    pub fn plane_mut(&mut self, index: usize) -> &mut [u8] {
        match self.planes.get_mut(index) {
            Some(p) => p.as_mut_slice(),
            None => &mut [],
        }
    }
}

impl Default for AudioFrame {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Picture
// ============================================================================

/// The converted, display-ready frame (packed RGBA, 4 bytes per pixel).
///
/// A session owns exactly one picture and overwrites it in place each time a
/// new frame is presented, so hosts can keep a GPU texture bound to it.
#[derive(Debug, Clone, Default)]
pub struct Picture {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    /// Presentation time of the frame currently held, in seconds
    pub pts: f64,
    /// Incremented on every conversion into this picture
    pub serial: u64,
}

impl Picture {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 4],
            pts: 0.0,
            serial: 0,
        }
    }

    /// True until the first frame has been converted into this picture.
    pub fn is_empty(&self) -> bool {
        self.serial == 0
    }

    pub fn stride(&self) -> usize {
        self.width as usize * 4
    }
}
