//! # Formats
//!
//! Sample formats, pixel formats and stream time bases, plus the
//! negotiation rules that pick the session's output audio format.

use serde::{Deserialize, Serialize};

// ============================================================================
// Time Base
// ============================================================================

/// Seconds-per-tick of a stream timestamp, as a rational number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBase {
    pub num: u32,
    pub den: u32,
}

impl TimeBase {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Convert a timestamp in ticks into seconds.
    pub fn seconds(&self, pts: i64) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        (pts as f64 * self.num as f64) / self.den as f64
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::new(1, 1_000_000)
    }
}

// ============================================================================
// Audio Formats
// ============================================================================

/// Output sample format requested through [`crate::Settings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AudioFormat {
    /// Keep the source format when it is one of the supported ones, otherwise F32
    #[default]
    Default,
    U8,
    S16,
    S32,
    F32,
}

/// Interleaved sample format stored in the audio FIFO and handed to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    U8,
    S16,
    S32,
    F32,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::U8 => 1,
            Self::S16 => 2,
            Self::S32 | Self::F32 => 4,
        }
    }

    /// Byte value that represents silence for one sample component.
    ///
    /// Zero for every format except unsigned 8-bit, whose midpoint is 0x80.
    /// The FIFO pre-fill uses plain zero bytes regardless.
    pub fn silence_byte(&self) -> u8 {
        match self {
            Self::U8 => 0x80,
            _ => 0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::S16 => "s16",
            Self::S32 => "s32",
            Self::F32 => "flt",
        }
    }
}

/// Sample format of decoded audio as produced by a backend decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceSampleFormat {
    U8,
    S16,
    S32,
    F32,
    F64,
    U8Planar,
    S16Planar,
    S32Planar,
    F32Planar,
    F64Planar,
}

impl SourceSampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::U8 | Self::U8Planar => 1,
            Self::S16 | Self::S16Planar => 2,
            Self::S32 | Self::S32Planar | Self::F32 | Self::F32Planar => 4,
            Self::F64 | Self::F64Planar => 8,
        }
    }

    pub fn is_planar(&self) -> bool {
        matches!(
            self,
            Self::U8Planar | Self::S16Planar | Self::S32Planar | Self::F32Planar | Self::F64Planar
        )
    }

    /// The packed layout holding the same sample type.
    pub fn packed(&self) -> Self {
        match self {
            Self::U8Planar => Self::U8,
            Self::S16Planar => Self::S16,
            Self::S32Planar => Self::S32,
            Self::F32Planar => Self::F32,
            Self::F64Planar => Self::F64,
            other => *other,
        }
    }
}

impl From<SampleFormat> for SourceSampleFormat {
    fn from(format: SampleFormat) -> Self {
        match format {
            SampleFormat::U8 => Self::U8,
            SampleFormat::S16 => Self::S16,
            SampleFormat::S32 => Self::S32,
            SampleFormat::F32 => Self::F32,
        }
    }
}

/// Pick the interleaved output format for a session.
///
/// Planar sources map to their packed counterpart; formats the sink cannot
/// take (64-bit float) fall back to F32.
pub fn choose_output_format(requested: AudioFormat, source: SourceSampleFormat) -> SampleFormat {
    match requested {
        AudioFormat::Default => match source.packed() {
            SourceSampleFormat::U8 => SampleFormat::U8,
            SourceSampleFormat::S16 => SampleFormat::S16,
            SourceSampleFormat::S32 => SampleFormat::S32,
            _ => SampleFormat::F32,
        },
        AudioFormat::U8 => SampleFormat::U8,
        AudioFormat::S16 => SampleFormat::S16,
        AudioFormat::S32 => SampleFormat::S32,
        AudioFormat::F32 => SampleFormat::F32,
    }
}

// ============================================================================
// Pixel Formats
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    // YUV planar (common decoder output)
    Yuv420p,
    Yuv422p,
    Yuv444p,
    // Full-range JPEG variants, deprecated in favour of colour-range metadata
    Yuvj420p,
    Yuvj422p,
    Yuvj444p,
    // YUV semi-planar (hardware decoder output)
    Nv12,
    // Packed RGB
    Rgb24,
    Rgba,
}

impl PixelFormat {
    /// Map a deprecated full-range format onto its limited-range counterpart.
    pub fn normalized(self) -> Self {
        match self {
            Self::Yuvj420p => Self::Yuv420p,
            Self::Yuvj422p => Self::Yuv422p,
            Self::Yuvj444p => Self::Yuv444p,
            other => other,
        }
    }

    pub fn plane_count(&self) -> usize {
        match self {
            Self::Yuv420p | Self::Yuv422p | Self::Yuv444p => 3,
            Self::Yuvj420p | Self::Yuvj422p | Self::Yuvj444p => 3,
            Self::Nv12 => 2,
            Self::Rgb24 | Self::Rgba => 1,
        }
    }

    /// Chroma subsampling shift as (horizontal, vertical).
    pub fn chroma_shift(&self) -> (u32, u32) {
        match self.normalized() {
            Self::Yuv420p | Self::Nv12 => (1, 1),
            Self::Yuv422p => (1, 0),
            _ => (0, 0),
        }
    }

    /// Tightly packed line size of a plane.
    pub fn line_size(&self, plane: usize, width: u32) -> usize {
        let w = width as usize;
        let (sx, _) = self.chroma_shift();
        match (self.normalized(), plane) {
            (Self::Rgb24, 0) => w * 3,
            (Self::Rgba, 0) => w * 4,
            (Self::Nv12, 1) => w.div_ceil(2) * 2,
            (_, 0) => w,
            (_, _) => (w + (1 << sx) - 1) >> sx,
        }
    }

    /// Number of rows in a plane.
    pub fn plane_height(&self, plane: usize, height: u32) -> usize {
        let h = height as usize;
        let (_, sy) = self.chroma_shift();
        if plane == 0 {
            h
        } else {
            (h + (1 << sy) - 1) >> sy
        }
    }

    pub fn is_yuv(&self) -> bool {
        !matches!(self, Self::Rgb24 | Self::Rgba)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_base_conversion() {
        let tb = TimeBase::new(1, 30);
        assert_eq!(tb.seconds(45), 1.5);

        let tb = TimeBase::new(1001, 30000);
        assert!((tb.seconds(30) - 1.001).abs() < 1e-9);
    }

    #[test]
    fn test_default_format_keeps_supported_source() {
        assert_eq!(
            choose_output_format(AudioFormat::Default, SourceSampleFormat::S16Planar),
            SampleFormat::S16
        );
        assert_eq!(
            choose_output_format(AudioFormat::Default, SourceSampleFormat::U8),
            SampleFormat::U8
        );
        assert_eq!(
            choose_output_format(AudioFormat::Default, SourceSampleFormat::F64Planar),
            SampleFormat::F32
        );
    }

    #[test]
    fn test_explicit_format_wins() {
        assert_eq!(
            choose_output_format(AudioFormat::S32, SourceSampleFormat::F32Planar),
            SampleFormat::S32
        );
    }

    #[test]
    fn test_deprecated_pixel_formats_normalize() {
        assert_eq!(PixelFormat::Yuvj420p.normalized(), PixelFormat::Yuv420p);
        assert_eq!(PixelFormat::Yuvj444p.normalized(), PixelFormat::Yuv444p);
        assert_eq!(PixelFormat::Nv12.normalized(), PixelFormat::Nv12);
    }

    #[test]
    fn test_plane_geometry() {
        let f = PixelFormat::Yuv420p;
        assert_eq!(f.line_size(0, 65), 65);
        assert_eq!(f.line_size(1, 65), 33);
        assert_eq!(f.plane_height(2, 49), 25);
        assert_eq!(PixelFormat::Rgba.line_size(0, 10), 40);
        assert_eq!(PixelFormat::Nv12.line_size(1, 9), 10);
    }
}
