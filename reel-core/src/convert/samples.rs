//! Sample layout conversion: any decoder sample format, packed or planar,
//! to the session's interleaved output format. Channel count and rate are
//! preserved.
//!
//! Output is handed out in chunks of at most `chunk_samples`; whatever does
//! not fit stays buffered (`delay()`) until drained with `flush()`.

use crate::error::{MediaError, Result};
use crate::format::{SampleFormat, SourceSampleFormat};
use crate::frame::AudioFrame;

pub struct SampleConverter {
    in_format: SourceSampleFormat,
    out_format: SampleFormat,
    channels: u16,
    chunk_samples: usize,
    /// Converted bytes not yet handed out
    pending: Vec<u8>,
    read_pos: usize,
    chunk: Vec<u8>,
}

impl SampleConverter {
    pub fn new(
        in_format: SourceSampleFormat,
        out_format: SampleFormat,
        channels: u16,
        chunk_samples: usize,
    ) -> Result<Self> {
        if channels == 0 || chunk_samples == 0 {
            return Err(MediaError::Allocation(format!(
                "sample converter needs channels and a chunk size, got {} x {}",
                channels, chunk_samples
            )));
        }

        let frame_bytes = out_format.bytes_per_sample() * channels as usize;
        Ok(Self {
            in_format,
            out_format,
            channels,
            chunk_samples,
            pending: Vec::new(),
            read_pos: 0,
            chunk: Vec::with_capacity(chunk_samples * frame_bytes),
        })
    }

    fn frame_bytes(&self) -> usize {
        self.out_format.bytes_per_sample() * self.channels as usize
    }

    /// Convert a decoded frame and return the first chunk of output.
    pub fn convert(&mut self, frame: &AudioFrame) -> Result<&[u8]> {
        if frame.format != self.in_format || frame.channels != self.channels {
            return Err(MediaError::Decode(format!(
                "Audio layout changed mid-stream: {:?} x{} -> {:?} x{}",
                self.in_format, self.channels, frame.format, frame.channels
            )));
        }

        self.compact();
        let channels = self.channels as usize;
        let in_bps = self.in_format.bytes_per_sample();
        let out_bps = self.out_format.bytes_per_sample();
        let start = self.pending.len();
        self.pending.resize(start + frame.nb_samples * channels * out_bps, 0);

        let passthrough = !self.in_format.is_planar()
            && self.in_format == SourceSampleFormat::from(self.out_format);
        if passthrough {
            let len = frame.nb_samples * channels * in_bps;
            self.pending[start..].copy_from_slice(&frame.plane(0)[..len]);
        } else {
            for i in 0..frame.nb_samples {
                for ch in 0..channels {
                    let (plane, at) = if self.in_format.is_planar() {
                        (frame.plane(ch), i * in_bps)
                    } else {
                        (frame.plane(0), (i * channels + ch) * in_bps)
                    };
                    let value = read_sample(self.in_format, &plane[at..at + in_bps]);
                    let out = start + (i * channels + ch) * out_bps;
                    write_sample(self.out_format, value, &mut self.pending[out..out + out_bps]);
                }
            }
        }

        Ok(self.flush())
    }

    /// Samples converted but not yet handed out.
    pub fn delay(&self) -> usize {
        (self.pending.len() - self.read_pos) / self.frame_bytes()
    }

    /// Next chunk of buffered output; empty when nothing is left.
    pub fn flush(&mut self) -> &[u8] {
        let frame_bytes = self.frame_bytes();
        let available = self.pending.len() - self.read_pos;
        let take = available.min(self.chunk_samples * frame_bytes);

        self.chunk.clear();
        self.chunk
            .extend_from_slice(&self.pending[self.read_pos..self.read_pos + take]);
        self.read_pos += take;
        &self.chunk
    }

    /// Drop everything buffered (after a seek).
    pub fn reset(&mut self) {
        self.pending.clear();
        self.read_pos = 0;
        self.chunk.clear();
    }

    fn compact(&mut self) {
        if self.read_pos > 0 {
            self.pending.drain(..self.read_pos);
            self.read_pos = 0;
        }
    }
}

/// Decode one sample to the -1.0..1.0 range.
fn read_sample(format: SourceSampleFormat, bytes: &[u8]) -> f64 {
    match format.packed() {
        SourceSampleFormat::U8 => (bytes[0] as f64 - 128.0) / 128.0,
        SourceSampleFormat::S16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f64 / 32768.0,
        SourceSampleFormat::S32 => {
            i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64 / 2_147_483_648.0
        }
        SourceSampleFormat::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
        _ => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[..8]);
            f64::from_le_bytes(raw)
        }
    }
}

fn write_sample(format: SampleFormat, value: f64, out: &mut [u8]) {
    match format {
        SampleFormat::U8 => out[0] = (value * 128.0 + 128.0).round().clamp(0.0, 255.0) as u8,
        SampleFormat::S16 => {
            let v = (value * 32768.0).round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
            out.copy_from_slice(&v.to_le_bytes());
        }
        SampleFormat::S32 => {
            let v = (value * 2_147_483_648.0)
                .round()
                .clamp(i32::MIN as f64, i32::MAX as f64) as i32;
            out.copy_from_slice(&v.to_le_bytes());
        }
        SampleFormat::F32 => out.copy_from_slice(&(value as f32).to_le_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planar_f32(left: &[f32], right: &[f32]) -> AudioFrame {
        let mut frame = AudioFrame::new();
        frame.alloc(SourceSampleFormat::F32Planar, 2, 48_000, left.len());
        for (i, v) in left.iter().enumerate() {
            frame.plane_mut(0)[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
        for (i, v) in right.iter().enumerate() {
            frame.plane_mut(1)[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
        frame
    }

    fn s16(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    #[test]
    fn test_planar_float_to_interleaved_s16() {
        let mut converter =
            SampleConverter::new(SourceSampleFormat::F32Planar, SampleFormat::S16, 2, 1024).unwrap();
        let frame = planar_f32(&[0.5, -0.5], &[0.25, 1.0]);
        let out = converter.convert(&frame).unwrap();
        assert_eq!(s16(out), vec![16384, 8192, -16384, 32767]);
        assert_eq!(converter.delay(), 0);
    }

    #[test]
    fn test_passthrough_is_bit_exact() {
        let mut frame = AudioFrame::new();
        frame.alloc(SourceSampleFormat::S16, 1, 8000, 3);
        frame.plane_mut(0).copy_from_slice(&[1, 0, 255, 127, 0, 128]);

        let mut converter =
            SampleConverter::new(SourceSampleFormat::S16, SampleFormat::S16, 1, 16).unwrap();
        assert_eq!(converter.convert(&frame).unwrap(), &[1, 0, 255, 127, 0, 128]);
    }

    #[test]
    fn test_remainder_is_held_until_flushed() {
        let mut converter =
            SampleConverter::new(SourceSampleFormat::F32Planar, SampleFormat::F32, 2, 3).unwrap();
        let frame = planar_f32(&[0.0; 8], &[0.0; 8]);

        assert_eq!(converter.convert(&frame).unwrap().len(), 3 * 8);
        assert_eq!(converter.delay(), 5);
        assert_eq!(converter.flush().len(), 3 * 8);
        assert_eq!(converter.flush().len(), 2 * 8);
        assert!(converter.flush().is_empty());
        assert_eq!(converter.delay(), 0);
    }

    #[test]
    fn test_u8_silence_maps_to_zero() {
        let mut frame = AudioFrame::new();
        frame.alloc(SourceSampleFormat::U8, 1, 8000, 2);
        frame.plane_mut(0).copy_from_slice(&[128, 255]);

        let mut converter =
            SampleConverter::new(SourceSampleFormat::U8, SampleFormat::F32, 1, 16).unwrap();
        let out = converter.convert(&frame).unwrap().to_vec();
        assert_eq!(f32::from_le_bytes([out[0], out[1], out[2], out[3]]), 0.0);
        assert!(f32::from_le_bytes([out[4], out[5], out[6], out[7]]) > 0.99);
    }

    #[test]
    fn test_layout_change_is_rejected() {
        let mut converter =
            SampleConverter::new(SourceSampleFormat::S16, SampleFormat::S16, 2, 16).unwrap();
        let mut frame = AudioFrame::new();
        frame.alloc(SourceSampleFormat::S16, 1, 8000, 4);
        assert!(matches!(converter.convert(&frame), Err(MediaError::Decode(_))));
    }

    #[test]
    fn test_reset_discards_pending() {
        let mut converter =
            SampleConverter::new(SourceSampleFormat::F32Planar, SampleFormat::F32, 2, 1).unwrap();
        converter.convert(&planar_f32(&[0.0; 4], &[0.0; 4])).unwrap();
        assert_eq!(converter.delay(), 3);
        converter.reset();
        assert_eq!(converter.delay(), 0);
    }
}
