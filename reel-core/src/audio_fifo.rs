//! # Audio FIFO
//!
//! Bounded queue of interleaved, already converted samples between the
//! decode thread and whoever pulls audio (sink callback or host).
//!
//! Overflow is lossy: a push that does not fit first discards the oldest
//! queued samples. The producer never blocks here; the engine's watermarks
//! are what keep it from running far ahead.

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;

use crate::error::{MediaError, Result};
use crate::format::SampleFormat;

pub struct AudioFifo {
    ring: Mutex<HeapRb<u8>>,
    format: SampleFormat,
    channels: u16,
    /// Bytes per interleaved sample frame (all channels)
    frame_bytes: usize,
    capacity: usize,
}

impl AudioFifo {
    /// A FIFO holding up to `capacity` samples per channel.
    pub fn new(format: SampleFormat, channels: u16, capacity: usize) -> Result<Self> {
        if channels == 0 || capacity == 0 {
            return Err(MediaError::Allocation(format!(
                "audio fifo needs channels and capacity, got {} x {}",
                channels, capacity
            )));
        }

        let frame_bytes = format.bytes_per_sample() * channels as usize;
        let bytes = capacity
            .checked_mul(frame_bytes)
            .ok_or_else(|| MediaError::Allocation("audio fifo size overflows".into()))?;

        Ok(Self {
            ring: Mutex::new(HeapRb::new(bytes)),
            format,
            channels,
            frame_bytes,
            capacity,
        })
    }

    /// Queue `samples` samples from `data`, dropping the oldest on overflow.
    ///
    /// Returns the number of samples written.
    pub fn push(&self, data: &[u8], samples: usize) -> usize {
        let samples = samples.min(data.len() / self.frame_bytes);
        if samples == 0 {
            return 0;
        }

        // Only the newest `capacity` samples of an oversized push can survive
        let keep = samples.min(self.capacity);
        let bytes = &data[(samples - keep) * self.frame_bytes..samples * self.frame_bytes];

        let mut ring = self.ring.lock();
        let vacant = ring.vacant_len();
        if vacant < bytes.len() {
            ring.skip(bytes.len() - vacant);
        }
        let written = ring.push_slice(bytes);
        written / self.frame_bytes
    }

    /// Read up to `samples` samples into `out`. Returns how many were read.
    pub fn pop(&self, out: &mut [u8], samples: usize) -> usize {
        let samples = samples.min(out.len() / self.frame_bytes);
        if samples == 0 {
            return 0;
        }
        let read = self.ring.lock().pop_slice(&mut out[..samples * self.frame_bytes]);
        read / self.frame_bytes
    }

    /// Discard up to `samples` of the oldest samples.
    pub fn drain(&self, samples: usize) -> usize {
        let bytes = samples.saturating_mul(self.frame_bytes);
        self.ring.lock().skip(bytes) / self.frame_bytes
    }

    /// Samples currently queued.
    pub fn size(&self) -> usize {
        self.ring.lock().occupied_len() / self.frame_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Queued plus free space, in samples.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.ring.lock().clear();
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s16_mono(values: &[i16]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_rejects_empty_layout() {
        assert!(matches!(
            AudioFifo::new(SampleFormat::S16, 0, 100),
            Err(MediaError::Allocation(_))
        ));
        assert!(matches!(
            AudioFifo::new(SampleFormat::S16, 2, 0),
            Err(MediaError::Allocation(_))
        ));
    }

    #[test]
    fn test_push_pop_partial() {
        let fifo = AudioFifo::new(SampleFormat::S16, 1, 10).unwrap();
        assert_eq!(fifo.push(&s16_mono(&[1, 2, 3]), 3), 3);
        assert_eq!(fifo.size(), 3);

        let mut out = [0u8; 10];
        assert_eq!(fifo.pop(&mut out, 5), 3);
        assert_eq!(&out[..6], &s16_mono(&[1, 2, 3])[..]);
        assert_eq!(fifo.size(), 0);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let fifo = AudioFifo::new(SampleFormat::S16, 1, 4).unwrap();
        fifo.push(&s16_mono(&[1, 2, 3]), 3);
        fifo.push(&s16_mono(&[4, 5, 6]), 3);
        assert_eq!(fifo.size(), 4);

        let mut out = [0u8; 8];
        assert_eq!(fifo.pop(&mut out, 4), 4);
        assert_eq!(&out[..], &s16_mono(&[3, 4, 5, 6])[..]);
    }

    #[test]
    fn test_oversized_push_keeps_tail() {
        let fifo = AudioFifo::new(SampleFormat::S16, 1, 3).unwrap();
        let values: Vec<i16> = (0..10).collect();
        assert_eq!(fifo.push(&s16_mono(&values), 10), 3);
        assert!(fifo.size() <= fifo.capacity());

        let mut out = [0u8; 6];
        fifo.pop(&mut out, 3);
        assert_eq!(&out[..], &s16_mono(&[7, 8, 9])[..]);
    }

    #[test]
    fn test_stereo_counts_sample_frames() {
        let fifo = AudioFifo::new(SampleFormat::F32, 2, 100).unwrap();
        assert_eq!(fifo.frame_bytes(), 8);
        fifo.push(&[0u8; 80], 10);
        assert_eq!(fifo.size(), 10);
        assert_eq!(fifo.drain(4), 4);
        assert_eq!(fifo.size(), 6);
        fifo.clear();
        assert!(fifo.is_empty());
    }
}
