//! Presentation clocks.
//!
//! Audio is the master whenever an audio stream is open: its time is the
//! number of samples consumed divided by the sample rate. Without audio the
//! render loop's frame deltas are summed instead.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Audio clock - advanced by whoever pulls samples (sink callback or host)
#[derive(Debug)]
pub struct AudioClock {
    samples_consumed: AtomicU64,
    sample_rate: AtomicU32,
}

impl AudioClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            samples_consumed: AtomicU64::new(0),
            sample_rate: AtomicU32::new(sample_rate),
        }
    }

    /// Account for `samples` more samples played. Returns the new time.
    pub fn advance(&self, samples: u64) -> f64 {
        let total = self.samples_consumed.fetch_add(samples, Ordering::SeqCst) + samples;
        self.to_seconds(total)
    }

    pub fn time(&self) -> f64 {
        self.to_seconds(self.samples_consumed.load(Ordering::SeqCst))
    }

    /// Re-base the clock, e.g. after a seek.
    pub fn set_time(&self, seconds: f64) {
        let rate = self.sample_rate.load(Ordering::SeqCst) as f64;
        let samples = (seconds.max(0.0) * rate).round() as u64;
        self.samples_consumed.store(samples, Ordering::SeqCst);
    }

    fn to_seconds(&self, samples: u64) -> f64 {
        let rate = self.sample_rate.load(Ordering::SeqCst);
        if rate == 0 {
            return 0.0;
        }
        samples as f64 / rate as f64
    }
}

/// Wall clock - sum of the deltas passed to `get_video_frame`
#[derive(Debug, Default, Clone, Copy)]
pub struct WallClock {
    elapsed: f64,
}

impl WallClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&mut self, delta: f64) -> f64 {
        if delta.is_finite() && delta > 0.0 {
            self.elapsed += delta;
        }
        self.elapsed
    }

    pub fn set_time(&mut self, seconds: f64) {
        self.elapsed = seconds;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_clock_counts_samples() {
        let clock = AudioClock::new(48_000);
        assert_eq!(clock.time(), 0.0);
        clock.advance(24_000);
        assert_eq!(clock.advance(24_000), 1.0);
        assert_eq!(clock.time(), 1.0);
    }

    #[test]
    fn test_audio_clock_rebase() {
        let clock = AudioClock::new(44_100);
        clock.advance(1000);
        clock.set_time(2.0);
        assert!((clock.time() - 2.0).abs() < 1e-9);
        assert!((clock.advance(44_100) - 3.0).abs() < 1e-9);
        clock.set_time(-1.0);
        assert_eq!(clock.time(), 0.0);
    }

    #[test]
    fn test_zero_rate_is_silent() {
        let clock = AudioClock::new(0);
        assert_eq!(clock.advance(100), 0.0);
    }

    #[test]
    fn test_wall_clock_ignores_bad_deltas() {
        let mut clock = WallClock::new();
        clock.advance(0.5);
        clock.advance(-1.0);
        clock.advance(f64::NAN);
        assert_eq!(clock.advance(0.25), 0.75);
        clock.set_time(10.0);
        assert_eq!(clock.advance(0.0), 10.0);
    }
}
