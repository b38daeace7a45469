//! # Audio Sink
//!
//! The audio device seam. A device is opened with a fixed format and a pull
//! callback; it calls back on its own thread asking for `frames` sample
//! frames and plays whatever the callback filled.
//!
//! Thread affinity: the callback runs on the device thread, never on the
//! decode thread or the host's render thread. Everything it touches (the
//! audio FIFO, the audio clock, the engine signal) is internally locked.
//!
//! Without a configured [`AudioOutput`] no device is opened and the host
//! pulls samples itself through `Media::get_audio_frame`.

use thiserror::Error;

use crate::format::SampleFormat;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("No audio output device available")]
    NoDevice,
    #[error("Unsupported device configuration: {0}")]
    UnsupportedConfig(String),
    #[error("Failed to build output stream: {0}")]
    Build(String),
    #[error("Failed to control output stream: {0}")]
    Control(String),
}

/// Fills `buffer` with up to `frames` interleaved sample frames and returns
/// how many it actually filled. Shortfalls must already be silent.
pub type PullCallback = Box<dyn FnMut(&mut [u8], usize) -> usize + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkConfig {
    pub format: SampleFormat,
    pub channels: u16,
    pub sample_rate: u32,
}

/// An opened, initially stopped, output stream.
pub trait AudioSink {
    fn start(&mut self) -> Result<(), SinkError>;

    fn stop(&mut self) -> Result<(), SinkError>;

    /// Linear gain, 0.0 to 1.0.
    fn set_master_volume(&mut self, volume: f32) -> Result<(), SinkError>;
}

/// Opens sinks. One per `Media`, reused across files.
pub trait AudioOutput: Send + Sync {
    fn open(&self, config: SinkConfig, callback: PullCallback) -> Result<Box<dyn AudioSink>, SinkError>;
}

#[cfg(feature = "audio-output")]
pub use self::device::CpalOutput;

#[cfg(feature = "audio-output")]
mod device {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SizedSample, Stream, StreamConfig};
    use tracing::{error, info};

    use super::{AudioOutput, AudioSink, PullCallback, SinkConfig, SinkError};
    use crate::format::SampleFormat;

    /// Samples the device callback can scale in place.
    trait VolumeSample: SizedSample + bytemuck::Pod {
        fn scaled(self, volume: f32) -> Self;
    }

    impl VolumeSample for u8 {
        fn scaled(self, volume: f32) -> Self {
            ((self as f32 - 128.0) * volume + 128.0) as u8
        }
    }

    impl VolumeSample for i16 {
        fn scaled(self, volume: f32) -> Self {
            (self as f32 * volume) as i16
        }
    }

    impl VolumeSample for i32 {
        fn scaled(self, volume: f32) -> Self {
            (self as f64 * volume as f64) as i32
        }
    }

    impl VolumeSample for f32 {
        fn scaled(self, volume: f32) -> Self {
            self * volume
        }
    }

    /// The host's default output device through cpal.
    #[derive(Debug, Default)]
    pub struct CpalOutput;

    impl CpalOutput {
        pub fn new() -> Self {
            Self
        }
    }

    pub struct CpalSink {
        stream: Stream,
        volume: Arc<AtomicU32>,
    }

    fn build<T: VolumeSample>(
        device: &cpal::Device,
        config: &StreamConfig,
        mut callback: PullCallback,
        volume: Arc<AtomicU32>,
    ) -> Result<Stream, SinkError> {
        let channels = config.channels as usize;
        let err_fn = |err| error!("Audio stream error: {}", err);

        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels;
                    callback(bytemuck::cast_slice_mut(data), frames);

                    let vol = f32::from_bits(volume.load(Ordering::Relaxed));
                    if vol < 1.0 {
                        for sample in data.iter_mut() {
                            *sample = sample.scaled(vol);
                        }
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| SinkError::Build(e.to_string()))
    }

    impl AudioOutput for CpalOutput {
        fn open(&self, config: SinkConfig, callback: PullCallback) -> Result<Box<dyn AudioSink>, SinkError> {
            if config.channels == 0 || config.sample_rate == 0 {
                return Err(SinkError::UnsupportedConfig(format!(
                    "{} ch at {} Hz",
                    config.channels, config.sample_rate
                )));
            }

            let device = cpal::default_host()
                .default_output_device()
                .ok_or(SinkError::NoDevice)?;

            if let Ok(name) = device.name() {
                info!(
                    "Opening audio device '{}': {} ch, {} Hz, {}",
                    name,
                    config.channels,
                    config.sample_rate,
                    config.format.name()
                );
            }

            let stream_config = StreamConfig {
                channels: config.channels,
                sample_rate: cpal::SampleRate(config.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            let volume = Arc::new(AtomicU32::new(1.0f32.to_bits()));
            let stream = match config.format {
                SampleFormat::U8 => build::<u8>(&device, &stream_config, callback, volume.clone())?,
                SampleFormat::S16 => build::<i16>(&device, &stream_config, callback, volume.clone())?,
                SampleFormat::S32 => build::<i32>(&device, &stream_config, callback, volume.clone())?,
                SampleFormat::F32 => build::<f32>(&device, &stream_config, callback, volume.clone())?,
            };

            // cpal streams may start playing on creation
            stream.pause().map_err(|e| SinkError::Control(e.to_string()))?;

            Ok(Box::new(CpalSink { stream, volume }))
        }
    }

    impl AudioSink for CpalSink {
        fn start(&mut self) -> Result<(), SinkError> {
            self.stream.play().map_err(|e| SinkError::Control(e.to_string()))
        }

        fn stop(&mut self) -> Result<(), SinkError> {
            self.stream.pause().map_err(|e| SinkError::Control(e.to_string()))
        }

        fn set_master_volume(&mut self, volume: f32) -> Result<(), SinkError> {
            self.volume
                .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
            Ok(())
        }
    }

}
