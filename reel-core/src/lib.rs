//! # Reel Core
//!
//! Decode-and-synchronize media playback engine.
//!
//! A background thread demuxes and decodes into bounded queues; the host
//! pulls time-correct RGBA pictures and interleaved audio samples through
//! [`Media`] without ever blocking.

// ============================================================================
// Foundations
// ============================================================================
pub mod error;
pub mod format;
pub mod frame;
pub mod source;

// ============================================================================
// Collaborators
// ============================================================================
pub mod backend;
pub mod sink;

// ============================================================================
// Queues / Conversion
// ============================================================================
pub mod video_ring;
pub mod audio_fifo;
pub mod convert;

// ============================================================================
// Playback
// ============================================================================
pub mod clock;
pub mod engine;
pub mod seek;
pub mod media;

pub use error::{MediaError, Result};
pub use format::{AudioFormat, PixelFormat, SampleFormat, SourceSampleFormat, TimeBase};
pub use frame::Picture;
pub use media::{AudioInfo, AudioPuller, Media, Settings, VideoInfo};
pub use seek::SeekOutcome;
pub use sink::{AudioOutput, AudioSink, SinkConfig, SinkError};
pub use source::{ByteSource, FileSource, MemorySource};

#[cfg(feature = "audio-output")]
pub use sink::CpalOutput;

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
