//! # Decoder Backend
//!
//! The demux/decode collaborator the playback core orchestrates. A backend
//! opens a container from a [`ByteSource`], describes its streams, yields
//! compressed packets and creates send/receive style decoders for them.
//!
//! Implementations:
//! - `symphonia_backend` - pure Rust demuxers and audio codecs (feature `symphonia`)
//! - `testsrc` - generated colour bars and a sine tone, fully deterministic

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::format::{PixelFormat, SourceSampleFormat, TimeBase};
use crate::frame::{AudioFrame, Packet, VideoFrame};
use crate::source::ByteSource;

#[cfg(feature = "symphonia")]
pub mod symphonia_backend;
pub mod testsrc;

#[derive(Debug, Error)]
pub enum BackendError {
    /// Decoder needs another packet before it can output
    #[error("Need more input")]
    Again,
    #[error("End of stream")]
    EndOfStream,
    #[error("Stream not found")]
    StreamNotFound,
    #[error("No decoder for codec {0}")]
    DecoderNotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("Malformed data: {0}")]
    Malformed(String),
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// The allow-list of expected, non-fatal codes inside a decode loop.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Again | BackendError::EndOfStream)
    }
}

// ============================================================================
// Stream Description
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MediaKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, Serialize)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Average frame rate in frames per second (0 when unknown)
    pub avg_frame_rate: f64,
    /// The stream is a single attached still image, e.g. cover art
    pub attached_picture: bool,
    /// Frames of reorder delay the decoder introduces
    pub video_delay: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SourceSampleFormat,
    /// Samples per packet when the codec has a fixed frame size
    pub frame_size: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub enum StreamParams {
    Video(VideoParams),
    Audio(AudioParams),
    Other,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub index: usize,
    pub codec: String,
    pub time_base: TimeBase,
    /// Duration in time-base ticks, when the container declares one
    pub duration: Option<i64>,
    pub params: StreamParams,
}

impl StreamInfo {
    pub fn kind(&self) -> Option<MediaKind> {
        match self.params {
            StreamParams::Video(_) => Some(MediaKind::Video),
            StreamParams::Audio(_) => Some(MediaKind::Audio),
            StreamParams::Other => None,
        }
    }

    pub fn video(&self) -> Option<&VideoParams> {
        match &self.params {
            StreamParams::Video(v) => Some(v),
            _ => None,
        }
    }

    pub fn audio(&self) -> Option<&AudioParams> {
        match &self.params {
            StreamParams::Audio(a) => Some(a),
            _ => None,
        }
    }
}

// ============================================================================
// Backend Traits
// ============================================================================

/// Opens containers. Shared across sessions, so it must hold no per-file state.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn open(&self, source: Box<dyn ByteSource>) -> Result<Box<dyn Container>, BackendError>;
}

/// An open container.
pub trait Container: Send {
    fn streams(&self) -> &[StreamInfo];

    /// Container duration in seconds, when known.
    fn duration(&self) -> Option<f64>;

    /// Pick the stream of the given kind to play.
    ///
    /// `StreamNotFound` when the container has none of that kind;
    /// `DecoderNotFound` when it has some but none can be decoded.
    fn find_best_stream(&self, kind: MediaKind) -> Result<usize, BackendError> {
        self.streams()
            .iter()
            .find(|s| s.kind() == Some(kind))
            .map(|s| s.index)
            .ok_or(BackendError::StreamNotFound)
    }

    /// Read the next packet of any stream. `EndOfStream` when exhausted.
    fn read_packet(&mut self, packet: &mut Packet) -> Result<(), BackendError>;

    /// Reposition to the nearest keyframe at or before `seconds`.
    fn seek(&mut self, seconds: f64) -> Result<(), BackendError>;

    fn video_decoder(&self, stream: usize) -> Result<Box<dyn VideoDecoder>, BackendError>;

    fn audio_decoder(&self, stream: usize) -> Result<Box<dyn AudioDecoder>, BackendError>;
}

/// Send/receive video decoder.
pub trait VideoDecoder: Send {
    /// Submit one compressed packet. `Again` means output must be drained first.
    fn send_packet(&mut self, packet: &Packet) -> Result<(), BackendError>;

    /// Decode the next picture into `frame`.
    ///
    /// `Again` when more input is needed; `frame` is left empty in that case.
    fn receive_frame(&mut self, frame: &mut VideoFrame) -> Result<(), BackendError>;

    /// Drop all internal state (after a seek).
    fn flush(&mut self);

    fn name(&self) -> &str;
}

/// Send/receive audio decoder. One packet may yield several frames.
pub trait AudioDecoder: Send {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), BackendError>;

    fn receive_frame(&mut self, frame: &mut AudioFrame) -> Result<(), BackendError>;

    fn flush(&mut self);

    fn name(&self) -> &str;
}

/// The backend `Media::new()` uses.
pub fn default_backend() -> Arc<dyn Backend> {
    #[cfg(feature = "symphonia")]
    {
        Arc::new(symphonia_backend::SymphoniaBackend::new())
    }
    #[cfg(not(feature = "symphonia"))]
    {
        Arc::new(testsrc::TestSourceBackend::new())
    }
}
