//! # Symphonia Backend
//!
//! Pure Rust demuxing (WAV, FLAC, OGG, MP4/M4A, MKV audio, MP3, ...) and
//! audio decoding. Symphonia has no video codecs, so video tracks are
//! listed but never selected: a file with video and audio opens audio-only,
//! and a video-only file has no playable stream.
//!
//! Decoded audio is handed out interleaved, in the packed format closest to
//! what the track stores: integer PCM stays integer, lossy codecs are f32.

use std::io::{self, Read, Seek, SeekFrom};

use ::symphonia::core::audio::{AudioBufferRef, SampleBuffer, SignalSpec};
use ::symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions, CODEC_TYPE_NULL};
use ::symphonia::core::errors::Error as SymphoniaError;
use ::symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use ::symphonia::core::io::{MediaSource, MediaSourceStream, MediaSourceStreamOptions};
use ::symphonia::core::meta::MetadataOptions;
use ::symphonia::core::probe::Hint;
use ::symphonia::core::sample::SampleFormat as SymphoniaSampleFormat;
use ::symphonia::core::units::Time;
use bytes::Bytes;
use tracing::{debug, warn};

use super::{
    AudioDecoder, AudioParams, Backend, BackendError, Container, MediaKind, StreamInfo,
    StreamParams, VideoDecoder,
};
use crate::format::{SourceSampleFormat, TimeBase};
use crate::frame::{AudioFrame, Packet};
use crate::source::ByteSource;

impl From<SymphoniaError> for BackendError {
    fn from(err: SymphoniaError) -> Self {
        match err {
            SymphoniaError::IoError(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                BackendError::EndOfStream
            }
            SymphoniaError::IoError(e) => BackendError::Io(e),
            SymphoniaError::DecodeError(msg) => BackendError::Malformed(msg.to_string()),
            SymphoniaError::Unsupported(msg) => BackendError::Unsupported(msg.to_string()),
            other => BackendError::Other(other.to_string()),
        }
    }
}

// ============================================================================
// Byte Source Adapter
// ============================================================================

struct SourceAdapter {
    inner: Box<dyn ByteSource>,
}

impl Read for SourceAdapter {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Seek for SourceAdapter {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl MediaSource for SourceAdapter {
    fn is_seekable(&self) -> bool {
        self.inner.is_seekable()
    }

    fn byte_len(&self) -> Option<u64> {
        self.inner.byte_len()
    }
}

// ============================================================================
// Backend
// ============================================================================

#[derive(Debug, Default)]
pub struct SymphoniaBackend;

impl SymphoniaBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for SymphoniaBackend {
    fn name(&self) -> &str {
        "symphonia"
    }

    fn open(&self, source: Box<dyn ByteSource>) -> Result<Box<dyn Container>, BackendError> {
        let mut hint = Hint::new();
        if let Some(ext) = source.hint() {
            hint.with_extension(ext);
        }

        let mss = MediaSourceStream::new(
            Box::new(SourceAdapter { inner: source }),
            MediaSourceStreamOptions::default(),
        );

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };

        let probed = ::symphonia::default::get_probe().format(
            &hint,
            mss,
            &format_opts,
            &MetadataOptions::default(),
        )?;

        Ok(Box::new(SymphoniaContainer::new(probed.format)))
    }
}

// ============================================================================
// Container
// ============================================================================

pub struct SymphoniaContainer {
    reader: Box<dyn FormatReader>,
    streams: Vec<StreamInfo>,
    track_ids: Vec<u32>,
}

fn codec_name(params: &CodecParameters) -> String {
    ::symphonia::default::get_codecs()
        .get_codec(params.codec)
        .map(|d| d.short_name.to_string())
        .unwrap_or_else(|| format!("{:?}", params.codec))
}

/// Packed format a track decodes to. Lossy codecs carry no sample format
/// and decode to f32.
fn source_format(params: &CodecParameters) -> SourceSampleFormat {
    match params.sample_format {
        Some(SymphoniaSampleFormat::U8) => SourceSampleFormat::U8,
        Some(SymphoniaSampleFormat::S8 | SymphoniaSampleFormat::S16) => SourceSampleFormat::S16,
        Some(
            SymphoniaSampleFormat::U16
            | SymphoniaSampleFormat::U24
            | SymphoniaSampleFormat::S24
            | SymphoniaSampleFormat::U32
            | SymphoniaSampleFormat::S32,
        ) => SourceSampleFormat::S32,
        Some(SymphoniaSampleFormat::F64) => SourceSampleFormat::F64,
        Some(_) => SourceSampleFormat::F32,
        None => match params.bits_per_sample {
            Some(bits) if bits <= 8 => SourceSampleFormat::U8,
            Some(bits) if bits <= 16 => SourceSampleFormat::S16,
            Some(bits) if bits <= 32 => SourceSampleFormat::S32,
            _ => SourceSampleFormat::F32,
        },
    }
}

fn time_base(params: &CodecParameters) -> TimeBase {
    match (params.time_base, params.sample_rate) {
        (Some(tb), _) => TimeBase::new(tb.numer, tb.denom),
        (None, Some(rate)) => TimeBase::new(1, rate),
        _ => TimeBase::default(),
    }
}

impl SymphoniaContainer {
    fn new(reader: Box<dyn FormatReader>) -> Self {
        let mut streams = Vec::new();
        let mut track_ids = Vec::new();

        for (index, track) in reader.tracks().iter().enumerate() {
            let params = &track.codec_params;
            let decodable = params.codec != CODEC_TYPE_NULL
                && ::symphonia::default::get_codecs().get_codec(params.codec).is_some();

            let stream_params = match (params.sample_rate, params.channels) {
                (Some(sample_rate), Some(channels)) if decodable => StreamParams::Audio(AudioParams {
                    sample_rate,
                    channels: channels.count() as u16,
                    sample_format: source_format(params),
                    frame_size: params.max_frames_per_packet.map(|n| n as u32),
                }),
                _ => StreamParams::Other,
            };

            debug!(
                "Track {} ({}): codec {}, {:?} frames",
                index,
                track.id,
                codec_name(params),
                params.n_frames
            );

            streams.push(StreamInfo {
                index,
                codec: codec_name(params),
                time_base: time_base(params),
                duration: params.n_frames.map(|n| n as i64),
                params: stream_params,
            });
            track_ids.push(track.id);
        }

        Self {
            reader,
            streams,
            track_ids,
        }
    }

    fn params(&self, stream: usize) -> Option<&CodecParameters> {
        let id = *self.track_ids.get(stream)?;
        self.reader
            .tracks()
            .iter()
            .find(|t| t.id == id)
            .map(|t| &t.codec_params)
    }
}

impl Container for SymphoniaContainer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn duration(&self) -> Option<f64> {
        self.streams
            .iter()
            .filter_map(|s| s.duration.map(|d| s.time_base.seconds(d)))
            .fold(None, |acc: Option<f64>, d| Some(acc.map_or(d, |a| a.max(d))))
    }

    fn find_best_stream(&self, kind: MediaKind) -> Result<usize, BackendError> {
        match kind {
            MediaKind::Audio => self
                .streams
                .iter()
                .find(|s| s.kind() == Some(MediaKind::Audio))
                .map(|s| s.index)
                .ok_or(BackendError::StreamNotFound),
            MediaKind::Video => Err(BackendError::StreamNotFound),
        }
    }

    fn read_packet(&mut self, packet: &mut Packet) -> Result<(), BackendError> {
        let next = match self.reader.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::ResetRequired) => return Err(BackendError::EndOfStream),
            Err(e) => return Err(e.into()),
        };

        let index = self
            .track_ids
            .iter()
            .position(|&id| id == next.track_id())
            .ok_or_else(|| BackendError::Malformed(format!("packet for unknown track {}", next.track_id())))?;

        packet.stream_index = index;
        packet.pts = Some(next.ts() as i64);
        packet.dts = packet.pts;
        packet.duration = next.dur() as i64;
        packet.keyframe = true;
        packet.data = Bytes::from(next.data.into_vec());
        Ok(())
    }

    fn seek(&mut self, seconds: f64) -> Result<(), BackendError> {
        let seeked = self.reader.seek(
            SeekMode::Coarse,
            SeekTo::Time {
                time: Time::from(seconds.max(0.0)),
                track_id: None,
            },
        )?;
        debug!(
            "Seek to {:.3}s landed at ts {} (requested ts {})",
            seconds, seeked.actual_ts, seeked.required_ts
        );
        Ok(())
    }

    fn video_decoder(&self, stream: usize) -> Result<Box<dyn VideoDecoder>, BackendError> {
        let codec = self
            .streams
            .get(stream)
            .map(|s| s.codec.clone())
            .ok_or(BackendError::StreamNotFound)?;
        Err(BackendError::DecoderNotFound(codec))
    }

    fn audio_decoder(&self, stream: usize) -> Result<Box<dyn AudioDecoder>, BackendError> {
        let params = self.params(stream).ok_or(BackendError::StreamNotFound)?;
        let track_id = self.track_ids[stream];
        let decoder = ::symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(|_| BackendError::DecoderNotFound(codec_name(params)))?;

        Ok(Box::new(SymphoniaAudioDecoder {
            decoder,
            track_id,
            format: source_format(params),
            sample_buf: None,
            pending: None,
        }))
    }
}

// ============================================================================
// Audio Decoder
// ============================================================================

/// Interleaving buffer typed to the decoder's output format.
enum DecodeBuffer {
    U8(SampleBuffer<u8>),
    S16(SampleBuffer<i16>),
    S32(SampleBuffer<i32>),
    F32(SampleBuffer<f32>),
    F64(SampleBuffer<f64>),
}

impl DecodeBuffer {
    fn new(format: SourceSampleFormat, duration: u64, spec: SignalSpec) -> Self {
        match format.packed() {
            SourceSampleFormat::U8 => Self::U8(SampleBuffer::new(duration, spec)),
            SourceSampleFormat::S16 => Self::S16(SampleBuffer::new(duration, spec)),
            SourceSampleFormat::S32 => Self::S32(SampleBuffer::new(duration, spec)),
            SourceSampleFormat::F64 => Self::F64(SampleBuffer::new(duration, spec)),
            _ => Self::F32(SampleBuffer::new(duration, spec)),
        }
    }

    fn capacity(&self) -> usize {
        match self {
            Self::U8(b) => b.capacity(),
            Self::S16(b) => b.capacity(),
            Self::S32(b) => b.capacity(),
            Self::F32(b) => b.capacity(),
            Self::F64(b) => b.capacity(),
        }
    }

    fn copy_interleaved(&mut self, decoded: AudioBufferRef<'_>) {
        match self {
            Self::U8(b) => b.copy_interleaved_ref(decoded),
            Self::S16(b) => b.copy_interleaved_ref(decoded),
            Self::S32(b) => b.copy_interleaved_ref(decoded),
            Self::F32(b) => b.copy_interleaved_ref(decoded),
            Self::F64(b) => b.copy_interleaved_ref(decoded),
        }
    }

    /// The first `samples` interleaved samples as raw bytes.
    fn bytes(&self, samples: usize) -> &[u8] {
        match self {
            Self::U8(b) => &b.samples()[..samples],
            Self::S16(b) => bytemuck::cast_slice(&b.samples()[..samples]),
            Self::S32(b) => bytemuck::cast_slice(&b.samples()[..samples]),
            Self::F32(b) => bytemuck::cast_slice(&b.samples()[..samples]),
            Self::F64(b) => bytemuck::cast_slice(&b.samples()[..samples]),
        }
    }
}

struct PendingFrame {
    pts: Option<i64>,
    channels: u16,
    sample_rate: u32,
    frames: usize,
}

pub struct SymphoniaAudioDecoder {
    decoder: Box<dyn Decoder>,
    track_id: u32,
    format: SourceSampleFormat,
    sample_buf: Option<DecodeBuffer>,
    pending: Option<PendingFrame>,
}

impl AudioDecoder for SymphoniaAudioDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), BackendError> {
        if self.pending.is_some() {
            return Err(BackendError::Again);
        }

        let sym_packet = ::symphonia::core::formats::Packet::new_from_slice(
            self.track_id,
            packet.pts.unwrap_or(0).max(0) as u64,
            packet.duration.max(0) as u64,
            &packet.data,
        );

        let decoded = match self.decoder.decode(&sym_packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                // Damaged packet; symphonia leaves the decoder usable
                warn!("Dropping undecodable packet at {:?}: {}", packet.pts, e);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let spec = *decoded.spec();
        let frames = decoded.frames();
        if frames == 0 {
            return Ok(());
        }

        let needs_alloc = self
            .sample_buf
            .as_ref()
            .map_or(true, |b| b.capacity() < decoded.capacity() * spec.channels.count());
        if needs_alloc {
            self.sample_buf = Some(DecodeBuffer::new(self.format, decoded.capacity() as u64, spec));
        }
        if let Some(buf) = &mut self.sample_buf {
            buf.copy_interleaved(decoded);
        }

        self.pending = Some(PendingFrame {
            pts: packet.pts,
            channels: spec.channels.count() as u16,
            sample_rate: spec.rate,
            frames,
        });
        Ok(())
    }

    fn receive_frame(&mut self, frame: &mut AudioFrame) -> Result<(), BackendError> {
        let (Some(pending), Some(buf)) = (self.pending.take(), self.sample_buf.as_ref()) else {
            frame.unref();
            return Err(BackendError::Again);
        };

        frame.alloc(self.format, pending.channels, pending.sample_rate, pending.frames);
        frame
            .plane_mut(0)
            .copy_from_slice(buf.bytes(pending.frames * pending.channels as usize));
        frame.pts = pending.pts;
        Ok(())
    }

    fn flush(&mut self) {
        self.decoder.reset();
        self.pending = None;
    }

    fn name(&self) -> &str {
        "symphonia"
    }
}
