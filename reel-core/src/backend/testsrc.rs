//! # Test Pattern Backend
//!
//! A generated "container" described by a short text descriptor, e.g.
//!
//! ```text
//! duration=10; fps=30; width=64; height=48; sample_rate=48000; channels=1; sample_fmt=s16
//! ```
//!
//! Video is a set of moving colour bars, audio a sine tone. Packets are
//! interleaved in presentation order, keyframes every `gop` frames, so seeking
//! lands on a keyframe before the target exactly like a real file would.
//!
//! The knobs `delay`, `latency_ms`, `corrupt_at` and `frames_per_packet`
//! reproduce decoder priming, slow I/O, mid-stream corruption and
//! multi-frame audio packets.

use std::collections::VecDeque;
use std::f64::consts::TAU;
use std::io::Read;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use super::{
    AudioDecoder, AudioParams, Backend, BackendError, Container, StreamInfo, StreamParams,
    VideoDecoder, VideoParams,
};
use crate::format::{PixelFormat, SourceSampleFormat, TimeBase};
use crate::frame::{AudioFrame, Packet, VideoFrame};
use crate::source::ByteSource;

const CORRUPT_PAYLOAD: &[u8] = b"corrupt";

// ============================================================================
// Descriptor
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct TestPattern {
    pub duration: f64,
    pub video: bool,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub pixel_format: PixelFormat,
    /// Keyframe interval in frames
    pub gop: u32,
    /// Frames the video decoder holds back before its first output
    pub delay: u32,
    /// Single attached picture instead of a moving stream
    pub still: bool,
    pub audio: bool,
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SourceSampleFormat,
    /// Samples per audio packet
    pub frame_size: u32,
    /// Decoded frames produced per audio packet
    pub frames_per_packet: u32,
    pub tone_hz: f64,
    /// Sleep before the first packet is handed out
    pub latency_ms: u64,
    /// Video frame index whose payload is damaged
    pub corrupt_at: Option<u64>,
}

impl Default for TestPattern {
    fn default() -> Self {
        Self {
            duration: 10.0,
            video: true,
            width: 64,
            height: 48,
            fps: 30,
            pixel_format: PixelFormat::Yuv420p,
            gop: 30,
            delay: 0,
            still: false,
            audio: true,
            sample_rate: 48_000,
            channels: 1,
            sample_format: SourceSampleFormat::S16,
            frame_size: 1024,
            frames_per_packet: 1,
            tone_hz: 440.0,
            latency_ms: 0,
            corrupt_at: None,
        }
    }
}

impl TestPattern {
    pub fn to_descriptor(&self) -> String {
        let mut out = format!(
            "duration={}; video={}; width={}; height={}; fps={}; pixfmt={}; gop={}; delay={}; still={}; \
             audio={}; sample_rate={}; channels={}; sample_fmt={}; frame_size={}; frames_per_packet={}; \
             tone={}; latency_ms={}",
            self.duration,
            self.video,
            self.width,
            self.height,
            self.fps,
            pixel_format_name(self.pixel_format),
            self.gop,
            self.delay,
            self.still,
            self.audio,
            self.sample_rate,
            self.channels,
            sample_format_name(self.sample_format),
            self.frame_size,
            self.frames_per_packet,
            self.tone_hz,
            self.latency_ms,
        );
        if let Some(idx) = self.corrupt_at {
            out.push_str(&format!("; corrupt_at={}", idx));
        }
        out
    }

    fn video_frames(&self) -> u64 {
        if !self.video {
            0
        } else if self.still {
            1
        } else {
            (self.duration * self.fps as f64).ceil() as u64
        }
    }

    fn audio_samples(&self) -> u64 {
        if !self.audio {
            0
        } else {
            (self.duration * self.sample_rate as f64).round() as u64
        }
    }

    fn audio_packets(&self) -> u64 {
        self.audio_samples().div_ceil(self.frame_size as u64)
    }

    fn validate(&self) -> Result<(), BackendError> {
        if self.duration <= 0.0 || !self.duration.is_finite() {
            return Err(BackendError::Malformed("duration must be positive".into()));
        }
        if self.video && (self.width == 0 || self.height == 0 || self.fps == 0 || self.gop == 0) {
            return Err(BackendError::Malformed("video geometry must be non-zero".into()));
        }
        if self.audio
            && (self.sample_rate == 0
                || self.channels == 0
                || self.frame_size == 0
                || self.frames_per_packet == 0)
        {
            return Err(BackendError::Malformed("audio layout must be non-zero".into()));
        }
        if !self.video && !self.audio {
            return Err(BackendError::Malformed("pattern has no streams".into()));
        }
        Ok(())
    }
}

impl FromStr for TestPattern {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut pattern = TestPattern::default();
        let mut seen = 0;

        for item in s.split([';', '\n']).map(str::trim).filter(|i| !i.is_empty()) {
            let (key, value) = item
                .split_once('=')
                .ok_or_else(|| BackendError::Unsupported("not a test pattern descriptor".into()))?;
            let (key, value) = (key.trim(), value.trim());
            let bad = || BackendError::Malformed(format!("bad value for {}: {}", key, value));

            match key {
                "duration" => pattern.duration = value.parse().map_err(|_| bad())?,
                "video" => pattern.video = value.parse().map_err(|_| bad())?,
                "width" => pattern.width = value.parse().map_err(|_| bad())?,
                "height" => pattern.height = value.parse().map_err(|_| bad())?,
                "fps" => pattern.fps = value.parse().map_err(|_| bad())?,
                "pixfmt" => pattern.pixel_format = parse_pixel_format(value).ok_or_else(bad)?,
                "gop" => pattern.gop = value.parse().map_err(|_| bad())?,
                "delay" => pattern.delay = value.parse().map_err(|_| bad())?,
                "still" => pattern.still = value.parse().map_err(|_| bad())?,
                "audio" => pattern.audio = value.parse().map_err(|_| bad())?,
                "sample_rate" => pattern.sample_rate = value.parse().map_err(|_| bad())?,
                "channels" => pattern.channels = value.parse().map_err(|_| bad())?,
                "sample_fmt" => pattern.sample_format = parse_sample_format(value).ok_or_else(bad)?,
                "frame_size" => pattern.frame_size = value.parse().map_err(|_| bad())?,
                "frames_per_packet" => pattern.frames_per_packet = value.parse().map_err(|_| bad())?,
                "tone" => pattern.tone_hz = value.parse().map_err(|_| bad())?,
                "latency_ms" => pattern.latency_ms = value.parse().map_err(|_| bad())?,
                "corrupt_at" => pattern.corrupt_at = Some(value.parse().map_err(|_| bad())?),
                other => {
                    return Err(BackendError::Unsupported(format!("unknown test pattern key {}", other)))
                }
            }
            seen += 1;
        }

        if seen == 0 {
            return Err(BackendError::Unsupported("empty test pattern descriptor".into()));
        }
        pattern.validate()?;
        Ok(pattern)
    }
}

fn parse_pixel_format(s: &str) -> Option<PixelFormat> {
    match s {
        "yuv420p" => Some(PixelFormat::Yuv420p),
        "yuv422p" => Some(PixelFormat::Yuv422p),
        "yuv444p" => Some(PixelFormat::Yuv444p),
        "yuvj420p" => Some(PixelFormat::Yuvj420p),
        "nv12" => Some(PixelFormat::Nv12),
        "rgb24" => Some(PixelFormat::Rgb24),
        "rgba" => Some(PixelFormat::Rgba),
        _ => None,
    }
}

fn pixel_format_name(f: PixelFormat) -> &'static str {
    match f {
        PixelFormat::Yuv420p => "yuv420p",
        PixelFormat::Yuv422p => "yuv422p",
        PixelFormat::Yuv444p => "yuv444p",
        PixelFormat::Yuvj420p => "yuvj420p",
        PixelFormat::Yuvj422p => "yuvj422p",
        PixelFormat::Yuvj444p => "yuvj444p",
        PixelFormat::Nv12 => "nv12",
        PixelFormat::Rgb24 => "rgb24",
        PixelFormat::Rgba => "rgba",
    }
}

fn parse_sample_format(s: &str) -> Option<SourceSampleFormat> {
    match s {
        "u8" => Some(SourceSampleFormat::U8),
        "s16" => Some(SourceSampleFormat::S16),
        "s32" => Some(SourceSampleFormat::S32),
        "f32" | "flt" => Some(SourceSampleFormat::F32),
        "f64" | "dbl" => Some(SourceSampleFormat::F64),
        "u8p" => Some(SourceSampleFormat::U8Planar),
        "s16p" => Some(SourceSampleFormat::S16Planar),
        "s32p" => Some(SourceSampleFormat::S32Planar),
        "f32p" | "fltp" => Some(SourceSampleFormat::F32Planar),
        "f64p" | "dblp" => Some(SourceSampleFormat::F64Planar),
        _ => None,
    }
}

fn sample_format_name(f: SourceSampleFormat) -> &'static str {
    match f {
        SourceSampleFormat::U8 => "u8",
        SourceSampleFormat::S16 => "s16",
        SourceSampleFormat::S32 => "s32",
        SourceSampleFormat::F32 => "f32",
        SourceSampleFormat::F64 => "f64",
        SourceSampleFormat::U8Planar => "u8p",
        SourceSampleFormat::S16Planar => "s16p",
        SourceSampleFormat::S32Planar => "s32p",
        SourceSampleFormat::F32Planar => "f32p",
        SourceSampleFormat::F64Planar => "f64p",
    }
}

// ============================================================================
// Backend
// ============================================================================

#[derive(Debug, Default)]
pub struct TestSourceBackend;

impl TestSourceBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for TestSourceBackend {
    fn name(&self) -> &str {
        "testsrc"
    }

    fn open(&self, mut source: Box<dyn ByteSource>) -> Result<Box<dyn Container>, BackendError> {
        let mut text = String::new();
        source
            .read_to_string(&mut text)
            .map_err(|_| BackendError::Unsupported("test pattern descriptor is not text".into()))?;
        let pattern: TestPattern = text.parse()?;
        debug!("Opened test pattern: {}", pattern.to_descriptor());
        Ok(Box::new(TestContainer::new(pattern)))
    }
}

// ============================================================================
// Container
// ============================================================================

pub struct TestContainer {
    pattern: TestPattern,
    streams: Vec<StreamInfo>,
    video_stream: Option<usize>,
    audio_stream: Option<usize>,
    next_video: u64,
    next_audio: u64,
    first_read: bool,
}

impl TestContainer {
    pub fn new(pattern: TestPattern) -> Self {
        let mut streams = Vec::new();
        let mut video_stream = None;
        let mut audio_stream = None;

        if pattern.video {
            video_stream = Some(streams.len());
            streams.push(StreamInfo {
                index: streams.len(),
                codec: "testsrc-video".into(),
                time_base: TimeBase::new(1, pattern.fps),
                duration: Some(pattern.video_frames() as i64),
                params: StreamParams::Video(VideoParams {
                    width: pattern.width,
                    height: pattern.height,
                    pixel_format: pattern.pixel_format,
                    avg_frame_rate: if pattern.still { 0.0 } else { pattern.fps as f64 },
                    attached_picture: pattern.still,
                    video_delay: pattern.delay,
                }),
            });
        }

        if pattern.audio {
            audio_stream = Some(streams.len());
            streams.push(StreamInfo {
                index: streams.len(),
                codec: "testsrc-audio".into(),
                time_base: TimeBase::new(1, pattern.sample_rate),
                duration: Some(pattern.audio_samples() as i64),
                params: StreamParams::Audio(AudioParams {
                    sample_rate: pattern.sample_rate,
                    channels: pattern.channels,
                    sample_format: pattern.sample_format,
                    frame_size: Some(pattern.frame_size),
                }),
            });
        }

        Self {
            pattern,
            streams,
            video_stream,
            audio_stream,
            next_video: 0,
            next_audio: 0,
            first_read: true,
        }
    }

    fn video_time(&self, index: u64) -> f64 {
        if self.pattern.still {
            0.0
        } else {
            index as f64 / self.pattern.fps as f64
        }
    }

    fn audio_time(&self, index: u64) -> f64 {
        (index * self.pattern.frame_size as u64) as f64 / self.pattern.sample_rate as f64
    }

    fn fill_video_packet(&mut self, stream: usize, packet: &mut Packet) {
        let index = self.next_video;
        self.next_video += 1;

        let payload = if self.pattern.corrupt_at == Some(index) {
            Bytes::from_static(CORRUPT_PAYLOAD)
        } else {
            Bytes::copy_from_slice(&index.to_le_bytes())
        };

        packet.stream_index = stream;
        packet.pts = Some(index as i64);
        packet.dts = Some(index as i64);
        packet.duration = 1;
        packet.keyframe = index % self.pattern.gop as u64 == 0;
        packet.data = payload;
    }

    fn fill_audio_packet(&mut self, stream: usize, packet: &mut Packet) {
        let index = self.next_audio;
        self.next_audio += 1;

        let start = index * self.pattern.frame_size as u64;
        let samples = (self.pattern.audio_samples() - start).min(self.pattern.frame_size as u64);

        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&start.to_le_bytes());
        payload.extend_from_slice(&samples.to_le_bytes());

        packet.stream_index = stream;
        packet.pts = Some(start as i64);
        packet.dts = Some(start as i64);
        packet.duration = samples as i64;
        packet.keyframe = true;
        packet.data = Bytes::from(payload);
    }
}

impl Container for TestContainer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn duration(&self) -> Option<f64> {
        Some(self.pattern.duration)
    }

    fn read_packet(&mut self, packet: &mut Packet) -> Result<(), BackendError> {
        if self.first_read && self.pattern.latency_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.pattern.latency_ms));
        }
        self.first_read = false;

        let video_left = self.next_video < self.pattern.video_frames();
        let audio_left = self.next_audio < self.pattern.audio_packets();

        match (self.video_stream, self.audio_stream) {
            (Some(v), Some(a)) if video_left && audio_left => {
                if self.video_time(self.next_video) <= self.audio_time(self.next_audio) {
                    self.fill_video_packet(v, packet);
                } else {
                    self.fill_audio_packet(a, packet);
                }
            }
            (Some(v), _) if video_left => self.fill_video_packet(v, packet),
            (_, Some(a)) if audio_left => self.fill_audio_packet(a, packet),
            _ => return Err(BackendError::EndOfStream),
        }
        Ok(())
    }

    fn seek(&mut self, seconds: f64) -> Result<(), BackendError> {
        if !seconds.is_finite() {
            return Err(BackendError::Other(format!("invalid seek target {}", seconds)));
        }
        let seconds = seconds.max(0.0);

        // Land on the keyframe at or before the target; audio follows from there
        let landing = if self.video_stream.is_some() && !self.pattern.still {
            let target = (seconds * self.pattern.fps as f64).floor() as u64;
            let target = target.min(self.pattern.video_frames());
            let key = target - target % self.pattern.gop as u64;
            self.next_video = key;
            self.video_time(key)
        } else {
            if self.pattern.still {
                self.next_video = 0;
            }
            seconds
        };

        let audio_index = (landing * self.pattern.sample_rate as f64 / self.pattern.frame_size as f64).floor() as u64;
        self.next_audio = audio_index.min(self.pattern.audio_packets());

        debug!("Test pattern seek to {:.3}s landed at {:.3}s", seconds, landing);
        Ok(())
    }

    fn video_decoder(&self, stream: usize) -> Result<Box<dyn VideoDecoder>, BackendError> {
        if Some(stream) != self.video_stream {
            return Err(BackendError::StreamNotFound);
        }
        Ok(Box::new(TestVideoDecoder::new(&self.pattern)))
    }

    fn audio_decoder(&self, stream: usize) -> Result<Box<dyn AudioDecoder>, BackendError> {
        if Some(stream) != self.audio_stream {
            return Err(BackendError::StreamNotFound);
        }
        Ok(Box::new(TestAudioDecoder::new(&self.pattern)))
    }
}

// ============================================================================
// Video Decoder
// ============================================================================

/// BT.601 limited-range colour bars: white, yellow, cyan, green, magenta, red, blue, black.
const BARS_RGB: [[u8; 3]; 8] = [
    [235, 235, 235],
    [235, 235, 16],
    [16, 235, 235],
    [16, 235, 16],
    [235, 16, 235],
    [235, 16, 16],
    [16, 16, 235],
    [16, 16, 16],
];

fn rgb_to_yuv(rgb: [u8; 3]) -> [u8; 3] {
    let (r, g, b) = (rgb[0] as f32, rgb[1] as f32, rgb[2] as f32);
    let y = 0.257 * r + 0.504 * g + 0.098 * b + 16.0;
    let u = -0.148 * r - 0.291 * g + 0.439 * b + 128.0;
    let v = 0.439 * r - 0.368 * g - 0.071 * b + 128.0;
    [
        y.round().clamp(0.0, 255.0) as u8,
        u.round().clamp(0.0, 255.0) as u8,
        v.round().clamp(0.0, 255.0) as u8,
    ]
}

pub struct TestVideoDecoder {
    width: u32,
    height: u32,
    format: PixelFormat,
    delay: usize,
    pending: VecDeque<u64>,
}

impl TestVideoDecoder {
    fn new(pattern: &TestPattern) -> Self {
        Self {
            width: pattern.width,
            height: pattern.height,
            format: pattern.pixel_format,
            delay: pattern.delay as usize,
            pending: VecDeque::new(),
        }
    }

    /// The bar index a column shows for a given frame; bars scroll one column per frame.
    fn bar_at(&self, x: u32, frame: u64) -> usize {
        let shifted = (x as u64 + frame) % self.width as u64;
        (shifted * BARS_RGB.len() as u64 / self.width as u64) as usize
    }

    fn render(&self, index: u64, frame: &mut VideoFrame) {
        frame.alloc(self.width, self.height, self.format);
        let format = self.format.normalized();
        let (sx, sy) = format.chroma_shift();

        match format {
            PixelFormat::Rgba | PixelFormat::Rgb24 => {
                let bpp = if format == PixelFormat::Rgba { 4 } else { 3 };
                let stride = frame.linesize(0);
                for y in 0..self.height as usize {
                    for x in 0..self.width {
                        let rgb = BARS_RGB[self.bar_at(x, index)];
                        let at = y * stride + x as usize * bpp;
                        let plane = frame.plane_mut(0);
                        plane[at..at + 3].copy_from_slice(&rgb);
                        if bpp == 4 {
                            plane[at + 3] = 255;
                        }
                    }
                }
            }
            PixelFormat::Nv12 => {
                let (luma_stride, chroma_stride) = (frame.linesize(0), frame.linesize(1));
                for y in 0..self.height as usize {
                    for x in 0..self.width {
                        let yuv = rgb_to_yuv(BARS_RGB[self.bar_at(x, index)]);
                        frame.plane_mut(0)[y * luma_stride + x as usize] = yuv[0];
                        if y % 2 == 0 && x % 2 == 0 {
                            let at = (y / 2) * chroma_stride + x as usize;
                            frame.plane_mut(1)[at] = yuv[1];
                            frame.plane_mut(1)[at + 1] = yuv[2];
                        }
                    }
                }
            }
            _ => {
                let luma_stride = frame.linesize(0);
                let chroma_stride = frame.linesize(1);
                for y in 0..self.height as usize {
                    for x in 0..self.width {
                        let yuv = rgb_to_yuv(BARS_RGB[self.bar_at(x, index)]);
                        frame.plane_mut(0)[y * luma_stride + x as usize] = yuv[0];
                        let on_x = x % (1 << sx) == 0;
                        let on_y = y % (1 << sy) == 0;
                        if on_x && on_y {
                            let at = (y >> sy) * chroma_stride + (x >> sx) as usize;
                            frame.plane_mut(1)[at] = yuv[1];
                            frame.plane_mut(2)[at] = yuv[2];
                        }
                    }
                }
            }
        }

        frame.pts = Some(index as i64);
        frame.key_frame = false;
    }
}

impl VideoDecoder for TestVideoDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), BackendError> {
        let bytes: [u8; 8] = packet
            .data
            .as_ref()
            .try_into()
            .map_err(|_| BackendError::Malformed(format!("bad video payload at pts {:?}", packet.pts)))?;
        self.pending.push_back(u64::from_le_bytes(bytes));
        Ok(())
    }

    fn receive_frame(&mut self, frame: &mut VideoFrame) -> Result<(), BackendError> {
        if self.pending.len() <= self.delay {
            frame.unref();
            return Err(BackendError::Again);
        }
        match self.pending.pop_front() {
            Some(index) => {
                self.render(index, frame);
                Ok(())
            }
            None => {
                frame.unref();
                Err(BackendError::Again)
            }
        }
    }

    fn flush(&mut self) {
        self.pending.clear();
    }

    fn name(&self) -> &str {
        "testsrc-video"
    }
}

// ============================================================================
// Audio Decoder
// ============================================================================

pub struct TestAudioDecoder {
    format: SourceSampleFormat,
    channels: u16,
    sample_rate: u32,
    tone_hz: f64,
    frames_per_packet: u64,
    /// (first sample, sample count) chunks still to be output
    pending: VecDeque<(u64, u64)>,
}

impl TestAudioDecoder {
    fn new(pattern: &TestPattern) -> Self {
        Self {
            format: pattern.sample_format,
            channels: pattern.channels,
            sample_rate: pattern.sample_rate,
            tone_hz: pattern.tone_hz,
            frames_per_packet: pattern.frames_per_packet as u64,
            pending: VecDeque::new(),
        }
    }

    fn sample(&self, n: u64) -> f64 {
        (TAU * self.tone_hz * n as f64 / self.sample_rate as f64).sin() * 0.5
    }

    fn write_sample(format: SourceSampleFormat, out: &mut [u8], value: f64) {
        match format.packed() {
            SourceSampleFormat::U8 => out[0] = ((value * 127.0) + 128.0).round() as u8,
            SourceSampleFormat::S16 => {
                out.copy_from_slice(&((value * i16::MAX as f64) as i16).to_le_bytes())
            }
            SourceSampleFormat::S32 => {
                out.copy_from_slice(&((value * i32::MAX as f64) as i32).to_le_bytes())
            }
            SourceSampleFormat::F32 => out.copy_from_slice(&(value as f32).to_le_bytes()),
            _ => out.copy_from_slice(&value.to_le_bytes()),
        }
    }
}

impl AudioDecoder for TestAudioDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), BackendError> {
        if packet.data.len() != 16 {
            return Err(BackendError::Malformed("bad audio payload".into()));
        }
        let mut start = [0u8; 8];
        let mut count = [0u8; 8];
        start.copy_from_slice(&packet.data[..8]);
        count.copy_from_slice(&packet.data[8..]);
        let (start, count) = (u64::from_le_bytes(start), u64::from_le_bytes(count));

        let chunk = count.div_ceil(self.frames_per_packet).max(1);
        let mut offset = 0;
        while offset < count {
            let len = chunk.min(count - offset);
            self.pending.push_back((start + offset, len));
            offset += len;
        }
        Ok(())
    }

    fn receive_frame(&mut self, frame: &mut AudioFrame) -> Result<(), BackendError> {
        let Some((start, count)) = self.pending.pop_front() else {
            frame.unref();
            return Err(BackendError::Again);
        };

        let format = self.format;
        let channels = self.channels as usize;
        let bps = format.bytes_per_sample();
        frame.alloc(format, self.channels, self.sample_rate, count as usize);

        for i in 0..count as usize {
            let value = self.sample(start + i as u64);
            for ch in 0..channels {
                if format.is_planar() {
                    let at = i * bps;
                    Self::write_sample(format, &mut frame.plane_mut(ch)[at..at + bps], value);
                } else {
                    let at = (i * channels + ch) * bps;
                    Self::write_sample(format, &mut frame.plane_mut(0)[at..at + bps], value);
                }
            }
        }
        frame.pts = Some(start as i64);
        Ok(())
    }

    fn flush(&mut self) {
        self.pending.clear();
    }

    fn name(&self) -> &str {
        "testsrc-audio"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MediaKind;
    use crate::source::MemorySource;

    fn open(desc: &str) -> Box<dyn Container> {
        TestSourceBackend::new()
            .open(Box::new(MemorySource::new(desc.as_bytes().to_vec())))
            .unwrap()
    }

    #[test]
    fn test_descriptor_roundtrip_defaults() {
        let pattern = TestPattern::default();
        let parsed: TestPattern = pattern.to_descriptor().parse().unwrap();
        assert_eq!(parsed, pattern);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            "\u{0}\u{1}binary".parse::<TestPattern>(),
            Err(BackendError::Unsupported(_))
        ));
        assert!(matches!(
            "duration=-1".parse::<TestPattern>(),
            Err(BackendError::Malformed(_))
        ));
        assert!(matches!(
            "video=false; audio=false".parse::<TestPattern>(),
            Err(BackendError::Malformed(_))
        ));
    }

    #[test]
    fn test_packets_interleave_in_time_order() {
        let mut container = open("duration=1; fps=10; sample_rate=1000; frame_size=250");
        let mut packet = Packet::new();
        let mut last = -1.0f64;
        let mut video = 0;
        let mut audio = 0;

        while container.read_packet(&mut packet).is_ok() {
            let stream = &container.streams()[packet.stream_index];
            let t = stream.time_base.seconds(packet.pts.unwrap());
            assert!(t >= last);
            last = t;
            match stream.kind() {
                Some(MediaKind::Video) => video += 1,
                _ => audio += 1,
            }
        }
        assert_eq!(video, 10);
        assert_eq!(audio, 4);
    }

    #[test]
    fn test_seek_lands_on_keyframe() {
        let mut container = open("duration=10; fps=30; gop=30; audio=false");
        container.seek(4.5).unwrap();

        let mut packet = Packet::new();
        container.read_packet(&mut packet).unwrap();
        assert_eq!(packet.pts, Some(120));
        assert!(packet.keyframe);
    }

    #[test]
    fn test_video_decoder_delay_primes() {
        let mut c = open("duration=1; fps=10; delay=2; audio=false");
        let mut decoder = c.video_decoder(0).unwrap();
        let mut frame = VideoFrame::new();
        let mut packet = Packet::new();

        for expected_again in [true, true, false] {
            c.read_packet(&mut packet).unwrap();
            decoder.send_packet(&packet).unwrap();
            let result = decoder.receive_frame(&mut frame);
            assert_eq!(matches!(result, Err(BackendError::Again)), expected_again);
        }
        assert_eq!(frame.pts, Some(0));
    }

    #[test]
    fn test_audio_packet_splits_into_frames() {
        let mut c = open("duration=1; video=false; sample_rate=1000; frame_size=100; frames_per_packet=4");
        let mut decoder = c.audio_decoder(0).unwrap();
        let mut packet = Packet::new();
        c.read_packet(&mut packet).unwrap();
        decoder.send_packet(&packet).unwrap();

        let mut frame = AudioFrame::new();
        let mut total = 0;
        let mut frames = 0;
        while decoder.receive_frame(&mut frame).is_ok() {
            total += frame.nb_samples;
            frames += 1;
        }
        assert_eq!(frames, 4);
        assert_eq!(total, 100);
    }

    #[test]
    fn test_corrupt_payload_is_fatal() {
        let mut c = open("duration=1; fps=10; audio=false; corrupt_at=0");
        let mut decoder = c.video_decoder(0).unwrap();
        let mut packet = Packet::new();
        c.read_packet(&mut packet).unwrap();
        let err = decoder.send_packet(&packet).unwrap_err();
        assert!(!err.is_transient());
    }
}
