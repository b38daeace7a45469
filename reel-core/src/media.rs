//! # Media
//!
//! The playback facade a host application drives from its render loop.
//!
//! One `Media` holds at most one open session. Opening a file builds the
//! video and/or audio pipeline, starts the decode engine and (optionally)
//! an audio device. The host then pulls:
//!
//! - `get_video_frame(dt)` once per rendered frame, which paces video
//!   against the audio clock (or the summed `dt` when there is no audio)
//! - `get_audio_frame(..)`, or an [`AudioPuller`] moved into its own audio
//!   callback, when no device was configured
//!
//! None of the pull calls block. "Nothing ready" is reported as `None`,
//! zero samples or `MediaError::NotReady`.
//!
//! `Media` is not `Send`: the audio device handle it owns is pinned to the
//! thread that opened it on some hosts. Audio pulled on another thread goes
//! through [`Media::audio_puller`].

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audio_fifo::AudioFifo;
use crate::backend::{default_backend, Backend, BackendError, Container, MediaKind};
use crate::clock::{AudioClock, WallClock};
use crate::convert::{PixelConverter, SampleConverter};
use crate::engine::{AudioPipeline, DecodeEngine, DecodeState, EngineShared, VideoPipeline, Watermarks};
use crate::error::{MediaError, Result};
use crate::format::{choose_output_format, AudioFormat, PixelFormat, SampleFormat, SourceSampleFormat, TimeBase};
use crate::frame::Picture;
use crate::seek::{adjust_seeked_position, SeekLanding, SeekOutcome};
use crate::sink::{AudioOutput, AudioSink, PullCallback, SinkConfig};
use crate::source::{ByteSource, FileSource};
use crate::video_ring::VideoRing;

/// Volume a fresh `Media` starts at.
const DEFAULT_VOLUME: f32 = 0.5;

/// Converter chunk when the codec has no fixed frame size.
const DEFAULT_AUDIO_CHUNK: usize = 1024;

// ============================================================================
// Settings
// ============================================================================

/// Per-open configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Seconds of media buffered ahead: video ring holds `scale * fps`
    /// frames, audio FIFO `scale * sample_rate` samples. Must be at least 1.
    pub preloaded_frames_scale: u8,
    pub audio_format: AudioFormat,
    /// Decoding resumes once the video ring drops to this many frames
    pub video_low_watermark: Option<usize>,
    /// Decoding resumes once the audio FIFO drops to this many samples
    pub audio_low_watermark: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            preloaded_frames_scale: 1,
            audio_format: AudioFormat::Default,
            video_low_watermark: None,
            audio_low_watermark: None,
        }
    }
}

// ============================================================================
// Stream Info
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct VideoInfo {
    pub stream: usize,
    pub codec: String,
    pub decoder: String,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub time_base: TimeBase,
    pub avg_frame_rate: f64,
    pub attached_picture: bool,
    pub video_delay: u32,
    pub ring_capacity: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioInfo {
    pub stream: usize,
    pub codec: String,
    pub decoder: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub source_format: SourceSampleFormat,
    pub output_format: SampleFormat,
    pub sample_size: usize,
    pub time_base: TimeBase,
    pub fifo_capacity: usize,
    /// Samples are pulled by a device sink rather than by the host
    pub device: bool,
}

// ============================================================================
// Audio Tap
// ============================================================================

/// The consumer end of the audio FIFO, shared between the host and the
/// device callback.
struct AudioTap {
    fifo: Arc<AudioFifo>,
    clock: AudioClock,
    engine: Arc<EngineShared>,
}

impl AudioTap {
    /// Pre-fill the requested region with `fill`, read what is queued over
    /// it, wake the engine and advance the clock.
    fn pull(&self, out: &mut [u8], samples: usize, fill: u8) -> usize {
        let len = samples.saturating_mul(self.fifo.frame_bytes()).min(out.len());
        let region = &mut out[..len];
        region.fill(fill);

        let read = self.fifo.pop(region, samples);
        self.engine.notify();
        self.clock.advance(read as u64);
        read
    }

    /// Host pull: -1 for a negative count or a buffer that cannot hold it.
    fn pull_checked(&self, out: &mut [u8], sample_count: i64) -> i64 {
        if sample_count < 0 {
            return -1;
        }
        let samples = sample_count as usize;
        match samples.checked_mul(self.fifo.frame_bytes()) {
            Some(needed) if needed <= out.len() => self.pull(out, samples, 0) as i64,
            _ => -1,
        }
    }
}

/// Pulls audio of one session from any thread.
///
/// Same contract as [`Media::get_audio_frame`]. Once its session is closed
/// the puller only returns silence.
#[derive(Clone)]
pub struct AudioPuller {
    tap: Arc<AudioTap>,
}

impl AudioPuller {
    pub fn pull(&self, out: &mut [u8], sample_count: i64) -> i64 {
        self.tap.pull_checked(out, sample_count)
    }

    /// Audio clock of the session, in seconds.
    pub fn time(&self) -> f64 {
        self.tap.clock.time()
    }

    /// Bytes per interleaved sample frame.
    pub fn frame_bytes(&self) -> usize {
        self.tap.fifo.frame_bytes()
    }
}

// ============================================================================
// Session
// ============================================================================

struct VideoSide {
    ring: Arc<VideoRing>,
    converter: PixelConverter,
    picture: Picture,
    time_base: TimeBase,
    still_image: bool,
    info: VideoInfo,
    /// PTS of the newest frame the presentation loop has looked at
    last_pts: f64,
    wall_clock: WallClock,
}

impl VideoSide {
    fn pts_seconds(&self, pts: Option<i64>, fallback: f64) -> f64 {
        pts.map_or(fallback, |p| self.time_base.seconds(p))
    }

    /// Convert and pop the front frame if there is one. Returns the
    /// current picture either way.
    fn present_next(&mut self, engine: &EngineShared) -> &Picture {
        let converted = self.ring.front().map(|front| {
            let result = self.converter.convert(&front, &mut self.picture);
            (result, front.pts)
        });

        if let Some((result, pts)) = converted {
            self.ring.pop();
            engine.notify();
            match result {
                Ok(()) => self.picture.pts = self.pts_seconds(pts, self.picture.pts),
                Err(e) => warn!("Dropping unconvertible video frame: {}", e),
            }
        }
        &self.picture
    }
}

struct AudioSide {
    tap: Arc<AudioTap>,
    info: AudioInfo,
    sink: Option<Box<dyn AudioSink>>,
}

impl AudioSide {
    fn start_sink(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.start() {
                warn!("Cannot start audio device: {}", e);
            }
        }
    }

    fn stop_sink(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.stop() {
                warn!("Cannot stop audio device: {}", e);
            }
        }
    }
}

struct Session {
    id: u64,
    engine: DecodeEngine,
    video: Option<VideoSide>,
    audio: Option<AudioSide>,
    duration: Option<f64>,
}

impl Session {
    fn apply_landing(&mut self, landing: &SeekLanding, target: f64) {
        if let Some(audio) = &self.audio {
            audio.tap.clock.set_time(landing.audio_time.unwrap_or(target));
        }
        if let Some(video) = self.video.as_mut() {
            let pts = landing.video_pts.unwrap_or(target);
            video.last_pts = pts;
            video.wall_clock.set_time(pts);
        }
    }

    fn close(mut self) {
        self.engine.stop();
        if let Some(audio) = self.audio.as_mut() {
            audio.stop_sink();
            audio.tap.fifo.clear();
        }
        info!("Closed session {}", self.id);
    }
}

/// Pipeline halves built during open, before the engine exists.
struct OpenedVideo {
    pipeline: VideoPipeline,
    side: VideoSide,
}

struct OpenedAudio {
    pipeline: AudioPipeline,
    tap: Arc<AudioTap>,
    info: AudioInfo,
}

fn check_settings(settings: Option<&Settings>) -> Result<()> {
    match settings {
        Some(s) if s.preloaded_frames_scale == 0 => Err(MediaError::InvalidArgument(
            "preloaded_frames_scale must be at least 1".into(),
        )),
        _ => Ok(()),
    }
}

fn init_video(container: &dyn Container, settings: &Settings) -> Result<Option<OpenedVideo>> {
    let stream = match container.find_best_stream(MediaKind::Video) {
        Ok(stream) => stream,
        Err(BackendError::StreamNotFound) => {
            debug!("No video stream");
            return Ok(None);
        }
        Err(e) => return Err(MediaError::open("cannot select video stream", e)),
    };

    let info = container
        .streams()
        .get(stream)
        .ok_or_else(|| MediaError::Open(format!("video stream {} does not exist", stream)))?;
    let params = info
        .video()
        .ok_or_else(|| MediaError::Open(format!("stream {} is not a video stream", stream)))?;

    let decoder = container
        .video_decoder(stream)
        .map_err(|e| MediaError::open("cannot create video decoder", e))?;
    let converter = PixelConverter::new(params.pixel_format.normalized(), params.width, params.height)?;

    // Never fewer than 2 slots, whatever the frame rate
    let still_image = params.attached_picture;
    let capacity = if still_image {
        2
    } else {
        ((settings.preloaded_frames_scale as f64 * params.avg_frame_rate) as usize).max(2)
    };
    let ring = Arc::new(VideoRing::with_capacity(capacity)?);

    let video_info = VideoInfo {
        stream,
        codec: info.codec.clone(),
        decoder: decoder.name().to_string(),
        width: params.width,
        height: params.height,
        pixel_format: params.pixel_format,
        time_base: info.time_base,
        avg_frame_rate: params.avg_frame_rate,
        attached_picture: still_image,
        video_delay: params.video_delay,
        ring_capacity: capacity,
    };

    info!(
        "Video stream {}: {} {}x{} {:?} ({:?}) @ {:.3} fps, {} frames buffered{}",
        stream,
        video_info.codec,
        video_info.width,
        video_info.height,
        video_info.pixel_format,
        converter.color_space(),
        video_info.avg_frame_rate,
        capacity,
        if still_image { " (still image)" } else { "" }
    );

    Ok(Some(OpenedVideo {
        pipeline: VideoPipeline {
            stream,
            time_base: info.time_base,
            decoder,
            ring: ring.clone(),
            still_image,
        },
        side: VideoSide {
            ring,
            converter,
            picture: Picture::new(params.width, params.height),
            time_base: info.time_base,
            still_image,
            info: video_info,
            last_pts: 0.0,
            wall_clock: WallClock::new(),
        },
    }))
}

fn init_audio(
    container: &dyn Container,
    settings: &Settings,
    engine: &Arc<EngineShared>,
) -> Result<Option<OpenedAudio>> {
    let stream = match container.find_best_stream(MediaKind::Audio) {
        Ok(stream) => stream,
        Err(BackendError::StreamNotFound) => {
            debug!("No audio stream");
            return Ok(None);
        }
        Err(e) => return Err(MediaError::open("cannot select audio stream", e)),
    };

    let info = container
        .streams()
        .get(stream)
        .ok_or_else(|| MediaError::Open(format!("audio stream {} does not exist", stream)))?;
    let params = info
        .audio()
        .ok_or_else(|| MediaError::Open(format!("stream {} is not an audio stream", stream)))?;

    let decoder = container
        .audio_decoder(stream)
        .map_err(|e| MediaError::open("cannot create audio decoder", e))?;

    let output_format = choose_output_format(settings.audio_format, params.sample_format);
    let chunk = params
        .frame_size
        .map_or(DEFAULT_AUDIO_CHUNK, |size| (size as usize).max(1));
    let converter = SampleConverter::new(params.sample_format, output_format, params.channels, chunk)?;

    let capacity = settings.preloaded_frames_scale as usize * params.sample_rate as usize;
    let fifo = Arc::new(AudioFifo::new(output_format, params.channels, capacity)?);

    let tap = Arc::new(AudioTap {
        fifo: fifo.clone(),
        clock: AudioClock::new(params.sample_rate),
        engine: engine.clone(),
    });

    let audio_info = AudioInfo {
        stream,
        codec: info.codec.clone(),
        decoder: decoder.name().to_string(),
        sample_rate: params.sample_rate,
        channels: params.channels,
        source_format: params.sample_format,
        output_format,
        sample_size: output_format.bytes_per_sample(),
        time_base: info.time_base,
        fifo_capacity: capacity,
        device: false,
    };

    info!(
        "Audio stream {}: {} {} Hz, {} ch, {:?} -> {}, {} samples buffered",
        stream,
        audio_info.codec,
        audio_info.sample_rate,
        audio_info.channels,
        audio_info.source_format,
        output_format.name(),
        capacity
    );

    Ok(Some(OpenedAudio {
        pipeline: AudioPipeline {
            stream,
            time_base: info.time_base,
            decoder,
            converter,
            fifo,
        },
        tap,
        info: audio_info,
    }))
}

// ============================================================================
// Media
// ============================================================================

pub struct Media {
    backend: Arc<dyn Backend>,
    output: Option<Arc<dyn AudioOutput>>,
    session: Option<Session>,
    paused: bool,
    volume: f32,
    sessions_opened: u64,
}

impl Default for Media {
    fn default() -> Self {
        Self::new()
    }
}

impl Media {
    /// Default backend, no audio device: the host pulls audio itself.
    pub fn new() -> Self {
        Self::with_backend(default_backend())
    }

    pub fn with_backend(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            output: None,
            session: None,
            paused: false,
            volume: DEFAULT_VOLUME,
            sessions_opened: 0,
        }
    }

    /// Play audio through `output` instead of leaving it to the host.
    pub fn with_audio_output(mut self, output: Arc<dyn AudioOutput>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub fn open<P: AsRef<Path>>(
        &mut self,
        path: P,
        want_video: bool,
        want_audio: bool,
        settings: Option<Settings>,
    ) -> Result<()> {
        check_settings(settings.as_ref())?;
        self.close();

        let path = path.as_ref();
        let source = FileSource::open(path).map_err(|e| MediaError::Open(format!("{}: {}", path.display(), e)))?;
        self.open_source(Box::new(source), want_video, want_audio, settings)
    }

    /// Open a container from any byte source, replacing the current session.
    ///
    /// A missing stream of a requested kind is not an error; a container
    /// with neither is.
    pub fn open_source(
        &mut self,
        source: Box<dyn ByteSource>,
        want_video: bool,
        want_audio: bool,
        settings: Option<Settings>,
    ) -> Result<()> {
        check_settings(settings.as_ref())?;
        let settings = settings.unwrap_or_default();

        self.close();

        let container = self
            .backend
            .open(source)
            .map_err(|e| MediaError::open("cannot open container", e))?;
        let shared = Arc::new(EngineShared::new());

        let video = if want_video {
            init_video(container.as_ref(), &settings)?
        } else {
            None
        };
        let audio = if want_audio {
            init_audio(container.as_ref(), &settings, &shared)?
        } else {
            None
        };

        if video.is_none() && audio.is_none() {
            return Err(MediaError::Open("no playable stream".into()));
        }

        let mut audio_side = match audio.as_ref() {
            Some(opened) => Some(self.open_audio_side(opened)?),
            None => None,
        };

        let still_image = video.as_ref().is_some_and(|v| v.side.still_image);
        let video_capacity = video.as_ref().map(|v| v.side.ring.capacity());
        let audio_capacity = audio.as_ref().map(|a| a.info.fifo_capacity);
        let watermarks =
            Watermarks::new(video_capacity, still_image, audio_capacity).with_overrides(&settings, audio_capacity);
        debug!("Watermarks: {:?}", watermarks);

        let duration = container.duration();
        let (video_pipeline, video_side) = match video {
            Some(opened) => (Some(opened.pipeline), Some(opened.side)),
            None => (None, None),
        };
        let audio_pipeline = audio.map(|opened| opened.pipeline);

        self.sessions_opened += 1;
        let id = self.sessions_opened;
        let state = DecodeState {
            container,
            video: video_pipeline,
            audio: audio_pipeline,
            watermarks,
        };
        let mut engine = DecodeEngine::new(state, shared, id);
        engine.start()?;

        if let Some(side) = audio_side.as_mut() {
            side.start_sink();
        }

        info!(
            "Opened session {} with {} backend (video: {}, audio: {}, duration: {:?})",
            id,
            self.backend.name(),
            video_side.is_some(),
            audio_side.is_some(),
            duration
        );

        self.session = Some(Session {
            id,
            engine,
            video: video_side,
            audio: audio_side,
            duration,
        });
        self.paused = false;
        Ok(())
    }

    fn open_audio_side(&self, opened: &OpenedAudio) -> Result<AudioSide> {
        let mut info = opened.info.clone();
        let sink = match &self.output {
            Some(output) => {
                let tap = opened.tap.clone();
                let silence = info.output_format.silence_byte();
                let callback: PullCallback = Box::new(move |buffer: &mut [u8], frames: usize| tap.pull(buffer, frames, silence));
                let config = SinkConfig {
                    format: info.output_format,
                    channels: info.channels,
                    sample_rate: info.sample_rate,
                };
                let mut sink = output.open(config, callback)?;
                sink.set_master_volume(self.volume)?;
                info.device = true;
                Some(sink)
            }
            None => None,
        };

        Ok(AudioSide {
            tap: opened.tap.clone(),
            info,
            sink,
        })
    }

    /// Stop the engine and release everything. No-op when nothing is open.
    pub fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
        }
    }

    pub fn pause(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if self.paused {
            return;
        }
        if let Some(audio) = session.audio.as_mut() {
            audio.stop_sink();
        }
        self.paused = true;
    }

    pub fn play(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !self.paused {
            return;
        }
        if let Some(audio) = session.audio.as_mut() {
            audio.start_sink();
        }
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    // ------------------------------------------------------------------------
    // Seeking
    // ------------------------------------------------------------------------

    /// Jump to `seconds`, landing on the first frame at or after it.
    ///
    /// Playback is resumed afterwards even when the landing is only
    /// approximate. `Err(MediaError::Seek)` when the backend could not
    /// reposition at all; decoding then carries on from where it was.
    pub fn seek(&mut self, seconds: f64) -> Result<SeekOutcome> {
        if self.session.is_none() {
            return Err(MediaError::NotReady("no stream is open"));
        }
        if !seconds.is_finite() {
            return Err(MediaError::InvalidArgument(format!("cannot seek to {}", seconds)));
        }

        self.pause();
        let result = self.seek_stopped(seconds.max(0.0));
        self.play();
        result
    }

    fn seek_stopped(&mut self, target: f64) -> Result<SeekOutcome> {
        let session = self.session.as_mut().ok_or(MediaError::NotReady("no stream is open"))?;
        session.engine.stop();

        let state = session
            .engine
            .state_mut()
            .ok_or(MediaError::NotReady("decode state was lost"))?;

        if let Err(e) = state.container.seek(target) {
            warn!("Backend seek to {:.3}s failed: {}", target, e);
            session.engine.start()?;
            return Err(MediaError::Seek(e.to_string()));
        }

        state.flush();
        let landing = adjust_seeked_position(state, target);
        session.apply_landing(&landing, target);
        session.engine.start()?;

        info!("Seeked to {:.3}s: {:?}", target, landing.outcome);
        Ok(landing.outcome)
    }

    /// Presentation time in seconds: the last looked-at video PTS when moving
    /// video is open, the audio clock otherwise.
    pub fn get_current_playback_time(&self) -> f64 {
        let Some(session) = &self.session else {
            return 0.0;
        };
        match (&session.video, &session.audio) {
            (Some(video), _) if !video.still_image => video.last_pts,
            (_, Some(audio)) => audio.tap.clock.time(),
            (Some(video), None) => video.last_pts,
            (None, None) => 0.0,
        }
    }

    // ------------------------------------------------------------------------
    // Video
    // ------------------------------------------------------------------------

    /// The picture due after `delta_time` more seconds of playback.
    ///
    /// Late frames are dropped until the queue front is at or after the
    /// clock. `None` only when no video stream is open.
    pub fn get_video_frame(&mut self, delta_time: f64) -> Option<&Picture> {
        let finished = self.finished_reading();
        let paused = self.paused;
        let session = self.session.as_mut()?;
        let audio_time = session.audio.as_ref().map(|a| a.tap.clock.time());
        let engine = session.engine.shared().clone();
        let video = session.video.as_mut()?;

        if finished || paused {
            return Some(&video.picture);
        }
        if video.still_image {
            return Some(video.present_next(&engine));
        }

        let reference = match audio_time {
            Some(time) => time,
            None => video.wall_clock.advance(delta_time),
        };
        if reference < video.last_pts {
            return Some(&video.picture);
        }

        let mut dropped = 0usize;
        loop {
            let pts = match video.ring.front() {
                Some(front) => front.pts,
                None => {
                    if dropped > 0 {
                        debug!("Dropped {} late video frames, queue empty", dropped);
                    }
                    return Some(&video.picture);
                }
            };
            let pts = video.pts_seconds(pts, reference);

            video.last_pts = pts;
            if reference <= pts {
                break;
            }
            video.ring.pop();
            engine.notify();
            dropped += 1;
        }

        if dropped > 0 {
            debug!("Dropped {} late video frames at {:.3}s", dropped, reference);
        }
        Some(video.present_next(&engine))
    }

    /// Present the next queued frame without any timing, or the current one
    /// if the queue is empty.
    pub fn get_video_frame_now(&mut self) -> Option<&Picture> {
        let finished = self.finished_reading();
        let session = self.session.as_mut()?;
        let video = session.video.as_mut()?;

        if finished {
            return Some(&video.picture);
        }
        Some(video.present_next(session.engine.shared()))
    }

    /// Discard the next queued frame without converting it.
    pub fn skip_video_frame(&self) -> Result<()> {
        let session = self.session.as_ref().ok_or(MediaError::NotReady("video is not open"))?;
        let video = session.video.as_ref().ok_or(MediaError::NotReady("video is not open"))?;

        if self.finished_reading() {
            return Err(MediaError::NotReady("reading has finished"));
        }
        if video.ring.is_empty() {
            return Err(MediaError::NotReady("video queue is empty"));
        }

        video.ring.pop();
        session.engine.shared().notify();
        Ok(())
    }

    pub fn is_video_opened(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.video.is_some())
    }

    /// The video stream is a single still image (cover art).
    pub fn has_album_art(&self) -> bool {
        self.session
            .as_ref()
            .and_then(|s| s.video.as_ref())
            .is_some_and(|v| v.still_image)
    }

    pub fn average_video_fps(&self) -> f64 {
        self.video_info().map_or(0.0, |info| info.avg_frame_rate)
    }

    pub fn video_info(&self) -> Option<&VideoInfo> {
        self.session.as_ref()?.video.as_ref().map(|v| &v.info)
    }

    pub fn video_queue_size(&self) -> usize {
        self.session
            .as_ref()
            .and_then(|s| s.video.as_ref())
            .map_or(0, |v| v.ring.size())
    }

    pub fn video_queue_capacity(&self) -> usize {
        self.session
            .as_ref()
            .and_then(|s| s.video.as_ref())
            .map_or(0, |v| v.ring.capacity())
    }

    // ------------------------------------------------------------------------
    // Audio
    // ------------------------------------------------------------------------

    /// Fill `out` with up to `sample_count` interleaved sample frames in the
    /// session's output format.
    ///
    /// The whole requested region is zeroed first, so a shortfall is silent.
    /// Returns the number of frames read (0 on underrun), or -1 when
    /// `sample_count` is negative, `out` is too small, or audio is not open.
    pub fn get_audio_frame(&self, out: &mut [u8], sample_count: i64) -> i64 {
        match self.session.as_ref().and_then(|s| s.audio.as_ref()) {
            Some(audio) => audio.tap.pull_checked(out, sample_count),
            None => -1,
        }
    }

    /// A handle for pulling this session's audio from another thread.
    /// `None` when audio is not open or a device sink already consumes it.
    pub fn audio_puller(&self) -> Option<AudioPuller> {
        let audio = self.session.as_ref()?.audio.as_ref()?;
        if audio.sink.is_some() {
            return None;
        }
        Some(AudioPuller {
            tap: audio.tap.clone(),
        })
    }

    pub fn is_audio_opened(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.audio.is_some())
    }

    pub fn audio_info(&self) -> Option<&AudioInfo> {
        self.session.as_ref()?.audio.as_ref().map(|a| &a.info)
    }

    /// Format samples are handed out in.
    pub fn audio_output_format(&self) -> Option<SampleFormat> {
        self.audio_info().map(|info| info.output_format)
    }

    /// Format the decoder produces.
    pub fn audio_original_format(&self) -> Option<SourceSampleFormat> {
        self.audio_info().map(|info| info.source_format)
    }

    /// Bytes per sample of the output format; 0 when audio is not open.
    pub fn audio_sample_size(&self) -> usize {
        self.audio_info().map_or(0, |info| info.sample_size)
    }

    pub fn audio_sample_rate(&self) -> u32 {
        self.audio_info().map_or(0, |info| info.sample_rate)
    }

    pub fn audio_channel_count(&self) -> u16 {
        self.audio_info().map_or(0, |info| info.channels)
    }

    /// Device volume, clamped to 0..1. No-op when audio is not open.
    ///
    /// Only affects output through a configured audio device; samples pulled
    /// with `get_audio_frame` are never scaled.
    pub fn set_audio_volume(&mut self, volume: f32) {
        let Some(audio) = self.session.as_mut().and_then(|s| s.audio.as_mut()) else {
            return;
        };

        let volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
        self.volume = volume;
        if let Some(sink) = audio.sink.as_mut() {
            if let Err(e) = sink.set_master_volume(volume) {
                warn!("Cannot set audio volume: {}", e);
            }
        }
    }

    /// Current volume; 0.0 when audio is not open.
    pub fn get_audio_volume(&self) -> f32 {
        if self.is_audio_opened() {
            self.volume
        } else {
            0.0
        }
    }

    pub fn audio_queue_size(&self) -> usize {
        self.session
            .as_ref()
            .and_then(|s| s.audio.as_ref())
            .map_or(0, |a| a.tap.fifo.size())
    }

    pub fn audio_queue_capacity(&self) -> usize {
        self.session
            .as_ref()
            .and_then(|s| s.audio.as_ref())
            .map_or(0, |a| a.tap.fifo.capacity())
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    /// True once the engine has stopped reading and every open queue has
    /// been drained: nothing more will ever be presented.
    pub fn finished_reading(&self) -> bool {
        let Some(session) = &self.session else {
            return false;
        };
        session.engine.shared().finished_reading()
            && session.video.as_ref().map_or(true, |v| v.ring.is_empty())
            && session.audio.as_ref().map_or(true, |a| a.tap.fifo.is_empty())
    }

    /// Container duration in seconds, when known.
    pub fn duration(&self) -> Option<f64> {
        self.session.as_ref()?.duration
    }
}

impl Drop for Media {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testsrc::{TestPattern, TestSourceBackend};
    use crate::sink::SinkError;
    use crate::source::MemorySource;
    use parking_lot::Mutex;
    use std::io::Write;
    use std::time::{Duration, Instant};

    fn media() -> Media {
        Media::with_backend(Arc::new(TestSourceBackend::new()))
    }

    fn open_pattern(media: &mut Media, pattern: &TestPattern, settings: Option<Settings>) -> Result<()> {
        let source = MemorySource::new(pattern.to_descriptor().into_bytes());
        media.open_source(Box::new(source), true, true, settings)
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_queue_sizes_follow_preload_scale() {
        let mut media = media();
        open_pattern(&mut media, &TestPattern::default(), None).unwrap();

        assert!(media.is_video_opened());
        assert!(media.is_audio_opened());
        assert!(!media.finished_reading());
        assert_eq!(media.video_queue_capacity(), 30);
        assert_eq!(media.audio_queue_capacity(), 48_000);
        assert_eq!(media.audio_output_format(), Some(SampleFormat::S16));
        assert_eq!(media.audio_original_format(), Some(SourceSampleFormat::S16));
        assert_eq!(media.audio_sample_size(), 2);
        assert_eq!(media.audio_sample_rate(), 48_000);
        assert_eq!(media.audio_channel_count(), 1);
        assert_eq!(media.average_video_fps(), 30.0);

        let settings = Settings {
            preloaded_frames_scale: 2,
            ..Settings::default()
        };
        open_pattern(&mut media, &TestPattern::default(), Some(settings)).unwrap();
        assert_eq!(media.video_queue_capacity(), 60);
        assert_eq!(media.audio_queue_capacity(), 96_000);
    }

    #[test]
    fn test_zero_scale_is_rejected() {
        let mut media = media();
        let settings = Settings {
            preloaded_frames_scale: 0,
            ..Settings::default()
        };
        let err = open_pattern(&mut media, &TestPattern::default(), Some(settings)).unwrap_err();
        assert!(matches!(err, MediaError::InvalidArgument(_)));
        assert!(!media.is_video_opened());
        assert!(!media.is_audio_opened());
    }

    #[test]
    fn test_audio_only_file_opens_without_video() {
        let mut media = media();
        let pattern = TestPattern {
            video: false,
            ..TestPattern::default()
        };
        open_pattern(&mut media, &pattern, None).unwrap();

        assert!(!media.is_video_opened());
        assert!(media.is_audio_opened());
        assert!(media.get_video_frame(0.1).is_none());
        assert!(media.get_video_frame_now().is_none());
    }

    #[test]
    fn test_garbage_source_fails_to_open() {
        let mut media = media();
        let source = MemorySource::new(b"not a pattern".to_vec());
        let err = media.open_source(Box::new(source), true, true, None).unwrap_err();
        assert!(matches!(err, MediaError::Open(_)));
        assert!(!media.finished_reading());
    }

    #[test]
    fn test_skip_before_first_decode_is_not_ready() {
        let mut media = media();
        let pattern = TestPattern {
            latency_ms: 200,
            ..TestPattern::default()
        };
        open_pattern(&mut media, &pattern, None).unwrap();

        let err = media.skip_video_frame().unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_skip_pops_one_frame() {
        let mut media = media();
        let pattern = TestPattern {
            audio: false,
            ..TestPattern::default()
        };
        open_pattern(&mut media, &pattern, None).unwrap();

        assert!(wait_until(Duration::from_secs(5), || media.video_queue_size() >= 15));
        media.skip_video_frame().unwrap();
        assert!(!media.get_video_frame_now().unwrap().is_empty());
    }

    #[test]
    fn test_volume_is_clamped() {
        let mut media = media();
        media.set_audio_volume(0.8);
        assert_eq!(media.get_audio_volume(), 0.0);

        open_pattern(&mut media, &TestPattern::default(), None).unwrap();
        assert_eq!(media.get_audio_volume(), 0.5);
        media.set_audio_volume(1.5);
        assert_eq!(media.get_audio_volume(), 1.0);
        media.set_audio_volume(-2.0);
        assert_eq!(media.get_audio_volume(), 0.0);
    }

    #[test]
    fn test_paused_returns_same_picture() {
        let mut media = media();
        open_pattern(&mut media, &TestPattern::default(), None).unwrap();
        assert!(wait_until(Duration::from_secs(5), || media.video_queue_size() > 0));

        let first = media.get_video_frame_now().unwrap().serial;
        assert_eq!(first, 1);

        media.pause();
        assert!(media.is_paused());
        for dt in [0.0, 0.016, 1.0, 10.0] {
            assert_eq!(media.get_video_frame(dt).unwrap().serial, first);
        }

        media.play();
        assert!(!media.is_paused());
    }

    #[test]
    fn test_empty_fifo_yields_silence() {
        let mut media = media();
        let pattern = TestPattern {
            video: false,
            latency_ms: 300,
            ..TestPattern::default()
        };
        open_pattern(&mut media, &pattern, None).unwrap();

        let mut buffer = vec![0xAAu8; 256 * 2];
        assert_eq!(media.get_audio_frame(&mut buffer, 256), 0);
        assert!(buffer.iter().all(|&b| b == 0));

        assert_eq!(media.get_audio_frame(&mut buffer, -1), -1);
        assert_eq!(media.get_audio_frame(&mut buffer, 1024), -1);
    }

    #[test]
    fn test_host_pull_advances_audio_clock() {
        let mut media = media();
        let pattern = TestPattern {
            video: false,
            ..TestPattern::default()
        };
        open_pattern(&mut media, &pattern, None).unwrap();
        assert!(wait_until(Duration::from_secs(5), || media.audio_queue_size() >= 4800));

        let mut buffer = vec![0u8; 4800 * 2];
        assert_eq!(media.get_audio_frame(&mut buffer, 4800), 4800);
        assert!((media.get_current_playback_time() - 0.1).abs() < 1e-9);
        assert!(buffer.iter().any(|&b| b != 0));
    }

    #[test]
    fn test_video_only_paced_by_wall_clock() {
        let mut media = media();
        let pattern = TestPattern {
            duration: 1.0,
            audio: false,
            ..TestPattern::default()
        };
        open_pattern(&mut media, &pattern, None).unwrap();

        let mut shown: Vec<f64> = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        while !media.finished_reading() && Instant::now() < deadline {
            if media.video_queue_size() == 0 {
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            let picture = media.get_video_frame(1.0 / 30.0).unwrap();
            if !picture.is_empty() && shown.last() != Some(&picture.pts) {
                shown.push(picture.pts);
            }
        }

        assert!(media.finished_reading());
        assert!(shown.windows(2).all(|w| w[0] < w[1]));
        assert!(*shown.last().unwrap() > 0.9);
        assert!(media.get_current_playback_time() > 0.9);
    }

    #[test]
    fn test_empty_queue_returns_same_picture() {
        let mut media = media();
        let pattern = TestPattern {
            duration: 0.1,
            audio: false,
            ..TestPattern::default()
        };
        open_pattern(&mut media, &pattern, None).unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            media.get_video_frame_now();
            media.finished_reading()
        }));

        let serial = media.get_video_frame_now().unwrap().serial;
        let pixels = media.get_video_frame_now().unwrap().pixels.clone();
        for _ in 0..3 {
            let picture = media.get_video_frame_now().unwrap();
            assert_eq!(picture.serial, serial);
            assert_eq!(picture.pixels, pixels);
        }
    }

    #[test]
    fn test_seek_lands_at_or_after_target() {
        let mut media = media();
        open_pattern(&mut media, &TestPattern::default(), None).unwrap();

        for target in [4.5, 1.25, 7.0] {
            let outcome = media.seek(target).unwrap();
            assert!(outcome.is_exact());
            assert!(media.get_current_playback_time() >= target - 1e-6);
            assert!(!media.is_paused());
        }
    }

    #[test]
    fn test_seek_past_end_is_approximate() {
        let mut media = media();
        let pattern = TestPattern {
            duration: 2.0,
            ..TestPattern::default()
        };
        open_pattern(&mut media, &pattern, None).unwrap();

        let outcome = media.seek(5.0).unwrap();
        assert!(!outcome.is_exact());
        assert!(media.get_current_playback_time() >= 5.0 - 1e-6);
    }

    #[test]
    fn test_seek_audio_only_rebases_clock() {
        let mut media = media();
        let pattern = TestPattern {
            video: false,
            ..TestPattern::default()
        };
        open_pattern(&mut media, &pattern, None).unwrap();

        assert!(media.seek(3.0).unwrap().is_exact());
        let time = media.get_current_playback_time();
        assert!(time >= 3.0 && time < 3.0 + 1024.0 / 48_000.0);
        assert!(media.audio_queue_size() > 0);
    }

    #[test]
    fn test_seek_without_session_is_not_ready() {
        let mut media = media();
        assert!(matches!(media.seek(1.0), Err(MediaError::NotReady(_))));
    }

    #[test]
    fn test_album_art_is_shown_once_decoded() {
        let mut media = media();
        let pattern = TestPattern {
            still: true,
            ..TestPattern::default()
        };
        open_pattern(&mut media, &pattern, None).unwrap();

        assert!(media.has_album_art());
        assert_eq!(media.video_queue_capacity(), 2);
        assert!(wait_until(Duration::from_secs(5), || media.video_queue_size() == 1));

        assert_eq!(media.get_video_frame(0.0).unwrap().serial, 1);
        assert_eq!(media.get_video_frame(5.0).unwrap().serial, 1);
    }

    #[test]
    fn test_close_resets_state() {
        let mut media = media();
        open_pattern(&mut media, &TestPattern::default(), None).unwrap();
        media.close();

        assert!(!media.is_video_opened());
        assert!(!media.is_audio_opened());
        assert!(!media.finished_reading());
        assert!(media.get_video_frame(0.1).is_none());
        assert_eq!(media.get_current_playback_time(), 0.0);
        assert_eq!(media.duration(), None);

        // Second close is harmless
        media.close();
    }

    #[test]
    fn test_open_by_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", TestPattern::default().to_descriptor()).unwrap();

        let mut media = media();
        media.open(file.path(), true, false, None).unwrap();
        assert!(media.is_video_opened());
        assert!(!media.is_audio_opened());
        assert_eq!(media.duration(), Some(10.0));

        let err = media.open("/definitely/not/here.mkv", true, true, None).unwrap_err();
        assert!(matches!(err, MediaError::Open(_)));
        assert!(!media.is_video_opened());
    }

    #[test]
    fn test_stream_info_serializes() {
        let mut media = media();
        open_pattern(&mut media, &TestPattern::default(), None).unwrap();

        let video = serde_json::to_value(media.video_info().unwrap()).unwrap();
        assert_eq!(video["width"], 64);
        assert_eq!(video["ring_capacity"], 30);

        let audio = serde_json::to_value(media.audio_info().unwrap()).unwrap();
        assert_eq!(audio["sample_rate"], 48_000);
        assert_eq!(audio["device"], false);
    }

    #[test]
    fn test_settings_deserialize_with_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"preloaded_frames_scale": 3}"#).unwrap();
        assert_eq!(settings.preloaded_frames_scale, 3);
        assert_eq!(settings.audio_format, AudioFormat::Default);
        assert_eq!(settings.video_low_watermark, None);
    }

    #[test]
    fn test_late_frames_dropped_behind_audio_clock() {
        let mut media = media();
        open_pattern(&mut media, &TestPattern::default(), None).unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            media.video_queue_size() >= 12 && media.audio_queue_size() >= 14_400
        }));

        let mut buffer = vec![0u8; 14_400 * 2];
        assert_eq!(media.get_audio_frame(&mut buffer, 14_400), 14_400);
        let clock = media.audio_puller().unwrap().time();
        assert!((clock - 0.3).abs() < 1e-9);

        let picture = media.get_video_frame(0.0).unwrap();
        assert!(picture.pts >= clock - 1e-9);
        assert!(picture.pts < clock + 1.0 / 30.0);
        // Frames 0..9 were dropped unconverted; only the one shown was converted
        assert_eq!(picture.serial, 1);
        assert!((picture.pts * 30.0).round() as u64 > 1);
        assert!(media.get_current_playback_time() >= clock - 1e-9);
    }

    #[test]
    fn test_seek_with_album_art_keeps_audio() {
        let mut media = media();
        let pattern = TestPattern {
            still: true,
            duration: 10.0,
            ..TestPattern::default()
        };
        open_pattern(&mut media, &pattern, None).unwrap();

        assert!(media.seek(3.0).unwrap().is_exact());
        let time = media.get_current_playback_time();
        assert!(time >= 3.0 && time < 3.0 + 1024.0 / 48_000.0);

        let mut buffer = vec![0u8; 4800 * 2];
        let mut played = 0u64;
        let mut art_shown = false;
        let deadline = Instant::now() + Duration::from_secs(20);
        while !media.finished_reading() && Instant::now() < deadline {
            if let Some(picture) = media.get_video_frame(0.0) {
                art_shown |= !picture.is_empty();
            }
            let read = media.get_audio_frame(&mut buffer, 4800);
            if read == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
            played += read.max(0) as u64;
        }

        assert!(media.finished_reading());
        assert!(art_shown);
        // Everything from the landing packet to the end of the file
        assert_eq!(played, 480_000 - 141 * 1024);
    }

    #[test]
    fn test_audio_puller_works_from_another_thread() {
        fn assert_send_sync<T: Send + Sync + 'static>() {}
        assert_send_sync::<AudioPuller>();

        let mut media = media();
        let pattern = TestPattern {
            video: false,
            ..TestPattern::default()
        };
        open_pattern(&mut media, &pattern, None).unwrap();
        let puller = media.audio_puller().unwrap();
        assert_eq!(puller.frame_bytes(), 2);

        let worker = std::thread::spawn(move || {
            let mut buffer = vec![0u8; 480 * 2];
            let mut pulled = 0;
            let deadline = Instant::now() + Duration::from_secs(5);
            while pulled < 4800 && Instant::now() < deadline {
                let read = puller.pull(&mut buffer, (4800 - pulled).min(480));
                assert!(read >= 0);
                if read == 0 {
                    std::thread::sleep(Duration::from_millis(1));
                }
                pulled += read;
            }
            assert_eq!(puller.pull(&mut buffer, 481), -1);
            (pulled, puller)
        });
        let (pulled, puller) = worker.join().unwrap();

        assert_eq!(pulled, 4800);
        assert!((media.get_current_playback_time() - 0.1).abs() < 1e-9);

        media.close();
        let mut buffer = vec![0xAAu8; 64];
        assert_eq!(puller.pull(&mut buffer, 32), 0);
        assert!(buffer.iter().all(|&b| b == 0));
    }

    // ------------------------------------------------------------------------
    // Device sink
    // ------------------------------------------------------------------------

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        callback: Mutex<Option<PullCallback>>,
    }

    struct RecordingOutput(Arc<Recorder>);

    struct RecordingSink(Arc<Recorder>);

    impl AudioOutput for RecordingOutput {
        fn open(&self, config: SinkConfig, callback: PullCallback) -> std::result::Result<Box<dyn AudioSink>, SinkError> {
            self.0.events.lock().push(format!("open {}", config.sample_rate));
            *self.0.callback.lock() = Some(callback);
            Ok(Box::new(RecordingSink(self.0.clone())))
        }
    }

    impl AudioSink for RecordingSink {
        fn start(&mut self) -> std::result::Result<(), SinkError> {
            self.0.events.lock().push("start".into());
            Ok(())
        }

        fn stop(&mut self) -> std::result::Result<(), SinkError> {
            self.0.events.lock().push("stop".into());
            Ok(())
        }

        fn set_master_volume(&mut self, volume: f32) -> std::result::Result<(), SinkError> {
            self.0.events.lock().push(format!("volume {}", volume));
            Ok(())
        }
    }

    #[test]
    fn test_pause_and_play_drive_the_device() {
        let recorder = Arc::new(Recorder::default());
        let mut media = media().with_audio_output(Arc::new(RecordingOutput(recorder.clone())));
        let pattern = TestPattern {
            video: false,
            ..TestPattern::default()
        };
        open_pattern(&mut media, &pattern, None).unwrap();
        assert!(media.audio_info().unwrap().device);

        media.pause();
        media.pause();
        media.play();
        media.play();
        media.set_audio_volume(0.25);

        assert_eq!(
            *recorder.events.lock(),
            vec!["open 48000", "volume 0.5", "start", "stop", "start", "volume 0.25"]
        );
    }

    #[test]
    fn test_device_callback_pulls_samples() {
        let recorder = Arc::new(Recorder::default());
        let mut media = media().with_audio_output(Arc::new(RecordingOutput(recorder.clone())));
        let pattern = TestPattern {
            video: false,
            ..TestPattern::default()
        };
        open_pattern(&mut media, &pattern, None).unwrap();
        assert!(wait_until(Duration::from_secs(5), || media.audio_queue_size() >= 480));

        let mut buffer = vec![0u8; 480 * 2];
        let filled = {
            let mut callback = recorder.callback.lock();
            let callback = callback.as_mut().unwrap();
            callback(&mut buffer, 480)
        };
        assert_eq!(filled, 480);
        assert!((media.get_current_playback_time() - 0.01).abs() < 1e-9);
    }
}
