//! # Decode Engine
//!
//! The background worker: demux a packet, decode it, convert it, enqueue it,
//! repeat. Watermarks bound how far it runs ahead of the consumers.
//!
//! ```text
//!                    ┌──────────────┐   video   ┌───────────┐
//!  ┌───────────┐     │              ├──────────►│ VideoRing │──► render thread
//!  │ Container ├────►│ DecodeEngine │           └───────────┘
//!  └───────────┘     │   (thread)   │   audio   ┌───────────┐
//!                    │              ├──────────►│ AudioFifo │──► sink callback
//!                    └──────▲───────┘           └───────────┘
//!                           │ notify after every pop
//!                           └──────────── consumers
//! ```
//!
//! The thread owns the container and both codec pipelines while it runs and
//! hands them back when joined, so seeking and teardown never race it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, info_span, warn};

use crate::audio_fifo::AudioFifo;
use crate::backend::{AudioDecoder, BackendError, Container, VideoDecoder};
use crate::convert::SampleConverter;
use crate::error::{MediaError, Result};
use crate::format::TimeBase;
use crate::frame::{AudioFrame, Packet};
use crate::media::Settings;
use crate::video_ring::VideoRing;

// ============================================================================
// Shared State
// ============================================================================

/// Flags and the backpressure signal shared between the engine thread and
/// its consumers.
#[derive(Debug, Default)]
pub struct EngineShared {
    keep_running: AtomicBool,
    finished_reading: AtomicBool,
    signal: Mutex<()>,
    cond: Condvar,
}

impl EngineShared {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake the engine. Consumers call this after every pop or drain.
    pub fn notify(&self) {
        let _guard = self.signal.lock();
        self.cond.notify_all();
    }

    pub fn keep_running(&self) -> bool {
        self.keep_running.load(Ordering::SeqCst)
    }

    /// True once the engine has stopped reading for good (end of stream,
    /// fatal error, or stopped).
    pub fn finished_reading(&self) -> bool {
        self.finished_reading.load(Ordering::SeqCst)
    }

    /// Block until `demand()` holds or shutdown is requested.
    fn wait_for_demand(&self, mut demand: impl FnMut() -> bool) {
        let mut guard = self.signal.lock();
        while self.keep_running() && !demand() {
            self.cond.wait(&mut guard);
        }
    }
}

// ============================================================================
// Watermarks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    /// Most frames the ring may hold (capacity - 1)
    pub max_video: usize,
    /// Decoding resumes once the ring drops to this
    pub min_video: usize,
    /// Decoding resumes once the FIFO drops to this
    pub min_audio: usize,
}

impl Watermarks {
    pub fn new(video_capacity: Option<usize>, still_image: bool, audio_capacity: Option<usize>) -> Self {
        let (max_video, min_video) = match video_capacity {
            Some(_) if still_image => (1, 1),
            Some(capacity) => {
                let max = capacity.saturating_sub(1).max(1);
                (max, (max / 2).max(1))
            }
            None => (0, 0),
        };
        let min_audio = audio_capacity.map_or(0, |c| (c / 2).max(1));

        Self {
            max_video,
            min_video,
            min_audio,
        }
    }

    /// Apply low watermark overrides, clamped to `1..=max`.
    pub fn with_overrides(mut self, settings: &Settings, audio_capacity: Option<usize>) -> Self {
        if let Some(min) = settings.video_low_watermark {
            if self.max_video > 1 {
                self.min_video = min.clamp(1, self.max_video);
            }
        }
        if let (Some(min), Some(capacity)) = (settings.audio_low_watermark, audio_capacity) {
            self.min_audio = min.clamp(1, capacity);
        }
        self
    }
}

// ============================================================================
// Pipelines
// ============================================================================

pub struct VideoPipeline {
    pub stream: usize,
    pub time_base: TimeBase,
    pub decoder: Box<dyn VideoDecoder>,
    pub ring: Arc<VideoRing>,
    /// Single still image (cover art)
    pub still_image: bool,
}

impl VideoPipeline {
    pub fn has_demand(&self, watermarks: &Watermarks, audio_open: bool) -> bool {
        if self.still_image {
            // A still image only drives reading when nothing else does
            !audio_open && self.ring.is_empty()
        } else {
            self.ring.size() <= watermarks.min_video
        }
    }
}

pub struct AudioPipeline {
    pub stream: usize,
    pub time_base: TimeBase,
    pub decoder: Box<dyn AudioDecoder>,
    pub converter: SampleConverter,
    pub fifo: Arc<AudioFifo>,
}

impl AudioPipeline {
    pub fn has_demand(&self, watermarks: &Watermarks) -> bool {
        self.fifo.size() <= watermarks.min_audio
    }

    /// Convert one decoded frame into the FIFO, including anything the
    /// converter still holds afterwards.
    pub(crate) fn enqueue(&mut self, frame: &AudioFrame) -> Result<usize> {
        let frame_bytes = self.fifo.frame_bytes();
        let chunk = self.converter.convert(frame)?;
        let mut pushed = self.fifo.push(chunk, chunk.len() / frame_bytes);

        loop {
            let chunk = self.converter.flush();
            if chunk.is_empty() {
                break;
            }
            pushed += self.fifo.push(chunk, chunk.len() / frame_bytes);
        }
        Ok(pushed)
    }
}

/// Everything the engine thread owns while it runs.
pub struct DecodeState {
    pub container: Box<dyn Container>,
    pub video: Option<VideoPipeline>,
    pub audio: Option<AudioPipeline>,
    pub watermarks: Watermarks,
}

/// Which open pipeline a packet feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Routed {
    Video,
    Audio,
    /// Stream not opened (subtitles, a second audio track, ...)
    Nothing,
}

impl DecodeState {
    fn has_demand(&self) -> bool {
        let video = self
            .video
            .as_ref()
            .is_some_and(|v| v.has_demand(&self.watermarks, self.audio.is_some()));
        let audio = self.audio.as_ref().is_some_and(|a| a.has_demand(&self.watermarks));
        video || audio
    }

    /// Send a video packet and receive at most one frame into the ring's back slot.
    ///
    /// Evicts the oldest frame first when the ring is at its max. Returns the
    /// frame's pts in seconds, or `None` if the decoder produced no output.
    pub(crate) fn decode_video(&mut self, packet: &Packet) -> Result<Option<f64>> {
        let Some(video) = self.video.as_mut() else {
            return Ok(None);
        };

        if video.ring.size() >= self.watermarks.max_video {
            video.ring.pop();
        }

        match video.decoder.send_packet(packet) {
            Ok(()) => {}
            Err(e) if e.is_transient() => debug!("Video decoder not ready for packet: {}", e),
            Err(e) => return Err(decode_error("video send", e)),
        }

        let mut slot = video.ring.back();
        match video.decoder.receive_frame(&mut slot) {
            Ok(()) if !slot.is_empty() => {
                let pts = slot.pts.map_or(0.0, |p| video.time_base.seconds(p));
                Ok(Some(pts))
            }
            Ok(()) => Ok(None),
            Err(e) if e.is_transient() => Ok(None),
            Err(e) => Err(decode_error("video receive", e)),
        }
    }

    /// Send an audio packet and drain every frame it yields through `sink`.
    ///
    /// `sink` gets the pipeline and each decoded frame's pts in seconds.
    pub(crate) fn decode_audio<F>(&mut self, packet: &Packet, frame: &mut AudioFrame, mut sink: F) -> Result<()>
    where
        F: FnMut(&mut AudioPipeline, &AudioFrame, f64) -> Result<()>,
    {
        let Some(audio) = self.audio.as_mut() else {
            return Ok(());
        };

        match audio.decoder.send_packet(packet) {
            Ok(()) => {}
            Err(e) if e.is_transient() => debug!("Audio decoder not ready for packet: {}", e),
            Err(e) => return Err(decode_error("audio send", e)),
        }

        loop {
            match audio.decoder.receive_frame(frame) {
                Ok(()) => {}
                Err(e) if e.is_transient() => return Ok(()),
                Err(e) => return Err(decode_error("audio receive", e)),
            }
            if frame.is_empty() {
                continue;
            }
            let pts = frame.pts.map_or(0.0, |p| audio.time_base.seconds(p));
            sink(audio, frame, pts)?;
        }
    }

    /// Which open stream a packet belongs to.
    pub(crate) fn route(&self, packet: &Packet) -> Routed {
        if self.video.as_ref().is_some_and(|v| v.stream == packet.stream_index) {
            Routed::Video
        } else if self.audio.as_ref().is_some_and(|a| a.stream == packet.stream_index) {
            Routed::Audio
        } else {
            Routed::Nothing
        }
    }

    /// Empty both queues and reset decoder state (after a backend seek).
    ///
    /// A queued still image is kept: most containers deliver cover art once,
    /// so a seek would otherwise lose it.
    pub(crate) fn flush(&mut self) {
        if let Some(video) = self.video.as_mut() {
            if !video.still_image {
                video.ring.clear();
            }
            video.decoder.flush();
        }
        if let Some(audio) = self.audio.as_mut() {
            let held = audio.converter.delay();
            if held > 0 {
                debug!("Dropping {} converted samples on flush", held);
            }
            audio.fifo.clear();
            audio.decoder.flush();
            audio.converter.reset();
        }
    }

    /// Steady decode loop. Returns when shutdown is requested or the stream ends.
    fn decode_loop(&mut self, shared: &EngineShared, packet: &mut Packet, frame: &mut AudioFrame) -> Result<()> {
        loop {
            shared.wait_for_demand(|| self.has_demand());
            if !shared.keep_running() {
                debug!("Decode engine asked to stop");
                return Ok(());
            }

            match self.container.read_packet(packet) {
                Ok(()) => {}
                Err(BackendError::EndOfStream) => {
                    info!("Reached end of stream");
                    return Ok(());
                }
                Err(e) => return Err(decode_error("read", e)),
            }

            match self.route(packet) {
                Routed::Video => {
                    if self.decode_video(packet)?.is_some() {
                        if let Some(video) = &self.video {
                            video.ring.push();
                        }
                    }
                }
                Routed::Audio => {
                    self.decode_audio(packet, frame, |audio, frame, _| audio.enqueue(frame).map(|_| ()))?;
                }
                Routed::Nothing => {}
            }

            packet.unref();
        }
    }
}

fn decode_error(stage: &str, err: BackendError) -> MediaError {
    MediaError::Decode(format!("{} failed: {}", stage, err))
}

/// Thread body. Scratch objects live exactly as long as this call.
fn run(mut state: DecodeState, shared: &EngineShared) -> DecodeState {
    let mut packet = Packet::new();
    let mut frame = AudioFrame::new();

    debug!("Decode engine started");
    if let Err(e) = state.decode_loop(shared, &mut packet, &mut frame) {
        error!("Decode engine aborted: {}", e);
    }

    shared.finished_reading.store(true, Ordering::SeqCst);
    debug!("Decode engine finished");
    state
}

// ============================================================================
// Engine Handle
// ============================================================================

/// Starts, stops and owns the decode thread of one session.
pub struct DecodeEngine {
    shared: Arc<EngineShared>,
    session: u64,
    state: Option<DecodeState>,
    thread: Option<JoinHandle<DecodeState>>,
}

impl DecodeEngine {
    pub fn new(state: DecodeState, shared: Arc<EngineShared>, session: u64) -> Self {
        Self {
            shared,
            session,
            state: Some(state),
            thread: None,
        }
    }

    pub fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// The decode state, only while the thread is stopped.
    pub fn state_mut(&mut self) -> Option<&mut DecodeState> {
        if self.thread.is_some() {
            return None;
        }
        self.state.as_mut()
    }

    pub fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        let state = self
            .state
            .take()
            .ok_or(MediaError::NotReady("decode state was lost"))?;

        self.shared.keep_running.store(true, Ordering::SeqCst);
        self.shared.finished_reading.store(false, Ordering::SeqCst);

        let shared = self.shared.clone();
        let span = info_span!("decode", session = self.session);
        let spawned = std::thread::Builder::new()
            .name(format!("reel-decode-{}", self.session))
            .spawn(move || {
                let _enter = span.enter();
                run(state, &shared)
            });

        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.keep_running.store(false, Ordering::SeqCst);
                self.shared.finished_reading.store(true, Ordering::SeqCst);
                Err(MediaError::Allocation(format!("cannot spawn decode thread: {}", e)))
            }
        }
    }

    /// Request shutdown, wake the thread and join it.
    pub fn stop(&mut self) {
        self.shared.keep_running.store(false, Ordering::SeqCst);
        self.shared.finished_reading.store(true, Ordering::SeqCst);
        self.shared.notify();

        if let Some(handle) = self.thread.take() {
            match handle.join() {
                Ok(state) => self.state = Some(state),
                Err(_) => warn!("Decode thread panicked; session state dropped"),
            }
        }
    }
}

impl Drop for DecodeEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
