//! # Seek Controller
//!
//! A backend seek lands on the keyframe at or before the target. This module
//! decodes forward from there, throwing away everything earlier than the
//! target, until each open stream has produced a frame at or after it.
//!
//! A still image (cover art) counts as landed straight away: it has one
//! frame at pts 0 and is re-queued whenever the container delivers it again.
//!
//! Runs on the caller's thread while the decode engine is stopped.

use serde::Serialize;
use tracing::{debug, warn};

use crate::backend::BackendError;
use crate::engine::{DecodeState, Routed};
use crate::error::Result;
use crate::frame::{AudioFrame, Packet};

/// How close a seek got to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SeekOutcome {
    /// Every open stream produced a frame at or after the target
    Exact,
    /// The stream ended (or failed) before every stream got there; the flags
    /// say which streams did land
    Approximate { video: bool, audio: bool },
}

impl SeekOutcome {
    pub fn is_exact(&self) -> bool {
        matches!(self, SeekOutcome::Exact)
    }
}

/// Where each stream landed, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeekLanding {
    pub outcome: SeekOutcome,
    /// PTS of the first queued video frame
    pub video_pts: Option<f64>,
    /// PTS of the first queued audio frame
    pub audio_time: Option<f64>,
}

/// Decode from the backend's landing point up to `target`.
///
/// Video frames before the target are decoded and overwritten in place;
/// from the target on they are queued. The first audio frame at or after
/// the target fixes the new audio clock; it and everything after is queued.
pub fn adjust_seeked_position(state: &mut DecodeState, target: f64) -> SeekLanding {
    let mut packet = Packet::new();
    let mut frame = AudioFrame::new();

    let mut video_pts = None;
    let mut audio_time = None;

    let result = seek_loop(state, target, &mut packet, &mut frame, &mut video_pts, &mut audio_time);
    if let Err(e) = result {
        warn!("Seek decode stopped early: {}", e);
    }

    let video_landed = video_settled(state, video_pts);
    let audio_landed = state.audio.is_none() || audio_time.is_some();
    let outcome = if video_landed && audio_landed {
        SeekOutcome::Exact
    } else {
        SeekOutcome::Approximate {
            video: video_landed,
            audio: audio_landed,
        }
    };

    debug!(
        "Seek to {:.3}s: {:?}, video at {:?}, audio at {:?}",
        target, outcome, video_pts, audio_time
    );

    SeekLanding {
        outcome,
        video_pts,
        audio_time,
    }
}

/// No video, a still image, or a frame queued at or after the target.
fn video_settled(state: &DecodeState, video_pts: Option<f64>) -> bool {
    state.video.as_ref().map_or(true, |v| v.still_image) || video_pts.is_some()
}

fn seek_loop(
    state: &mut DecodeState,
    target: f64,
    packet: &mut Packet,
    frame: &mut AudioFrame,
    video_pts: &mut Option<f64>,
    audio_time: &mut Option<f64>,
) -> Result<()> {
    loop {
        let video_done = video_settled(state, *video_pts);
        let audio_done = state.audio.is_none() || audio_time.is_some();
        if video_done && audio_done {
            if let Some(video) = state.video.as_ref().filter(|v| !v.still_image) {
                // The ring may hold later frames too; the clock starts at the oldest
                if let Some(front) = video.ring.front() {
                    *video_pts = Some(front.pts.map_or(target, |p| video.time_base.seconds(p)));
                }
            }
            return Ok(());
        }

        match state.container.read_packet(packet) {
            Ok(()) => {}
            Err(BackendError::EndOfStream) => {
                debug!("End of stream while seeking");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        match state.route(packet) {
            Routed::Video => {
                if let Some(pts) = state.decode_video(packet)? {
                    let still_image = state.video.as_ref().is_some_and(|v| v.still_image);
                    if still_image || pts >= target {
                        if let Some(video) = &state.video {
                            video.ring.push();
                        }
                    }
                    if !still_image && pts >= target {
                        video_pts.get_or_insert(pts);
                    }
                }
            }
            Routed::Audio => {
                state.decode_audio(packet, frame, |audio, frame, pts| {
                    if pts >= target {
                        audio_time.get_or_insert(pts);
                        audio.enqueue(frame)?;
                    }
                    Ok(())
                })?;
            }
            Routed::Nothing => {}
        }

        packet.unref();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_fifo::AudioFifo;
    use crate::backend::testsrc::{TestContainer, TestPattern};
    use crate::backend::{Container, MediaKind};
    use crate::convert::SampleConverter;
    use crate::engine::{AudioPipeline, VideoPipeline, Watermarks};
    use crate::format::SampleFormat;
    use crate::video_ring::VideoRing;
    use std::sync::Arc;

    fn state(pattern: TestPattern) -> DecodeState {
        let still_image = pattern.still;
        let container: Box<dyn Container> = Box::new(TestContainer::new(pattern));
        let video = container.find_best_stream(MediaKind::Video).ok().map(|stream| VideoPipeline {
            stream,
            time_base: container.streams()[stream].time_base,
            decoder: container.video_decoder(stream).unwrap(),
            ring: Arc::new(VideoRing::with_capacity(if still_image { 2 } else { 30 }).unwrap()),
            still_image,
        });
        let audio = container.find_best_stream(MediaKind::Audio).ok().map(|stream| AudioPipeline {
            stream,
            time_base: container.streams()[stream].time_base,
            decoder: container.audio_decoder(stream).unwrap(),
            converter: SampleConverter::new(
                crate::format::SourceSampleFormat::S16,
                SampleFormat::S16,
                1,
                1024,
            )
            .unwrap(),
            fifo: Arc::new(AudioFifo::new(SampleFormat::S16, 1, 48_000).unwrap()),
        });
        DecodeState {
            container,
            watermarks: Watermarks::new(
                video.as_ref().map(|v| v.ring.capacity()),
                still_image,
                audio.as_ref().map(|_| 48_000),
            ),
            video,
            audio,
        }
    }

    #[test]
    fn test_lands_at_or_after_target() {
        let mut state = state(TestPattern::default());
        state.container.seek(4.5).unwrap();
        state.flush();

        let landing = adjust_seeked_position(&mut state, 4.5);
        assert_eq!(landing.outcome, SeekOutcome::Exact);

        let video_pts = landing.video_pts.unwrap();
        assert!(video_pts >= 4.5 && video_pts < 4.5 + 1.0 / 30.0 + 1e-9);
        let audio_time = landing.audio_time.unwrap();
        assert!(audio_time >= 4.5 && audio_time < 4.5 + 1024.0 / 48_000.0);

        let ring = &state.video.as_ref().unwrap().ring;
        assert!(ring.size() >= 1);
        assert_eq!(ring.front().unwrap().pts, Some(135));
    }

    #[test]
    fn test_past_end_is_approximate() {
        let mut state = state(TestPattern {
            duration: 2.0,
            ..TestPattern::default()
        });
        state.container.seek(5.0).unwrap();
        state.flush();

        let landing = adjust_seeked_position(&mut state, 5.0);
        assert!(!landing.outcome.is_exact());
        assert_eq!(landing.video_pts, None);
    }

    #[test]
    fn test_audio_only_seek() {
        let mut state = state(TestPattern {
            video: false,
            ..TestPattern::default()
        });
        state.container.seek(2.0).unwrap();
        state.flush();

        let landing = adjust_seeked_position(&mut state, 2.0);
        assert!(landing.outcome.is_exact());
        assert!(landing.audio_time.unwrap() >= 2.0);
        assert!(state.audio.as_ref().unwrap().fifo.size() > 0);
    }

    #[test]
    fn test_still_image_lands_without_decoding_ahead() {
        let mut state = state(TestPattern {
            still: true,
            ..TestPattern::default()
        });
        state.container.seek(3.0).unwrap();
        state.flush();

        let landing = adjust_seeked_position(&mut state, 3.0);
        assert!(landing.outcome.is_exact());
        assert_eq!(landing.video_pts, None);

        let audio_time = landing.audio_time.unwrap();
        assert!(audio_time >= 3.0 && audio_time < 3.0 + 1024.0 / 48_000.0);
        // Only the landing packet's samples are queued, not the rest of the file
        assert!(state.audio.as_ref().unwrap().fifo.size() <= 1024);
        assert_eq!(state.video.as_ref().unwrap().ring.size(), 1);
    }
}
