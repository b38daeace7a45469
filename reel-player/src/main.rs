//! # Reel Player
//!
//! Headless playback driver for reel-core. Opens a file (or a generated
//! test pattern), runs a fixed-rate render loop against the pull API and
//! logs what it presented.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reel_core::backend::testsrc::{TestPattern, TestSourceBackend};
use reel_core::{AudioFormat, Media, MemorySource, Settings};

// ============================================================================
// Options
// ============================================================================

enum InputKind {
    File(PathBuf),
    TestPattern(String),
}

struct PlayerOptions {
    input: InputKind,
    want_video: bool,
    want_audio: bool,
    seek: Option<f64>,
    frames: u64,
    fps: f64,
    settings: Settings,
    info_only: bool,
    device: bool,
}

fn parse_args(args: &[String]) -> Result<PlayerOptions> {
    let mut input: Option<InputKind> = None;
    let mut want_video = true;
    let mut want_audio = true;
    let mut seek = None;
    let mut frames: u64 = 300;
    let mut fps: f64 = 60.0;
    let mut settings = Settings::default();
    let mut info_only = false;
    let mut device = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--input" | "-i" => {
                let value = value_of(args, i, "--input")?;
                input = Some(InputKind::File(PathBuf::from(value)));
                i += 2;
            }
            "--test-pattern" => {
                let value = value_of(args, i, "--test-pattern")?;
                input = Some(InputKind::TestPattern(value.to_string()));
                i += 2;
            }
            "--no-video" => {
                want_video = false;
                i += 1;
            }
            "--no-audio" => {
                want_audio = false;
                i += 1;
            }
            "--seek" => {
                let value = value_of(args, i, "--seek")?;
                seek = Some(
                    value
                        .parse::<f64>()
                        .map_err(|e| anyhow!("Invalid seek time {}: {}", value, e))?,
                );
                i += 2;
            }
            "--frames" | "-n" => {
                let value = value_of(args, i, "--frames")?;
                frames = value
                    .parse::<u64>()
                    .map_err(|e| anyhow!("Invalid frame count {}: {}", value, e))?;
                i += 2;
            }
            "--fps" => {
                let value = value_of(args, i, "--fps")?;
                fps = value
                    .parse::<f64>()
                    .map_err(|e| anyhow!("Invalid render rate {}: {}", value, e))?;
                if !(fps > 0.0 && fps.is_finite()) {
                    return Err(anyhow!("Render rate must be positive, got {}", value));
                }
                i += 2;
            }
            "--format" => {
                let value = value_of(args, i, "--format")?;
                settings.audio_format = parse_audio_format(value)?;
                i += 2;
            }
            "--scale" => {
                let value = value_of(args, i, "--scale")?;
                settings.preloaded_frames_scale = value
                    .parse::<u8>()
                    .map_err(|e| anyhow!("Invalid preload scale {}: {}", value, e))?;
                i += 2;
            }
            "--info" => {
                info_only = true;
                i += 1;
            }
            "--device" => {
                device = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                tracing::warn!("Ignoring unknown argument {:?}", other);
                i += 1;
            }
        }
    }

    let input = input.ok_or_else(|| {
        print_usage();
        anyhow!("Missing --input or --test-pattern")
    })?;

    Ok(PlayerOptions {
        input,
        want_video,
        want_audio,
        seek,
        frames,
        fps,
        settings,
        info_only,
        device,
    })
}

fn value_of<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(|s| s.as_str())
        .ok_or_else(|| anyhow!("Missing value for {}", flag))
}

fn parse_audio_format(value: &str) -> Result<AudioFormat> {
    match value.to_ascii_lowercase().as_str() {
        "default" => Ok(AudioFormat::Default),
        "u8" => Ok(AudioFormat::U8),
        "s16" => Ok(AudioFormat::S16),
        "s32" => Ok(AudioFormat::S32),
        "f32" | "flt" => Ok(AudioFormat::F32),
        other => Err(anyhow!("Unknown audio format {:?}", other)),
    }
}

fn print_usage() {
    eprintln!(
        "\nUsage:\n  reel --input <file> [options]\n  reel --test-pattern <descriptor|default> [options]\n\n\
         Options:\n  --no-video | --no-audio   skip a stream\n  --seek <seconds>          seek before playing\n  \
         --frames <n>              render ticks to run (default 300)\n  --fps <rate>              render rate (default 60)\n  \
         --format <default|u8|s16|s32|f32>\n  --scale <n>               seconds of media to buffer (default 1)\n  \
         --info                    print stream info as JSON and exit\n  --device                  play audio on the default device\n"
    );
}

// ============================================================================
// Playback
// ============================================================================

#[derive(Debug, Default, Serialize)]
struct PlaybackStats {
    ticks: u64,
    frames_presented: u64,
    samples_pulled: u64,
    underruns: u64,
    final_time: f64,
    finished: bool,
    duration_ms: u64,
}

fn with_device(media: Media, device: bool) -> Result<Media> {
    if !device {
        return Ok(media);
    }

    #[cfg(feature = "audio-output")]
    {
        Ok(media.with_audio_output(Arc::new(reel_core::CpalOutput::new())))
    }
    #[cfg(not(feature = "audio-output"))]
    {
        drop(media);
        Err(anyhow!("--device needs the audio-output feature"))
    }
}

fn open(options: &PlayerOptions) -> Result<Media> {
    let mut media = match &options.input {
        InputKind::File(path) => {
            let mut media = with_device(Media::new(), options.device)?;
            media
                .open(path, options.want_video, options.want_audio, Some(options.settings.clone()))
                .with_context(|| format!("Failed to open {}", path.display()))?;
            media
        }
        InputKind::TestPattern(descriptor) => {
            let descriptor = if descriptor == "default" {
                TestPattern::default().to_descriptor()
            } else {
                descriptor.clone()
            };
            let mut media = with_device(Media::with_backend(Arc::new(TestSourceBackend::new())), options.device)?;
            media
                .open_source(
                    Box::new(MemorySource::new(descriptor.into_bytes())),
                    options.want_video,
                    options.want_audio,
                    Some(options.settings.clone()),
                )
                .context("Failed to open test pattern")?;
            media
        }
    };

    if let Some(target) = options.seek {
        let outcome = media.seek(target).context("Seek failed")?;
        tracing::info!("Seek to {:.3}s: {:?}", target, outcome);
    }
    Ok(media)
}

fn run(media: &mut Media, options: &PlayerOptions) -> PlaybackStats {
    let tick = Duration::from_secs_f64(1.0 / options.fps);
    let dt = tick.as_secs_f64();
    let started = Instant::now();
    let mut stats = PlaybackStats::default();

    // Host-driven audio: pull one tick's worth per frame
    let host_audio = media.is_audio_opened() && !media.audio_info().is_some_and(|a| a.device);
    let samples_per_tick = (media.audio_sample_rate() as f64 / options.fps).ceil() as usize;
    let frame_bytes = media.audio_channel_count() as usize * media.audio_sample_size();
    let mut audio_buffer = vec![0u8; samples_per_tick * frame_bytes];

    let mut last_serial = 0;
    while stats.ticks < options.frames {
        let tick_start = Instant::now();
        if media.finished_reading() {
            stats.finished = true;
            break;
        }

        if host_audio && samples_per_tick > 0 {
            let read = media.get_audio_frame(&mut audio_buffer, samples_per_tick as i64);
            if read >= 0 {
                stats.samples_pulled += read as u64;
                if (read as usize) < samples_per_tick {
                    stats.underruns += 1;
                }
            }
        }

        if let Some(picture) = media.get_video_frame(dt) {
            if picture.serial != last_serial {
                last_serial = picture.serial;
                stats.frames_presented += 1;
                tracing::debug!("Presented frame at {:.3}s", picture.pts);
            }
        }

        stats.ticks += 1;
        if let Some(rest) = tick.checked_sub(tick_start.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    stats.final_time = media.get_current_playback_time();
    stats.duration_ms = started.elapsed().as_millis() as u64;
    stats
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("reel=info")),
        )
        .init();

    tracing::info!("Reel Player v{}", env!("CARGO_PKG_VERSION"));

    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;
    let mut media = open(&options)?;

    if options.info_only {
        let info = serde_json::json!({
            "backend": media.backend_name(),
            "duration": media.duration(),
            "album_art": media.has_album_art(),
            "video": media.video_info(),
            "audio": media.audio_info(),
        });
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    let stats = run(&mut media, &options);
    tracing::info!(
        "Playback complete: presented={} ticks={} samples={} underruns={} time={:.3}s finished={}",
        stats.frames_presented,
        stats.ticks,
        stats.samples_pulled,
        stats.underruns,
        stats.final_time,
        stats.finished
    );
    println!("{}", serde_json::to_string(&stats)?);

    media.close();
    Ok(())
}
