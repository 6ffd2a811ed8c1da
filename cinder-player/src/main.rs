//! # Cinder Player
//!
//! Headless host for the Cinder pipeline. Opens a file (or the generated
//! test pattern), drives the session one tick at a time and prints the
//! pipeline statistics as JSON when playback ends.
//!
//! ```text
//! cinder --input movie.mkv --realtime --audio
//! cinder --test-pattern --ticks 600 --seek-at 120:30 --dump-frame 300:frame.png
//! cinder --test-pattern --press 60:l --press 90:right
//! ```

use anyhow::{bail, Context, Result};
use cinder_core::overlay::{EventTrack, OverlayImage, SubtitleRenderer};
use cinder_core::source::{SyntheticConfig, SyntheticSource};
use cinder_core::sync::TickPacer;
use cinder_core::{
    InputMapper, InputState, PlaybackCommand, PlaybackConfig, PlaybackSession, PlaybackSink,
    TickOutcome, VideoOutput,
};
use std::path::{Path, PathBuf};

// ============================================================================
// Command Line
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Scripted {
    Command(PlaybackCommand),
    Press(InputState),
}

#[derive(Debug, Default)]
struct Options {
    input: Option<PathBuf>,
    test_pattern: bool,
    ticks: Option<u64>,
    realtime: bool,
    audio: bool,
    config: Option<PathBuf>,
    script: Vec<(u64, Scripted)>,
    dumps: Vec<(u64, PathBuf)>,
}

fn usage() -> &'static str {
    "usage: cinder (--input FILE | FILE | --test-pattern) [--ticks N] [--realtime] [--audio]\n\
     \x20             [--config FILE] [--seek-at TICK:SECONDS] [--reset-at TICK]\n\
     \x20             [--switch-audio-at TICK] [--switch-subtitle-at TICK]\n\
     \x20             [--press TICK:left|right|up|down|l|r] [--dump-frame TICK:FILE.png]"
}

fn split_at_tick(value: &str) -> Result<(u64, &str)> {
    let (tick, rest) = value
        .split_once(':')
        .with_context(|| format!("expected TICK:VALUE, got {:?}", value))?;
    let tick = tick.parse().with_context(|| format!("bad tick {:?}", tick))?;
    Ok((tick, rest))
}

fn parse_button(name: &str) -> Result<InputState> {
    let mut state = InputState::default();
    match name {
        "left" => state.left = true,
        "right" => state.right = true,
        "up" => state.up = true,
        "down" => state.down = true,
        "l" => state.l = true,
        "r" => state.r = true,
        other => bail!("unknown button {:?}", other),
    }
    Ok(state)
}

impl Options {
    fn from_args(args: &[String]) -> Result<Self> {
        let mut options = Self::default();
        let mut iter = args.iter().skip(1);

        while let Some(arg) = iter.next() {
            let mut value = || {
                iter.next()
                    .cloned()
                    .with_context(|| format!("{} needs a value", arg))
            };
            match arg.as_str() {
                "--input" | "-i" => options.input = Some(PathBuf::from(value()?)),
                "--test-pattern" => options.test_pattern = true,
                "--ticks" => options.ticks = Some(value()?.parse().context("bad --ticks")?),
                "--realtime" => options.realtime = true,
                "--audio" => options.audio = true,
                "--config" => options.config = Some(PathBuf::from(value()?)),
                "--seek-at" => {
                    let value = value()?;
                    let (tick, seconds) = split_at_tick(&value)?;
                    let seconds = seconds.parse().context("bad seek seconds")?;
                    options
                        .script
                        .push((tick, Scripted::Command(PlaybackCommand::SeekRelative { seconds })));
                }
                "--reset-at" => {
                    let tick = value()?.parse().context("bad --reset-at")?;
                    options
                        .script
                        .push((tick, Scripted::Command(PlaybackCommand::Reset)));
                }
                "--switch-audio-at" => {
                    let tick = value()?.parse().context("bad --switch-audio-at")?;
                    options
                        .script
                        .push((tick, Scripted::Command(PlaybackCommand::CycleAudioTrack)));
                }
                "--switch-subtitle-at" => {
                    let tick = value()?.parse().context("bad --switch-subtitle-at")?;
                    options
                        .script
                        .push((tick, Scripted::Command(PlaybackCommand::CycleSubtitleTrack)));
                }
                "--press" => {
                    let value = value()?;
                    let (tick, button) = split_at_tick(&value)?;
                    options.script.push((tick, Scripted::Press(parse_button(button)?)));
                }
                "--dump-frame" => {
                    let value = value()?;
                    let (tick, path) = split_at_tick(&value)?;
                    options.dumps.push((tick, PathBuf::from(path)));
                }
                "--help" | "-h" => {
                    println!("{}", usage());
                    std::process::exit(0);
                }
                other if !other.starts_with('-') && options.input.is_none() => {
                    options.input = Some(PathBuf::from(other));
                }
                other => bail!("unknown argument {:?}\n{}", other, usage()),
            }
        }

        if options.input.is_none() && !options.test_pattern {
            bail!("no input\n{}", usage());
        }
        Ok(options)
    }
}

// ============================================================================
// Captions
// ============================================================================

/// Stand-in rasterizer without a font stack: every active event becomes a
/// translucent bar along the bottom of the frame, stacked upwards.
#[derive(Default)]
struct CaptionBar {
    width: usize,
    height: usize,
}

impl SubtitleRenderer for CaptionBar {
    fn add_font(&mut self, name: &str, data: &[u8]) {
        tracing::debug!("Font {} ({} bytes) ignored by caption bar", name, data.len());
    }

    fn set_frame_size(&mut self, width: u32, height: u32) {
        self.width = width as usize;
        self.height = height as usize;
    }

    fn render(&mut self, track: &EventTrack, time_ms: i64, out: &mut Vec<OverlayImage>) {
        let bar = (self.height / 12).max(1);
        for (line, _event) in track.active_at(time_ms).enumerate() {
            let bottom = self.height.saturating_sub(bar * (line + 1) + bar / 2);
            out.push(OverlayImage {
                width: self.width,
                height: bar,
                stride: self.width,
                bitmap: vec![160; self.width * bar],
                color: 0xF0F0_F000,
                dst_x: 0,
                dst_y: bottom as i32,
            });
        }
    }
}

// ============================================================================
// Host Sink
// ============================================================================

#[cfg(feature = "audio")]
mod output {
    use anyhow::{Context, Result};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use ringbuf::traits::{Consumer, Producer, Split};
    use ringbuf::HeapRb;

    /// Default output device fed from a ring of interleaved stereo s16.
    pub struct AudioOut {
        producer: ringbuf::HeapProd<i16>,
        _stream: cpal::Stream,
    }

    impl AudioOut {
        pub fn open(sample_rate: u32) -> Result<Self> {
            let device = cpal::default_host()
                .default_output_device()
                .context("no audio output device")?;
            let config = cpal::StreamConfig {
                channels: 2,
                sample_rate: cpal::SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            // Half a second of slack between tick and device
            let ring = HeapRb::<i16>::new(sample_rate as usize);
            let (producer, mut consumer) = ring.split();

            let stream = device
                .build_output_stream(
                    &config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        for sample in data.iter_mut() {
                            *sample = consumer.try_pop().unwrap_or(0);
                        }
                    },
                    |err| tracing::error!("Audio stream error: {}", err),
                    None,
                )
                .context("failed to build output stream")?;
            stream.play().context("failed to start output stream")?;
            tracing::info!("Audio output on {:?} at {} Hz", device.name().ok(), sample_rate);

            Ok(Self {
                producer,
                _stream: stream,
            })
        }

        pub fn push(&mut self, samples: &[i16]) {
            let pushed = self.producer.push_slice(samples);
            if pushed < samples.len() {
                tracing::trace!("Audio ring full, dropped {} samples", samples.len() - pushed);
            }
        }
    }
}

#[derive(Debug, Default, serde::Serialize)]
struct SinkCounters {
    frames: u64,
    blends: u64,
    dupes: u64,
    audio_frames: u64,
    messages: Vec<String>,
}

struct HostSink {
    counters: SinkCounters,
    tick: u64,
    dumps: Vec<(u64, PathBuf)>,
    /// Last presented frame, kept for dumps on duplicate ticks
    last_frame: Vec<u8>,
    width: u32,
    height: u32,
    shutdown: bool,
    #[cfg(feature = "audio")]
    audio: Option<output::AudioOut>,
}

impl HostSink {
    fn new(dumps: Vec<(u64, PathBuf)>) -> Self {
        Self {
            counters: SinkCounters::default(),
            tick: 0,
            dumps,
            last_frame: Vec::new(),
            width: 0,
            height: 0,
            shutdown: false,
            #[cfg(feature = "audio")]
            audio: None,
        }
    }

    fn keep(&mut self, pixels: &[u8], width: u32, height: u32) {
        self.last_frame.clear();
        self.last_frame.extend_from_slice(pixels);
        self.width = width;
        self.height = height;
    }

    fn dump_due_frames(&mut self) {
        let tick = self.tick;
        let due: Vec<PathBuf> = self
            .dumps
            .iter()
            .filter(|(t, _)| *t == tick)
            .map(|(_, p)| p.clone())
            .collect();
        for path in due {
            if let Err(e) = self.save(&path) {
                tracing::error!("Frame dump to {} failed: {:#}", path.display(), e);
            } else {
                tracing::info!("Tick {} saved to {}", tick, path.display());
            }
        }
    }

    /// Write the last frame as RGB. Pixels are native-endian 0xXXRRGGBB.
    fn save(&self, path: &Path) -> Result<()> {
        if self.last_frame.is_empty() {
            bail!("no frame presented yet");
        }
        let width = self.width as usize;
        let image = image::RgbImage::from_fn(self.width, self.height, |x, y| {
            let i = (y as usize * width + x as usize) * 4;
            let px = u32::from_ne_bytes([
                self.last_frame[i],
                self.last_frame[i + 1],
                self.last_frame[i + 2],
                self.last_frame[i + 3],
            ]);
            image::Rgb([(px >> 16) as u8, (px >> 8) as u8, px as u8])
        });
        image.save(path)?;
        Ok(())
    }
}

impl PlaybackSink for HostSink {
    fn push_video(&mut self, output: VideoOutput<'_>) {
        match output {
            VideoOutput::Frame(frame) => {
                self.counters.frames += 1;
                self.keep(frame.pixels, frame.width, frame.height);
            }
            VideoOutput::Blend { current, next, mix } => {
                self.counters.blends += 1;
                let weight = (mix.clamp(0.0, 1.0) * 256.0) as u32;
                self.keep(current.pixels, current.width, current.height);
                for (out, n) in self.last_frame.iter_mut().zip(next.pixels) {
                    *out = ((*out as u32 * (256 - weight) + *n as u32 * weight) >> 8) as u8;
                }
            }
            VideoOutput::Dupe => self.counters.dupes += 1,
        }
        self.dump_due_frames();
    }

    fn push_audio(&mut self, samples: &[i16]) {
        self.counters.audio_frames += (samples.len() / 2) as u64;
        #[cfg(feature = "audio")]
        {
            if let Some(audio) = self.audio.as_mut() {
                audio.push(samples);
            }
        }
    }

    fn show_message(&mut self, text: &str, frames: u32) {
        tracing::info!("[osd {} frames] {}", frames, text);
        self.counters.messages.push(text.to_string());
    }

    fn request_shutdown(&mut self) {
        self.shutdown = true;
    }
}

// ============================================================================
// Main
// ============================================================================

fn open_session(options: &Options, config: PlaybackConfig) -> Result<PlaybackSession> {
    let renderer: Box<dyn SubtitleRenderer> = Box::new(CaptionBar::default());

    if options.test_pattern {
        let source = SyntheticSource::new(SyntheticConfig {
            duration_secs: 60.0,
            audio_tracks: 2,
            subtitles: true,
            ..Default::default()
        })?;
        return Ok(PlaybackSession::open_with_renderer(
            Box::new(source),
            config,
            Some(renderer),
        )?);
    }

    let path = options.input.as_ref().context("no input")?;
    let source_options = cinder_core::source::SourceOptions {
        decoder_threads: config.decoder_thread_count(),
    };
    let source = cinder_core::source::open_file(path, &source_options)
        .with_context(|| format!("failed to open {}", path.display()))?;
    Ok(PlaybackSession::open_with_renderer(
        source,
        config,
        Some(renderer),
    )?)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cinder_core=info,cinder=info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let options = Options::from_args(&args)?;
    tracing::info!("Cinder Player v{} (core {})", env!("CARGO_PKG_VERSION"), cinder_core::VERSION);

    let config = match &options.config {
        Some(path) => PlaybackConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => PlaybackConfig::default(),
    };

    let mut session = open_session(&options, config)?;
    let info = session.av_info();
    let descriptor = session.descriptor();
    let mut mapper = InputMapper::new(
        descriptor.audio_tracks.len(),
        descriptor.subtitle_tracks.len(),
    );

    let mut sink = HostSink::new(options.dumps.clone());
    #[cfg(feature = "audio")]
    {
        if options.audio {
            match output::AudioOut::open(info.sample_rate as u32) {
                Ok(out) => sink.audio = Some(out),
                Err(e) => tracing::warn!("Audio output disabled: {:#}", e),
            }
        }
    }
    #[cfg(not(feature = "audio"))]
    {
        if options.audio {
            tracing::warn!("Built without the `audio` feature, playing silently");
        }
    }

    let mut pacer = options.realtime.then(|| TickPacer::new(info.fps));
    let mut ticks = 0u64;
    let mut finished = false;

    while options.ticks.map_or(true, |limit| ticks < limit) {
        let mut buttons = InputState::default();
        for (_, step) in options.script.iter().filter(|(t, _)| *t == ticks) {
            match step {
                Scripted::Command(command) => session.handle(*command, &mut sink),
                Scripted::Press(press) => {
                    buttons.left |= press.left;
                    buttons.right |= press.right;
                    buttons.up |= press.up;
                    buttons.down |= press.down;
                    buttons.l |= press.l;
                    buttons.r |= press.r;
                }
            }
        }
        for command in mapper.update(buttons) {
            session.handle(command, &mut sink);
        }

        ticks += 1;
        sink.tick = ticks;
        if session.tick(&mut sink) == TickOutcome::Finished || sink.shutdown {
            finished = true;
            break;
        }
        if let Some(pacer) = pacer.as_mut() {
            pacer.wait();
        }
    }

    let clock = session.clock();
    let report = serde_json::json!({
        "ticks": ticks,
        "finished": finished,
        "av_info": info,
        "clock": {
            "frame_count": clock.frame_count,
            "audio_frames": clock.audio_frames,
            "pts_bias": clock.pts_bias,
            "audio_track": clock.audio_track,
            "subtitle_track": clock.subtitle_track,
        },
        "pipeline": session.stats(),
        "queues": session.queue_levels(),
        "host": sink.counters,
        "measured_rate": pacer.as_ref().map(|p| p.measured_rate()),
    });
    session.close();

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
