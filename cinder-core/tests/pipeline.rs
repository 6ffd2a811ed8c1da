//! End-to-end runs of a session over generated media.

use cinder_core::overlay::{EventTrack, OverlayImage, SubtitleRenderer};
use cinder_core::source::{SyntheticAudio, SyntheticConfig, SyntheticSource};
use cinder_core::{
    ColorSpaceSetting, PlaybackCommand, PlaybackConfig, PlaybackSession, PlaybackSink,
    StallPolicy, TickOutcome, VideoOutput,
};
use std::sync::mpsc;
use std::time::Duration;

#[derive(Default)]
struct Recorder {
    /// PTS and first pixel of every new frame
    frames: Vec<(f64, u32)>,
    dupes: usize,
    audio_samples: usize,
    last_audio: Vec<i16>,
    messages: Vec<String>,
    shutdown: bool,
}

impl PlaybackSink for Recorder {
    fn push_video(&mut self, output: VideoOutput<'_>) {
        match output {
            VideoOutput::Frame(frame) | VideoOutput::Blend { next: frame, .. } => {
                let px = &frame.pixels[..4];
                self.frames
                    .push((frame.pts, u32::from_ne_bytes([px[0], px[1], px[2], px[3]])));
            }
            VideoOutput::Dupe => self.dupes += 1,
        }
    }

    fn push_audio(&mut self, samples: &[i16]) {
        self.audio_samples += samples.len();
        self.last_audio.clear();
        self.last_audio.extend_from_slice(samples);
    }

    fn show_message(&mut self, text: &str, _frames: u32) {
        self.messages.push(text.to_string());
    }

    fn request_shutdown(&mut self) {
        self.shutdown = true;
    }
}

fn session(config: SyntheticConfig, playback: PlaybackConfig) -> PlaybackSession {
    let source = SyntheticSource::new(config).unwrap();
    PlaybackSession::open(Box::new(source), playback).unwrap()
}

fn small(duration_secs: f64) -> SyntheticConfig {
    SyntheticConfig {
        width: 64,
        height: 48,
        duration_secs,
        ..Default::default()
    }
}

#[test]
fn test_steady_playback_keeps_audio_and_video_locked() {
    let mut session = session(small(20.0), PlaybackConfig::default());
    assert_eq!(session.av_info().fps, 30.0);
    assert_eq!(session.av_info().sample_rate, 44_100.0);

    let mut sink = Recorder::default();
    for _ in 0..300 {
        assert_eq!(session.tick(&mut sink), TickOutcome::Presented);
    }

    let clock = session.clock();
    assert_eq!(clock.frame_count, 300);
    assert_eq!(clock.audio_frames, 441_000);
    assert_eq!(sink.audio_samples, 441_000 * 2);
    assert!(clock.pts_bias.abs() < 0.05, "bias {}", clock.pts_bias);

    assert!(sink.frames.windows(2).all(|w| w[1].0 > w[0].0));
    let (last_pts, _) = *sink.frames.last().unwrap();
    assert!((last_pts - 10.0).abs() < 0.1, "last frame at {}", last_pts);

    let levels = session.queue_levels();
    assert!(levels.audio <= levels.audio_capacity);
    assert!(levels.video <= levels.video_capacity);
    assert!(session.stats().video_frames >= 300);
}

#[test]
fn test_seek_forward_lands_on_target() {
    let mut session = session(small(20.0), PlaybackConfig::default());
    let mut sink = Recorder::default();
    for _ in 0..30 {
        session.tick(&mut sink);
    }

    session.handle(PlaybackCommand::SeekRelative { seconds: 5 }, &mut sink);
    assert_eq!(session.clock().frame_count, 180);
    assert_eq!(sink.messages, vec!["Seek: 6 s.".to_string()]);

    sink.frames.clear();
    session.tick(&mut sink);
    let (pts, _) = sink.frames[0];
    assert!(pts > 5.99 && pts < 6.2, "first frame after seek at {}", pts);
    assert_eq!(session.stats().seeks, 1);
}

#[test]
fn test_reset_returns_to_start() {
    let mut session = session(small(20.0), PlaybackConfig::default());
    let mut sink = Recorder::default();
    for _ in 0..90 {
        session.tick(&mut sink);
    }

    session.handle(PlaybackCommand::Reset, &mut sink);
    sink.frames.clear();
    session.tick(&mut sink);

    assert_eq!(session.clock().frame_count, 1);
    let (pts, _) = sink.frames[0];
    assert!(pts < 0.1, "frame after reset at {}", pts);
}

#[test]
fn test_end_of_file_drains_then_finishes() {
    let mut session = session(small(1.0), PlaybackConfig::default());
    let mut sink = Recorder::default();

    let mut ticks = 0;
    while session.tick(&mut sink) == TickOutcome::Presented {
        ticks += 1;
        assert!(ticks < 200, "never finished");
    }

    assert!((28..=40).contains(&ticks), "finished after {} ticks", ticks);
    assert!(sink.shutdown);
    assert!(session.is_finished());
    let (last_pts, _) = *sink.frames.last().unwrap();
    assert!(last_pts > 0.9, "last frame at {}", last_pts);
    assert_eq!(session.tick(&mut sink), TickOutcome::Finished);
}

#[test]
fn test_close_while_decoder_is_blocked() {
    let session = session(small(60.0), PlaybackConfig::default());
    // Nobody ticks, so the decode thread fills both queues and waits.
    std::thread::sleep(Duration::from_millis(100));
    let levels = session.queue_levels();
    assert!(levels.video > 0);

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        session.close();
        let _ = tx.send(());
    });
    assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
}

#[test]
fn test_low_tick_rate_with_short_audio_buffer() {
    let playback = PlaybackConfig {
        tick_rate: Some(2.0),
        audio_buffer_seconds: 0.25,
        stall_policy: StallPolicy::Block,
        ..Default::default()
    };
    let mut session = session(small(20.0), playback);
    let levels = session.queue_levels();
    assert!(levels.audio_capacity >= 2 * 22_050 * 4);

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut sink = Recorder::default();
        for _ in 0..3 {
            session.tick(&mut sink);
        }
        let _ = tx.send((session.clock(), session.stats(), sink.audio_samples));
    });

    let (clock, stats, samples) = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("ticks did not complete");
    assert_eq!(clock.frame_count, 3);
    assert_eq!(clock.audio_frames, 3 * 22_050);
    assert_eq!(samples, 3 * 22_050 * 2);
    assert_eq!(stats.stalls, 0);
}

#[test]
fn test_audio_track_switch_reaches_output() {
    let config = SyntheticConfig {
        audio_tracks: 2,
        audio: SyntheticAudio::TrackMarker,
        ..small(20.0)
    };
    let playback = PlaybackConfig {
        audio_buffer_seconds: 0.5,
        ..Default::default()
    };
    let mut session = session(config, playback);
    let mut sink = Recorder::default();

    for _ in 0..30 {
        session.tick(&mut sink);
    }
    assert!(sink.last_audio.iter().all(|&s| s == 1000));

    session.handle(PlaybackCommand::CycleAudioTrack, &mut sink);
    assert_eq!(sink.messages, vec!["Audio Track #1.".to_string()]);
    assert_eq!(session.clock().audio_track, 1);

    for _ in 0..90 {
        session.tick(&mut sink);
    }
    assert!(!sink.last_audio.is_empty());
    assert!(sink.last_audio.iter().all(|&s| s == 2000));
}

#[test]
fn test_audio_only_media_dupes_video() {
    let config = SyntheticConfig {
        video: false,
        sample_rate: 48_000,
        ..small(5.0)
    };
    let mut session = session(config, PlaybackConfig::default());
    assert_eq!(session.av_info().fps, 60.0);

    let mut sink = Recorder::default();
    for _ in 0..60 {
        session.tick(&mut sink);
    }
    assert_eq!(sink.dupes, 60);
    assert!(sink.frames.is_empty());
    assert_eq!(sink.audio_samples, 48_000 * 2);
}

#[test]
fn test_apply_config_validates_and_updates() {
    let mut session = session(small(5.0), PlaybackConfig::default());

    let bt601 = PlaybackConfig {
        color_space: ColorSpaceSetting::Bt601,
        show_messages: false,
        ..Default::default()
    };
    session.apply_config(bt601).unwrap();
    assert_eq!(session.config().color_space, ColorSpaceSetting::Bt601);

    let mut sink = Recorder::default();
    session.handle(PlaybackCommand::SeekRelative { seconds: 1 }, &mut sink);
    assert!(sink.messages.is_empty());

    let broken = PlaybackConfig {
        video_buffer_frames: 1,
        ..Default::default()
    };
    assert!(session.apply_config(broken).is_err());
    assert_eq!(session.config().color_space, ColorSpaceSetting::Bt601);
}

/// Paints the whole frame red while any event is on screen.
#[derive(Default)]
struct RedBox {
    width: usize,
    height: usize,
}

impl SubtitleRenderer for RedBox {
    fn add_font(&mut self, _name: &str, _data: &[u8]) {}

    fn set_frame_size(&mut self, width: u32, height: u32) {
        self.width = width as usize;
        self.height = height as usize;
    }

    fn render(&mut self, track: &EventTrack, time_ms: i64, out: &mut Vec<OverlayImage>) {
        if track.active_at(time_ms).next().is_none() {
            return;
        }
        out.push(OverlayImage {
            width: self.width,
            height: self.height,
            stride: self.width,
            bitmap: vec![255; self.width * self.height],
            color: 0xFF00_0000,
            dst_x: 0,
            dst_y: 0,
        });
    }
}

#[test]
fn test_subtitles_are_burned_in() {
    const RED: u32 = 0xFFFF_0000;
    let config = SyntheticConfig {
        subtitles: true,
        ..small(5.0)
    };
    let source = SyntheticSource::new(config).unwrap();
    let mut session = PlaybackSession::open_with_renderer(
        Box::new(source),
        PlaybackConfig::default(),
        Some(Box::new(RedBox::default())),
    )
    .unwrap();

    let mut sink = Recorder::default();
    for _ in 0..60 {
        session.tick(&mut sink);
    }

    // Cues run from each whole second for 0.8 s.
    for &(pts, pixel) in &sink.frames {
        let into_second = pts.fract();
        if into_second > 0.1 && into_second < 0.75 {
            assert_eq!(pixel, RED, "frame at {} should carry a cue", pts);
        } else if into_second > 0.82 && into_second < 0.98 {
            assert_ne!(pixel, RED, "frame at {} should be clear", pts);
        }
    }
    assert!(session.stats().subtitle_events >= 2);
}

/// Fails on the first frame it is asked to draw.
struct Broken;

impl SubtitleRenderer for Broken {
    fn add_font(&mut self, _name: &str, _data: &[u8]) {}

    fn set_frame_size(&mut self, _width: u32, _height: u32) {}

    fn render(&mut self, _track: &EventTrack, _time_ms: i64, _out: &mut Vec<OverlayImage>) {
        panic!("renderer failure");
    }
}

#[test]
fn test_decode_thread_panic_finishes_playback() {
    let config = SyntheticConfig {
        subtitles: true,
        ..small(5.0)
    };
    let source = SyntheticSource::new(config).unwrap();
    let mut session = PlaybackSession::open_with_renderer(
        Box::new(source),
        PlaybackConfig::default(),
        Some(Box::new(Broken)),
    )
    .unwrap();

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut sink = Recorder::default();
        let mut ticks = 0;
        while session.tick(&mut sink) == TickOutcome::Presented && ticks < 1000 {
            ticks += 1;
        }
        let _ = tx.send((session.is_finished(), sink.shutdown));
    });

    let (finished, shutdown) = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("tick hung after the decode thread died");
    assert!(finished);
    assert!(shutdown);
}

#[test]
fn test_short_subtitle_bitmap_is_skipped() {
    struct Truncated;

    impl SubtitleRenderer for Truncated {
        fn add_font(&mut self, _name: &str, _data: &[u8]) {}

        fn set_frame_size(&mut self, _width: u32, _height: u32) {}

        fn render(&mut self, _track: &EventTrack, _time_ms: i64, out: &mut Vec<OverlayImage>) {
            out.push(OverlayImage {
                width: 4,
                height: 4,
                stride: 4,
                bitmap: vec![255; 4],
                color: 0xFF00_0000,
                dst_x: 0,
                dst_y: 0,
            });
        }
    }

    let config = SyntheticConfig {
        subtitles: true,
        ..small(5.0)
    };
    let source = SyntheticSource::new(config).unwrap();
    let mut session = PlaybackSession::open_with_renderer(
        Box::new(source),
        PlaybackConfig::default(),
        Some(Box::new(Truncated)),
    )
    .unwrap();

    let mut sink = Recorder::default();
    for _ in 0..30 {
        assert_eq!(session.tick(&mut sink), TickOutcome::Presented);
    }
    assert!(sink.frames.iter().all(|&(_, pixel)| pixel != 0xFFFF_0000));
}
