//! # Tick Side
//!
//! Runs once per host tick on the host's thread. Audio is the master
//! clock: every tick pulls exactly `rate / fps` frames of audio, measures
//! how far the decoded timeline has drifted from the tick timeline, and
//! then advances video until the next frame is due.

use crate::byte_queue::Readable;
use crate::media::{MediaDescriptor, BYTES_PER_AUDIO_FRAME, BYTES_PER_PIXEL, VIDEO_HEADER_BYTES};
use crate::sync::{PipelineShared, SyncState};
use std::sync::Arc;

/// How long seek and track messages stay on screen, in ticks.
pub const MESSAGE_FRAMES: u32 = 180;

/// A bias drop larger than this means the decoded timeline jumped back.
const BIAS_RESET_THRESHOLD: f64 = 1.0;

// ============================================================================
// Host Boundary
// ============================================================================

/// Borrowed XRGB8888 frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameRef<'a> {
    pub pixels: &'a [u8],
    pub width: u32,
    pub height: u32,
    /// Bytes per row
    pub pitch: usize,
    /// Presentation time in seconds
    pub pts: f64,
}

/// What the host draws this tick.
#[derive(Debug, Clone, Copy)]
pub enum VideoOutput<'a> {
    Frame(FrameRef<'a>),
    /// Both slots for the host to mix; `mix` is the weight of `next`
    Blend {
        current: FrameRef<'a>,
        next: FrameRef<'a>,
        mix: f32,
    },
    /// Show the previous frame again
    Dupe,
}

/// Callbacks into the host.
pub trait PlaybackSink {
    fn push_video(&mut self, output: VideoOutput<'_>);
    /// Interleaved stereo s16
    fn push_audio(&mut self, samples: &[i16]);
    fn show_message(&mut self, text: &str, frames: u32);
    /// Playback is over; the host should close the session.
    fn request_shutdown(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Presented,
    /// Everything decoded has been played, or the pipeline was shut down
    Finished,
}

// ============================================================================
// Consumer
// ============================================================================

struct FrameSlot {
    pixels: Vec<u8>,
    pts: f64,
}

impl FrameSlot {
    fn as_frame(&self, width: u32, height: u32) -> FrameRef<'_> {
        FrameRef {
            pixels: &self.pixels,
            width,
            height,
            pitch: width as usize * BYTES_PER_PIXEL,
            pts: self.pts,
        }
    }
}

pub struct PlaybackConsumer {
    shared: Arc<PipelineShared>,
    descriptor: MediaDescriptor,
    fps: f64,
    sample_rate: f64,
    temporal_interpolation: bool,
    show_messages: bool,
    /// `[current, next]`
    slots: [FrameSlot; 2],
    header: [u8; VIDEO_HEADER_BYTES],
    audio_samples: Vec<i16>,
    finished: bool,
}

impl PlaybackConsumer {
    pub fn new(
        shared: Arc<PipelineShared>,
        descriptor: MediaDescriptor,
        fps: f64,
        temporal_interpolation: bool,
        show_messages: bool,
    ) -> Self {
        let frame_bytes = descriptor.frame_bytes();
        let sample_rate = descriptor.av_info(fps).sample_rate;
        let slot = || FrameSlot {
            pixels: vec![0u8; frame_bytes],
            pts: 0.0,
        };
        Self {
            shared,
            fps,
            sample_rate,
            temporal_interpolation,
            show_messages,
            slots: [slot(), slot()],
            header: [0; VIDEO_HEADER_BYTES],
            audio_samples: Vec::new(),
            finished: false,
            descriptor,
        }
    }

    pub fn set_temporal_interpolation(&mut self, enabled: bool) {
        self.temporal_interpolation = enabled;
    }

    pub fn set_show_messages(&mut self, enabled: bool) {
        self.show_messages = enabled;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Snapshot of the shared clock.
    pub fn clock(&self) -> SyncState {
        self.shared.lock().sync.clone()
    }

    /// Present one tick: pull its audio, then the video due at its time.
    pub fn tick(&mut self, sink: &mut dyn PlaybackSink) -> TickOutcome {
        if self.finished {
            return TickOutcome::Finished;
        }

        let frame_count = {
            let mut state = self.shared.lock();
            state.sync.frame_count += 1;
            state.sync.frame_count
        };

        let audio_frames = if self.descriptor.has_audio() {
            self.pull_audio(frame_count)
        } else {
            0
        };

        let bias = self.shared.lock().sync.pts_bias;
        let min_pts = frame_count as f64 / self.fps + bias;

        if self.descriptor.has_video() {
            self.present_video(min_pts, sink);
        } else {
            sink.push_video(VideoOutput::Dupe);
        }

        if audio_frames > 0 {
            sink.push_audio(&self.audio_samples[..audio_frames * 2]);
        }

        if self.is_drained() {
            tracing::info!("Playback finished after {} ticks", frame_count);
            self.finished = true;
            sink.request_shutdown();
            return TickOutcome::Finished;
        }
        TickOutcome::Presented
    }

    /// Read this tick's share of audio and update the PTS bias.
    /// Returns the number of frames to hand to the host.
    fn pull_audio(&mut self, frame_count: u64) -> usize {
        let (audio_frames, old_bias) = {
            let state = self.shared.lock();
            (state.sync.audio_frames, state.sync.pts_bias)
        };
        let expected = (frame_count as f64 * self.sample_rate / self.fps) as u64;
        let to_read = expected.saturating_sub(audio_frames) as usize;
        let to_read_bytes = to_read * BYTES_PER_AUDIO_FRAME;

        self.audio_samples.resize(to_read * 2, 0);
        let shared = &*self.shared;
        let mut queue = shared.audio.lock();
        let readable = queue.wait_readable(to_read_bytes, || shared.park_consumer(&shared.video));

        let bias = {
            let mut state = shared.lock();
            state.consumer_parked = false;

            let avail = queue.available_to_read() as f64;
            let reading_pts = state.sync.decode_last_audio_time
                - avail / (self.sample_rate * BYTES_PER_AUDIO_FRAME as f64);
            let expected_pts = audio_frames as f64 / self.sample_rate;
            let bias = reading_pts - expected_pts;
            state.sync.pts_bias = bias;
            state.sync.audio_frames = audio_frames + to_read as u64;
            bias
        };

        let got = match readable {
            Readable::Dead => 0,
            Readable::Ready | Readable::Drained => {
                queue.take(bytemuck::cast_slice_mut(&mut self.audio_samples))
            }
        };
        drop(queue);

        // Short reads only happen at end of stream or shutdown
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut self.audio_samples);
        bytes[got..].fill(0);

        if bias < old_bias - BIAS_RESET_THRESHOLD {
            tracing::info!("Resetting PTS (bias {:.3} -> {:.3})", old_bias, bias);
            self.reset_slot_pts();
        }
        to_read
    }

    fn present_video(&mut self, min_pts: f64, sink: &mut dyn PlaybackSink) {
        if min_pts > self.slots[1].pts {
            self.slots.swap(0, 1);
        }

        let mut read_any = false;
        while min_pts > self.slots[1].pts {
            if !self.read_frame() {
                break;
            }
            read_any = true;
        }

        let Some(video) = self.descriptor.video.as_ref() else {
            return;
        };
        let (width, height) = (video.width, video.height);

        let output = if self.temporal_interpolation {
            let [current, next] = &self.slots;
            let span = next.pts - current.pts;
            let mix = if span > 0.0 {
                ((min_pts - current.pts) / span).clamp(0.0, 1.0) as f32
            } else {
                1.0
            };
            VideoOutput::Blend {
                current: current.as_frame(width, height),
                next: next.as_frame(width, height),
                mix,
            }
        } else if read_any {
            VideoOutput::Frame(self.slots[1].as_frame(width, height))
        } else {
            VideoOutput::Dupe
        };
        sink.push_video(output);
    }

    /// Pull one record into the next slot. `false` when none will come.
    fn read_frame(&mut self) -> bool {
        let record = self.descriptor.video_record_bytes();
        let time_base = match self.descriptor.video.as_ref() {
            Some(v) => v.time_base,
            None => return false,
        };

        let shared = &*self.shared;
        let mut queue = shared.video.lock();
        let readable = queue.wait_readable(record, || shared.park_consumer(&shared.audio));
        shared.set_consumer_parked(false);

        match readable {
            Readable::Dead => return false,
            Readable::Drained if queue.available_to_read() < record => return false,
            _ => {}
        }

        queue.take(&mut self.header);
        let slot = &mut self.slots[1];
        queue.take(&mut slot.pixels);
        drop(queue);

        slot.pts = time_base.ticks_to_seconds(i64::from_ne_bytes(self.header));
        true
    }

    fn reset_slot_pts(&mut self) {
        self.slots[0].pts = 0.0;
        self.slots[1].pts = 0.0;
    }

    fn is_drained(&self) -> bool {
        let shared = &*self.shared;
        if shared.audio.is_dead() || shared.video.is_dead() {
            return true;
        }
        shared.is_terminated()
            && shared.audio.available_to_read() == 0
            && shared.video.available_to_read() == 0
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Move the tick timeline by `delta` ticks and wait for the decode
    /// thread to follow.
    pub fn seek_ticks(&mut self, delta: i64, sink: &mut dyn PlaybackSink) {
        let frame_count = self.shared.lock().sync.frame_count;
        let target = if delta < 0 && delta.unsigned_abs() > frame_count {
            0
        } else {
            frame_count.saturating_add_signed(delta)
        };
        self.seek_to_tick(target, delta < 0, sink);
    }

    /// Back to the start of the file.
    pub fn reset(&mut self, sink: &mut dyn PlaybackSink) {
        self.seek_to_tick(0, true, sink);
    }

    fn seek_to_tick(&mut self, target: u64, backward: bool, sink: &mut dyn PlaybackSink) {
        let seek_time = target as f64 / self.fps;
        if self.show_messages {
            sink.show_message(&format!("Seek: {} s.", seek_time as u64), MESSAGE_FRAMES);
        }
        if backward {
            tracing::info!("Resetting PTS");
            self.reset_slot_pts();
        }

        {
            let mut state = self.shared.lock();
            state.sync.frame_count = target;
            state.sync.audio_frames = (target as f64 * self.sample_rate / self.fps) as u64;
        }

        if !self.shared.request_seek(seek_time) {
            tracing::debug!("Seek to {:.3}s ignored, decode thread has stopped", seek_time);
        }
    }

    pub fn cycle_audio_track(&mut self, sink: &mut dyn PlaybackSink) {
        let count = self.descriptor.audio_tracks.len();
        if count == 0 {
            return;
        }
        let slot = {
            let mut state = self.shared.lock();
            state.sync.audio_track = (state.sync.audio_track + 1) % count;
            state.sync.audio_track
        };
        tracing::info!("Audio track {}", slot);
        if self.show_messages {
            sink.show_message(&format!("Audio Track #{}.", slot), MESSAGE_FRAMES);
        }
    }

    pub fn cycle_subtitle_track(&mut self, sink: &mut dyn PlaybackSink) {
        let count = self.descriptor.subtitle_tracks.len();
        if count == 0 {
            return;
        }
        let slot = {
            let mut state = self.shared.lock();
            state.sync.subtitle_track = (state.sync.subtitle_track + 1) % count;
            state.sync.subtitle_track
        };
        tracing::info!("Subtitle track {}", slot);
        if self.show_messages {
            sink.show_message(&format!("Subtitle Track #{}.", slot), MESSAGE_FRAMES);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{AudioTrackInfo, Rational, VideoStreamInfo};

    #[derive(Default)]
    struct Recorder {
        frames: Vec<f64>,
        dupes: usize,
        blends: Vec<f32>,
        audio_frames: usize,
        messages: Vec<String>,
        shutdown: bool,
    }

    impl PlaybackSink for Recorder {
        fn push_video(&mut self, output: VideoOutput<'_>) {
            match output {
                VideoOutput::Frame(f) => self.frames.push(f.pts),
                VideoOutput::Blend { mix, .. } => self.blends.push(mix),
                VideoOutput::Dupe => self.dupes += 1,
            }
        }
        fn push_audio(&mut self, samples: &[i16]) {
            self.audio_frames += samples.len() / 2;
        }
        fn show_message(&mut self, text: &str, _frames: u32) {
            self.messages.push(text.to_string());
        }
        fn request_shutdown(&mut self) {
            self.shutdown = true;
        }
    }

    fn descriptor(video: bool, audio: bool) -> MediaDescriptor {
        MediaDescriptor {
            video: video.then(|| VideoStreamInfo {
                index: 0,
                width: 2,
                height: 1,
                aspect: 2.0,
                frame_rate: Some(10.0),
                time_base: Rational::new(1, 10),
                codec: "raw".into(),
            }),
            audio_tracks: if audio {
                vec![AudioTrackInfo {
                    index: 1,
                    time_base: Rational::new(1, 100),
                    source_rate: 100,
                    channels: 2,
                    codec: "pcm".into(),
                    language: None,
                }]
            } else {
                Vec::new()
            },
            sample_rate: 100,
            ..Default::default()
        }
    }

    fn setup(video: bool, audio: bool) -> (PlaybackConsumer, Arc<PipelineShared>) {
        let desc = descriptor(video, audio);
        let shared = Arc::new(PipelineShared::new(
            400,
            desc.video_record_bytes() * 8,
            SyncState::default(),
        ));
        let consumer = PlaybackConsumer::new(shared.clone(), desc, 10.0, false, true);
        (consumer, shared)
    }

    fn push_frame(shared: &PipelineShared, pts_ticks: i64) {
        let header = pts_ticks.to_ne_bytes();
        let pixels = [pts_ticks as u8; 8];
        shared.video.write_parts(&[&header[..], &pixels[..]], || {
            crate::byte_queue::Backpressure::Wait
        })
        .unwrap();
    }

    #[test]
    fn test_audio_pull_matches_tick_rate() {
        let (mut consumer, shared) = setup(false, true);
        shared.audio.write(&[0u8; 400]).unwrap();
        shared.lock().sync.decode_last_audio_time = 1.0;

        let mut sink = Recorder::default();
        for _ in 0..10 {
            assert_eq!(consumer.tick(&mut sink), TickOutcome::Presented);
        }
        assert_eq!(sink.audio_frames, 100);
        assert_eq!(sink.dupes, 10);

        let clock = consumer.clock();
        assert_eq!(clock.frame_count, 10);
        assert_eq!(clock.audio_frames, 100);
        // Last pull started at 0.9 s with 10 frames left queued
        assert!((clock.pts_bias - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_video_advances_to_due_frame() {
        let (mut consumer, shared) = setup(true, false);
        for pts in 0..4 {
            push_frame(&shared, pts);
        }
        let mut sink = Recorder::default();

        // Tick 1 is due at 0.1 s: frames 0.0 and 0.1 are read, the newest shown
        consumer.tick(&mut sink);
        assert_eq!(sink.frames, vec![0.1]);
        // Tick 2 is due at 0.2 s
        consumer.tick(&mut sink);
        assert_eq!(sink.frames, vec![0.1, 0.2]);
        assert_eq!(sink.dupes, 0);
    }

    #[test]
    fn test_blend_mix_factor() {
        let (mut consumer, shared) = setup(true, false);
        consumer.set_temporal_interpolation(true);
        for pts in [0, 2, 4] {
            push_frame(&shared, pts);
        }
        let mut sink = Recorder::default();
        consumer.tick(&mut sink);
        // min_pts 0.1 between slots at 0.0 and 0.2
        assert_eq!(sink.blends.len(), 1);
        assert!((sink.blends[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_drains_then_finishes_after_end_of_stream() {
        let (mut consumer, shared) = setup(true, true);
        push_frame(&shared, 0);
        push_frame(&shared, 1);
        shared.audio.write(&[0u8; 40]).unwrap();
        shared.finish();

        let mut sink = Recorder::default();
        assert_eq!(consumer.tick(&mut sink), TickOutcome::Presented);
        assert_eq!(consumer.tick(&mut sink), TickOutcome::Finished);
        assert!(sink.shutdown);
        // Second tick found no audio left and padded with silence
        assert_eq!(sink.audio_frames, 20);
        assert_eq!(consumer.tick(&mut sink), TickOutcome::Finished);
    }

    #[test]
    fn test_bias_regression_resets_slots() {
        let (mut consumer, shared) = setup(true, true);
        consumer.slots[0].pts = 50.0;
        consumer.slots[1].pts = 60.0;
        {
            let mut state = shared.lock();
            state.sync.pts_bias = 30.0;
            state.sync.decode_last_audio_time = 0.1;
        }
        shared.audio.write(&[0u8; 40]).unwrap();
        push_frame(&shared, 1);

        let mut sink = Recorder::default();
        consumer.tick(&mut sink);
        assert_eq!(consumer.slots[1].pts, 0.1);
        assert_eq!(sink.frames, vec![0.1]);
    }

    #[test]
    fn test_track_cycling_wraps_and_reports() {
        let (mut consumer, shared) = setup(false, true);
        let mut sink = Recorder::default();
        consumer.cycle_audio_track(&mut sink);
        assert_eq!(shared.lock().sync.audio_track, 0);
        consumer.cycle_subtitle_track(&mut sink);
        assert_eq!(sink.messages, vec!["Audio Track #0.".to_string()]);
    }

    #[test]
    fn test_seek_after_termination_moves_clock_only() {
        let (mut consumer, shared) = setup(false, true);
        shared.terminate();
        let mut sink = Recorder::default();

        consumer.seek_ticks(50, &mut sink);
        let clock = consumer.clock();
        assert_eq!(clock.frame_count, 50);
        assert_eq!(clock.audio_frames, 500);
        consumer.seek_ticks(-80, &mut sink);
        assert_eq!(consumer.clock().frame_count, 0);
        assert_eq!(sink.messages, vec!["Seek: 5 s.", "Seek: 0 s."]);
    }
}
