//! # Decode Thread
//!
//! Pulls packets from a [`MediaSource`], decodes the active audio track and
//! the video stream, converts pictures to XRGB, burns in subtitles and feeds
//! both byte queues.
//!
//! Audio and video packets are staged before decoding so neither stream
//! runs more than one tick ahead of the other:
//!
//! ```text
//! read_packet ─┬─► audio staging ──► decode when start <= next video end
//!              ├─► video staging ──► decode when end <= last audio end
//!              └─► subtitles ──────► decoded at once into the overlay
//! ```

use crate::byte_queue::{Backpressure, Reserve, WriteOutcome};
use crate::config::{ColorSpaceSetting, StallPolicy};
use crate::convert::{select_matrix, Picture, PixelConverter};
use crate::media::{MediaDescriptor, Rational};
use crate::overlay::{SubtitleEvent, SubtitleOverlay, SubtitleRenderer};
use crate::source::{AudioBlock, MediaSource, Packet};
use crate::sync::PipelineShared;
use std::collections::VecDeque;
use std::sync::Arc;

/// Lifecycle of the decode thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProducerState {
    Running,
    /// Demuxer hit end of file; staged packets are still being decoded
    Draining,
    Terminated,
}

/// Result of one pass through the decode loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Decoded,
    Seeked,
    /// End of stream reached, queues closed
    Finished,
    /// Shut down from outside
    Stopped,
}

/// Active tracks as seen at the top of a loop pass.
#[derive(Debug, Clone, Copy)]
struct Selection {
    audio: Option<(usize, Rational)>,
    subtitle_slot: usize,
    subtitle_index: Option<usize>,
    color_space: ColorSpaceSetting,
}

pub struct DecodeProducer {
    shared: Arc<PipelineShared>,
    source: Box<dyn MediaSource>,
    descriptor: MediaDescriptor,
    policy: StallPolicy,
    /// Slack allowed between the staged streams, one tick
    window: f64,
    state: ProducerState,

    audio_staged: VecDeque<Packet>,
    video_staged: VecDeque<Packet>,
    last_audio_end: f64,

    converter: Option<PixelConverter>,
    picture: Picture,
    frame: Vec<u8>,
    block: AudioBlock,
    events: Vec<SubtitleEvent>,
    overlay: SubtitleOverlay,
}

impl DecodeProducer {
    pub fn new(
        source: Box<dyn MediaSource>,
        shared: Arc<PipelineShared>,
        policy: StallPolicy,
        tick_rate: f64,
        renderer: Option<Box<dyn SubtitleRenderer>>,
    ) -> Self {
        let descriptor = source.descriptor().clone();
        let overlay = SubtitleOverlay::new(&descriptor, renderer);
        let frame = vec![0u8; descriptor.frame_bytes()];
        Self {
            shared,
            source,
            policy,
            window: 1.0 / tick_rate.max(1.0),
            state: ProducerState::Running,
            audio_staged: VecDeque::new(),
            video_staged: VecDeque::new(),
            last_audio_end: 0.0,
            converter: None,
            picture: Picture::default(),
            frame,
            block: AudioBlock::default(),
            events: Vec::new(),
            overlay,
            descriptor,
        }
    }

    /// Decode until end of stream or shutdown.
    pub fn run(mut self) {
        let _guard = FinishOnUnwind(self.shared.clone());
        tracing::info!(
            "Decode thread started ({}, {} audio track(s), video: {})",
            self.source.name(),
            self.descriptor.audio_tracks.len(),
            self.descriptor.has_video()
        );
        loop {
            match self.step() {
                StepOutcome::Decoded | StepOutcome::Seeked => {}
                StepOutcome::Finished => {
                    tracing::info!("Decode thread reached end of stream");
                    break;
                }
                StepOutcome::Stopped => {
                    tracing::info!("Decode thread stopped");
                    break;
                }
            }
        }
    }

    /// One pass of the decode loop.
    pub fn step(&mut self) -> StepOutcome {
        if self.state == ProducerState::Terminated || self.shared.is_terminated() {
            self.state = ProducerState::Terminated;
            return StepOutcome::Stopped;
        }

        if let Some(target) = self.shared.pending_seek() {
            self.seek(target);
            return StepOutcome::Seeked;
        }

        let selection = self.selection();
        let eof = self.state == ProducerState::Draining;

        if let Some((audio_index, _)) = selection.audio {
            // Packets staged before a track switch belong to the old track
            self.audio_staged.retain(|p| p.stream_index == audio_index);
        }

        let audio_tb = selection.audio.map(|(_, tb)| tb).unwrap_or(Rational::new(0, 1));
        let video_tb = self
            .descriptor
            .video
            .as_ref()
            .map(|v| v.time_base)
            .unwrap_or(Rational::new(0, 1));
        let next_audio_start = self
            .audio_staged
            .front()
            .map(|p| p.start_seconds(audio_tb))
            .unwrap_or(0.0);
        let next_video_end = self
            .video_staged
            .front()
            .map(|p| p.end_seconds(video_tb))
            .unwrap_or(0.0);

        if !self.audio_staged.is_empty()
            && (next_video_end == 0.0
                || (!eof && self.close_enough(next_audio_start, next_video_end))
                || eof)
        {
            if let Some(packet) = self.audio_staged.pop_front() {
                self.last_audio_end = packet.end_seconds(audio_tb);
                self.decode_audio(&packet, audio_tb);
            }
        }

        if !self.video_staged.is_empty()
            && ((!eof && self.close_enough(next_video_end, self.last_audio_end))
                || selection.audio.is_none()
                || eof)
        {
            if let Some(packet) = self.video_staged.pop_front() {
                self.decode_video(&packet, video_tb, &selection);
            }
        }

        if eof && self.audio_staged.is_empty() && self.video_staged.is_empty() {
            self.finish();
            return StepOutcome::Finished;
        }

        if !eof {
            self.read_next(&selection);
        }
        StepOutcome::Decoded
    }

    fn close_enough(&self, p1: f64, p2: f64) -> bool {
        p1 <= p2 || (p1 - p2) < self.window
    }

    fn selection(&self) -> Selection {
        let state = self.shared.lock();
        let audio = self
            .descriptor
            .audio_tracks
            .get(state.sync.audio_track)
            .map(|t| (t.index, t.time_base));
        let subtitle_slot = state.sync.subtitle_track;
        Selection {
            audio,
            subtitle_slot,
            subtitle_index: self
                .descriptor
                .subtitle_tracks
                .get(subtitle_slot)
                .map(|t| t.index),
            color_space: state.color_space,
        }
    }

    fn read_next(&mut self, selection: &Selection) {
        let packet = match self.source.read_packet() {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                self.state = ProducerState::Draining;
                return;
            }
            Err(e) => {
                tracing::error!("Read failed, treating as end of file: {}", e);
                self.shared.lock().stats.decode_errors += 1;
                self.state = ProducerState::Draining;
                return;
            }
        };

        let video_index = self.descriptor.video.as_ref().map(|v| v.index);
        if selection.audio.map(|(index, _)| index) == Some(packet.stream_index) {
            self.audio_staged.push_back(packet);
        } else if video_index == Some(packet.stream_index) {
            self.video_staged.push_back(packet);
        } else if selection.subtitle_index == Some(packet.stream_index) {
            self.decode_subtitles(&packet, selection.subtitle_slot);
        }
    }

    // ========================================================================
    // Decoding
    // ========================================================================

    fn decode_subtitles(&mut self, packet: &Packet, slot: usize) {
        self.events.clear();
        if let Err(e) = self.source.decode_subtitles(packet, &mut self.events) {
            tracing::error!("Decode subtitles failed: {}", e);
            self.shared.lock().stats.decode_errors += 1;
            return;
        }
        let count = self.events.len() as u64;
        self.overlay.push_events(slot, self.events.drain(..));
        self.shared.lock().stats.subtitle_events += count;
    }

    fn decode_audio(&mut self, packet: &Packet, time_base: Rational) {
        if let Err(e) = self.source.send_packet(packet) {
            tracing::error!("Can't decode audio packet: {}", e);
            self.shared.lock().stats.decode_errors += 1;
            return;
        }

        loop {
            match self.source.receive_audio(packet.stream_index, &mut self.block) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    tracing::error!("Error while reading audio frame: {}", e);
                    self.shared.lock().stats.decode_errors += 1;
                    break;
                }
            }

            let pts = self.block.pts.or(packet.pts).unwrap_or(0);
            let time = time_base.ticks_to_seconds(pts);
            let bytes: &[u8] = bytemuck::cast_slice(&self.block.samples);
            let shared = &*self.shared;

            let mut queue = shared.audio.lock();
            let reserved = queue.reserve(bytes.len(), || backpressure(shared, self.policy, "Audio"));
            match reserved {
                Ok(Reserve::Ready) => {
                    {
                        let mut state = shared.lock();
                        state.sync.decode_last_audio_time = time;
                        state.stats.audio_blocks += 1;
                    }
                    queue.put(&[bytes]);
                }
                Ok(Reserve::Abandoned) | Ok(Reserve::Refused) => return,
                Err(e) => {
                    tracing::error!("Dropping audio block: {}", e);
                }
            }
        }
    }

    fn decode_video(&mut self, packet: &Packet, time_base: Rational, selection: &Selection) {
        if let Err(e) = self.source.send_packet(packet) {
            tracing::error!("Can't decode video packet: {}", e);
            self.shared.lock().stats.decode_errors += 1;
            return;
        }

        let Some((width, height)) = self.descriptor.video.as_ref().map(|v| (v.width, v.height))
        else {
            return;
        };

        loop {
            match self.source.receive_video(&mut self.picture) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    tracing::error!("Error while reading video frame: {}", e);
                    self.shared.lock().stats.decode_errors += 1;
                    break;
                }
            }

            if self.picture.width != width || self.picture.height != height {
                tracing::warn!(
                    "Dropping {}x{} picture, stream is {}x{}",
                    self.picture.width,
                    self.picture.height,
                    width,
                    height
                );
                self.shared.lock().stats.decode_errors += 1;
                continue;
            }

            let matrix = select_matrix(
                selection.color_space,
                self.picture.color.matrix,
                width,
                height,
            );
            let range = self.picture.color.range;
            let converter = match self.converter.take() {
                Some(c) if c.matches(matrix, range) => c,
                _ => {
                    tracing::debug!("Colorspace now {:?} {:?}", matrix, range);
                    PixelConverter::new(matrix, range)
                }
            };
            let converted = converter.convert(&self.picture, &mut self.frame);
            self.converter = Some(converter);
            if let Err(e) = converted {
                tracing::error!("Error while converting picture: {}", e);
                self.shared.lock().stats.decode_errors += 1;
                continue;
            }

            let pts = self.picture.pts.or(packet.pts).unwrap_or(0);
            let time = time_base.ticks_to_seconds(pts);
            if self.overlay.is_active() {
                self.overlay
                    .composite(selection.subtitle_slot, (time * 1000.0) as i64, &mut self.frame);
            }

            let header = pts.to_ne_bytes();
            let shared = &*self.shared;
            let policy = self.policy;
            let written = shared.video.write_parts(&[&header[..], &self.frame[..]], || {
                backpressure(shared, policy, "Video")
            });
            match written {
                Ok(WriteOutcome::Written) => {
                    let mut state = shared.lock();
                    state.sync.decode_last_video_time = time;
                    state.stats.video_frames += 1;
                }
                Ok(WriteOutcome::Abandoned) | Ok(WriteOutcome::Refused) => return,
                Err(e) => {
                    tracing::error!("Dropping video frame: {}", e);
                    return;
                }
            }
        }
    }

    // ========================================================================
    // Seek / End
    // ========================================================================

    fn seek(&mut self, target: f64) {
        let target = target.max(0.0);
        tracing::info!("Seeking to {:.3}s", target);

        if let Err(e) = self.source.seek(target) {
            tracing::error!("Seek to {:.3}s failed: {}", target, e);
        }
        self.source.flush();
        self.overlay.flush();

        self.audio_staged.clear();
        self.video_staged.clear();
        self.last_audio_end = 0.0;
        self.state = ProducerState::Running;

        self.shared.complete_seek(target);
    }

    fn finish(&mut self) {
        self.state = ProducerState::Terminated;
        self.shared.finish();
    }
}

/// Closes the queues if the decode thread unwinds, so the tick drains
/// instead of waiting on data that will never come.
struct FinishOnUnwind(Arc<PipelineShared>);

impl Drop for FinishOnUnwind {
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::error!("Decode thread panicked, closing queues");
            self.0.finish();
        }
    }
}

/// Decide what a writer blocked on a full queue does next.
///
/// Runs under the queue lock; takes the coordination lock inside it.
fn backpressure(shared: &PipelineShared, policy: StallPolicy, queue: &str) -> Backpressure {
    let mut state = shared.lock();
    if state.seek.pending || state.terminated {
        return Backpressure::Abandon;
    }
    if state.consumer_parked && policy == StallPolicy::DropQueued {
        state.stats.stalls += 1;
        tracing::error!("{} deadlock detected, dropping queued data", queue);
        return Backpressure::Clear;
    }
    Backpressure::Wait
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::VIDEO_HEADER_BYTES;
    use crate::overlay::{EventTrack, OverlayImage};
    use crate::source::{SyntheticAudio, SyntheticConfig, SyntheticSource};
    use crate::sync::SyncState;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn small(config: SyntheticConfig) -> SyntheticConfig {
        SyntheticConfig {
            width: 16,
            height: 8,
            ..config
        }
    }

    fn producer(
        config: SyntheticConfig,
        policy: StallPolicy,
        video_records: usize,
    ) -> (DecodeProducer, Arc<PipelineShared>) {
        let source = SyntheticSource::new(config).unwrap();
        let desc = source.descriptor().clone();
        let shared = Arc::new(PipelineShared::new(
            desc.sample_rate as usize * 4,
            desc.video_record_bytes() * video_records,
            SyncState::default(),
        ));
        let producer = DecodeProducer::new(Box::new(source), shared.clone(), policy, 30.0, None);
        (producer, shared)
    }

    fn read_video_pts(shared: &PipelineShared, record: usize) -> i64 {
        let mut buf = vec![0u8; record];
        assert_eq!(shared.video.read(&mut buf), record);
        i64::from_ne_bytes(buf[..VIDEO_HEADER_BYTES].try_into().unwrap())
    }

    #[test]
    fn test_decodes_both_streams_in_order() {
        let (mut producer, shared) = producer(small(Default::default()), StallPolicy::Block, 8);
        let record = producer.descriptor.video_record_bytes();

        while shared.lock().stats.video_frames < 3 {
            assert_eq!(producer.step(), StepOutcome::Decoded);
        }

        assert_eq!(read_video_pts(&shared, record), 0);
        assert_eq!(read_video_pts(&shared, record), 3000);
        assert!(shared.audio.available_to_read() > 0);
        assert_eq!(shared.audio.available_to_read() % 4, 0);

        let state = shared.lock();
        assert!(state.sync.decode_last_video_time > 0.0);
        assert!(state.sync.decode_last_audio_time < 0.25);
    }

    #[test]
    fn test_seek_clears_queues_and_resets_times() {
        let (mut producer, shared) = producer(small(Default::default()), StallPolicy::Block, 8);
        for _ in 0..12 {
            producer.step();
        }
        assert!(shared.video.available_to_read() > 0);

        {
            let mut state = shared.lock();
            state.seek.pending = true;
            state.seek.target_seconds = 5.0;
        }
        assert_eq!(producer.step(), StepOutcome::Seeked);

        assert_eq!(shared.audio.available_to_read(), 0);
        assert_eq!(shared.video.available_to_read(), 0);
        let state = shared.lock();
        assert!(!state.seek.pending);
        assert_eq!(state.sync.decode_last_audio_time, 5.0);
        assert_eq!(state.sync.decode_last_video_time, 5.0);
        drop(state);

        let record = producer.descriptor.video_record_bytes();
        while shared.video.available_to_read() < record {
            producer.step();
        }
        assert_eq!(read_video_pts(&shared, record), 5 * 90_000);
    }

    #[test]
    fn test_end_of_stream_closes_queues() {
        let (producer, shared) = producer(
            small(SyntheticConfig {
                duration_secs: 0.5,
                ..Default::default()
            }),
            StallPolicy::Block,
            32,
        );
        producer.run();

        assert!(shared.is_terminated());
        assert!(shared.video.is_closed());
        assert_eq!(shared.lock().stats.video_frames, 15);
        assert_eq!(shared.video.available_to_write(), 0);
    }

    #[test]
    fn test_active_audio_track_is_read_each_pass() {
        let (mut producer, shared) = producer(
            small(SyntheticConfig {
                video: false,
                audio_tracks: 2,
                audio: SyntheticAudio::TrackMarker,
                ..Default::default()
            }),
            StallPolicy::Block,
            2,
        );
        shared.lock().sync.audio_track = 1;
        while shared.audio.available_to_read() < 4096 {
            producer.step();
        }
        let mut bytes = vec![0u8; 4096];
        shared.audio.read(&mut bytes);
        let samples: &[i16] = bytemuck::cast_slice(&bytes);
        assert!(samples.iter().all(|s| *s == 2000));
    }

    #[test]
    fn test_full_queue_dropped_when_consumer_parked() {
        let (mut producer, shared) =
            producer(small(Default::default()), StallPolicy::DropQueued, 2);
        let capacity = shared.video.capacity();
        shared.video.write(&vec![0u8; capacity]).unwrap();
        shared.set_consumer_parked(true);

        while shared.lock().stats.video_frames == 0 {
            producer.step();
        }
        assert_eq!(shared.lock().stats.stalls, 1);
        assert_eq!(
            shared.video.available_to_read(),
            producer.descriptor.video_record_bytes()
        );
    }

    struct Exploding;

    impl SubtitleRenderer for Exploding {
        fn add_font(&mut self, _name: &str, _data: &[u8]) {}

        fn set_frame_size(&mut self, _width: u32, _height: u32) {}

        fn render(&mut self, _track: &EventTrack, _time_ms: i64, _out: &mut Vec<OverlayImage>) {
            panic!("renderer failure");
        }
    }

    #[test]
    fn test_panic_closes_queues() {
        let source = SyntheticSource::new(small(SyntheticConfig {
            subtitles: true,
            ..Default::default()
        }))
        .unwrap();
        let desc = source.descriptor().clone();
        let shared = Arc::new(PipelineShared::new(
            desc.sample_rate as usize * 4,
            desc.video_record_bytes() * 8,
            SyncState::default(),
        ));
        let producer = DecodeProducer::new(
            Box::new(source),
            shared.clone(),
            StallPolicy::Block,
            30.0,
            Some(Box::new(Exploding)),
        );

        let handle = thread::spawn(move || producer.run());
        assert!(handle.join().is_err());
        assert!(shared.is_terminated());
        assert!(shared.audio.is_closed());
        assert!(shared.video.is_closed());
    }

    #[test]
    fn test_block_policy_waits_until_killed() {
        let (mut producer, shared) = producer(small(Default::default()), StallPolicy::Block, 2);
        let capacity = shared.video.capacity();
        shared.video.write(&vec![0u8; capacity]).unwrap();
        shared.set_consumer_parked(true);

        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            while producer.step() == StepOutcome::Decoded {}
            tx.send(()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(shared.lock().stats.stalls, 0);
        shared.kill();
        rx.recv_timeout(Duration::from_secs(5))
            .expect("producer did not stop after kill");
        handle.join().unwrap();
    }
}
