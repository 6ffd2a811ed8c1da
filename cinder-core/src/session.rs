//! # Playback Session
//!
//! Owns one opened file: the two queues, the decode thread and the tick
//! side. The host calls [`PlaybackSession::tick`] once per frame and
//! forwards commands; dropping the session stops the decode thread.

use crate::config::{ConfigError, PlaybackConfig};
use crate::consumer::{PlaybackConsumer, PlaybackSink, TickOutcome};
use crate::input::PlaybackCommand;
use crate::media::{
    AvInfo, MediaDescriptor, BYTES_PER_AUDIO_FRAME, MAX_AUDIO_BLOCK_FRAMES, VIDEO_HEADER_BYTES,
};
use crate::overlay::SubtitleRenderer;
use crate::producer::DecodeProducer;
use crate::source::{self, MediaSource, SourceError, SourceOptions};
use crate::sync::{PipelineShared, PipelineStats, SyncState};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OpenError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("Failed to start decode thread: {0}")]
    Thread(#[from] std::io::Error),
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

/// Fill of both queues, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueLevels {
    pub audio: usize,
    pub audio_capacity: usize,
    pub video: usize,
    pub video_capacity: usize,
}

pub struct PlaybackSession {
    shared: Arc<PipelineShared>,
    consumer: PlaybackConsumer,
    descriptor: MediaDescriptor,
    av_info: AvInfo,
    config: PlaybackConfig,
    decode_thread: Option<JoinHandle<()>>,
}

impl PlaybackSession {
    pub fn open(source: Box<dyn MediaSource>, config: PlaybackConfig) -> Result<Self, OpenError> {
        Self::open_with_renderer(source, config, None)
    }

    /// Open a file on disk with the compiled-in back ends.
    pub fn open_path(path: impl AsRef<Path>, config: PlaybackConfig) -> Result<Self, OpenError> {
        config.validate()?;
        let options = SourceOptions {
            decoder_threads: config.decoder_thread_count(),
        };
        let source = source::open_file(path.as_ref(), &options)?;
        Self::open(source, config)
    }

    pub fn open_with_renderer(
        source: Box<dyn MediaSource>,
        config: PlaybackConfig,
        renderer: Option<Box<dyn SubtitleRenderer>>,
    ) -> Result<Self, OpenError> {
        config.validate()?;
        let descriptor = source.descriptor().clone();
        if !descriptor.has_video() && !descriptor.has_audio() {
            return Err(SourceError::NoStreams.into());
        }

        let fps = config.resolve_tick_rate(descriptor.video.as_ref().and_then(|v| v.frame_rate));
        let av_info = descriptor.av_info(fps);

        let audio_capacity = if descriptor.has_audio() {
            audio_queue_frames(&config, descriptor.sample_rate as f64, fps) * BYTES_PER_AUDIO_FRAME
        } else {
            BYTES_PER_AUDIO_FRAME
        };
        let video_capacity = match &descriptor.video {
            Some(video) => {
                video_queue_frames(&config, video.frame_rate, fps) * descriptor.video_record_bytes()
            }
            None => VIDEO_HEADER_BYTES,
        };

        let shared = Arc::new(PipelineShared::new(
            audio_capacity,
            video_capacity,
            SyncState::default(),
        ));
        shared.lock().color_space = config.color_space;

        tracing::info!(
            "Opened {}: {}x{} @ {:.3} ticks/s, {} Hz, {} audio / {} subtitle track(s)",
            source.name(),
            av_info.base_width,
            av_info.base_height,
            fps,
            av_info.sample_rate,
            descriptor.audio_tracks.len(),
            descriptor.subtitle_tracks.len()
        );
        tracing::debug!(
            "Queue sizes: audio {} bytes, video {} bytes",
            audio_capacity,
            video_capacity
        );

        let producer =
            DecodeProducer::new(source, shared.clone(), config.stall_policy, fps, renderer);
        let decode_thread = std::thread::Builder::new()
            .name("cinder-decode".into())
            .spawn(move || producer.run())?;

        let consumer = PlaybackConsumer::new(
            shared.clone(),
            descriptor.clone(),
            fps,
            config.temporal_interpolation,
            config.show_messages,
        );

        Ok(Self {
            shared,
            consumer,
            descriptor,
            av_info,
            config,
            decode_thread: Some(decode_thread),
        })
    }

    pub fn av_info(&self) -> AvInfo {
        self.av_info
    }

    pub fn descriptor(&self) -> &MediaDescriptor {
        &self.descriptor
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    pub fn tick(&mut self, sink: &mut dyn PlaybackSink) -> TickOutcome {
        self.consumer.tick(sink)
    }

    pub fn handle(&mut self, command: PlaybackCommand, sink: &mut dyn PlaybackSink) {
        match command {
            PlaybackCommand::SeekRelative { seconds } => {
                let ticks = (seconds as f64 * self.av_info.fps).round() as i64;
                self.consumer.seek_ticks(ticks, sink);
            }
            PlaybackCommand::Reset => self.consumer.reset(sink),
            PlaybackCommand::CycleAudioTrack => self.consumer.cycle_audio_track(sink),
            PlaybackCommand::CycleSubtitleTrack => self.consumer.cycle_subtitle_track(sink),
        }
    }

    /// Apply settings changed by the host. Buffer sizes, thread count, tick
    /// rate and stall policy only take effect on the next open.
    pub fn apply_config(&mut self, config: PlaybackConfig) -> Result<(), ConfigError> {
        config.validate()?;
        if config.color_space != self.config.color_space {
            tracing::info!("Colorspace override now {:?}", config.color_space);
            self.shared.lock().color_space = config.color_space;
        }
        self.consumer
            .set_temporal_interpolation(config.temporal_interpolation);
        self.consumer.set_show_messages(config.show_messages);
        self.config = config;
        Ok(())
    }

    pub fn clock(&self) -> SyncState {
        self.consumer.clock()
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.lock().stats
    }

    pub fn queue_levels(&self) -> QueueLevels {
        QueueLevels {
            audio: self.shared.audio.available_to_read(),
            audio_capacity: self.shared.audio.capacity(),
            video: self.shared.video.available_to_read(),
            video_capacity: self.shared.video.capacity(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.consumer.is_finished()
    }

    /// Stop the decode thread and release everything.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.decode_thread.take() else {
            return;
        };
        self.shared.kill();
        if handle.join().is_err() {
            tracing::error!("Decode thread panicked");
        }
        tracing::debug!("Session closed");
    }
}

/// Audio queue size in frames.
///
/// Holds two ticks of audio plus one decoded block on top, whatever the
/// configured buffer time, so a tick's read can always be satisfied.
fn audio_queue_frames(config: &PlaybackConfig, sample_rate: f64, tick_rate: f64) -> usize {
    let buffered = (sample_rate * config.audio_buffer_seconds) as usize;
    let per_tick = (sample_rate / tick_rate).ceil() as usize;
    buffered.max(2 * per_tick + MAX_AUDIO_BLOCK_FRAMES)
}

/// Video queue size in frames, enough for two ticks of stream frames.
fn video_queue_frames(config: &PlaybackConfig, stream_fps: Option<f64>, tick_rate: f64) -> usize {
    let per_tick = stream_fps
        .filter(|fps| fps.is_finite() && *fps > 0.0)
        .map(|fps| (fps / tick_rate).ceil() as usize)
        .unwrap_or(1);
    config.video_buffer_frames.max(2 * per_tick + 1)
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_queue_holds_two_ticks() {
        let config = PlaybackConfig {
            audio_buffer_seconds: 0.25,
            ..Default::default()
        };
        assert_eq!(
            audio_queue_frames(&config, 44_100.0, 2.0),
            2 * 22_050 + MAX_AUDIO_BLOCK_FRAMES
        );
        assert_eq!(
            audio_queue_frames(&PlaybackConfig::default(), 44_100.0, 60.0),
            88_200
        );
    }

    #[test]
    fn test_video_queue_holds_two_ticks() {
        let config = PlaybackConfig::default();
        assert_eq!(video_queue_frames(&config, Some(30.0), 2.0), 31);
        assert_eq!(video_queue_frames(&config, Some(30.0), 30.0), 8);
        assert_eq!(video_queue_frames(&config, None, 60.0), 8);
    }
}
