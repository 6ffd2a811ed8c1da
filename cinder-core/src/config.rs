//! Playback configuration.
//!
//! Read once at open, and again whenever the host reports that its
//! variables changed. Only `color_space` and `temporal_interpolation`
//! take effect on a running session; the rest size buffers and threads.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Tick rate used when the stream has no usable frame rate.
pub const DEFAULT_TICK_RATE: f64 = 60.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// Options
// ============================================================================

/// YUV matrix override. `Auto` follows the stream tag, then resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorSpaceSetting {
    #[default]
    Auto,
    Bt709,
    Bt601,
    Fcc,
    Smpte240m,
}

/// What the decode thread does when a queue stays full while the tick
/// thread is parked waiting on the other queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StallPolicy {
    /// Log, clear the full queue and keep decoding. Loses up to one queue
    /// worth of data but never wedges the pipeline.
    #[default]
    DropQueued,
    /// Keep waiting. Only safe when the container interleaves tightly.
    Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub color_space: ColorSpaceSetting,
    /// Hand both frame slots and a mix factor to the host instead of a
    /// single frame.
    pub temporal_interpolation: bool,
    /// Host ticks per second. `None` follows the video frame rate.
    pub tick_rate: Option<f64>,
    /// Software decoder threads, 0 = one per core.
    pub decoder_threads: usize,
    /// Depth of the audio queue.
    pub audio_buffer_seconds: f64,
    /// Depth of the video queue in frames.
    pub video_buffer_frames: usize,
    pub stall_policy: StallPolicy,
    /// Post seek / track messages to the host.
    pub show_messages: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            color_space: ColorSpaceSetting::Auto,
            temporal_interpolation: false,
            tick_rate: None,
            decoder_threads: 0,
            audio_buffer_seconds: 2.0,
            video_buffer_frames: 8,
            stall_policy: StallPolicy::DropQueued,
            show_messages: true,
        }
    }
}

impl PlaybackConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(rate) = self.tick_rate {
            if !rate.is_finite() || !(1.0..=1000.0).contains(&rate) {
                return Err(ConfigError::Invalid(format!(
                    "tick_rate must be between 1 and 1000, got {}",
                    rate
                )));
            }
        }
        if !self.audio_buffer_seconds.is_finite() || self.audio_buffer_seconds < 0.25 {
            return Err(ConfigError::Invalid(format!(
                "audio_buffer_seconds must be at least 0.25, got {}",
                self.audio_buffer_seconds
            )));
        }
        if self.video_buffer_frames < 2 {
            return Err(ConfigError::Invalid(format!(
                "video_buffer_frames must be at least 2, got {}",
                self.video_buffer_frames
            )));
        }
        Ok(())
    }

    /// Ticks per second for a stream with the given nominal frame rate.
    pub fn resolve_tick_rate(&self, stream_fps: Option<f64>) -> f64 {
        self.tick_rate
            .or(stream_fps.filter(|fps| fps.is_finite() && *fps >= 1.0))
            .unwrap_or(DEFAULT_TICK_RATE)
    }

    pub fn decoder_thread_count(&self) -> usize {
        match self.decoder_threads {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
