//! # Media Sources
//!
//! Demux + decode back ends behind one trait. The decode thread drives a
//! source packet by packet:
//!
//! ```text
//! read_packet ──► stage ──► send_packet ──► receive_video / receive_audio
//!             └─► decode_subtitles (right away, no staging)
//! ```
//!
//! ## Back ends
//! 1. `FfmpegSource` - any container libavformat opens (feature `ffmpeg`)
//! 2. `SymphoniaSource` - audio-only files (feature `symphonia`)
//! 3. `SyntheticSource` - generated test pattern and tones, always built

use crate::convert::Picture;
use crate::media::{MediaDescriptor, Rational};
use crate::overlay::SubtitleEvent;
use bytes::Bytes;
use std::path::Path;
use thiserror::Error;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
#[cfg(feature = "symphonia")]
pub mod symphonia;
pub mod synthetic;

#[cfg(feature = "ffmpeg")]
pub use self::ffmpeg::FfmpegSource;
#[cfg(feature = "symphonia")]
pub use self::symphonia::SymphoniaSource;
pub use synthetic::{SyntheticAudio, SyntheticConfig, SyntheticSource};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to open {path}: {reason}")]
    Open { path: String, reason: String },
    #[error("No decodable audio or video stream")]
    NoStreams,
    #[error("Failed to open {kind} decoder: {reason}")]
    CodecOpen { kind: &'static str, reason: String },
    #[error("Read failed: {0}")]
    Read(String),
    #[error("Decode failed: {0}")]
    Decode(String),
    #[error("Seek failed: {0}")]
    Seek(String),
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// One demuxed packet. Timestamps are in the stream's time base.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    pub stream_index: usize,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    pub key: bool,
    pub data: Bytes,
}

impl Packet {
    pub fn start_seconds(&self, time_base: Rational) -> f64 {
        time_base.ticks_to_seconds(self.pts.or(self.dts).unwrap_or(0))
    }

    pub fn end_seconds(&self, time_base: Rational) -> f64 {
        time_base.ticks_to_seconds(self.pts.or(self.dts).unwrap_or(0) + self.duration)
    }
}

/// Decoded audio, already interleaved stereo s16 at the descriptor's rate.
#[derive(Debug, Clone, Default)]
pub struct AudioBlock {
    /// Best-effort PTS of the first sample in stream ticks
    pub pts: Option<i64>,
    pub samples: Vec<i16>,
}

impl AudioBlock {
    pub fn frames(&self) -> usize {
        self.samples.len() / 2
    }

    pub fn clear(&mut self) {
        self.pts = None;
        self.samples.clear();
    }
}

/// Open-time knobs shared by every back end.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceOptions {
    /// Software video decoder threads; 0 lets the decoder pick
    pub decoder_threads: usize,
}

/// Demuxer plus decoders for one opened file.
///
/// Only the decode thread calls into a source after open.
pub trait MediaSource: Send {
    fn name(&self) -> &str;

    fn descriptor(&self) -> &MediaDescriptor;

    /// Next packet in container order, `None` at end of file.
    fn read_packet(&mut self) -> Result<Option<Packet>, SourceError>;

    /// Feed a video or audio packet to the decoder of its stream.
    fn send_packet(&mut self, packet: &Packet) -> Result<(), SourceError>;

    /// Pull the next decoded picture. `Ok(false)` when the decoder needs input.
    fn receive_video(&mut self, picture: &mut Picture) -> Result<bool, SourceError>;

    /// Pull the next decoded block of `stream_index`.
    fn receive_audio(&mut self, stream_index: usize, block: &mut AudioBlock)
        -> Result<bool, SourceError>;

    /// Decode a subtitle packet straight into events.
    fn decode_subtitles(
        &mut self,
        packet: &Packet,
        events: &mut Vec<SubtitleEvent>,
    ) -> Result<(), SourceError>;

    /// Reposition the demuxer at or before `seconds`.
    fn seek(&mut self, seconds: f64) -> Result<(), SourceError>;

    /// Drop decoder state, used after a seek.
    fn flush(&mut self);
}

/// Open `path` with the best back end compiled in.
pub fn open_file(path: &Path, options: &SourceOptions) -> Result<Box<dyn MediaSource>, SourceError> {
    let mut tried = Vec::new();

    #[cfg(feature = "ffmpeg")]
    match FfmpegSource::open(path, options) {
        Ok(source) => return Ok(Box::new(source)),
        Err(e) => {
            tracing::warn!("ffmpeg could not open {}: {}", path.display(), e);
            tried.push(format!("ffmpeg: {}", e));
        }
    }

    #[cfg(feature = "symphonia")]
    match SymphoniaSource::open(path, options) {
        Ok(source) => return Ok(Box::new(source)),
        Err(e) => {
            tracing::warn!("symphonia could not open {}: {}", path.display(), e);
            tried.push(format!("symphonia: {}", e));
        }
    }

    let _ = options;
    if tried.is_empty() {
        return Err(SourceError::Unsupported(
            "built without a file back end (enable `ffmpeg` or `symphonia`)".into(),
        ));
    }
    Err(SourceError::Open {
        path: path.display().to_string(),
        reason: tried.join("; "),
    })
}
