//! Media description derived once at open time.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// At most this many audio or subtitle tracks are exposed for cycling.
pub const MAX_TRACKS: usize = 8;

/// Output audio is always interleaved stereo s16.
pub const AUDIO_CHANNELS: usize = 2;
pub const BYTES_PER_AUDIO_FRAME: usize = AUDIO_CHANNELS * std::mem::size_of::<i16>();

/// Decoded audio block size the audio queue always leaves room for.
pub const MAX_AUDIO_BLOCK_FRAMES: usize = 8192;

/// Output video is XRGB8888.
pub const BYTES_PER_PIXEL: usize = 4;

/// Every video record starts with the frame PTS in stream ticks.
pub const VIDEO_HEADER_BYTES: usize = std::mem::size_of::<i64>();

pub const DEFAULT_WIDTH: u32 = 320;
pub const DEFAULT_HEIGHT: u32 = 240;
pub const DEFAULT_SAMPLE_RATE: u32 = 32_000;

// ============================================================================
// Time Base
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }

    pub fn ticks_to_seconds(&self, ticks: i64) -> f64 {
        ticks as f64 * self.as_f64()
    }

    pub fn seconds_to_ticks(&self, seconds: f64) -> i64 {
        let tb = self.as_f64();
        if tb == 0.0 {
            0
        } else {
            (seconds / tb).round() as i64
        }
    }
}

// ============================================================================
// Streams
// ============================================================================

#[derive(Debug, Clone)]
pub struct VideoStreamInfo {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    /// Display aspect, 0.0 when unknown
    pub aspect: f32,
    pub frame_rate: Option<f64>,
    pub time_base: Rational,
    pub codec: String,
}

#[derive(Debug, Clone)]
pub struct AudioTrackInfo {
    pub index: usize,
    pub time_base: Rational,
    pub source_rate: u32,
    pub channels: u16,
    pub codec: String,
    pub language: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SubtitleTrackInfo {
    pub index: usize,
    pub time_base: Rational,
    pub codec: String,
    pub language: Option<String>,
    /// Codec private header (the ASS script header for SSA/ASS tracks)
    pub header: Option<String>,
}

/// Embedded file, e.g. a TTF font in a Matroska container.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub mime: Option<String>,
    pub data: Bytes,
}

impl Attachment {
    pub fn is_font(&self) -> bool {
        let by_mime = self.mime.as_deref().is_some_and(|m| {
            matches!(
                m,
                "application/x-truetype-font"
                    | "application/x-font-ttf"
                    | "application/vnd.ms-opentype"
                    | "application/x-font-otf"
                    | "font/ttf"
                    | "font/otf"
                    | "font/sfnt"
            )
        });
        let name = self.name.to_ascii_lowercase();
        by_mime || name.ends_with(".ttf") || name.ends_with(".otf")
    }
}

// ============================================================================
// Descriptor
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct MediaDescriptor {
    pub video: Option<VideoStreamInfo>,
    pub audio_tracks: Vec<AudioTrackInfo>,
    pub subtitle_tracks: Vec<SubtitleTrackInfo>,
    pub attachments: Vec<Attachment>,
    /// Output rate every audio track is resampled to
    pub sample_rate: u32,
    pub duration: Option<f64>,
}

impl MediaDescriptor {
    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    pub fn has_audio(&self) -> bool {
        !self.audio_tracks.is_empty()
    }

    /// Size of one converted frame without its header.
    pub fn frame_bytes(&self) -> usize {
        self.video
            .as_ref()
            .map(|v| v.width as usize * v.height as usize * BYTES_PER_PIXEL)
            .unwrap_or(0)
    }

    pub fn video_record_bytes(&self) -> usize {
        VIDEO_HEADER_BYTES + self.frame_bytes()
    }

    pub fn font_attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.attachments.iter().filter(|a| a.is_font())
    }

    /// Position of a stream in the audio track list.
    pub fn audio_track_slot(&self, stream_index: usize) -> Option<usize> {
        self.audio_tracks.iter().position(|t| t.index == stream_index)
    }

    pub fn av_info(&self, tick_rate: f64) -> AvInfo {
        let (base_width, base_height, aspect) = match &self.video {
            Some(v) => (v.width, v.height, v.aspect),
            None => (DEFAULT_WIDTH, DEFAULT_HEIGHT, 0.0),
        };
        let sample_rate = if self.has_audio() {
            self.sample_rate
        } else {
            DEFAULT_SAMPLE_RATE
        };
        AvInfo {
            fps: tick_rate,
            sample_rate: sample_rate as f64,
            base_width,
            base_height,
            aspect,
        }
    }
}

/// Timing and geometry reported to the host after open.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AvInfo {
    pub fps: f64,
    pub sample_rate: f64,
    pub base_width: u32,
    pub base_height: u32,
    pub aspect: f32,
}
