//! Generated media: a scrolling luma ramp with one audio tone per track.
//!
//! Used by `--test-pattern` and by the pipeline tests. Timing is exact, so
//! every decoded timestamp can be predicted from the configuration.

use super::{AudioBlock, MediaSource, Packet, SourceError};
use crate::convert::{ColorMatrix, ColorRange, ColorTag, Picture};
use crate::media::{
    Attachment, AudioTrackInfo, MediaDescriptor, Rational, SubtitleTrackInfo, VideoStreamInfo,
};
use crate::overlay::SubtitleEvent;
use bytes::Bytes;

const VIDEO_TIME_BASE: Rational = Rational::new(1, 90_000);
const SUBTITLE_TIME_BASE: Rational = Rational::new(1, 1000);
const CUE_DURATION_MS: i64 = 800;

/// Sample content of generated audio tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticAudio {
    /// A sine per track, 440 Hz for the first and up a fifth for each next one
    Tone,
    /// Every sample of track slot `n` equals `(n + 1) * 1000`
    TrackMarker,
}

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// `false` produces audio-only media
    pub video: bool,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub sample_rate: u32,
    pub duration_secs: f64,
    pub audio_tracks: usize,
    pub audio: SyntheticAudio,
    /// Frames per audio packet
    pub audio_block_frames: usize,
    /// Audio packets are muxed this much later than their timestamps
    pub audio_lag_secs: f64,
    /// One subtitle cue per second
    pub subtitles: bool,
    /// Attach a font file to the container
    pub font_attachment: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            video: true,
            width: 320,
            height: 240,
            frame_rate: 30.0,
            sample_rate: 44_100,
            duration_secs: 10.0,
            audio_tracks: 1,
            audio: SyntheticAudio::Tone,
            audio_block_frames: 1024,
            audio_lag_secs: 0.0,
            subtitles: false,
            font_attachment: false,
        }
    }
}

enum NextPacket {
    Video,
    Audio,
    Subtitle,
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    descriptor: MediaDescriptor,
    total_frames: u64,
    total_blocks: u64,
    total_cues: u64,
    next_frame: u64,
    /// Next block number, per audio track
    next_block: Vec<u64>,
    next_cue: u64,
    pending_frame: Option<u64>,
    pending_block: Option<(usize, u64)>,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Result<Self, SourceError> {
        if !config.video && config.audio_tracks == 0 {
            return Err(SourceError::NoStreams);
        }
        if config.frame_rate <= 0.0 || config.sample_rate == 0 || config.audio_block_frames == 0
        {
            return Err(SourceError::Unsupported(
                "frame rate, sample rate and block size must be positive".into(),
            ));
        }

        let mut descriptor = MediaDescriptor {
            sample_rate: config.sample_rate,
            duration: Some(config.duration_secs),
            ..Default::default()
        };
        let mut index = 0;

        if config.video {
            descriptor.video = Some(VideoStreamInfo {
                index,
                width: config.width,
                height: config.height,
                aspect: config.width as f32 / config.height.max(1) as f32,
                frame_rate: Some(config.frame_rate),
                time_base: VIDEO_TIME_BASE,
                codec: "rawvideo".into(),
            });
            index += 1;
        }
        for track in 0..config.audio_tracks {
            descriptor.audio_tracks.push(AudioTrackInfo {
                index,
                time_base: Rational::new(1, config.sample_rate as i32),
                source_rate: config.sample_rate,
                channels: 2,
                codec: "pcm_s16le".into(),
                language: Some(format!("t{}", track)),
            });
            index += 1;
        }
        if config.subtitles {
            descriptor.subtitle_tracks.push(SubtitleTrackInfo {
                index,
                time_base: SUBTITLE_TIME_BASE,
                codec: "ass".into(),
                language: None,
                header: Some(
                    "[Script Info]\nScriptType: v4.00+\nPlayResX: 384\nPlayResY: 288\n".into(),
                ),
            });
        }
        if config.font_attachment {
            descriptor.attachments.push(Attachment {
                name: "pattern.ttf".into(),
                mime: Some("application/x-truetype-font".into()),
                data: Bytes::from_static(b"\0\x01\0\0\0\0\0\0"),
            });
        }

        let total_frames = if config.video {
            (config.duration_secs * config.frame_rate).floor() as u64
        } else {
            0
        };
        let total_blocks = (config.duration_secs * config.sample_rate as f64
            / config.audio_block_frames as f64)
            .ceil() as u64;
        let total_cues = if config.subtitles {
            config.duration_secs.floor() as u64
        } else {
            0
        };

        Ok(Self {
            next_block: vec![0; config.audio_tracks],
            config,
            descriptor,
            total_frames,
            total_blocks,
            total_cues,
            next_frame: 0,
            next_cue: 0,
            pending_frame: None,
            pending_block: None,
        })
    }

    fn frame_time(&self, frame: u64) -> f64 {
        frame as f64 / self.config.frame_rate
    }

    fn block_time(&self, block: u64) -> f64 {
        (block * self.config.audio_block_frames as u64) as f64 / self.config.sample_rate as f64
    }

    fn frame_pts(&self, frame: u64) -> i64 {
        VIDEO_TIME_BASE.seconds_to_ticks(self.frame_time(frame))
    }

    /// Track slot whose next block is furthest behind.
    fn lagging_track(&self) -> Option<(usize, u64)> {
        self.next_block
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, block)| *block < self.total_blocks)
            .min_by_key(|(_, block)| *block)
    }

    fn sample_value(&self, track: usize, frame_index: u64) -> i16 {
        match self.config.audio {
            SyntheticAudio::TrackMarker => ((track as i32 + 1) * 1000) as i16,
            SyntheticAudio::Tone => {
                let freq = 440.0 * 1.5f64.powi(track as i32);
                let t = frame_index as f64 / self.config.sample_rate as f64;
                ((t * freq * std::f64::consts::TAU).sin() * 8000.0) as i16
            }
        }
    }
}

impl MediaSource for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn descriptor(&self) -> &MediaDescriptor {
        &self.descriptor
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, SourceError> {
        let mut best: Option<(f64, NextPacket)> = None;
        let mut consider = |time: f64, kind: NextPacket| {
            if best.as_ref().map_or(true, |(t, _)| time < *t) {
                best = Some((time, kind));
            }
        };

        if self.next_frame < self.total_frames {
            consider(self.frame_time(self.next_frame), NextPacket::Video);
        }
        if let Some((_, block)) = self.lagging_track() {
            consider(
                self.block_time(block) + self.config.audio_lag_secs,
                NextPacket::Audio,
            );
        }
        if self.next_cue < self.total_cues {
            consider(self.next_cue as f64, NextPacket::Subtitle);
        }

        let Some((_, kind)) = best else {
            return Ok(None);
        };

        let packet = match kind {
            NextPacket::Video => {
                let frame = self.next_frame;
                self.next_frame += 1;
                let pts = self.frame_pts(frame);
                Packet {
                    stream_index: 0,
                    pts: Some(pts),
                    dts: Some(pts),
                    duration: self.frame_pts(frame + 1) - pts,
                    key: true,
                    data: Bytes::copy_from_slice(&frame.to_le_bytes()),
                }
            }
            NextPacket::Audio => {
                let Some((slot, block)) = self.lagging_track() else {
                    return Ok(None);
                };
                self.next_block[slot] += 1;
                let pts = (block * self.config.audio_block_frames as u64) as i64;
                Packet {
                    stream_index: self.descriptor.audio_tracks[slot].index,
                    pts: Some(pts),
                    dts: Some(pts),
                    duration: self.config.audio_block_frames as i64,
                    key: true,
                    data: Bytes::copy_from_slice(&block.to_le_bytes()),
                }
            }
            NextPacket::Subtitle => {
                let cue = self.next_cue;
                self.next_cue += 1;
                let text = format!("Line {}", cue + 1);
                Packet {
                    stream_index: self.descriptor.subtitle_tracks[0].index,
                    pts: Some(cue as i64 * 1000),
                    dts: Some(cue as i64 * 1000),
                    duration: CUE_DURATION_MS,
                    key: true,
                    data: Bytes::from(text),
                }
            }
        };
        Ok(Some(packet))
    }

    fn send_packet(&mut self, packet: &Packet) -> Result<(), SourceError> {
        let counter = packet
            .data
            .get(..8)
            .and_then(|b| <[u8; 8]>::try_from(b).ok())
            .map(u64::from_le_bytes)
            .ok_or_else(|| SourceError::Decode("truncated packet".into()))?;

        if self.descriptor.video.as_ref().map(|v| v.index) == Some(packet.stream_index) {
            self.pending_frame = Some(counter);
        } else if let Some(slot) = self.descriptor.audio_track_slot(packet.stream_index) {
            self.pending_block = Some((slot, counter));
        } else {
            return Err(SourceError::Decode(format!(
                "no decoder for stream {}",
                packet.stream_index
            )));
        }
        Ok(())
    }

    fn receive_video(&mut self, picture: &mut Picture) -> Result<bool, SourceError> {
        let Some(frame) = self.pending_frame.take() else {
            return Ok(false);
        };

        picture.resize(self.config.width, self.config.height);
        picture.pts = Some(self.frame_pts(frame));
        picture.color = ColorTag {
            matrix: Some(ColorMatrix::Bt601),
            range: ColorRange::Limited,
        };

        let width = self.config.width as usize;
        let shift = frame as usize * 4;
        for (y, row) in picture.planes[0].chunks_mut(width.max(1)).enumerate() {
            for (x, luma) in row.iter_mut().enumerate() {
                *luma = 16 + ((x + y + shift) % 220) as u8;
            }
        }
        let chroma = picture.chroma_width();
        let [_, u_plane, v_plane] = &mut picture.planes;
        for (i, (u, v)) in u_plane.iter_mut().zip(v_plane.iter_mut()).enumerate() {
            let col = i % chroma.max(1);
            *u = 128u8.wrapping_add((col % 32) as u8);
            *v = 128u8.wrapping_sub((frame % 32) as u8);
        }
        Ok(true)
    }

    fn receive_audio(
        &mut self,
        stream_index: usize,
        block: &mut AudioBlock,
    ) -> Result<bool, SourceError> {
        let Some(slot) = self.descriptor.audio_track_slot(stream_index) else {
            return Ok(false);
        };
        match self.pending_block {
            Some((pending_slot, number)) if pending_slot == slot => {
                self.pending_block = None;
                let frames = self.config.audio_block_frames;
                let first = number * frames as u64;
                block.pts = Some(first as i64);
                block.samples.clear();
                block.samples.reserve(frames * 2);
                for i in 0..frames as u64 {
                    let s = self.sample_value(slot, first + i);
                    block.samples.push(s);
                    block.samples.push(s);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn decode_subtitles(
        &mut self,
        packet: &Packet,
        events: &mut Vec<SubtitleEvent>,
    ) -> Result<(), SourceError> {
        let text = std::str::from_utf8(&packet.data)
            .map_err(|e| SourceError::Decode(format!("subtitle text: {}", e)))?;
        let start_ms = SUBTITLE_TIME_BASE.ticks_to_seconds(packet.pts.unwrap_or(0)) * 1000.0;
        events.push(SubtitleEvent {
            start_ms: start_ms.round() as i64,
            duration_ms: packet.duration,
            text: text.to_string(),
        });
        Ok(())
    }

    fn seek(&mut self, seconds: f64) -> Result<(), SourceError> {
        let seconds = seconds.max(0.0);
        self.next_frame = ((seconds * self.config.frame_rate).floor() as u64).min(self.total_frames);
        let block = ((seconds * self.config.sample_rate as f64
            / self.config.audio_block_frames as f64)
            .floor() as u64)
            .min(self.total_blocks);
        self.next_block.iter_mut().for_each(|b| *b = block);
        // First cue still on screen at the target
        let target_ms = (seconds * 1000.0) as i64;
        self.next_cue = (0..self.total_cues)
            .find(|cue| *cue as i64 * 1000 + CUE_DURATION_MS > target_ms)
            .unwrap_or(self.total_cues);
        Ok(())
    }

    fn flush(&mut self) {
        self.pending_frame = None;
        self.pending_block = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(source: &mut SyntheticSource) -> Vec<Packet> {
        std::iter::from_fn(|| source.read_packet().unwrap()).collect()
    }

    #[test]
    fn test_descriptor_layout() {
        let source = SyntheticSource::new(SyntheticConfig {
            audio_tracks: 2,
            subtitles: true,
            font_attachment: true,
            ..Default::default()
        })
        .unwrap();
        let desc = source.descriptor();
        assert_eq!(desc.video.as_ref().unwrap().index, 0);
        assert_eq!(desc.audio_tracks[1].index, 2);
        assert_eq!(desc.subtitle_tracks[0].index, 3);
        assert_eq!(desc.font_attachments().count(), 1);
    }

    #[test]
    fn test_rejects_empty_media() {
        let result = SyntheticSource::new(SyntheticConfig {
            video: false,
            audio_tracks: 0,
            ..Default::default()
        });
        assert!(matches!(result, Err(SourceError::NoStreams)));
    }

    #[test]
    fn test_packets_interleave_by_time() {
        let mut source = SyntheticSource::new(SyntheticConfig {
            duration_secs: 1.0,
            ..Default::default()
        })
        .unwrap();
        let packets = drain(&mut source);

        let videos = packets.iter().filter(|p| p.stream_index == 0).count();
        let audios = packets.iter().filter(|p| p.stream_index == 1).count();
        assert_eq!(videos, 30);
        assert_eq!(audios, 44); // ceil(44100 / 1024)

        let times: Vec<f64> = packets
            .iter()
            .map(|p| {
                let tb = if p.stream_index == 0 {
                    VIDEO_TIME_BASE
                } else {
                    Rational::new(1, 44_100)
                };
                p.start_seconds(tb)
            })
            .collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_decode_video_and_audio() {
        let mut source = SyntheticSource::new(SyntheticConfig {
            audio: SyntheticAudio::TrackMarker,
            audio_tracks: 2,
            ..Default::default()
        })
        .unwrap();

        let mut picture = Picture::default();
        let mut block = AudioBlock::default();
        for packet in drain(&mut source).into_iter().take(12) {
            source.send_packet(&packet).unwrap();
            if packet.stream_index == 0 {
                assert!(source.receive_video(&mut picture).unwrap());
                assert_eq!(picture.pts, packet.pts);
                assert_eq!(picture.planes[0].len(), 320 * 240);
                assert_eq!(picture.planes[1].len(), 160 * 120);
                assert_eq!(picture.planes[1][1], 129);
                assert_eq!(picture.planes[2].len(), picture.planes[1].len());
            } else {
                assert!(!source.receive_audio(9, &mut block).unwrap());
                assert!(source.receive_audio(packet.stream_index, &mut block).unwrap());
                let slot = packet.stream_index - 1;
                assert_eq!(block.frames(), 1024);
                assert!(block.samples.iter().all(|s| *s == (slot as i16 + 1) * 1000));
            }
        }
    }

    #[test]
    fn test_seek_lands_at_or_before_target() {
        let mut source = SyntheticSource::new(SyntheticConfig::default()).unwrap();
        source.seek(5.0).unwrap();
        let first_video = std::iter::from_fn(|| source.read_packet().unwrap())
            .find(|p| p.stream_index == 0)
            .unwrap();
        let t = first_video.start_seconds(VIDEO_TIME_BASE);
        assert!(t <= 5.0 + 1e-9 && t > 5.0 - 1.0 / 30.0);
    }

    #[test]
    fn test_audio_lag_delays_audio_packets() {
        let mut source = SyntheticSource::new(SyntheticConfig {
            audio_lag_secs: 1.0,
            duration_secs: 3.0,
            ..Default::default()
        })
        .unwrap();
        let leading_video = std::iter::from_fn(|| source.read_packet().unwrap())
            .take_while(|p| p.stream_index == 0)
            .count();
        assert_eq!(leading_video, 31);
    }

    #[test]
    fn test_subtitle_cues() {
        let mut source = SyntheticSource::new(SyntheticConfig {
            video: false,
            subtitles: true,
            duration_secs: 3.0,
            ..Default::default()
        })
        .unwrap();
        let sub_index = source.descriptor().subtitle_tracks[0].index;
        let mut events = Vec::new();
        for packet in drain(&mut source) {
            if packet.stream_index == sub_index {
                source.decode_subtitles(&packet, &mut events).unwrap();
            }
        }
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].start_ms, 1000);
        assert_eq!(events[1].text, "Line 2");
    }
}
