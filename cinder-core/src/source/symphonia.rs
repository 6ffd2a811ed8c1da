//! Pure Rust back end for audio-only files (symphonia + rubato).
//!
//! Every decodable track becomes an audio track. Samples are mixed down to
//! stereo and, when a track's rate differs from the first track's, run
//! through an FFT resampler.

use super::{AudioBlock, MediaSource, Packet, SourceError, SourceOptions};
use crate::convert::Picture;
use crate::media::{AudioTrackInfo, MediaDescriptor, Rational, MAX_TRACKS};
use crate::overlay::SubtitleEvent;
use bytes::Bytes;
use rubato::{FftFixedIn, Resampler};
use std::fs::File;
use std::path::Path;
use symphonia::core::audio::{SampleBuffer, SignalSpec};
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

/// Input frames per resampler chunk.
const RESAMPLE_CHUNK: usize = 1024;

struct Track {
    index: usize,
    track_id: u32,
    decoder: Box<dyn Decoder>,
    sample_buf: Option<SampleBuffer<f32>>,
    resampler: Option<FftFixedIn<f32>>,
    /// Planar stereo waiting for a full resampler chunk
    pending: [Vec<f32>; 2],
    /// Finished output, handed out by the next `receive_audio`
    ready: Vec<i16>,
    ready_pts: Option<i64>,
}

pub struct SymphoniaSource {
    name: String,
    format: Box<dyn FormatReader>,
    descriptor: MediaDescriptor,
    tracks: Vec<Track>,
}

fn to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

impl Track {
    /// Mix a decoded buffer down to stereo and queue it for output.
    fn push_interleaved(&mut self, samples: &[f32], channels: usize, pts: i64) {
        if self.ready.is_empty() {
            self.ready_pts = Some(pts);
        }
        let channels = channels.max(1);
        for frame in samples.chunks_exact(channels) {
            let left = frame[0];
            let right = if channels > 1 { frame[1] } else { left };
            if self.resampler.is_some() {
                self.pending[0].push(left);
                self.pending[1].push(right);
            } else {
                self.ready.push(to_i16(left));
                self.ready.push(to_i16(right));
            }
        }
    }

    fn run_resampler(&mut self) -> Result<(), SourceError> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(());
        };
        loop {
            let needed = resampler.input_frames_next();
            if self.pending[0].len() < needed {
                return Ok(());
            }
            let chunk = [
                self.pending[0].drain(..needed).collect::<Vec<_>>(),
                self.pending[1].drain(..needed).collect::<Vec<_>>(),
            ];
            let out = resampler
                .process(&chunk[..], None)
                .map_err(|e| SourceError::Decode(format!("resample: {}", e)))?;
            for (l, r) in out[0].iter().zip(out[1].iter()) {
                self.ready.push(to_i16(*l));
                self.ready.push(to_i16(*r));
            }
        }
    }

    fn reset(&mut self) {
        self.decoder.reset();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
        self.pending[0].clear();
        self.pending[1].clear();
        self.ready.clear();
        self.ready_pts = None;
    }
}

impl SymphoniaSource {
    pub fn open(path: &Path, _options: &SourceOptions) -> Result<Self, SourceError> {
        let open_error = |reason: String| SourceError::Open {
            path: path.display().to_string(),
            reason,
        };

        let file = File::open(path).map_err(|e| open_error(e.to_string()))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| open_error(e.to_string()))?;
        let format = probed.format;

        let mut descriptor = MediaDescriptor::default();
        let mut tracks = Vec::new();

        for (index, track) in format.tracks().iter().enumerate() {
            let params = &track.codec_params;
            if params.codec == CODEC_TYPE_NULL || tracks.len() >= MAX_TRACKS {
                continue;
            }
            let Some(source_rate) = params.sample_rate else {
                continue;
            };
            let decoder = symphonia::default::get_codecs()
                .make(params, &DecoderOptions::default())
                .map_err(|e| SourceError::CodecOpen {
                    kind: "audio",
                    reason: e.to_string(),
                })?;

            let time_base = params
                .time_base
                .map(|tb| Rational::new(tb.numer as i32, tb.denom as i32))
                .unwrap_or(Rational::new(1, source_rate as i32));

            if descriptor.audio_tracks.is_empty() {
                descriptor.sample_rate = source_rate;
                descriptor.duration = params
                    .n_frames
                    .map(|frames| frames as f64 / source_rate as f64);
            }

            let resampler = if source_rate != descriptor.sample_rate {
                tracing::debug!(
                    "Track {} resampled {} Hz -> {} Hz",
                    index,
                    source_rate,
                    descriptor.sample_rate
                );
                Some(
                    FftFixedIn::<f32>::new(
                        source_rate as usize,
                        descriptor.sample_rate as usize,
                        RESAMPLE_CHUNK,
                        2,
                        2,
                    )
                    .map_err(|e| SourceError::CodecOpen {
                        kind: "resampler",
                        reason: e.to_string(),
                    })?,
                )
            } else {
                None
            };

            descriptor.audio_tracks.push(AudioTrackInfo {
                index,
                time_base,
                source_rate,
                channels: params.channels.map(|c| c.count() as u16).unwrap_or(2),
                codec: symphonia::default::get_codecs()
                    .get_codec(params.codec)
                    .map(|c| c.short_name.to_string())
                    .unwrap_or_else(|| format!("{:?}", params.codec)),
                language: track.language.clone(),
            });
            tracks.push(Track {
                index,
                track_id: track.id,
                decoder,
                sample_buf: None,
                resampler,
                pending: [Vec::new(), Vec::new()],
                ready: Vec::new(),
                ready_pts: None,
            });
        }

        if tracks.is_empty() {
            return Err(SourceError::NoStreams);
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "symphonia".to_string());

        Ok(Self {
            name,
            format,
            descriptor,
            tracks,
        })
    }
}

impl MediaSource for SymphoniaSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn descriptor(&self) -> &MediaDescriptor {
        &self.descriptor
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, SourceError> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None)
                }
                Err(SymphoniaError::ResetRequired) => return Ok(None),
                Err(e) => return Err(SourceError::Read(e.to_string())),
            };

            // Packets of tracks that were not exposed are skipped here.
            let Some(track) = self.tracks.iter().find(|t| t.track_id == packet.track_id()) else {
                continue;
            };
            let ts = packet.ts() as i64;
            return Ok(Some(Packet {
                stream_index: track.index,
                pts: Some(ts),
                dts: Some(ts),
                duration: packet.dur() as i64,
                key: true,
                data: Bytes::from(packet.data),
            }));
        }
    }

    fn send_packet(&mut self, packet: &Packet) -> Result<(), SourceError> {
        let Some(track) = self
            .tracks
            .iter_mut()
            .find(|t| t.index == packet.stream_index)
        else {
            return Ok(());
        };

        let ts = packet.pts.unwrap_or(0).max(0) as u64;
        let raw = symphonia::core::formats::Packet::new_from_slice(
            track.track_id,
            ts,
            packet.duration.max(0) as u64,
            &packet.data,
        );
        let decoded = match track.decoder.decode(&raw) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::warn!("Skipping corrupt audio packet: {}", e);
                return Ok(());
            }
            Err(e) => return Err(SourceError::Decode(e.to_string())),
        };

        let spec: SignalSpec = *decoded.spec();
        let capacity = decoded.capacity() as u64;
        let needs_buffer = track
            .sample_buf
            .as_ref()
            .map_or(true, |b| b.capacity() < decoded.capacity() * spec.channels.count());
        if needs_buffer {
            track.sample_buf = Some(SampleBuffer::new(capacity, spec));
        }
        let Some(buf) = track.sample_buf.as_mut() else {
            return Ok(());
        };
        buf.copy_interleaved_ref(decoded);

        let channels = spec.channels.count();
        let samples = buf.samples().to_vec();
        track.push_interleaved(&samples, channels, ts as i64);
        track.run_resampler()
    }

    fn receive_video(&mut self, _picture: &mut Picture) -> Result<bool, SourceError> {
        Ok(false)
    }

    fn receive_audio(
        &mut self,
        stream_index: usize,
        block: &mut AudioBlock,
    ) -> Result<bool, SourceError> {
        let Some(track) = self.tracks.iter_mut().find(|t| t.index == stream_index) else {
            return Ok(false);
        };
        if track.ready.is_empty() {
            return Ok(false);
        }
        block.clear();
        block.pts = track.ready_pts.take();
        std::mem::swap(&mut block.samples, &mut track.ready);
        Ok(true)
    }

    fn decode_subtitles(
        &mut self,
        _packet: &Packet,
        _events: &mut Vec<SubtitleEvent>,
    ) -> Result<(), SourceError> {
        Ok(())
    }

    fn seek(&mut self, seconds: f64) -> Result<(), SourceError> {
        let seek_to = SeekTo::Time {
            time: Time::from(seconds.max(0.0)),
            track_id: None,
        };
        self.format
            .seek(SeekMode::Coarse, seek_to)
            .map(|_| ())
            .map_err(|e| SourceError::Seek(e.to_string()))
    }

    fn flush(&mut self) {
        for track in &mut self.tracks {
            track.reset();
        }
    }
}
