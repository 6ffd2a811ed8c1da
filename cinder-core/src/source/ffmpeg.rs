//! libavformat / libavcodec back end.
//!
//! One video stream, up to [`MAX_TRACKS`] audio and ASS/SSA subtitle tracks,
//! and every attachment stream. Video is scaled to planar 4:2:0 at the
//! opened geometry; audio is resampled to packed stereo s16 at the rate of
//! the first audio track.

use super::{AudioBlock, MediaSource, Packet, SourceError, SourceOptions};
use crate::convert::{ColorMatrix, ColorRange, ColorTag, Picture};
use crate::media::{
    Attachment, AudioTrackInfo, MediaDescriptor, Rational, SubtitleTrackInfo, VideoStreamInfo,
    MAX_TRACKS,
};
use crate::overlay::SubtitleEvent;
use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use ffmpeg::codec::subtitle::{Rect, Subtitle};
use ffmpeg::codec::{decoder, threading, Id};
use ffmpeg::format::Pixel;
use ffmpeg::media::Type;
use ffmpeg::software::{resampling, scaling};
use ffmpeg::util::color;
use std::path::Path;

struct VideoDecoder {
    index: usize,
    decoder: decoder::Video,
    scaler: Option<scaling::Context>,
    frame: ffmpeg::frame::Video,
    scaled: ffmpeg::frame::Video,
    width: u32,
    height: u32,
}

struct AudioDecoder {
    index: usize,
    decoder: decoder::Audio,
    resampler: Option<resampling::Context>,
}

struct SubtitleDecoder {
    index: usize,
    time_base: Rational,
    decoder: decoder::Subtitle,
}

pub struct FfmpegSource {
    name: String,
    input: ffmpeg::format::context::Input,
    descriptor: MediaDescriptor,
    video: Option<VideoDecoder>,
    audio: Vec<AudioDecoder>,
    subtitles: Vec<SubtitleDecoder>,
    audio_frame: ffmpeg::frame::Audio,
    packet: ffmpeg::Packet,
}

// SAFETY: the format and codec contexts are created on the opening thread
// and afterwards only touched by the decode thread that owns the source.
unsafe impl Send for FfmpegSource {}

fn rational(r: ffmpeg::Rational) -> Rational {
    Rational::new(r.0, r.1)
}

fn codec_error(kind: &'static str) -> impl Fn(ffmpeg::Error) -> SourceError {
    move |e| SourceError::CodecOpen {
        kind,
        reason: e.to_string(),
    }
}

/// Codec private data of a stream, e.g. the ASS script header or the bytes
/// of an attached font.
fn extradata(params: &ffmpeg::codec::Parameters) -> Option<Bytes> {
    // SAFETY: extradata is owned by the parameters and `extradata_size`
    // bytes long while they are alive; the bytes are copied out here.
    unsafe {
        let raw = params.as_ptr();
        let size = (*raw).extradata_size;
        if (*raw).extradata.is_null() || size <= 0 {
            return None;
        }
        Some(Bytes::copy_from_slice(std::slice::from_raw_parts(
            (*raw).extradata,
            size as usize,
        )))
    }
}

fn color_tag(frame: &ffmpeg::frame::Video) -> ColorTag {
    let matrix = match frame.color_space() {
        color::Space::BT709 => Some(ColorMatrix::Bt709),
        color::Space::BT470BG | color::Space::SMPTE170M => Some(ColorMatrix::Bt601),
        color::Space::FCC => Some(ColorMatrix::Fcc),
        color::Space::SMPTE240M => Some(ColorMatrix::Smpte240m),
        _ => None,
    };
    let range = match frame.color_range() {
        color::Range::JPEG => ColorRange::Full,
        _ => ColorRange::Limited,
    };
    ColorTag { matrix, range }
}

impl FfmpegSource {
    pub fn open(path: &Path, options: &SourceOptions) -> Result<Self, SourceError> {
        let open_error = |e: ffmpeg::Error| SourceError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        };
        ffmpeg::init().map_err(open_error)?;
        let input = ffmpeg::format::input(&path).map_err(open_error)?;

        let mut descriptor = MediaDescriptor::default();
        let mut video = None;
        let mut audio = Vec::new();
        let mut subtitles = Vec::new();

        for stream in input.streams() {
            let params = stream.parameters();
            let index = stream.index();
            let time_base = rational(stream.time_base());

            match params.medium() {
                Type::Video if video.is_none() => {
                    let mut context = ffmpeg::codec::context::Context::from_parameters(params)
                        .map_err(codec_error("video"))?;
                    if options.decoder_threads > 0 {
                        context.set_threading(threading::Config {
                            kind: threading::Type::Frame,
                            count: options.decoder_threads,
                            ..Default::default()
                        });
                    }
                    let decoder = context.decoder().video().map_err(codec_error("video"))?;

                    let (width, height) = (decoder.width(), decoder.height());
                    let sar = decoder.aspect_ratio();
                    let aspect = if sar.0 > 0 && sar.1 > 0 {
                        (width as f32 * sar.0 as f32) / (height.max(1) as f32 * sar.1 as f32)
                    } else {
                        width as f32 / height.max(1) as f32
                    };
                    let fps = stream.avg_frame_rate();
                    let frame_rate = (fps.0 > 0 && fps.1 > 0).then(|| fps.0 as f64 / fps.1 as f64);

                    descriptor.video = Some(VideoStreamInfo {
                        index,
                        width,
                        height,
                        aspect,
                        frame_rate,
                        time_base,
                        codec: decoder
                            .codec()
                            .map(|c| c.name().to_string())
                            .unwrap_or_else(|| "unknown".to_string()),
                    });
                    video = Some(VideoDecoder {
                        index,
                        decoder,
                        scaler: None,
                        frame: ffmpeg::frame::Video::empty(),
                        scaled: ffmpeg::frame::Video::empty(),
                        width,
                        height,
                    });
                }
                Type::Audio if audio.len() < MAX_TRACKS => {
                    let context = ffmpeg::codec::context::Context::from_parameters(params)
                        .map_err(codec_error("audio"))?;
                    let decoder = context.decoder().audio().map_err(codec_error("audio"))?;

                    descriptor.audio_tracks.push(AudioTrackInfo {
                        index,
                        time_base,
                        source_rate: decoder.rate(),
                        channels: decoder.channels() as u16,
                        codec: decoder
                            .codec()
                            .map(|c| c.name().to_string())
                            .unwrap_or_else(|| "unknown".to_string()),
                        language: stream.metadata().get("language").map(str::to_string),
                    });
                    audio.push(AudioDecoder {
                        index,
                        decoder,
                        resampler: None,
                    });
                }
                Type::Subtitle
                    if subtitles.len() < MAX_TRACKS && matches!(params.id(), Id::ASS | Id::SSA) =>
                {
                    let header = extradata(&params)
                        .map(|data| String::from_utf8_lossy(&data).into_owned());
                    let context = ffmpeg::codec::context::Context::from_parameters(params)
                        .map_err(codec_error("subtitle"))?;
                    let decoder = context.decoder().subtitle().map_err(codec_error("subtitle"))?;

                    descriptor.subtitle_tracks.push(SubtitleTrackInfo {
                        index,
                        time_base,
                        codec: "ass".into(),
                        language: stream.metadata().get("language").map(str::to_string),
                        header,
                    });
                    subtitles.push(SubtitleDecoder {
                        index,
                        time_base,
                        decoder,
                    });
                }
                Type::Attachment => {
                    let Some(data) = extradata(&params) else {
                        continue;
                    };
                    let metadata = stream.metadata();
                    descriptor.attachments.push(Attachment {
                        name: metadata
                            .get("filename")
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("attachment{}", index)),
                        mime: metadata.get("mimetype").map(str::to_string),
                        data,
                    });
                }
                _ => {}
            }
        }

        if video.is_none() && audio.is_empty() {
            return Err(SourceError::NoStreams);
        }

        descriptor.sample_rate = descriptor
            .audio_tracks
            .first()
            .map(|t| t.source_rate)
            .unwrap_or(0);
        if input.duration() > 0 {
            descriptor.duration = Some(input.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64);
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "ffmpeg".to_string());

        tracing::debug!(
            "ffmpeg opened {}: video {:?}, {} audio, {} subtitle, {} attachment(s)",
            name,
            descriptor.video.as_ref().map(|v| &v.codec),
            audio.len(),
            subtitles.len(),
            descriptor.attachments.len()
        );

        Ok(Self {
            name,
            input,
            descriptor,
            video,
            audio,
            subtitles,
            audio_frame: ffmpeg::frame::Audio::empty(),
            packet: ffmpeg::Packet::empty(),
        })
    }

    fn ensure_resampler(
        track: &mut AudioDecoder,
        frame: &ffmpeg::frame::Audio,
        dst_rate: u32,
    ) -> Result<(), SourceError> {
        let rebuild = match &track.resampler {
            None => true,
            Some(resampler) => {
                let input = resampler.input();
                input.format != frame.format()
                    || input.rate != frame.rate()
                    || input.channel_layout != frame.channel_layout()
            }
        };
        if rebuild {
            let resampler = resampling::Context::get(
                frame.format(),
                frame.channel_layout(),
                frame.rate(),
                ffmpeg::format::Sample::I16(ffmpeg::format::sample::Type::Packed),
                ffmpeg::ChannelLayout::STEREO,
                dst_rate,
            )
            .map_err(|e| SourceError::Decode(format!("resampler: {}", e)))?;
            track.resampler = Some(resampler);
        }
        Ok(())
    }
}

impl VideoDecoder {
    /// Copy the decoded frame into `picture`, scaling when the format or
    /// geometry differs from the opened stream.
    fn export(&mut self, picture: &mut Picture) -> Result<(), SourceError> {
        let frame = &self.frame;
        let direct = frame.format() == Pixel::YUV420P
            && frame.width() == self.width
            && frame.height() == self.height;

        let source = if direct {
            frame
        } else {
            let rebuild = match &self.scaler {
                None => true,
                Some(scaler) => {
                    let input = scaler.input();
                    input.format != frame.format()
                        || input.width != frame.width()
                        || input.height != frame.height()
                }
            };
            if rebuild {
                tracing::debug!(
                    "Scaler {:?} {}x{} -> yuv420p {}x{}",
                    frame.format(),
                    frame.width(),
                    frame.height(),
                    self.width,
                    self.height
                );
                self.scaler = Some(
                    scaling::Context::get(
                        frame.format(),
                        frame.width(),
                        frame.height(),
                        Pixel::YUV420P,
                        self.width,
                        self.height,
                        scaling::Flags::POINT,
                    )
                    .map_err(|e| SourceError::Decode(format!("scaler: {}", e)))?,
                );
            }
            let Some(scaler) = self.scaler.as_mut() else {
                return Err(SourceError::Decode("scaler missing".into()));
            };
            scaler
                .run(frame, &mut self.scaled)
                .map_err(|e| SourceError::Decode(format!("scale: {}", e)))?;
            &self.scaled
        };

        picture.resize(self.width, self.height);
        for plane in 0..3 {
            picture.copy_plane(plane, source.data(plane), source.stride(plane));
        }
        picture.pts = frame.timestamp().or(frame.pts());
        picture.color = color_tag(frame);
        Ok(())
    }
}

impl MediaSource for FfmpegSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn descriptor(&self) -> &MediaDescriptor {
        &self.descriptor
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, SourceError> {
        match self.packet.read(&mut self.input) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => return Ok(None),
            Err(e) => return Err(SourceError::Read(e.to_string())),
        }

        let packet = &self.packet;
        Ok(Some(Packet {
            stream_index: packet.stream(),
            pts: packet.pts(),
            dts: packet.dts(),
            duration: packet.duration(),
            key: packet.is_key(),
            data: packet.data().map(Bytes::copy_from_slice).unwrap_or_default(),
        }))
    }

    fn send_packet(&mut self, packet: &Packet) -> Result<(), SourceError> {
        let mut av_packet = ffmpeg::Packet::copy(&packet.data);
        av_packet.set_stream(packet.stream_index);
        av_packet.set_pts(packet.pts);
        av_packet.set_dts(packet.dts);
        av_packet.set_duration(packet.duration);
        if packet.key {
            av_packet.set_flags(ffmpeg::packet::Flags::KEY);
        }

        let result = if let Some(video) = self
            .video
            .as_mut()
            .filter(|v| v.index == packet.stream_index)
        {
            video.decoder.send_packet(&av_packet)
        } else if let Some(track) = self.audio.iter_mut().find(|t| t.index == packet.stream_index) {
            track.decoder.send_packet(&av_packet)
        } else {
            return Ok(());
        };

        match result {
            Ok(()) => Ok(()),
            // Output must be drained first; the packet is lost, like a corrupt one.
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                tracing::trace!("Decoder full, dropped packet on stream {}", packet.stream_index);
                Ok(())
            }
            Err(e) => Err(SourceError::Decode(e.to_string())),
        }
    }

    fn receive_video(&mut self, picture: &mut Picture) -> Result<bool, SourceError> {
        let Some(video) = self.video.as_mut() else {
            return Ok(false);
        };
        match video.decoder.receive_frame(&mut video.frame) {
            Ok(()) => {}
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                return Ok(false)
            }
            Err(ffmpeg::Error::Eof) => return Ok(false),
            Err(e) => return Err(SourceError::Decode(e.to_string())),
        }
        video.export(picture)?;
        Ok(true)
    }

    fn receive_audio(
        &mut self,
        stream_index: usize,
        block: &mut AudioBlock,
    ) -> Result<bool, SourceError> {
        let dst_rate = self.descriptor.sample_rate;
        let Some(track) = self.audio.iter_mut().find(|t| t.index == stream_index) else {
            return Ok(false);
        };
        let frame = &mut self.audio_frame;
        match track.decoder.receive_frame(frame) {
            Ok(()) => {}
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                return Ok(false)
            }
            Err(ffmpeg::Error::Eof) => return Ok(false),
            Err(e) => return Err(SourceError::Decode(e.to_string())),
        }

        Self::ensure_resampler(track, frame, dst_rate)?;
        let Some(resampler) = track.resampler.as_mut() else {
            return Ok(false);
        };
        let mut output = ffmpeg::frame::Audio::empty();
        resampler
            .run(frame, &mut output)
            .map_err(|e| SourceError::Decode(format!("resample: {}", e)))?;

        let raw = output.data(0);
        let bytes = (output.samples() * 4).min(raw.len());
        block.clear();
        block.pts = frame.timestamp().or(frame.pts());
        block.samples.extend(
            raw[..bytes]
                .chunks_exact(2)
                .map(|b| i16::from_ne_bytes([b[0], b[1]])),
        );
        Ok(true)
    }

    fn decode_subtitles(
        &mut self,
        packet: &Packet,
        events: &mut Vec<SubtitleEvent>,
    ) -> Result<(), SourceError> {
        let Some(track) = self
            .subtitles
            .iter_mut()
            .find(|t| t.index == packet.stream_index)
        else {
            return Ok(());
        };

        let mut av_packet = ffmpeg::Packet::copy(&packet.data);
        av_packet.set_stream(packet.stream_index);
        av_packet.set_pts(packet.pts);
        av_packet.set_dts(packet.dts);
        av_packet.set_duration(packet.duration);

        let mut subtitle = Subtitle::new();
        let got = track
            .decoder
            .decode(&av_packet, &mut subtitle)
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        if !got {
            return Ok(());
        }

        let start_ms = (packet.start_seconds(track.time_base) * 1000.0).round() as i64;
        let duration_ms =
            (track.time_base.ticks_to_seconds(packet.duration) * 1000.0).round() as i64;
        for rect in subtitle.rects() {
            let text = match rect {
                Rect::Ass(ass) => ass.get().to_string(),
                Rect::Text(text) => text.get().to_string(),
                _ => continue,
            };
            events.push(SubtitleEvent {
                start_ms,
                duration_ms,
                text,
            });
        }
        Ok(())
    }

    fn seek(&mut self, seconds: f64) -> Result<(), SourceError> {
        let target = (seconds.max(0.0) * ffmpeg::ffi::AV_TIME_BASE as f64) as i64;
        self.input
            .seek(target, ..)
            .map_err(|e| SourceError::Seek(e.to_string()))
    }

    fn flush(&mut self) {
        if let Some(video) = self.video.as_mut() {
            video.decoder.flush();
        }
        for track in &mut self.audio {
            track.decoder.flush();
        }
        for track in &mut self.subtitles {
            track.decoder.flush();
        }
    }
}
