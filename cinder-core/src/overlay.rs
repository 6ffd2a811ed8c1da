//! Subtitle Overlay
//!
//! Burns subtitle events into converted frames before they are queued.
//!
//! - One [`EventTrack`] per subtitle stream, flushed on seek
//! - Fonts from container attachments handed to the rasterizer
//! - Rasterization itself sits behind [`SubtitleRenderer`]; it returns
//!   coverage bitmaps that are alpha-blended here

use crate::media::{MediaDescriptor, BYTES_PER_PIXEL};

// ============================================================================
// Events
// ============================================================================

/// One decoded subtitle event, e.g. an ASS `Dialogue:` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitleEvent {
    pub start_ms: i64,
    pub duration_ms: i64,
    pub text: String,
}

impl SubtitleEvent {
    pub fn end_ms(&self) -> i64 {
        self.start_ms + self.duration_ms
    }

    pub fn is_active_at(&self, time_ms: i64) -> bool {
        time_ms >= self.start_ms && time_ms < self.end_ms()
    }
}

/// Timed events of a single subtitle stream.
#[derive(Debug, Default)]
pub struct EventTrack {
    header: Option<String>,
    events: Vec<SubtitleEvent>,
}

impl EventTrack {
    pub fn new(header: Option<String>) -> Self {
        Self {
            header,
            events: Vec::new(),
        }
    }

    /// Codec private data, the `[Script Info]`/`[V4+ Styles]` block for ASS.
    pub fn header(&self) -> Option<&str> {
        self.header.as_deref()
    }

    /// Add an event, ignoring exact repeats (Matroska re-sends them after seeks).
    pub fn add(&mut self, event: SubtitleEvent) {
        if self.events.contains(&event) {
            return;
        }
        let pos = self
            .events
            .iter()
            .position(|e| e.start_ms > event.start_ms)
            .unwrap_or(self.events.len());
        self.events.insert(pos, event);
    }

    pub fn active_at(&self, time_ms: i64) -> impl Iterator<Item = &SubtitleEvent> {
        self.events.iter().filter(move |e| e.is_active_at(time_ms))
    }

    pub fn events(&self) -> &[SubtitleEvent] {
        &self.events
    }

    /// Forget events that ended before `time_ms`.
    pub fn prune_before(&mut self, time_ms: i64) {
        self.events.retain(|e| e.end_ms() >= time_ms);
    }

    pub fn flush(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

// ============================================================================
// Rasterizer Boundary
// ============================================================================

/// Coverage bitmap in libass conventions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayImage {
    pub width: usize,
    pub height: usize,
    pub stride: usize,
    /// One coverage byte per pixel, `stride` bytes per row
    pub bitmap: Vec<u8>,
    /// 0xRRGGBBAA where AA is transparency (0 = opaque)
    pub color: u32,
    pub dst_x: i32,
    pub dst_y: i32,
}

/// Turns the active events of a track into bitmaps.
pub trait SubtitleRenderer: Send {
    /// Register an embedded font.
    fn add_font(&mut self, name: &str, data: &[u8]);

    fn set_frame_size(&mut self, width: u32, height: u32);

    /// Append the images for `time_ms` to `out`.
    fn render(&mut self, track: &EventTrack, time_ms: i64, out: &mut Vec<OverlayImage>);
}

/// Alpha-blend images onto an XRGB8888 frame of `width` x `height`.
pub fn blend_images(frame: &mut [u8], width: usize, height: usize, images: &[OverlayImage]) {
    let pitch = width * BYTES_PER_PIXEL;

    for img in images {
        if img.width == 0 || img.height == 0 {
            continue;
        }
        let needed = (img.height - 1) * img.stride + img.width;
        if img.stride < img.width || img.bitmap.len() < needed {
            tracing::warn!(
                "Skipping {}x{} subtitle image with {} byte bitmap",
                img.width,
                img.height,
                img.bitmap.len()
            );
            continue;
        }

        let r = (img.color >> 24) & 0xff;
        let g = (img.color >> 16) & 0xff;
        let b = (img.color >> 8) & 0xff;
        let a = 255 - (img.color & 0xff);

        for y in 0..img.height {
            let fy = img.dst_y + y as i32;
            if fy < 0 || fy as usize >= height {
                continue;
            }
            let Some(src_row) = img.bitmap.get(y * img.stride..y * img.stride + img.width) else {
                continue;
            };
            let Some(dst_row) = frame.get_mut(fy as usize * pitch..(fy as usize + 1) * pitch)
            else {
                continue;
            };

            for x in 0..img.width {
                let fx = img.dst_x + x as i32;
                if fx < 0 || fx as usize >= width {
                    continue;
                }
                let src_alpha = ((src_row[x] as u32 * (a + 1)) >> 8) + 1;
                let dst_alpha = 256 - src_alpha;

                let px = &mut dst_row[fx as usize * 4..fx as usize * 4 + 4];
                let dst = u32::from_ne_bytes([px[0], px[1], px[2], px[3]]);
                let dst_r = (r * src_alpha + ((dst >> 16) & 0xff) * dst_alpha) >> 8;
                let dst_g = (g * src_alpha + ((dst >> 8) & 0xff) * dst_alpha) >> 8;
                let dst_b = (b * src_alpha + (dst & 0xff) * dst_alpha) >> 8;

                let out = 0xFF00_0000 | (dst_r << 16) | (dst_g << 8) | dst_b;
                px.copy_from_slice(&out.to_ne_bytes());
            }
        }
    }
}

// ============================================================================
// Overlay
// ============================================================================

/// Per-session subtitle state owned by the decode thread.
pub struct SubtitleOverlay {
    /// Indexed like `MediaDescriptor::subtitle_tracks`
    tracks: Vec<EventTrack>,
    renderer: Option<Box<dyn SubtitleRenderer>>,
    images: Vec<OverlayImage>,
    width: usize,
    height: usize,
}

impl SubtitleOverlay {
    pub fn new(descriptor: &MediaDescriptor, mut renderer: Option<Box<dyn SubtitleRenderer>>) -> Self {
        let tracks = descriptor
            .subtitle_tracks
            .iter()
            .map(|t| EventTrack::new(t.header.clone()))
            .collect::<Vec<_>>();

        let (width, height) = descriptor
            .video
            .as_ref()
            .map(|v| (v.width, v.height))
            .unwrap_or((0, 0));

        if let Some(r) = renderer.as_mut() {
            r.set_frame_size(width, height);
            for font in descriptor.font_attachments() {
                tracing::debug!("Registering font attachment {}", font.name);
                r.add_font(&font.name, &font.data);
            }
        }

        Self {
            tracks,
            renderer,
            images: Vec::new(),
            width: width as usize,
            height: height as usize,
        }
    }

    /// Overlay rendering only happens with a rasterizer and at least one track.
    pub fn is_active(&self) -> bool {
        self.renderer.is_some() && !self.tracks.is_empty()
    }

    pub fn track(&self, slot: usize) -> Option<&EventTrack> {
        self.tracks.get(slot)
    }

    pub fn push_events(&mut self, slot: usize, events: impl IntoIterator<Item = SubtitleEvent>) {
        if let Some(track) = self.tracks.get_mut(slot) {
            for event in events {
                track.add(event);
            }
        }
    }

    /// Burn the events of `slot` active at `time_ms` into `frame`.
    /// Returns the number of images blended.
    pub fn composite(&mut self, slot: usize, time_ms: i64, frame: &mut [u8]) -> usize {
        let (Some(renderer), Some(track)) = (self.renderer.as_mut(), self.tracks.get_mut(slot))
        else {
            return 0;
        };

        track.prune_before(time_ms);
        self.images.clear();
        renderer.render(track, time_ms, &mut self.images);
        blend_images(frame, self.width, self.height, &self.images);
        self.images.len()
    }

    /// Drop pending events of every track, used after a seek.
    pub fn flush(&mut self) {
        for track in &mut self.tracks {
            track.flush();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
