// PIXEL CONVERT - YUV 4:2:0 to XRGB8888
//
// Decoders hand us planar YUV 4:2:0.
// The host wants packed XRGB8888 (0xFFRRGGBB per native-endian u32).
// The matrix is picked here rather than in the decoder library so the
// colorspace override behaves the same for every back end.

use crate::config::ColorSpaceSetting;
use crate::media::BYTES_PER_PIXEL;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConvertError {
    #[error("picture is {got_w}x{got_h}, converter output expects {want_w}x{want_h}")]
    SizeMismatch {
        got_w: u32,
        got_h: u32,
        want_w: u32,
        want_h: u32,
    },

    #[error("output buffer holds {got} bytes, frame needs {need}")]
    OutputTooSmall { got: usize, need: usize },

    #[error("plane {0} is shorter than its stride and height imply")]
    ShortPlane(usize),
}

// ============================================================================
// Color Matrices
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMatrix {
    Bt601,
    Bt709,
    Fcc,
    Smpte240m,
}

impl ColorMatrix {
    /// Returns (Wr, Wb) where Wg = 1 - Wr - Wb
    pub fn coefficients(&self) -> (f32, f32) {
        match self {
            Self::Bt601 => (0.299, 0.114),
            Self::Bt709 => (0.2126, 0.0722),
            Self::Fcc => (0.30, 0.11),
            Self::Smpte240m => (0.212, 0.087),
        }
    }

    /// Rows are R, G, B; columns are Y, Cb, Cr.
    pub fn yuv_to_rgb_matrix(&self) -> [[f32; 3]; 3] {
        let (wr, wb) = self.coefficients();
        let wg = 1.0 - wr - wb;

        // R = Y + 2*(1-Wr)*Cr
        // G = Y - 2*Wb*(1-Wb)/Wg*Cb - 2*Wr*(1-Wr)/Wg*Cr
        // B = Y + 2*(1-Wb)*Cb
        let cr_r = 2.0 * (1.0 - wr);
        let cb_g = -2.0 * wb * (1.0 - wb) / wg;
        let cr_g = -2.0 * wr * (1.0 - wr) / wg;
        let cb_b = 2.0 * (1.0 - wb);

        [[1.0, 0.0, cr_r], [1.0, cb_g, cr_g], [1.0, cb_b, 0.0]]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorRange {
    /// Y in 16..=235, chroma in 16..=240
    #[default]
    Limited,
    Full,
}

/// Color information a decoder attached to a picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColorTag {
    pub matrix: Option<ColorMatrix>,
    pub range: ColorRange,
}

/// Pick the conversion matrix for a stream.
///
/// `Auto` uses the stream's own tag, then falls back to BT.709 for HD
/// geometry and BT.601 for SD.
pub fn select_matrix(
    setting: ColorSpaceSetting,
    tagged: Option<ColorMatrix>,
    width: u32,
    height: u32,
) -> ColorMatrix {
    match setting {
        ColorSpaceSetting::Bt709 => ColorMatrix::Bt709,
        ColorSpaceSetting::Bt601 => ColorMatrix::Bt601,
        ColorSpaceSetting::Fcc => ColorMatrix::Fcc,
        ColorSpaceSetting::Smpte240m => ColorMatrix::Smpte240m,
        ColorSpaceSetting::Auto => tagged.unwrap_or(if width >= 1280 || height > 576 {
            ColorMatrix::Bt709
        } else {
            ColorMatrix::Bt601
        }),
    }
}

// ============================================================================
// Picture
// ============================================================================

/// Planar YUV 4:2:0 picture as produced by a source. Reused between frames.
#[derive(Debug, Clone, Default)]
pub struct Picture {
    pub width: u32,
    pub height: u32,
    /// Best-effort PTS in stream time-base ticks
    pub pts: Option<i64>,
    pub planes: [Vec<u8>; 3],
    pub strides: [usize; 3],
    pub color: ColorTag,
}

impl Picture {
    pub fn chroma_width(&self) -> usize {
        (self.width as usize + 1) / 2
    }

    pub fn chroma_height(&self) -> usize {
        (self.height as usize + 1) / 2
    }

    /// Size planes for `width` x `height` with tight strides.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        let cw = self.chroma_width();
        let ch = self.chroma_height();
        self.strides = [width as usize, cw, cw];
        self.planes[0].resize(width as usize * height as usize, 16);
        self.planes[1].resize(cw * ch, 128);
        self.planes[2].resize(cw * ch, 128);
    }

    /// Copy one plane from a strided source, keeping this picture's stride.
    pub fn copy_plane(&mut self, index: usize, src: &[u8], src_stride: usize) {
        let (w, h) = if index == 0 {
            (self.width as usize, self.height as usize)
        } else {
            (self.chroma_width(), self.chroma_height())
        };
        let dst_stride = self.strides[index];
        for row in 0..h {
            let s = row * src_stride;
            let d = row * dst_stride;
            if s + w > src.len() {
                break;
            }
            self.planes[index][d..d + w].copy_from_slice(&src[s..s + w]);
        }
    }
}

// ============================================================================
// Converter
// ============================================================================

const FIX_SHIFT: u32 = 16;
const FIX_ONE: f32 = (1 << FIX_SHIFT) as f32;

pub struct PixelConverter {
    matrix: ColorMatrix,
    range: ColorRange,
    // Pre-computed 16.16 fixed point lookup tables
    y_table: [i32; 256],
    u_table_g: [i32; 256],
    u_table_b: [i32; 256],
    v_table_r: [i32; 256],
    v_table_g: [i32; 256],
}

impl PixelConverter {
    pub fn new(matrix: ColorMatrix, range: ColorRange) -> Self {
        let mut converter = Self {
            matrix,
            range,
            y_table: [0; 256],
            u_table_g: [0; 256],
            u_table_b: [0; 256],
            v_table_r: [0; 256],
            v_table_g: [0; 256],
        };
        converter.build_tables();
        converter
    }

    pub fn matrix(&self) -> ColorMatrix {
        self.matrix
    }

    pub fn range(&self) -> ColorRange {
        self.range
    }

    /// Whether this converter already matches the requested settings.
    pub fn matches(&self, matrix: ColorMatrix, range: ColorRange) -> bool {
        self.matrix == matrix && self.range == range
    }

    fn build_tables(&mut self) {
        let m = self.matrix.yuv_to_rgb_matrix();
        let (y_offset, y_scale, c_scale) = match self.range {
            ColorRange::Limited => (16.0, 255.0 / 219.0, 255.0 / 224.0),
            ColorRange::Full => (0.0, 1.0, 1.0),
        };
        let half = (1 << (FIX_SHIFT - 1)) as i32;

        for i in 0..256 {
            let y = (i as f32 - y_offset) * y_scale;
            let c = (i as f32 - 128.0) * c_scale;

            // Rounding bias folded into the luma term
            self.y_table[i] = (y * FIX_ONE).round() as i32 + half;
            self.u_table_g[i] = (c * m[1][1] * FIX_ONE).round() as i32;
            self.u_table_b[i] = (c * m[2][1] * FIX_ONE).round() as i32;
            self.v_table_r[i] = (c * m[0][2] * FIX_ONE).round() as i32;
            self.v_table_g[i] = (c * m[1][2] * FIX_ONE).round() as i32;
        }
    }

    #[inline]
    fn pixel(&self, y: u8, u: u8, v: u8) -> u32 {
        let y = self.y_table[y as usize];
        let r = ((y + self.v_table_r[v as usize]) >> FIX_SHIFT).clamp(0, 255) as u32;
        let g = ((y + self.u_table_g[u as usize] + self.v_table_g[v as usize]) >> FIX_SHIFT)
            .clamp(0, 255) as u32;
        let b = ((y + self.u_table_b[u as usize]) >> FIX_SHIFT).clamp(0, 255) as u32;
        0xFF00_0000 | (r << 16) | (g << 8) | b
    }

    /// Convert `pic` into tightly packed XRGB8888 rows in `out`.
    pub fn convert(&self, pic: &Picture, out: &mut [u8]) -> Result<(), ConvertError> {
        let width = pic.width as usize;
        let height = pic.height as usize;
        let need = width * height * BYTES_PER_PIXEL;
        if out.len() < need {
            return Err(ConvertError::OutputTooSmall {
                got: out.len(),
                need,
            });
        }
        let (cw, ch) = (pic.chroma_width(), pic.chroma_height());
        for (index, cols, rows) in [(0, width, height), (1, cw, ch), (2, cw, ch)] {
            if rows > 0 && pic.planes[index].len() < (rows - 1) * pic.strides[index] + cols {
                return Err(ConvertError::ShortPlane(index));
            }
        }

        let [y_plane, u_plane, v_plane] = &pic.planes;
        let [y_stride, u_stride, v_stride] = pic.strides;

        for (row, dst_row) in out[..need]
            .chunks_exact_mut(width * BYTES_PER_PIXEL)
            .enumerate()
        {
            let y_row = &y_plane[row * y_stride..];
            let u_row = &u_plane[(row / 2) * u_stride..];
            let v_row = &v_plane[(row / 2) * v_stride..];

            for (x, dst) in dst_row.chunks_exact_mut(BYTES_PER_PIXEL).enumerate() {
                let px = self.pixel(y_row[x], u_row[x / 2], v_row[x / 2]);
                dst.copy_from_slice(&px.to_ne_bytes());
            }
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, y: u8, u: u8, v: u8) -> Picture {
        let mut pic = Picture::default();
        pic.resize(width, height);
        pic.planes[0].fill(y);
        pic.planes[1].fill(u);
        pic.planes[2].fill(v);
        pic
    }

    fn first_pixel(conv: &PixelConverter, pic: &Picture) -> (u8, u8, u8) {
        let mut out = vec![0u8; pic.width as usize * pic.height as usize * 4];
        conv.convert(pic, &mut out).unwrap();
        let px = u32::from_ne_bytes([out[0], out[1], out[2], out[3]]);
        assert_eq!(px >> 24, 0xFF);
        ((px >> 16) as u8, (px >> 8) as u8, px as u8)
    }

    #[test]
    fn test_limited_range_black_and_white() {
        let conv = PixelConverter::new(ColorMatrix::Bt709, ColorRange::Limited);
        assert_eq!(first_pixel(&conv, &solid(4, 4, 16, 128, 128)), (0, 0, 0));
        assert_eq!(first_pixel(&conv, &solid(4, 4, 235, 128, 128)), (255, 255, 255));
    }

    #[test]
    fn test_full_range_passthrough_gray() {
        let conv = PixelConverter::new(ColorMatrix::Bt601, ColorRange::Full);
        assert_eq!(first_pixel(&conv, &solid(2, 2, 100, 128, 128)), (100, 100, 100));
    }

    #[test]
    fn test_bt601_primary_red() {
        // Limited-range BT.601 encoding of pure red
        let conv = PixelConverter::new(ColorMatrix::Bt601, ColorRange::Limited);
        let (r, g, b) = first_pixel(&conv, &solid(2, 2, 81, 90, 240));
        assert!(r >= 250, "r = {}", r);
        assert!(g <= 5, "g = {}", g);
        assert!(b <= 5, "b = {}", b);
    }

    #[test]
    fn test_odd_geometry() {
        let conv = PixelConverter::new(ColorMatrix::Bt601, ColorRange::Limited);
        let pic = solid(5, 3, 235, 128, 128);
        assert_eq!(pic.planes[1].len(), 3 * 2);
        let mut out = vec![0u8; 5 * 3 * 4];
        conv.convert(&pic, &mut out).unwrap();
        assert!(out.chunks_exact(4).all(|p| u32::from_ne_bytes([p[0], p[1], p[2], p[3]]) == 0xFFFF_FFFF));
    }

    #[test]
    fn test_output_too_small() {
        let conv = PixelConverter::new(ColorMatrix::Bt601, ColorRange::Limited);
        let pic = solid(4, 4, 16, 128, 128);
        let mut out = vec![0u8; 10];
        assert_eq!(
            conv.convert(&pic, &mut out),
            Err(ConvertError::OutputTooSmall { got: 10, need: 64 })
        );
    }

    #[test]
    fn test_auto_matrix_selection() {
        use ColorSpaceSetting::*;
        assert_eq!(select_matrix(Auto, None, 1280, 720), ColorMatrix::Bt709);
        assert_eq!(select_matrix(Auto, None, 720, 576), ColorMatrix::Bt601);
        assert_eq!(select_matrix(Auto, None, 720, 578), ColorMatrix::Bt709);
        assert_eq!(
            select_matrix(Auto, Some(ColorMatrix::Smpte240m), 640, 480),
            ColorMatrix::Smpte240m
        );
        assert_eq!(select_matrix(Fcc, Some(ColorMatrix::Bt709), 1920, 1080), ColorMatrix::Fcc);
    }

    #[test]
    fn test_copy_plane_respects_strides() {
        let mut pic = Picture::default();
        pic.resize(2, 2);
        let src = [1, 2, 99, 99, 3, 4, 99, 99];
        pic.copy_plane(0, &src, 4);
        assert_eq!(pic.planes[0], vec![1, 2, 3, 4]);
    }
}
