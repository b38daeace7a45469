// PIXEL CONVERT - decoder output to packed RGBA
//
// Decoders hand out YUV (planar or NV12) or packed RGB; the host uploads RGBA.
// Lookup tables are built once per stream so the per-pixel path is integer only.

use serde::{Deserialize, Serialize};

use crate::error::{MediaError, Result};
use crate::format::PixelFormat;
use crate::frame::{Picture, VideoFrame};

// ============================================================================
// Color Spaces
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorSpace {
    BT601, // SD
    BT709, // HD
}

impl ColorSpace {
    /// BT.709 from 720 lines up, BT.601 below.
    pub fn for_height(height: u32) -> Self {
        if height >= 720 {
            Self::BT709
        } else {
            Self::BT601
        }
    }

    /// Returns (Wr, Wb) where Wg = 1 - Wr - Wb
    pub fn coefficients(&self) -> (f32, f32) {
        match self {
            Self::BT601 => (0.299, 0.114),
            Self::BT709 => (0.2126, 0.0722),
        }
    }

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

// ============================================================================
// Converter
// ============================================================================

pub struct PixelConverter {
    src_format: PixelFormat,
    width: u32,
    height: u32,
    color_space: ColorSpace,
    // Pre-computed lookup tables, 8-bit fixed point
    y_table: [i32; 256],
    u_table_g: [i32; 256],
    u_table_b: [i32; 256],
    v_table_r: [i32; 256],
    v_table_g: [i32; 256],
}

impl PixelConverter {
    /// Converter for frames of one geometry. Deprecated full-range formats
    /// are normalized first.
    pub fn new(src_format: PixelFormat, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(MediaError::Allocation(format!(
                "cannot convert a {}x{} picture",
                width, height
            )));
        }

        let mut converter = Self {
            src_format: src_format.normalized(),
            width,
            height,
            color_space: ColorSpace::for_height(height),
            y_table: [0; 256],
            u_table_g: [0; 256],
            u_table_b: [0; 256],
            v_table_r: [0; 256],
            v_table_g: [0; 256],
        };
        converter.build_tables();
        Ok(converter)
    }

    fn build_tables(&mut self) {
        let matrix = self.color_space.yuv_to_rgb_matrix();

        for i in 0..256 {
            let y = (i as i32) - 16; // Y range: 16-235
            let uv = (i as f32) - 128.0; // U/V centered at 128

            // 16-235 to 0-255, 298/256 ≈ 1.164
            self.y_table[i] = (y * 298) >> 8;

            // Chroma excursion 224 vs 255 folded into the coefficients
            let scale = 255.0 / 224.0 * 256.0;
            self.u_table_g[i] = (uv * matrix[1][1] * scale) as i32;
            self.u_table_b[i] = (uv * matrix[2][1] * scale) as i32;
            self.v_table_r[i] = (uv * matrix[0][2] * scale) as i32;
            self.v_table_g[i] = (uv * matrix[1][2] * scale) as i32;
        }
    }

    pub fn color_space(&self) -> ColorSpace {
        self.color_space
    }

    /// Convert `src` into `dst`, resizing `dst` if needed.
    pub fn convert(&self, src: &VideoFrame, dst: &mut Picture) -> Result<()> {
        if src.format.normalized() != self.src_format {
            return Err(MediaError::Decode(format!(
                "Format mismatch: converter built for {:?}, frame is {:?}",
                self.src_format, src.format
            )));
        }
        if src.width != self.width || src.height != self.height {
            return Err(MediaError::Decode(format!(
                "Size mismatch: converter built for {}x{}, frame is {}x{}",
                self.width, self.height, src.width, src.height
            )));
        }

        let len = self.width as usize * self.height as usize * 4;
        if dst.width != self.width || dst.height != self.height || dst.pixels.len() != len {
            dst.width = self.width;
            dst.height = self.height;
            dst.pixels.resize(len, 0);
        }

        match self.src_format {
            PixelFormat::Yuv420p | PixelFormat::Yuv422p | PixelFormat::Yuv444p => {
                self.planar_yuv_to_rgba(src, &mut dst.pixels)
            }
            PixelFormat::Nv12 => self.nv12_to_rgba(src, &mut dst.pixels),
            PixelFormat::Rgb24 => self.rgb24_to_rgba(src, &mut dst.pixels),
            PixelFormat::Rgba => self.copy_rgba(src, &mut dst.pixels),
            other => {
                return Err(MediaError::Decode(format!(
                    "Unsupported conversion: {:?} -> RGBA",
                    other
                )))
            }
        }

        dst.serial += 1;
        Ok(())
    }

    #[inline]
    fn pixel(&self, y: u8, u: u8, v: u8, out: &mut [u8]) {
        let (y, u, v) = (y as usize, u as usize, v as usize);
        let y_contrib = self.y_table[y];
        out[0] = (y_contrib + (self.v_table_r[v] >> 8)).clamp(0, 255) as u8;
        out[1] = (y_contrib + (self.u_table_g[u] >> 8) + (self.v_table_g[v] >> 8)).clamp(0, 255) as u8;
        out[2] = (y_contrib + (self.u_table_b[u] >> 8)).clamp(0, 255) as u8;
        out[3] = 255;
    }

    fn planar_yuv_to_rgba(&self, src: &VideoFrame, rgba: &mut [u8]) {
        let (sx, sy) = self.src_format.chroma_shift();
        let (y_plane, u_plane, v_plane) = (src.plane(0), src.plane(1), src.plane(2));
        let (y_stride, c_stride) = (src.linesize(0), src.linesize(1));
        let width = self.width as usize;

        for row in 0..self.height as usize {
            let y_row = row * y_stride;
            let c_row = (row >> sy) * c_stride;
            let dst_row = row * width * 4;

            for x in 0..width {
                let c = c_row + (x >> sx);
                let at = dst_row + x * 4;
                self.pixel(y_plane[y_row + x], u_plane[c], v_plane[c], &mut rgba[at..at + 4]);
            }
        }
    }

    fn nv12_to_rgba(&self, src: &VideoFrame, rgba: &mut [u8]) {
        let (y_plane, uv_plane) = (src.plane(0), src.plane(1));
        let (y_stride, uv_stride) = (src.linesize(0), src.linesize(1));
        let width = self.width as usize;

        for row in 0..self.height as usize {
            let y_row = row * y_stride;
            let uv_row = (row / 2) * uv_stride;
            let dst_row = row * width * 4;

            for x in 0..width {
                let uv = uv_row + (x / 2) * 2;
                let at = dst_row + x * 4;
                self.pixel(y_plane[y_row + x], uv_plane[uv], uv_plane[uv + 1], &mut rgba[at..at + 4]);
            }
        }
    }

    fn rgb24_to_rgba(&self, src: &VideoFrame, rgba: &mut [u8]) {
        let plane = src.plane(0);
        let stride = src.linesize(0);
        let width = self.width as usize;

        for row in 0..self.height as usize {
            let src_row = &plane[row * stride..row * stride + width * 3];
            let dst_row = &mut rgba[row * width * 4..(row + 1) * width * 4];
            for (rgb, out) in src_row.chunks_exact(3).zip(dst_row.chunks_exact_mut(4)) {
                out[..3].copy_from_slice(rgb);
                out[3] = 255;
            }
        }
    }

    fn copy_rgba(&self, src: &VideoFrame, rgba: &mut [u8]) {
        let plane = src.plane(0);
        let stride = src.linesize(0);
        let line = self.width as usize * 4;

        for row in 0..self.height as usize {
            rgba[row * line..(row + 1) * line].copy_from_slice(&plane[row * stride..row * stride + line]);
        }
    }
}
