// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! PNG export of a final swapchain image.

use crate::config::ScalingType;
use crate::error::{Error, Result};
use crate::graphics::format::dxgi;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Pixels copied back from the GPU. Rows are `row_pitch` bytes apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadbackImage {
    pub width: u32,
    pub height: u32,
    pub row_pitch: u32,
    pub format: i64,
    pub data: Vec<u8>,
}

fn unorm8(value: u32, max: u32) -> u8 {
    ((value * 255 + max / 2) / max) as u8
}

fn float8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn convert_pixel(format: i64, texel: &[u8], out: &mut [u8]) -> Result<()> {
    match format {
        dxgi::R8G8B8A8_TYPELESS | dxgi::R8G8B8A8_UNORM | dxgi::R8G8B8A8_UNORM_SRGB => {
            out.copy_from_slice(&texel[..4]);
        }
        dxgi::B8G8R8A8_TYPELESS | dxgi::B8G8R8A8_UNORM | dxgi::B8G8R8A8_UNORM_SRGB => {
            out.copy_from_slice(&[texel[2], texel[1], texel[0], texel[3]]);
        }
        dxgi::B8G8R8X8_TYPELESS | dxgi::B8G8R8X8_UNORM | dxgi::B8G8R8X8_UNORM_SRGB => {
            out.copy_from_slice(&[texel[2], texel[1], texel[0], 255]);
        }
        dxgi::R10G10B10A2_TYPELESS | dxgi::R10G10B10A2_UNORM => {
            let v = u32::from_le_bytes([texel[0], texel[1], texel[2], texel[3]]);
            out[0] = unorm8(v & 0x3ff, 0x3ff);
            out[1] = unorm8((v >> 10) & 0x3ff, 0x3ff);
            out[2] = unorm8((v >> 20) & 0x3ff, 0x3ff);
            out[3] = unorm8(v >> 30, 0x3);
        }
        dxgi::R16G16B16A16_UNORM => {
            for (c, o) in texel.chunks_exact(2).zip(out.iter_mut()) {
                *o = unorm8(u16::from_le_bytes([c[0], c[1]]) as u32, 0xffff);
            }
        }
        dxgi::R16G16B16A16_TYPELESS | dxgi::R16G16B16A16_FLOAT => {
            for (c, o) in texel.chunks_exact(2).zip(out.iter_mut()) {
                *o = float8(half::f16::from_le_bytes([c[0], c[1]]).to_f32());
            }
        }
        dxgi::R32G32B32A32_TYPELESS | dxgi::R32G32B32A32_FLOAT => {
            for (c, o) in texel.chunks_exact(4).zip(out.iter_mut()) {
                *o = float8(f32::from_le_bytes([c[0], c[1], c[2], c[3]]));
            }
        }
        format => return Err(Error::UnsupportedFormat { format }),
    }
    Ok(())
}

impl ReadbackImage {
    /// Tightly packed RGBA8 rows.
    pub fn to_rgba8(&self) -> Result<Vec<u8>> {
        let bpp = crate::graphics::format::bytes_per_pixel(self.format)
            .ok_or(Error::UnsupportedFormat { format: self.format })? as usize;
        let width = self.width as usize;
        let mut rgba = vec![0; width * self.height as usize * 4];
        for (y, out_row) in rgba.chunks_exact_mut(width * 4).enumerate() {
            let start = y * self.row_pitch as usize;
            let row = self
                .data
                .get(start..start + width * bpp)
                .ok_or(Error::UploadSizeMismatch {
                    expected: start + width * bpp,
                    actual: self.data.len(),
                })?;
            for (texel, out) in row.chunks_exact(bpp).zip(out_row.chunks_exact_mut(4)) {
                convert_pixel(self.format, texel, out)?;
            }
        }
        Ok(rgba)
    }

    pub fn write_png(&self, writer: impl Write) -> Result<()> {
        let rgba = self.to_rgba8()?;
        let mut encoder = png::Encoder::new(writer, self.width, self.height);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        let mut png_writer = encoder.write_header()?;
        png_writer.write_image_data(&rgba)?;
        png_writer.finish()?;
        Ok(())
    }
}

/// Upscaling parameters that end up in the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingTag {
    pub scaling_type: ScalingType,
    pub scaling: i32,
    pub sharpness: i32,
}

/// `<app>_<YYYYmmdd_HHMMSS>[_FSR_<scale>_<sharpness>].png`
pub fn file_name(application: &str, timestamp: &chrono::NaiveDateTime, tag: Option<ScalingTag>) -> String {
    let mut name = format!("{application}_{}", timestamp.format("%Y%m%d_%H%M%S"));
    if let Some(tag) = tag
        && let Some(kind) = tag.scaling_type.name()
    {
        name.push_str(&format!("_{kind}_{}_{}", tag.scaling, tag.sharpness));
    }
    name.push_str(".png");
    name
}

/// Writes `image` into `directory`, returning the path of the new file.
pub fn save(image: &ReadbackImage, directory: &Path, application: &str, tag: Option<ScalingTag>) -> Result<PathBuf> {
    let now = chrono::Local::now().naive_local();
    let path = directory.join(file_name(application, &now, tag));
    let file = std::fs::File::create(&path)?;
    image.write_png(std::io::BufWriter::new(file))?;
    logwise::info_sync!(
        "Screenshot saved to {path}",
        path = logwise::privacy::LogIt(&path)
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(format: i64, bpp: u32, data: Vec<u8>) -> ReadbackImage {
        ReadbackImage {
            width: 1,
            height: 1,
            row_pitch: bpp,
            format,
            data,
        }
    }

    #[test]
    fn r10g10b10a2_expands_to_eight_bits() {
        let packed: u32 = 0x3ff | (0x200 << 10) | (0 << 20) | (0x3 << 30);
        let rgba = image(dxgi::R10G10B10A2_UNORM, 4, packed.to_le_bytes().to_vec())
            .to_rgba8()
            .unwrap();
        assert_eq!(rgba, vec![255, 128, 0, 255]);
    }

    #[test]
    fn bgrx_is_swizzled_and_opaque() {
        let rgba = image(dxgi::B8G8R8X8_UNORM, 4, vec![10, 20, 30, 0]).to_rgba8().unwrap();
        assert_eq!(rgba, vec![30, 20, 10, 255]);
    }

    #[test]
    fn half_floats_are_clamped() {
        let mut data = Vec::new();
        for v in [2.0f32, 0.5, -1.0, 1.0] {
            data.extend_from_slice(&half::f16::from_f32(v).to_le_bytes());
        }
        let rgba = image(dxgi::R16G16B16A16_FLOAT, 8, data).to_rgba8().unwrap();
        assert_eq!(rgba, vec![255, 128, 0, 255]);
    }

    #[test]
    fn row_pitch_padding_is_skipped() {
        let image = ReadbackImage {
            width: 1,
            height: 2,
            row_pitch: 8,
            format: dxgi::R8G8B8A8_UNORM,
            data: vec![1, 2, 3, 4, 9, 9, 9, 9, 5, 6, 7, 8],
        };
        assert_eq!(image.to_rgba8().unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn depth_formats_are_rejected() {
        let result = image(dxgi::D32_FLOAT, 4, vec![0; 4]).to_rgba8();
        assert!(matches!(result, Err(Error::UnsupportedFormat { .. })));
    }

    #[test]
    fn file_names_carry_scaling() {
        let timestamp = chrono::NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(7, 5, 1)
            .unwrap();
        let tag = ScalingTag {
            scaling_type: ScalingType::Fsr,
            scaling: 150,
            sharpness: 20,
        };
        assert_eq!(file_name("game", &timestamp, Some(tag)), "game_20240309_070501_FSR_150_20.png");
        let off = ScalingTag {
            scaling_type: ScalingType::None,
            ..tag
        };
        assert_eq!(file_name("game", &timestamp, Some(off)), "game_20240309_070501.png");
        assert_eq!(file_name("game", &timestamp, None), "game_20240309_070501.png");
    }

    #[test]
    fn png_has_signature() {
        let mut out = Vec::new();
        image(dxgi::R8G8B8A8_UNORM, 4, vec![1, 2, 3, 4]).write_png(&mut out).unwrap();
        assert_eq!(&out[..8], &[137, 80, 78, 71, 13, 10, 26, 10]);
    }
}
