// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Texture formats.
//!
//! Both backends speak DXGI, and OpenXR carries the DXGI value in `XrSwapchainCreateInfo::format`,
//! so formats travel as plain `i64`s.

use crate::graphics::ViewKind;

/// DXGI_FORMAT values used by the layer.
pub mod dxgi {
    pub const UNKNOWN: i64 = 0;
    pub const R32G32B32A32_TYPELESS: i64 = 1;
    pub const R32G32B32A32_FLOAT: i64 = 2;
    pub const R16G16B16A16_TYPELESS: i64 = 9;
    pub const R16G16B16A16_FLOAT: i64 = 10;
    pub const R16G16B16A16_UNORM: i64 = 11;
    pub const R10G10B10A2_TYPELESS: i64 = 23;
    pub const R10G10B10A2_UNORM: i64 = 24;
    pub const R8G8B8A8_TYPELESS: i64 = 27;
    pub const R8G8B8A8_UNORM: i64 = 28;
    pub const R8G8B8A8_UNORM_SRGB: i64 = 29;
    pub const D32_FLOAT_S8X24_UINT: i64 = 20;
    pub const D32_FLOAT: i64 = 40;
    pub const D24_UNORM_S8_UINT: i64 = 45;
    pub const D16_UNORM: i64 = 55;
    pub const B8G8R8A8_UNORM: i64 = 87;
    pub const B8G8R8X8_UNORM: i64 = 88;
    pub const B8G8R8A8_TYPELESS: i64 = 90;
    pub const B8G8R8A8_UNORM_SRGB: i64 = 91;
    pub const B8G8R8X8_TYPELESS: i64 = 92;
    pub const B8G8R8X8_UNORM_SRGB: i64 = 93;
}

/// API-neutral format names used by stages for their private textures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R32G32B32A32Float,
    R16G16B16A16Unorm,
    R10G10B10A2Unorm,
    R8G8B8A8Unorm,
}

impl TextureFormat {
    pub const fn dxgi(self) -> i64 {
        match self {
            TextureFormat::R32G32B32A32Float => dxgi::R32G32B32A32_FLOAT,
            TextureFormat::R16G16B16A16Unorm => dxgi::R16G16B16A16_UNORM,
            TextureFormat::R10G10B10A2Unorm => dxgi::R10G10B10A2_UNORM,
            TextureFormat::R8G8B8A8Unorm => dxgi::R8G8B8A8_UNORM,
        }
    }
}

pub fn is_srgb(format: i64) -> bool {
    matches!(
        format,
        dxgi::R8G8B8A8_UNORM_SRGB | dxgi::B8G8R8A8_UNORM_SRGB | dxgi::B8G8R8X8_UNORM_SRGB
    )
}

pub fn is_depth(format: i64) -> bool {
    matches!(
        format,
        dxgi::D32_FLOAT_S8X24_UINT | dxgi::D32_FLOAT | dxgi::D24_UNORM_S8_UINT | dxgi::D16_UNORM
    )
}

/// Format a view of `kind` should use for a texture stored as `format`.
///
/// Typeless storage is viewed as its UNORM variant. Unordered access views cannot be sRGB
/// and use the linear variant instead.
pub fn view_format(format: i64, kind: ViewKind) -> i64 {
    let typed = match format {
        dxgi::R32G32B32A32_TYPELESS => dxgi::R32G32B32A32_FLOAT,
        dxgi::R16G16B16A16_TYPELESS => dxgi::R16G16B16A16_FLOAT,
        dxgi::R10G10B10A2_TYPELESS => dxgi::R10G10B10A2_UNORM,
        dxgi::R8G8B8A8_TYPELESS => dxgi::R8G8B8A8_UNORM,
        dxgi::B8G8R8A8_TYPELESS => dxgi::B8G8R8A8_UNORM,
        dxgi::B8G8R8X8_TYPELESS => dxgi::B8G8R8X8_UNORM,
        other => other,
    };
    if kind != ViewKind::UnorderedAccess {
        return typed;
    }
    match typed {
        dxgi::R8G8B8A8_UNORM_SRGB => dxgi::R8G8B8A8_UNORM,
        dxgi::B8G8R8A8_UNORM_SRGB => dxgi::B8G8R8A8_UNORM,
        dxgi::B8G8R8X8_UNORM_SRGB => dxgi::B8G8R8X8_UNORM,
        other => other,
    }
}

/// Bytes per texel for the color formats the layer can read back.
pub fn bytes_per_pixel(format: i64) -> Option<u32> {
    match format {
        dxgi::R32G32B32A32_TYPELESS | dxgi::R32G32B32A32_FLOAT => Some(16),
        dxgi::R16G16B16A16_TYPELESS | dxgi::R16G16B16A16_FLOAT | dxgi::R16G16B16A16_UNORM => Some(8),
        dxgi::R10G10B10A2_TYPELESS
        | dxgi::R10G10B10A2_UNORM
        | dxgi::R8G8B8A8_TYPELESS
        | dxgi::R8G8B8A8_UNORM
        | dxgi::R8G8B8A8_UNORM_SRGB
        | dxgi::B8G8R8A8_UNORM
        | dxgi::B8G8R8X8_UNORM
        | dxgi::B8G8R8A8_TYPELESS
        | dxgi::B8G8R8A8_UNORM_SRGB
        | dxgi::B8G8R8X8_TYPELESS
        | dxgi::B8G8R8X8_UNORM_SRGB => Some(4),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srgb_detection() {
        assert!(is_srgb(dxgi::R8G8B8A8_UNORM_SRGB));
        assert!(is_srgb(dxgi::B8G8R8X8_UNORM_SRGB));
        assert!(!is_srgb(dxgi::R8G8B8A8_UNORM));
        assert!(!is_srgb(TextureFormat::R10G10B10A2Unorm.dxgi()));
    }

    #[test]
    fn depth_formats_have_no_readback_size() {
        assert!(is_depth(dxgi::D32_FLOAT));
        assert_eq!(bytes_per_pixel(dxgi::D32_FLOAT), None);
        assert_eq!(bytes_per_pixel(dxgi::R16G16B16A16_UNORM), Some(8));
    }

    #[test]
    fn views_of_typeless_and_srgb_storage() {
        assert_eq!(view_format(dxgi::R8G8B8A8_TYPELESS, ViewKind::ShaderInput), dxgi::R8G8B8A8_UNORM);
        assert_eq!(view_format(dxgi::R8G8B8A8_UNORM_SRGB, ViewKind::RenderTarget), dxgi::R8G8B8A8_UNORM_SRGB);
        assert_eq!(view_format(dxgi::R8G8B8A8_UNORM_SRGB, ViewKind::UnorderedAccess), dxgi::R8G8B8A8_UNORM);
        assert_eq!(view_format(dxgi::D32_FLOAT, ViewKind::DepthStencil), dxgi::D32_FLOAT);
    }
}
