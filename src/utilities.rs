// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Small numeric helpers shared by the layer and the stages.

use openxr_sys as xr;

/// Application resolution for a display resolution and a scaling factor in percent.
///
/// Both dimensions are rounded up to even. Above 100% the display size is divided by the
/// factor and below 100% it is multiplied by it, so the application renders smaller either way.
pub fn scaled_dimensions(width: u32, height: u32, percent: i32) -> (u32, u32) {
    (scaled_dimension(width, percent), scaled_dimension(height, percent))
}

fn scaled_dimension(output: u32, percent: i32) -> u32 {
    if percent > 100 {
        let input = ((100.0f32 / percent as f32) * output as f32) as u32;
        input + (input & 1)
    } else if percent > 0 && percent < 100 {
        let input = (percent as u32 * output) / 100;
        input + (input & 1)
    } else {
        output
    }
}

/// Multiplies every angle of `fov` by `factor`.
pub fn scale_fov(fov: &mut xr::Fovf, factor: f32) {
    fov.angle_left *= factor;
    fov.angle_right *= factor;
    fov.angle_up *= factor;
    fov.angle_down *= factor;
}

pub(crate) fn distance(a: xr::Vector3f, b: xr::Vector3f) -> f32 {
    let (x, y, z) = (b.x - a.x, b.y - a.y, b.z - a.z);
    (x * x + y * y + z * z).sqrt()
}

/// Moves both positions symmetrically about their midpoint so they end up `separation` apart.
pub(crate) fn set_separation(left: &mut xr::Vector3f, right: &mut xr::Vector3f, separation: f32) {
    let current = distance(*left, *right);
    if current <= f32::EPSILON {
        return;
    }
    let center = xr::Vector3f {
        x: (left.x + right.x) / 2.0,
        y: (left.y + right.y) / 2.0,
        z: (left.z + right.z) / 2.0,
    };
    let half = separation / 2.0 / current;
    let (dx, dy, dz) = (right.x - left.x, right.y - left.y, right.z - left.z);
    *left = xr::Vector3f {
        x: center.x - dx * half,
        y: center.y - dy * half,
        z: center.z - dz * half,
    };
    *right = xr::Vector3f {
        x: center.x + dx * half,
        y: center.y + dy * half,
        z: center.z + dz * half,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upscaling_rounds_up_to_even() {
        assert_eq!(scaled_dimensions(2000, 2000, 150), (1334, 1334));
        assert_eq!(scaled_dimensions(1920, 1080, 200), (960, 540));
    }

    #[test]
    fn identity_and_fractional_scaling() {
        assert_eq!(scaled_dimensions(2000, 1800, 100), (2000, 1800));
        assert_eq!(scaled_dimensions(1001, 1000, 50), (500, 500));
        assert_eq!(scaled_dimensions(1002, 1000, 75), (752, 750));
    }

    #[test]
    fn every_factor_shrinks_the_application_image() {
        for percent in [25, 50, 75, 99, 101, 150, 200] {
            let (w, h) = scaled_dimensions(2000, 1000, percent);
            assert!(w < 2000 && h < 1000, "{percent}%");
        }
    }

    #[test]
    fn separation_keeps_the_center() {
        let mut left = xr::Vector3f { x: -0.03, y: 1.0, z: 0.0 };
        let mut right = xr::Vector3f { x: 0.03, y: 1.0, z: 0.0 };
        set_separation(&mut left, &mut right, 0.07);
        assert!((distance(left, right) - 0.07).abs() < 1e-6);
        assert!(((left.x + right.x) / 2.0).abs() < 1e-6);
        assert_eq!(left.y, 1.0);
    }
}
