// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! AMD FidelityFX Super Resolution 1.0: EASU upscale followed by RCAS sharpening.

use crate::config::{ConfigProvider, LayerSettings, Setting};
use crate::error::Result;
use crate::graphics::{Device, Shader, ShaderBuffer, ShaderKind, ShaderSource, Slice, TextureDesc, TextureFormat};
use crate::stages::{UpscaleSource, Upscaler};
use crate::utilities::scaled_dimensions;
use openxr_sys as xr;
use std::rc::Rc;

/// Output pixels covered by one thread group, per axis.
const WORK_REGION: u32 = 16;

pub const SHADER_FILE: &str = "FSR.hlsl";

/// Five `uint4` registers: EASU in 0..4, RCAS in 4.
pub type FsrConstants = [[u32; 4]; 5];

fn easu_constants(constants: &mut FsrConstants, input: (u32, u32), output: (u32, u32)) {
    let (in_w, in_h) = (input.0 as f32, input.1 as f32);
    let (out_w, out_h) = (output.0 as f32, output.1 as f32);
    let (rcp_w, rcp_h) = (1.0 / in_w, 1.0 / in_h);
    // Viewport and image size are the same here.
    constants[0] = [
        (in_w * (1.0 / out_w)).to_bits(),
        (in_h * (1.0 / out_h)).to_bits(),
        (0.5 * in_w * (1.0 / out_w) - 0.5).to_bits(),
        (0.5 * in_h * (1.0 / out_h) - 0.5).to_bits(),
    ];
    constants[1] = [
        rcp_w.to_bits(),
        rcp_h.to_bits(),
        (1.0 * rcp_w).to_bits(),
        (-1.0 * rcp_h).to_bits(),
    ];
    constants[2] = [
        (-1.0 * rcp_w).to_bits(),
        (2.0 * rcp_h).to_bits(),
        (1.0 * rcp_w).to_bits(),
        (2.0 * rcp_h).to_bits(),
    ];
    constants[3] = [(0.0 * rcp_w).to_bits(), (4.0 * rcp_h).to_bits(), 0, 0];
}

fn rcas_constants(constants: &mut FsrConstants, sharpness_percent: i32) {
    let attenuation = 1.0 - (sharpness_percent as f32 / 100.0).clamp(0.0, 1.0);
    let sharpness = (-attenuation).exp2();
    let packed = half::f16::from_f32(sharpness).to_bits() as u32;
    // Last lane is the HDR flag, always off.
    constants[4] = [sharpness.to_bits(), packed | (packed << 16), 0, 0];
}

pub fn constants(input: (u32, u32), output: (u32, u32), sharpness_percent: i32) -> FsrConstants {
    let mut constants = [[0; 4]; 5];
    easu_constants(&mut constants, input, output);
    rcas_constants(&mut constants, sharpness_percent);
    constants
}

fn to_bytes(constants: &FsrConstants) -> Vec<u8> {
    constants.iter().flatten().flat_map(|v| v.to_le_bytes()).collect()
}

pub struct FsrUpscaler<D: Device> {
    device: Rc<D>,
    config: Rc<dyn ConfigProvider>,
    input: (u32, u32),
    output: (u32, u32),
    easu: Rc<D::Shader>,
    rcas: Rc<D::Shader>,
    constants: Rc<D::Buffer>,
    intermediary: Rc<D::Texture>,
}

impl<D: Device> FsrUpscaler<D> {
    /// The scaling factor is latched here; changing it later needs a new session.
    pub fn new(
        device: Rc<D>,
        config: Rc<dyn ConfigProvider>,
        settings: &LayerSettings,
        output_width: u32,
        output_height: u32,
    ) -> Result<Self> {
        let input = scaled_dimensions(output_width, output_height, config.value(Setting::Scaling));
        let output = (output_width, output_height);
        let thread_groups = [output.0.div_ceil(WORK_REGION), output.1.div_ceil(WORK_REGION), 1];
        let kind = ShaderKind::Compute { thread_groups };

        let path = settings.shader_directory.join(SHADER_FILE);
        let common = [
            ("FSR_THREAD_GROUP_SIZE", "64"),
            ("SAMPLE_SLOW_FALLBACK", "1"),
            ("SAMPLE_BILINEAR", "0"),
        ];
        let easu_defines = [common[0], common[1], common[2], ("SAMPLE_RCAS", "0"), ("SAMPLE_EASU", "1")];
        let rcas_defines = [common[0], common[1], common[2], ("SAMPLE_RCAS", "1"), ("SAMPLE_EASU", "0")];
        let easu = device.create_shader(
            &ShaderSource::new(&path, "mainCS").with_defines(&easu_defines),
            kind,
            "FSR EASU CS",
        )?;
        let rcas = device.create_shader(
            &ShaderSource::new(&path, "mainCS").with_defines(&rcas_defines),
            kind,
            "FSR RCAS CS",
        )?;

        let intermediary_desc = TextureDesc::new(
            device.texture_format(TextureFormat::R10G10B10A2Unorm),
            output.0,
            output.1,
        )
        .with_usage(xr::SwapchainUsageFlags::SAMPLED)
        .with_usage(xr::SwapchainUsageFlags::UNORDERED_ACCESS);
        let intermediary = device.create_texture(&intermediary_desc, "FSR Intermediary TEX2D", None)?;

        let initial = to_bytes(&constants(input, output, config.value(Setting::Sharpness)));
        let constants = device.create_buffer(initial.len(), "FSR Constants CB", None, false)?;
        constants.upload_data(&initial)?;

        logwise::info_sync!(
            "FSR upscaler {in_w}x{in_h} to {out_w}x{out_h}",
            in_w = input.0,
            in_h = input.1,
            out_w = output.0,
            out_h = output.1
        );

        Ok(FsrUpscaler {
            device,
            config,
            input,
            output,
            easu,
            rcas,
            constants,
            intermediary,
        })
    }

    pub fn input_resolution(&self) -> (u32, u32) {
        self.input
    }

    pub fn thread_groups(&self) -> Option<[u32; 3]> {
        match self.easu.kind() {
            ShaderKind::Compute { thread_groups } => Some(thread_groups),
            ShaderKind::Quad => None,
        }
    }
}

impl<D: Device> Upscaler<D> for FsrUpscaler<D> {
    fn update(&self) -> Result<()> {
        if self.config.has_changed(Setting::Sharpness) {
            let values = constants(self.input, self.output, self.config.value(Setting::Sharpness));
            self.constants.upload_data(&to_bytes(&values))?;
        }
        Ok(())
    }

    fn upscale(&self, source: UpscaleSource<'_, D>, output: &Rc<D::Texture>, slice: Slice) -> Result<()> {
        let device = &self.device;
        device.set_shader(&self.easu)?;
        device.set_shader_input_buffer(0, &self.constants)?;
        device.set_shader_input_texture(0, source.color, slice)?;
        device.set_shader_output(0, &self.intermediary, Slice::All)?;
        device.dispatch_shader(false)?;

        device.set_shader(&self.rcas)?;
        device.set_shader_input_buffer(0, &self.constants)?;
        device.set_shader_input_texture(0, &self.intermediary, Slice::All)?;
        device.set_shader_output(0, output, slice)?;
        device.dispatch_shader(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::graphics::format::dxgi;
    use crate::imp::headless::{Command, HeadlessDevice};

    #[test]
    fn rcas_packs_full_and_half_precision() {
        let c = constants((1334, 1334), (2000, 2000), 100);
        // Full sharpness: attenuation 0, exp2(0) = 1.
        assert_eq!(c[4][0], 1.0f32.to_bits());
        assert_eq!(c[4][1], 0x3c00_3c00);
        assert_eq!(c[4][3], 0);

        let c = constants((1334, 1334), (2000, 2000), 0);
        assert_eq!(f32::from_bits(c[4][0]), 0.5);
        assert_eq!(c[4][1], 0x3800_3800);
    }

    #[test]
    fn easu_scale_is_input_over_output() {
        let c = constants((512, 256), (1024, 512), 20);
        assert_eq!(f32::from_bits(c[0][0]), 0.5);
        assert_eq!(f32::from_bits(c[0][1]), 0.5);
        assert_eq!(f32::from_bits(c[0][2]), -0.25);
        assert_eq!(f32::from_bits(c[1][3]), -1.0 / 256.0);
        assert_eq!(c[3][2], 0);
    }

    fn upscaler(config: Rc<MemoryConfig>) -> (Rc<HeadlessDevice>, FsrUpscaler<HeadlessDevice>) {
        let device = Rc::new(HeadlessDevice::new());
        let settings = LayerSettings::new("test");
        let fsr = FsrUpscaler::new(device.clone(), config, &settings, 2000, 2000).unwrap();
        (device, fsr)
    }

    fn uploads(device: &HeadlessDevice) -> usize {
        device
            .log()
            .count(|c| matches!(c, Command::Upload { buffer, .. } if buffer == "FSR Constants CB"))
    }

    #[test]
    fn constants_follow_sharpness_changes_only() {
        let config = Rc::new(MemoryConfig::with_values(&[(Setting::Scaling, 150)]));
        let (device, fsr) = upscaler(config.clone());
        assert_eq!(fsr.input_resolution(), (1334, 1334));
        assert_eq!(uploads(&device), 1);

        config.tick();
        fsr.update().unwrap();
        assert_eq!(uploads(&device), 1);

        config.set_value(Setting::Sharpness, 60);
        config.tick();
        fsr.update().unwrap();
        assert_eq!(uploads(&device), 2);

        config.tick();
        fsr.update().unwrap();
        assert_eq!(uploads(&device), 2);
    }

    #[test]
    fn thread_groups_cover_the_output() {
        let config = Rc::new(MemoryConfig::with_values(&[(Setting::Scaling, 150)]));
        let (_, fsr) = upscaler(config);
        assert_eq!(fsr.thread_groups(), Some([125, 125, 1]));
    }

    #[test]
    fn upscale_runs_two_passes() {
        let config = Rc::new(MemoryConfig::with_values(&[(Setting::Scaling, 150)]));
        let (device, fsr) = upscaler(config);
        let input_desc = TextureDesc::new(dxgi::R10G10B10A2_UNORM, 1334, 1334).with_usage(xr::SwapchainUsageFlags::SAMPLED);
        let output_desc =
            TextureDesc::new(dxgi::R10G10B10A2_UNORM, 2000, 2000).with_usage(xr::SwapchainUsageFlags::UNORDERED_ACCESS);
        let input = device.create_texture(&input_desc, "in", None).unwrap();
        let output = device.create_texture(&output_desc, "out", None).unwrap();
        fsr.upscale(UpscaleSource::color(&input), &output, Slice::All).unwrap();
        let dispatched: Vec<String> = device
            .log()
            .snapshot()
            .into_iter()
            .filter_map(|c| match c {
                Command::Dispatch { shader, .. } => Some(shader),
                _ => None,
            })
            .collect();
        assert_eq!(dispatched, vec!["FSR EASU CS", "FSR RCAS CS"]);
    }

    #[test]
    fn output_without_unordered_access_is_rejected() {
        let config = Rc::new(MemoryConfig::with_values(&[(Setting::Scaling, 150)]));
        let (device, fsr) = upscaler(config);
        let desc = TextureDesc::new(dxgi::R8G8B8A8_UNORM, 1334, 1334).with_usage(xr::SwapchainUsageFlags::SAMPLED);
        let input = device.create_texture(&desc, "in", None).unwrap();
        let output = device.create_texture(&desc.with_extent(2000, 2000), "out", None).unwrap();
        let result = fsr.upscale(UpscaleSource::color(&input), &output, Slice::All);
        assert!(matches!(result, Err(crate::error::Error::Capability { .. })));
    }
}
