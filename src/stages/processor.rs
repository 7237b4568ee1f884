// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Full-screen quad processors.

use crate::config::LayerSettings;
use crate::error::Result;
use crate::graphics::{Device, ShaderKind, ShaderSource, Slice};
use crate::stages::ImageProcessor;
use std::rc::Rc;

pub const PRE_PROCESS_SHADER: &str = "preprocess.hlsl";
pub const POST_PROCESS_SHADER: &str = "postprocess.hlsl";

/// Runs one pixel shader from input to output at the same resolution.
pub struct PassthroughProcessor<D: Device> {
    device: Rc<D>,
    shader: Rc<D::Shader>,
}

impl<D: Device> PassthroughProcessor<D> {
    pub fn new(device: Rc<D>, settings: &LayerSettings, shader_file: &str) -> Result<Self> {
        let path = settings.shader_directory.join(shader_file);
        let shader = device.create_shader(
            &ShaderSource::new(&path, "main"),
            ShaderKind::Quad,
            &format!("{shader_file} PS"),
        )?;
        Ok(PassthroughProcessor { device, shader })
    }
}

impl<D: Device> ImageProcessor<D> for PassthroughProcessor<D> {
    fn update(&self) -> Result<()> {
        Ok(())
    }

    fn process(&self, input: &Rc<D::Texture>, output: &Rc<D::Texture>, slice: Slice) -> Result<()> {
        self.device.set_shader(&self.shader)?;
        self.device.set_shader_input_texture(0, input, slice)?;
        self.device.set_shader_output(0, output, slice)?;
        self.device.dispatch_shader(false)
    }
}
