// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Processing stages that run between the application and the runtime.

Stages only see the [Device] surface, so the same code runs on every backend. Each stage
owns its shaders and constant buffers. Per frame the layer calls `update` once and then
`process`/`upscale` once per eye.

A stage must issue the same bind sequence on every call for a given shader; on D3D12 the
first sequence becomes the pipeline layout.
*/

pub mod fsr;
pub mod processor;

use crate::error::Result;
use crate::graphics::{Device, Slice};
use std::rc::Rc;

pub use fsr::FsrUpscaler;
pub use processor::PassthroughProcessor;

/// Same-resolution image transform (pre- and post-processing).
pub trait ImageProcessor<D: Device> {
    /// Picks up configuration changes.
    fn update(&self) -> Result<()>;
    fn process(&self, input: &Rc<D::Texture>, output: &Rc<D::Texture>, slice: Slice) -> Result<()>;
}

/// Inputs of an upscaling pass.
pub struct UpscaleSource<'a, D: Device> {
    pub color: &'a Rc<D::Texture>,
    pub motion_vectors: Option<&'a Rc<D::Texture>>,
    pub depth: Option<&'a Rc<D::Texture>>,
}

impl<'a, D: Device> UpscaleSource<'a, D> {
    pub fn color(color: &'a Rc<D::Texture>) -> Self {
        UpscaleSource {
            color,
            motion_vectors: None,
            depth: None,
        }
    }
}

/// Application resolution to display resolution.
pub trait Upscaler<D: Device> {
    fn update(&self) -> Result<()>;
    fn upscale(&self, source: UpscaleSource<'_, D>, output: &Rc<D::Texture>, slice: Slice) -> Result<()>;
}

/// The stages enabled for a session, in chain order.
pub struct Stages<D: Device> {
    pub pre_processor: Option<Box<dyn ImageProcessor<D>>>,
    pub upscaler: Option<Box<dyn Upscaler<D>>>,
    pub post_processor: Option<Box<dyn ImageProcessor<D>>>,
}

impl<D: Device> Default for Stages<D> {
    fn default() -> Self {
        Stages {
            pre_processor: None,
            upscaler: None,
            post_processor: None,
        }
    }
}

impl<D: Device> Stages<D> {
    pub fn update(&self) -> Result<()> {
        if let Some(pre) = &self.pre_processor {
            pre.update()?;
        }
        if let Some(upscaler) = &self.upscaler {
            upscaler.update()?;
        }
        if let Some(post) = &self.post_processor {
            post.update()?;
        }
        Ok(())
    }
}
