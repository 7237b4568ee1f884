// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Backend-independent graphics surface.

The layer talks to the application's GPU through [Device], which is implemented once
per native API (see `crate::imp`). Resources are handed out as `Rc`s: the chain, the
stages and the overlay can all hold the same texture, and every resource keeps the
parts of the device it needs alive.

| Concept           | D3D11                         | D3D12                                   |
|-------------------|-------------------------------|-----------------------------------------|
| Submission        | immediate context             | ring of command lists + fence           |
| Views             | COM view objects              | descriptors in fixed-capacity heaps     |
| Pipeline state    | set piecewise                 | resolved on first dispatch              |
| Overlay isolation | deferred context              | nothing to isolate                      |
*/

pub mod format;
pub mod heap;
pub mod resolve;
pub mod timer;
pub mod view_cache;

use crate::error::Result;
use crate::screenshot::ReadbackImage;
use openxr_sys as xr;
use std::path::Path;
use std::rc::Rc;

pub use format::TextureFormat;

/// Which native API a [Device] drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Api {
    D3D11,
    D3D12,
    /// GPU-less backend used by tests.
    #[cfg(any(test, feature = "testing"))]
    Headless,
}

/// Addresses either the whole texture or one array slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slice {
    All,
    Index(u32),
}

impl Slice {
    pub fn index(self) -> Option<u32> {
        match self {
            Slice::All => None,
            Slice::Index(i) => Some(i),
        }
    }
}

/// The view kinds a texture can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    ShaderInput,
    UnorderedAccess,
    RenderTarget,
    DepthStencil,
}

impl ViewKind {
    /// The usage bit a texture must carry to expose this view.
    pub fn required_usage(self) -> xr::SwapchainUsageFlags {
        match self {
            ViewKind::ShaderInput => xr::SwapchainUsageFlags::SAMPLED,
            ViewKind::UnorderedAccess => xr::SwapchainUsageFlags::UNORDERED_ACCESS,
            ViewKind::RenderTarget => xr::SwapchainUsageFlags::COLOR_ATTACHMENT,
            ViewKind::DepthStencil => xr::SwapchainUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        }
    }
}

/// Shape and usage of a texture. Mirrors the fields of `XrSwapchainCreateInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub format: i64,
    pub width: u32,
    pub height: u32,
    pub array_size: u32,
    pub mip_count: u32,
    pub sample_count: u32,
    pub usage: xr::SwapchainUsageFlags,
}

impl TextureDesc {
    pub fn new(format: i64, width: u32, height: u32) -> Self {
        TextureDesc {
            format,
            width,
            height,
            array_size: 1,
            mip_count: 1,
            sample_count: 1,
            usage: xr::SwapchainUsageFlags::EMPTY,
        }
    }

    pub fn from_create_info(info: &xr::SwapchainCreateInfo) -> Self {
        TextureDesc {
            format: info.format,
            width: info.width,
            height: info.height,
            array_size: info.array_size,
            mip_count: info.mip_count,
            sample_count: info.sample_count,
            usage: info.usage_flags,
        }
    }

    /// Writes this description over the matching fields of `info`, keeping the rest.
    pub fn apply_to(&self, info: &mut xr::SwapchainCreateInfo) {
        info.format = self.format;
        info.width = self.width;
        info.height = self.height;
        info.array_size = self.array_size;
        info.mip_count = self.mip_count;
        info.sample_count = self.sample_count;
        info.usage_flags = self.usage;
    }

    pub fn has_usage(&self, flag: xr::SwapchainUsageFlags) -> bool {
        self.usage.into_raw() & flag.into_raw() != 0
    }

    pub fn with_usage(mut self, flag: xr::SwapchainUsageFlags) -> Self {
        self.usage = xr::SwapchainUsageFlags::from_raw(self.usage.into_raw() | flag.into_raw());
        self
    }

    pub fn without_usage(mut self, flag: xr::SwapchainUsageFlags) -> Self {
        self.usage = xr::SwapchainUsageFlags::from_raw(self.usage.into_raw() & !flag.into_raw());
        self
    }

    pub fn with_extent(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn permits(&self, kind: ViewKind) -> bool {
        self.has_usage(kind.required_usage())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderKind {
    /// Pixel shader drawn as a full-screen triangle.
    Quad,
    /// Compute shader dispatched over `thread_groups`.
    Compute { thread_groups: [u32; 3] },
}

/// Filter of the sampler bound at `s0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerFilter {
    PointClamp,
    LinearClamp,
}

impl ShaderKind {
    /// Quads copy texel for texel; compute passes filter.
    pub fn sampler(&self) -> SamplerFilter {
        match self {
            ShaderKind::Quad => SamplerFilter::PointClamp,
            ShaderKind::Compute { .. } => SamplerFilter::LinearClamp,
        }
    }
}

/// Where a shader's HLSL comes from.
#[derive(Debug, Clone, Copy)]
pub struct ShaderSource<'a> {
    pub path: &'a Path,
    pub entry_point: &'a str,
    pub defines: &'a [(&'a str, &'a str)],
}

impl<'a> ShaderSource<'a> {
    pub fn new(path: &'a Path, entry_point: &'a str) -> Self {
        ShaderSource {
            path,
            entry_point,
            defines: &[],
        }
    }

    pub fn with_defines(mut self, defines: &'a [(&'a str, &'a str)]) -> Self {
        self.defines = defines;
        self
    }
}

/// Vertex layout used by [Device::create_simple_mesh].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimpleMeshVertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
}

pub trait Texture {
    /// The native object the runtime hands out for swapchain images.
    type Native: Clone;

    fn desc(&self) -> &TextureDesc;
    fn debug_name(&self) -> &str;
    fn native(&self) -> Self::Native;
}

/// Constant buffer.
pub trait ShaderBuffer {
    fn size(&self) -> usize;
    fn is_immutable(&self) -> bool;
    /// Replaces the whole content of the buffer. `data` must be exactly [ShaderBuffer::size] bytes.
    fn upload_data(&self, data: &[u8]) -> Result<()>;
}

pub trait Shader {
    fn kind(&self) -> ShaderKind;
    fn debug_name(&self) -> &str;
    /// Changes the dispatch size of a compute shader. Ignored for quad shaders.
    fn update_thread_groups(&self, thread_groups: [u32; 3]);
    /// Whether the pipeline state still has to be built from the first bind sequence.
    fn needs_resolve(&self) -> bool;
}

pub trait Mesh {
    fn index_count(&self) -> u32;
}

/// Measures elapsed time between `start` and `stop`.
///
/// `query` returns 0 until a start/stop pair has completed. With `reset == false`
/// the same sample keeps being returned; `reset == true` consumes it, which is
/// required before the timer can be started again.
pub trait GpuTimer {
    fn start(&self) -> Result<()>;
    fn stop(&self);
    fn query(&self, reset: bool) -> u64;
}

/**
Capability surface shared by both native backends.

Binding follows `Idle → ShaderBound → inputs/outputs → Dispatched`. Inputs and outputs
are only accepted after [Device::set_shader], and [Device::dispatch_shader] clears the
slots it used unless asked to preserve them.

Methods take `&self`: the device is driven from the single render thread and keeps its
binding state in cells.
*/
pub trait Device {
    type Texture: Texture;
    type Buffer: ShaderBuffer;
    type Shader: Shader;
    type Mesh: Mesh;
    type Timer: GpuTimer;

    fn api(&self) -> Api;
    fn name(&self) -> &str;
    fn texture_format(&self, format: TextureFormat) -> i64 {
        format.dxgi()
    }
    fn is_texture_format_srgb(&self, format: i64) -> bool {
        format::is_srgb(format)
    }

    /// Creates a texture. `initial_data` holds tightly packed rows of `row_pitch` bytes for slice 0, mip 0.
    fn create_texture(
        &self,
        desc: &TextureDesc,
        debug_name: &str,
        initial_data: Option<(&[u8], u32)>,
    ) -> Result<Rc<Self::Texture>>;
    /// Wraps an image owned by someone else, typically a runtime swapchain image.
    fn open_texture(
        &self,
        native: <Self::Texture as Texture>::Native,
        desc: &TextureDesc,
        debug_name: &str,
    ) -> Result<Rc<Self::Texture>>;
    fn create_buffer(
        &self,
        size: usize,
        debug_name: &str,
        initial_data: Option<&[u8]>,
        immutable: bool,
    ) -> Result<Rc<Self::Buffer>>;
    fn create_simple_mesh(
        &self,
        vertices: &[SimpleMeshVertex],
        indices: &[u16],
        debug_name: &str,
    ) -> Result<Rc<Self::Mesh>>;
    fn create_shader(
        &self,
        source: &ShaderSource<'_>,
        kind: ShaderKind,
        debug_name: &str,
    ) -> Result<Rc<Self::Shader>>;
    fn create_timer(&self) -> Result<Self::Timer>;

    fn set_shader(&self, shader: &Rc<Self::Shader>) -> Result<()>;
    fn set_shader_input_texture(&self, slot: u32, texture: &Rc<Self::Texture>, slice: Slice) -> Result<()>;
    fn set_shader_input_buffer(&self, slot: u32, buffer: &Rc<Self::Buffer>) -> Result<()>;
    fn set_shader_output(&self, slot: u32, texture: &Rc<Self::Texture>, slice: Slice) -> Result<()>;
    fn dispatch_shader(&self, preserve_bindings: bool) -> Result<()>;

    fn set_render_targets(
        &self,
        targets: &[(&Rc<Self::Texture>, Slice)],
        depth: Option<(&Rc<Self::Texture>, Slice)>,
    ) -> Result<()>;
    fn unset_render_targets(&self);
    fn clear_color(&self, top: f32, left: f32, bottom: f32, right: f32, color: [f32; 4]) -> Result<()>;
    fn clear_depth(&self, value: f32) -> Result<()>;
    /// Draws `mesh` into the current render targets. `transform` is a row-major model-view-projection matrix.
    fn draw_mesh(&self, mesh: &Rc<Self::Mesh>, transform: &[f32; 16]) -> Result<()>;

    /// Routes subsequent commands to a secondary stream that leaves application state alone.
    fn save_context(&self, clear: bool) -> Result<()>;
    fn restore_context(&self) -> Result<()>;
    fn flush_context(&self, blocking: bool) -> Result<()>;

    /// Copies one slice of `texture` back to the CPU. Blocks until the GPU is done.
    fn read_texture(&self, texture: &Rc<Self::Texture>, slice: Slice) -> Result<ReadbackImage>;

    /// Drops references to the current shader, render targets and mesh.
    fn shutdown(&self);
}
