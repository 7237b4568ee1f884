// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
A GPU-less [Device] that records what it was asked to do.

It enforces the same contracts as the native backends (view capabilities, binding order,
immutability, slot allocation, deferred pipeline resolution) so the chain and stage code
can be exercised in tests. Textures keep their pixels on the CPU; quad dispatches copy
input slot 0 into the render target, which is enough to follow an image through a chain.
*/

use crate::error::{Error, Result};
use crate::graphics::format::bytes_per_pixel;
use crate::graphics::heap::{HeapKind, SlotAllocator};
use crate::graphics::resolve::{PipelineResolution, RootParameter, RootParameterKind};
use crate::graphics::timer::SampleState;
use crate::graphics::view_cache::ViewCache;
use crate::graphics::{
    Api, Device, GpuTimer, Mesh, SamplerFilter, Shader, ShaderBuffer, ShaderKind, ShaderSource, SimpleMeshVertex, Slice,
    Texture, TextureDesc, ViewKind,
};
use crate::screenshot::ReadbackImage;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Timer ticks added by every `start` and every `stop`, in microseconds.
pub const TIMER_TICK_US: u64 = 10;

/// Something the device was asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CreateTexture { name: String },
    SetShader { shader: String },
    BindInput { slot: u32, texture: String, slice: Slice, view: u32 },
    BindBuffer { slot: u32, buffer: String },
    BindOutput { slot: u32, texture: String, slice: Slice, view: u32 },
    Resolve { shader: String, parameters: usize },
    Dispatch { shader: String, thread_groups: Option<[u32; 3]> },
    Unbind,
    SetRenderTargets { targets: Vec<String>, depth: Option<String> },
    UnsetRenderTargets,
    ClearColor { color: [f32; 4] },
    ClearDepth { value: f32 },
    DrawMesh { mesh: String },
    Upload { buffer: String, len: usize },
    SaveContext { clear: bool },
    RestoreContext,
    Flush { blocking: bool },
    ReadTexture { texture: String, slice: Slice },
    Shutdown,
}

#[derive(Debug, Default)]
pub struct CommandLog {
    commands: RefCell<Vec<Command>>,
}

impl CommandLog {
    fn push(&self, command: Command) {
        self.commands.borrow_mut().push(command);
    }

    pub fn snapshot(&self) -> Vec<Command> {
        self.commands.borrow().clone()
    }

    pub fn take(&self) -> Vec<Command> {
        std::mem::take(&mut *self.commands.borrow_mut())
    }

    pub fn count(&self, predicate: impl Fn(&Command) -> bool) -> usize {
        self.commands.borrow().iter().filter(|c| predicate(c)).count()
    }
}

/// The native handle of a headless texture. Runtimes in tests hand these out as swapchain images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeadlessImage(pub u64);

#[derive(Debug)]
pub struct HeadlessTexture {
    image: HeadlessImage,
    desc: TextureDesc,
    name: String,
    pixels: RefCell<Vec<u8>>,
    shader_input: ViewCache<u32>,
    unordered_access: ViewCache<u32>,
    render_target: ViewCache<u32>,
    depth_stencil: ViewCache<u32>,
}

impl HeadlessTexture {
    fn new(image: HeadlessImage, desc: &TextureDesc, name: &str) -> Self {
        let slice_len = slice_len(desc);
        HeadlessTexture {
            image,
            desc: *desc,
            name: name.to_string(),
            pixels: RefCell::new(vec![0; slice_len * desc.array_size.max(1) as usize]),
            shader_input: ViewCache::new(ViewKind::ShaderInput, desc),
            unordered_access: ViewCache::new(ViewKind::UnorderedAccess, desc),
            render_target: ViewCache::new(ViewKind::RenderTarget, desc),
            depth_stencil: ViewCache::new(ViewKind::DepthStencil, desc),
        }
    }

    pub fn views(&self, kind: ViewKind) -> &ViewCache<u32> {
        match kind {
            ViewKind::ShaderInput => &self.shader_input,
            ViewKind::UnorderedAccess => &self.unordered_access,
            ViewKind::RenderTarget => &self.render_target,
            ViewKind::DepthStencil => &self.depth_stencil,
        }
    }

    /// Bytes of one array slice.
    pub fn pixels(&self, slice: u32) -> Vec<u8> {
        let len = slice_len(&self.desc);
        let start = len * slice as usize;
        self.pixels.borrow().get(start..start + len).map(<[u8]>::to_vec).unwrap_or_default()
    }

    fn write_slice(&self, slice: u32, data: &[u8]) {
        let len = slice_len(&self.desc);
        let start = len * slice as usize;
        let mut pixels = self.pixels.borrow_mut();
        if let Some(target) = pixels.get_mut(start..start + len) {
            let n = target.len().min(data.len());
            target[..n].copy_from_slice(&data[..n]);
        }
    }
}

fn slice_len(desc: &TextureDesc) -> usize {
    let bpp = bytes_per_pixel(desc.format).unwrap_or(4) as usize;
    bpp * desc.width as usize * desc.height as usize
}

impl Texture for HeadlessTexture {
    type Native = HeadlessImage;

    fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    fn debug_name(&self) -> &str {
        &self.name
    }

    fn native(&self) -> HeadlessImage {
        self.image
    }
}

#[derive(Debug)]
pub struct HeadlessBuffer {
    name: String,
    immutable: bool,
    view_slot: u32,
    data: RefCell<Vec<u8>>,
    log: Rc<CommandLog>,
}

impl HeadlessBuffer {
    pub fn data(&self) -> Vec<u8> {
        self.data.borrow().clone()
    }

    /// Shader-resource heap slot reserved for the buffer's constant view.
    pub fn view_slot(&self) -> u32 {
        self.view_slot
    }
}

impl ShaderBuffer for HeadlessBuffer {
    fn size(&self) -> usize {
        self.data.borrow().len()
    }

    fn is_immutable(&self) -> bool {
        self.immutable
    }

    fn upload_data(&self, data: &[u8]) -> Result<()> {
        if self.immutable {
            return Err(Error::Immutable {
                buffer: self.name.clone(),
            });
        }
        let mut current = self.data.borrow_mut();
        if data.len() != current.len() {
            return Err(Error::UploadSizeMismatch {
                expected: current.len(),
                actual: data.len(),
            });
        }
        current.copy_from_slice(data);
        self.log.push(Command::Upload {
            buffer: self.name.clone(),
            len: data.len(),
        });
        Ok(())
    }
}

#[derive(Debug)]
pub struct HeadlessMesh {
    name: String,
    index_count: u32,
}

impl Mesh for HeadlessMesh {
    fn index_count(&self) -> u32 {
        self.index_count
    }
}

/// Shader whose "pipeline" is an id assigned at resolve time.
#[derive(Debug)]
pub struct HeadlessShader {
    name: String,
    kind: Cell<ShaderKind>,
    resolution: RefCell<PipelineResolution<u64, String>>,
}

impl HeadlessShader {
    pub fn pipeline(&self) -> Option<u64> {
        self.resolution.borrow().pipeline().copied()
    }

    /// Root parameters recorded on the first bind sequence.
    pub fn parameters(&self) -> Vec<RootParameter<String>> {
        self.resolution.borrow().parameters().to_vec()
    }
}

impl Shader for HeadlessShader {
    fn kind(&self) -> ShaderKind {
        self.kind.get()
    }

    fn debug_name(&self) -> &str {
        &self.name
    }

    fn update_thread_groups(&self, thread_groups: [u32; 3]) {
        if let ShaderKind::Compute { .. } = self.kind.get() {
            self.kind.set(ShaderKind::Compute { thread_groups });
        }
    }

    fn needs_resolve(&self) -> bool {
        self.resolution.borrow().needs_resolve()
    }
}

/// Timer on a fake clock shared by every timer of the device.
#[derive(Debug)]
pub struct HeadlessTimer {
    clock: Rc<Cell<u64>>,
    began: Cell<u64>,
    elapsed: Cell<u64>,
    state: SampleState,
}

impl GpuTimer for HeadlessTimer {
    fn start(&self) -> Result<()> {
        self.state.begin()?;
        self.clock.set(self.clock.get() + TIMER_TICK_US);
        self.began.set(self.clock.get());
        Ok(())
    }

    fn stop(&self) {
        self.clock.set(self.clock.get() + TIMER_TICK_US);
        self.elapsed.set(self.clock.get() - self.began.get());
        self.state.end();
    }

    fn query(&self, reset: bool) -> u64 {
        self.state.read(reset, || Some(self.elapsed.get()))
    }
}

#[derive(Default)]
struct Bindings {
    shader: Option<Rc<HeadlessShader>>,
    inputs: Vec<(u32, Rc<HeadlessTexture>, Slice)>,
    outputs: Vec<(u32, Rc<HeadlessTexture>, Slice)>,
    render_targets: Vec<(Rc<HeadlessTexture>, Slice)>,
    depth: Option<(Rc<HeadlessTexture>, Slice)>,
    mesh: Option<Rc<HeadlessMesh>>,
}

pub struct HeadlessDevice {
    name: String,
    log: Rc<CommandLog>,
    clock: Rc<Cell<u64>>,
    next_image: Cell<u64>,
    next_pipeline: Cell<u64>,
    shader_resource_heap: SlotAllocator,
    render_target_heap: SlotAllocator,
    depth_stencil_heap: SlotAllocator,
    bindings: RefCell<Bindings>,
    in_secondary_context: Cell<bool>,
}

impl std::fmt::Debug for HeadlessDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessDevice").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::with_heap_capacity(HeapKind::ShaderResource.capacity())
    }

    pub fn with_heap_capacity(shader_resource_slots: u32) -> Self {
        HeadlessDevice {
            name: "Headless: recording device".to_string(),
            log: Rc::new(CommandLog::default()),
            clock: Rc::new(Cell::new(0)),
            next_image: Cell::new(1),
            next_pipeline: Cell::new(1),
            shader_resource_heap: SlotAllocator::with_capacity(HeapKind::ShaderResource, shader_resource_slots),
            render_target_heap: SlotAllocator::new(HeapKind::RenderTarget),
            depth_stencil_heap: SlotAllocator::new(HeapKind::DepthStencil),
            bindings: RefCell::new(Bindings::default()),
            in_secondary_context: Cell::new(false),
        }
    }

    pub fn log(&self) -> &CommandLog {
        &self.log
    }

    /// A fresh native image id, as a runtime would hand out.
    pub fn allocate_image(&self) -> HeadlessImage {
        let id = self.next_image.get();
        self.next_image.set(id + 1);
        HeadlessImage(id)
    }

    pub fn is_in_secondary_context(&self) -> bool {
        self.in_secondary_context.get()
    }

    fn view(&self, texture: &HeadlessTexture, kind: ViewKind, slice: Slice) -> Result<u32> {
        let heap = match kind {
            ViewKind::ShaderInput | ViewKind::UnorderedAccess => &self.shader_resource_heap,
            ViewKind::RenderTarget => &self.render_target_heap,
            ViewKind::DepthStencil => &self.depth_stencil_heap,
        };
        texture.views(kind).get_or_create(slice, &texture.name, |_| heap.allocate())
    }

    fn bound_shader(&self) -> Result<Rc<HeadlessShader>> {
        self.bindings.borrow().shader.clone().ok_or(Error::NoShaderBound)
    }

    fn record_parameter(&self, shader: &HeadlessShader, kind: RootParameterKind, slot: u32, handle: String) -> Result<()> {
        let mut resolution = shader.resolution.borrow_mut();
        if resolution.needs_resolve() {
            resolution.register(kind, slot, handle)
        } else {
            resolution.rebind(kind, slot, handle);
            Ok(())
        }
    }

    fn copy_quad(&self, bindings: &Bindings) {
        let Some((_, input, in_slice)) = bindings.inputs.iter().find(|(slot, ..)| *slot == 0) else {
            return;
        };
        for (target, out_slice) in &bindings.render_targets {
            if input.desc.width != target.desc.width || input.desc.height != target.desc.height {
                continue;
            }
            let data = input.pixels(in_slice.index().unwrap_or(0));
            target.write_slice(out_slice.index().unwrap_or(0), &data);
        }
    }
}

impl Device for HeadlessDevice {
    type Texture = HeadlessTexture;
    type Buffer = HeadlessBuffer;
    type Shader = HeadlessShader;
    type Mesh = HeadlessMesh;
    type Timer = HeadlessTimer;

    fn api(&self) -> Api {
        Api::Headless
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn create_texture(
        &self,
        desc: &TextureDesc,
        debug_name: &str,
        initial_data: Option<(&[u8], u32)>,
    ) -> Result<Rc<HeadlessTexture>> {
        let texture = HeadlessTexture::new(self.allocate_image(), desc, debug_name);
        if let Some((data, _row_pitch)) = initial_data {
            texture.write_slice(0, data);
        }
        self.log.push(Command::CreateTexture {
            name: debug_name.to_string(),
        });
        Ok(Rc::new(texture))
    }

    fn open_texture(&self, native: HeadlessImage, desc: &TextureDesc, debug_name: &str) -> Result<Rc<HeadlessTexture>> {
        Ok(Rc::new(HeadlessTexture::new(native, desc, debug_name)))
    }

    fn create_buffer(
        &self,
        size: usize,
        debug_name: &str,
        initial_data: Option<&[u8]>,
        immutable: bool,
    ) -> Result<Rc<HeadlessBuffer>> {
        let mut data = vec![0; size];
        if let Some(initial) = initial_data {
            if initial.len() != size {
                return Err(Error::UploadSizeMismatch {
                    expected: size,
                    actual: initial.len(),
                });
            }
            data.copy_from_slice(initial);
        }
        let view_slot = self.shader_resource_heap.allocate()?;
        Ok(Rc::new(HeadlessBuffer {
            name: debug_name.to_string(),
            immutable: immutable && initial_data.is_some(),
            view_slot,
            data: RefCell::new(data),
            log: self.log.clone(),
        }))
    }

    fn create_simple_mesh(
        &self,
        _vertices: &[SimpleMeshVertex],
        indices: &[u16],
        debug_name: &str,
    ) -> Result<Rc<HeadlessMesh>> {
        Ok(Rc::new(HeadlessMesh {
            name: debug_name.to_string(),
            index_count: indices.len() as u32,
        }))
    }

    fn create_shader(&self, source: &ShaderSource<'_>, kind: ShaderKind, debug_name: &str) -> Result<Rc<HeadlessShader>> {
        if source.entry_point.is_empty() {
            return Err(Error::ShaderCompile {
                path: source.path.display().to_string(),
                message: "missing entry point".to_string(),
            });
        }
        Ok(Rc::new(HeadlessShader {
            name: debug_name.to_string(),
            kind: Cell::new(kind),
            resolution: RefCell::new(PipelineResolution::new()),
        }))
    }

    fn create_timer(&self) -> Result<HeadlessTimer> {
        Ok(HeadlessTimer {
            clock: self.clock.clone(),
            began: Cell::new(0),
            elapsed: Cell::new(0),
            state: SampleState::default(),
        })
    }

    fn set_shader(&self, shader: &Rc<HeadlessShader>) -> Result<()> {
        let mut bindings = self.bindings.borrow_mut();
        bindings.inputs.clear();
        bindings.outputs.clear();
        bindings.shader = Some(shader.clone());
        drop(bindings);
        if shader.needs_resolve() {
            let sampler = match shader.kind().sampler() {
                SamplerFilter::PointClamp => "point_clamp",
                SamplerFilter::LinearClamp => "linear_clamp",
            };
            self.record_parameter(shader, RootParameterKind::Sampler, 0, sampler.to_string())?;
        }
        self.log.push(Command::SetShader {
            shader: shader.name.clone(),
        });
        Ok(())
    }

    fn set_shader_input_texture(&self, slot: u32, texture: &Rc<HeadlessTexture>, slice: Slice) -> Result<()> {
        let shader = self.bound_shader()?;
        let view = self.view(texture, ViewKind::ShaderInput, slice)?;
        self.record_parameter(&shader, RootParameterKind::ShaderResource, slot, texture.name.clone())?;
        self.bindings.borrow_mut().inputs.push((slot, texture.clone(), slice));
        self.log.push(Command::BindInput {
            slot,
            texture: texture.name.clone(),
            slice,
            view,
        });
        Ok(())
    }

    fn set_shader_input_buffer(&self, slot: u32, buffer: &Rc<HeadlessBuffer>) -> Result<()> {
        let shader = self.bound_shader()?;
        self.record_parameter(&shader, RootParameterKind::ConstantBuffer, slot, buffer.name.clone())?;
        self.log.push(Command::BindBuffer {
            slot,
            buffer: buffer.name.clone(),
        });
        Ok(())
    }

    fn set_shader_output(&self, slot: u32, texture: &Rc<HeadlessTexture>, slice: Slice) -> Result<()> {
        let shader = self.bound_shader()?;
        let view = match shader.kind() {
            ShaderKind::Quad => {
                if slot != 0 {
                    return Err(Error::QuadOutputSlot { slot });
                }
                let view = self.view(texture, ViewKind::RenderTarget, slice)?;
                let mut bindings = self.bindings.borrow_mut();
                bindings.render_targets = vec![(texture.clone(), slice)];
                bindings.depth = None;
                view
            }
            ShaderKind::Compute { .. } => {
                let view = self.view(texture, ViewKind::UnorderedAccess, slice)?;
                self.record_parameter(&shader, RootParameterKind::UnorderedAccess, slot, texture.name.clone())?;
                view
            }
        };
        self.bindings.borrow_mut().outputs.push((slot, texture.clone(), slice));
        self.log.push(Command::BindOutput {
            slot,
            texture: texture.name.clone(),
            slice,
            view,
        });
        Ok(())
    }

    fn dispatch_shader(&self, preserve_bindings: bool) -> Result<()> {
        let shader = self.bound_shader()?;
        if shader.needs_resolve() {
            let mut resolution = shader.resolution.borrow_mut();
            let mut parameters = 0;
            resolution.resolve(|recorded| {
                parameters = recorded.len();
                let id = self.next_pipeline.get();
                self.next_pipeline.set(id + 1);
                Ok(id)
            })?;
            self.log.push(Command::Resolve {
                shader: shader.name.clone(),
                parameters,
            });
        }
        let thread_groups = match shader.kind() {
            ShaderKind::Quad => {
                self.copy_quad(&self.bindings.borrow());
                None
            }
            ShaderKind::Compute { thread_groups } => Some(thread_groups),
        };
        self.log.push(Command::Dispatch {
            shader: shader.name.clone(),
            thread_groups,
        });
        if !preserve_bindings {
            let mut bindings = self.bindings.borrow_mut();
            bindings.inputs.clear();
            bindings.outputs.clear();
            if let ShaderKind::Quad = shader.kind() {
                bindings.render_targets.clear();
            }
            self.log.push(Command::Unbind);
        }
        Ok(())
    }

    fn set_render_targets(
        &self,
        targets: &[(&Rc<HeadlessTexture>, Slice)],
        depth: Option<(&Rc<HeadlessTexture>, Slice)>,
    ) -> Result<()> {
        for (target, slice) in targets {
            self.view(target, ViewKind::RenderTarget, *slice)?;
        }
        if let Some((depth, slice)) = depth {
            self.view(depth, ViewKind::DepthStencil, slice)?;
        }
        let mut bindings = self.bindings.borrow_mut();
        bindings.render_targets = targets.iter().map(|(t, s)| ((*t).clone(), *s)).collect();
        bindings.depth = depth.map(|(t, s)| (t.clone(), s));
        self.log.push(Command::SetRenderTargets {
            targets: targets.iter().map(|(t, _)| t.name.clone()).collect(),
            depth: depth.map(|(t, _)| t.name.clone()),
        });
        Ok(())
    }

    fn unset_render_targets(&self) {
        let mut bindings = self.bindings.borrow_mut();
        bindings.render_targets.clear();
        bindings.depth = None;
        self.log.push(Command::UnsetRenderTargets);
    }

    fn clear_color(&self, _top: f32, _left: f32, _bottom: f32, _right: f32, color: [f32; 4]) -> Result<()> {
        self.log.push(Command::ClearColor { color });
        Ok(())
    }

    fn clear_depth(&self, value: f32) -> Result<()> {
        if self.bindings.borrow().depth.is_some() {
            self.log.push(Command::ClearDepth { value });
        }
        Ok(())
    }

    fn draw_mesh(&self, mesh: &Rc<HeadlessMesh>, _transform: &[f32; 16]) -> Result<()> {
        self.bindings.borrow_mut().mesh = Some(mesh.clone());
        self.log.push(Command::DrawMesh {
            mesh: mesh.name.clone(),
        });
        Ok(())
    }

    fn save_context(&self, clear: bool) -> Result<()> {
        self.in_secondary_context.set(true);
        self.log.push(Command::SaveContext { clear });
        Ok(())
    }

    fn restore_context(&self) -> Result<()> {
        self.in_secondary_context.set(false);
        self.log.push(Command::RestoreContext);
        Ok(())
    }

    fn flush_context(&self, blocking: bool) -> Result<()> {
        self.log.push(Command::Flush { blocking });
        Ok(())
    }

    fn read_texture(&self, texture: &Rc<HeadlessTexture>, slice: Slice) -> Result<ReadbackImage> {
        let bpp = bytes_per_pixel(texture.desc.format).ok_or(Error::UnsupportedFormat {
            format: texture.desc.format,
        })?;
        self.log.push(Command::ReadTexture {
            texture: texture.name.clone(),
            slice,
        });
        Ok(ReadbackImage {
            width: texture.desc.width,
            height: texture.desc.height,
            row_pitch: bpp * texture.desc.width,
            format: texture.desc.format,
            data: texture.pixels(slice.index().unwrap_or(0)),
        })
    }

    fn shutdown(&self) {
        *self.bindings.borrow_mut() = Bindings::default();
        self.log.push(Command::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphics::format::dxgi;
    use openxr_sys as xr;
    use std::path::Path;

    fn sampled_texture(device: &HeadlessDevice) -> Rc<HeadlessTexture> {
        let desc = TextureDesc::new(dxgi::R8G8B8A8_UNORM, 4, 4).with_usage(xr::SwapchainUsageFlags::SAMPLED);
        device.create_texture(&desc, "sampled", None).unwrap()
    }

    fn quad(device: &HeadlessDevice) -> Rc<HeadlessShader> {
        let source = ShaderSource::new(Path::new("quad.hlsl"), "main");
        device.create_shader(&source, ShaderKind::Quad, "quad").unwrap()
    }

    #[test]
    fn binding_requires_a_shader() {
        let device = HeadlessDevice::new();
        let texture = sampled_texture(&device);
        assert!(matches!(
            device.set_shader_input_texture(0, &texture, Slice::All),
            Err(Error::NoShaderBound)
        ));
        assert!(matches!(device.dispatch_shader(false), Err(Error::NoShaderBound)));
    }

    #[test]
    fn quad_outputs_only_slot_zero() {
        let device = HeadlessDevice::new();
        let desc = TextureDesc::new(dxgi::R8G8B8A8_UNORM, 4, 4).with_usage(xr::SwapchainUsageFlags::COLOR_ATTACHMENT);
        let target = device.create_texture(&desc, "target", None).unwrap();
        device.set_shader(&quad(&device)).unwrap();
        assert!(matches!(
            device.set_shader_output(1, &target, Slice::All),
            Err(Error::QuadOutputSlot { slot: 1 })
        ));
        device.set_shader_output(0, &target, Slice::All).unwrap();
    }

    #[test]
    fn views_are_reused_across_binds() {
        let device = HeadlessDevice::new();
        let texture = sampled_texture(&device);
        let shader = quad(&device);
        for _ in 0..2 {
            device.set_shader(&shader).unwrap();
            device.set_shader_input_texture(0, &texture, Slice::All).unwrap();
        }
        let views: Vec<u32> = device
            .log()
            .snapshot()
            .into_iter()
            .filter_map(|c| match c {
                Command::BindInput { view, .. } => Some(view),
                _ => None,
            })
            .collect();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0], views[1]);
    }

    #[test]
    fn first_dispatch_resolves() {
        let device = HeadlessDevice::new();
        let texture = sampled_texture(&device);
        let shader = quad(&device);
        assert!(shader.needs_resolve());
        device.set_shader(&shader).unwrap();
        device.set_shader_input_texture(0, &texture, Slice::All).unwrap();
        device.dispatch_shader(false).unwrap();
        assert!(!shader.needs_resolve());
        let pipeline = shader.pipeline();

        device.set_shader(&shader).unwrap();
        device.set_shader_input_texture(0, &texture, Slice::All).unwrap();
        device.dispatch_shader(false).unwrap();
        assert_eq!(shader.pipeline(), pipeline);
        assert_eq!(device.log().count(|c| matches!(c, Command::Resolve { .. })), 1);
    }

    #[test]
    fn mutable_buffers_accept_exact_uploads() {
        let device = HeadlessDevice::new();
        let buffer = device.create_buffer(16, "cb", None, false).unwrap();
        assert!(matches!(
            buffer.upload_data(&[0; 8]),
            Err(Error::UploadSizeMismatch { expected: 16, actual: 8 })
        ));
        buffer.upload_data(&[1; 16]).unwrap();
        assert_eq!(buffer.data(), vec![1; 16]);
    }

    #[test]
    fn timers_measure_the_fake_clock() {
        let device = HeadlessDevice::new();
        let timer = device.create_timer().unwrap();
        timer.start().unwrap();
        timer.stop();
        assert_eq!(timer.query(false), TIMER_TICK_US);
        assert_eq!(timer.query(true), TIMER_TICK_US);
        assert_eq!(timer.query(false), 0);
    }

    #[test]
    fn quads_sample_points_and_compute_samples_linearly() {
        let device = HeadlessDevice::new();
        let quad = quad(&device);
        let compute = device
            .create_shader(
                &ShaderSource::new(Path::new("cs.hlsl"), "main"),
                ShaderKind::Compute { thread_groups: [1, 1, 1] },
                "compute",
            )
            .unwrap();
        device.set_shader(&quad).unwrap();
        device.set_shader(&compute).unwrap();
        let sampler = |shader: &HeadlessShader| {
            shader
                .parameters()
                .into_iter()
                .find(|p| p.kind == RootParameterKind::Sampler)
                .map(|p| p.handle)
        };
        assert_eq!(sampler(&quad).as_deref(), Some("point_clamp"));
        assert_eq!(sampler(&compute).as_deref(), Some("linear_clamp"));
    }

    #[test]
    fn buffer_binds_do_not_consume_heap_slots() {
        let device = HeadlessDevice::with_heap_capacity(1);
        let buffer = device.create_buffer(16, "cb", None, false).unwrap();
        assert_eq!(buffer.view_slot(), 0);
        let shader = quad(&device);
        for _ in 0..8 {
            device.set_shader(&shader).unwrap();
            device.set_shader_input_buffer(0, &buffer).unwrap();
        }
        assert!(matches!(
            device.create_buffer(16, "second", None, false),
            Err(Error::HeapExhausted { .. })
        ));
    }
}
