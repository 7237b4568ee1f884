// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Direct3D 11 backend.

Commands go to the application's immediate context, except between
[Device::save_context] and [Device::restore_context], where they are recorded on a deferred
context and replayed afterwards so the application's pipeline state is left as it was.
*/

use crate::error::{Error, Result};
use crate::graphics::format::view_format;
use crate::graphics::timer::SampleState;
use crate::graphics::view_cache::ViewCache;
use crate::graphics::{
    Api, Device, GpuTimer, Mesh, SamplerFilter, Shader, ShaderBuffer, ShaderKind, ShaderSource, SimpleMeshVertex, Slice,
    Texture, TextureDesc, ViewKind,
};
use crate::imp::native::{MESH_SHADERS, NativeContext, QUAD_VERTEX_SHADER, adapter_name, compile_file, compile_text, created};
use crate::screenshot::ReadbackImage;
use openxr_sys as xr;
use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::rc::Rc;
use windows::Win32::Foundation::{BOOL, RECT};
use windows::Win32::Graphics::Direct3D::{
    D3D11_PRIMITIVE_TOPOLOGY_TRIANGLELIST, D3D11_PRIMITIVE_TOPOLOGY_TRIANGLESTRIP, D3D11_SRV_DIMENSION_TEXTURE2D,
    D3D11_SRV_DIMENSION_TEXTURE2DARRAY, WKPDID_D3DDebugObjectName,
};
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_FORMAT, DXGI_FORMAT_R16_UINT, DXGI_FORMAT_R32G32B32_FLOAT, DXGI_FORMAT_UNKNOWN, DXGI_SAMPLE_DESC,
};
use windows::Win32::Graphics::Dxgi::IDXGIDevice;
use windows::core::{Interface, s};

fn dxgi_format(format: i64) -> DXGI_FORMAT {
    DXGI_FORMAT(format as i32)
}

fn set_debug_name<T: Interface>(object: &T, name: &str) {
    if let Ok(child) = object.cast::<ID3D11DeviceChild>() {
        // SAFETY: the name bytes are copied by the runtime.
        let _ = unsafe {
            child.SetPrivateData(
                &WKPDID_D3DDebugObjectName,
                name.len() as u32,
                Some(name.as_ptr() as *const c_void),
            )
        };
    }
}

fn bind_flags(desc: &TextureDesc) -> u32 {
    let mut flags = 0;
    if desc.has_usage(xr::SwapchainUsageFlags::COLOR_ATTACHMENT) {
        flags |= D3D11_BIND_RENDER_TARGET.0 as u32;
    }
    if desc.has_usage(xr::SwapchainUsageFlags::DEPTH_STENCIL_ATTACHMENT) {
        flags |= D3D11_BIND_DEPTH_STENCIL.0 as u32;
    }
    if desc.has_usage(xr::SwapchainUsageFlags::SAMPLED) {
        flags |= D3D11_BIND_SHADER_RESOURCE.0 as u32;
    }
    if desc.has_usage(xr::SwapchainUsageFlags::UNORDERED_ACCESS) {
        flags |= D3D11_BIND_UNORDERED_ACCESS.0 as u32;
    }
    flags
}

/// First slice and slice count a view covers.
fn slice_range(desc: &TextureDesc, slice: Slice) -> (u32, u32) {
    match slice {
        Slice::All => (0, desc.array_size),
        Slice::Index(index) => (index, 1),
    }
}

/// The immediate context and whichever context commands currently go to.
struct Contexts {
    immediate: ID3D11DeviceContext,
    current: RefCell<ID3D11DeviceContext>,
    deferred: Cell<bool>,
}

impl Contexts {
    fn current(&self) -> ID3D11DeviceContext {
        self.current.borrow().clone()
    }
}

pub struct D3D11Texture {
    desc: TextureDesc,
    name: String,
    texture: ID3D11Texture2D,
    shader_input: ViewCache<ID3D11ShaderResourceView>,
    unordered_access: ViewCache<ID3D11UnorderedAccessView>,
    render_target: ViewCache<ID3D11RenderTargetView>,
    depth_stencil: ViewCache<ID3D11DepthStencilView>,
}

impl D3D11Texture {
    fn new(desc: &TextureDesc, name: &str, texture: ID3D11Texture2D) -> Self {
        set_debug_name(&texture, name);
        D3D11Texture {
            desc: *desc,
            name: name.to_string(),
            texture,
            shader_input: ViewCache::new(ViewKind::ShaderInput, desc),
            unordered_access: ViewCache::new(ViewKind::UnorderedAccess, desc),
            render_target: ViewCache::new(ViewKind::RenderTarget, desc),
            depth_stencil: ViewCache::new(ViewKind::DepthStencil, desc),
        }
    }

    fn shader_input_view(&self, device: &ID3D11Device, slice: Slice) -> Result<ID3D11ShaderResourceView> {
        self.shader_input.get_or_create(slice, &self.name, |slice| {
            let (first, count) = slice_range(&self.desc, slice);
            let mut desc = D3D11_SHADER_RESOURCE_VIEW_DESC {
                Format: dxgi_format(view_format(self.desc.format, ViewKind::ShaderInput)),
                ..Default::default()
            };
            if self.desc.array_size == 1 {
                desc.ViewDimension = D3D11_SRV_DIMENSION_TEXTURE2D;
                desc.Anonymous.Texture2D = D3D11_TEX2D_SRV {
                    MostDetailedMip: 0,
                    MipLevels: self.desc.mip_count,
                };
            } else {
                desc.ViewDimension = D3D11_SRV_DIMENSION_TEXTURE2DARRAY;
                desc.Anonymous.Texture2DArray = D3D11_TEX2D_ARRAY_SRV {
                    MostDetailedMip: 0,
                    MipLevels: self.desc.mip_count,
                    FirstArraySlice: first,
                    ArraySize: count,
                };
            }
            let mut view = None;
            // SAFETY: the texture and description are valid for the call.
            unsafe { device.CreateShaderResourceView(&self.texture, Some(&desc), Some(&mut view)) }
                .context("CreateShaderResourceView")?;
            created(view, "CreateShaderResourceView")
        })
    }

    fn unordered_access_view(&self, device: &ID3D11Device, slice: Slice) -> Result<ID3D11UnorderedAccessView> {
        self.unordered_access.get_or_create(slice, &self.name, |slice| {
            let (first, count) = slice_range(&self.desc, slice);
            let mut desc = D3D11_UNORDERED_ACCESS_VIEW_DESC {
                Format: dxgi_format(view_format(self.desc.format, ViewKind::UnorderedAccess)),
                ..Default::default()
            };
            if self.desc.array_size == 1 {
                desc.ViewDimension = D3D11_UAV_DIMENSION_TEXTURE2D;
                desc.Anonymous.Texture2D = D3D11_TEX2D_UAV { MipSlice: 0 };
            } else {
                desc.ViewDimension = D3D11_UAV_DIMENSION_TEXTURE2DARRAY;
                desc.Anonymous.Texture2DArray = D3D11_TEX2D_ARRAY_UAV {
                    MipSlice: 0,
                    FirstArraySlice: first,
                    ArraySize: count,
                };
            }
            let mut view = None;
            // SAFETY: the texture and description are valid for the call.
            unsafe { device.CreateUnorderedAccessView(&self.texture, Some(&desc), Some(&mut view)) }
                .context("CreateUnorderedAccessView")?;
            created(view, "CreateUnorderedAccessView")
        })
    }

    fn render_target_view(&self, device: &ID3D11Device, slice: Slice) -> Result<ID3D11RenderTargetView> {
        self.render_target.get_or_create(slice, &self.name, |slice| {
            let (first, count) = slice_range(&self.desc, slice);
            let mut desc = D3D11_RENDER_TARGET_VIEW_DESC {
                Format: dxgi_format(view_format(self.desc.format, ViewKind::RenderTarget)),
                ..Default::default()
            };
            if self.desc.array_size == 1 {
                desc.ViewDimension = D3D11_RTV_DIMENSION_TEXTURE2D;
                desc.Anonymous.Texture2D = D3D11_TEX2D_RTV { MipSlice: 0 };
            } else {
                desc.ViewDimension = D3D11_RTV_DIMENSION_TEXTURE2DARRAY;
                desc.Anonymous.Texture2DArray = D3D11_TEX2D_ARRAY_RTV {
                    MipSlice: 0,
                    FirstArraySlice: first,
                    ArraySize: count,
                };
            }
            let mut view = None;
            // SAFETY: the texture and description are valid for the call.
            unsafe { device.CreateRenderTargetView(&self.texture, Some(&desc), Some(&mut view)) }
                .context("CreateRenderTargetView")?;
            created(view, "CreateRenderTargetView")
        })
    }

    fn depth_stencil_view(&self, device: &ID3D11Device, slice: Slice) -> Result<ID3D11DepthStencilView> {
        self.depth_stencil.get_or_create(slice, &self.name, |slice| {
            let (first, count) = slice_range(&self.desc, slice);
            let mut desc = D3D11_DEPTH_STENCIL_VIEW_DESC {
                Format: dxgi_format(self.desc.format),
                ..Default::default()
            };
            if self.desc.array_size == 1 {
                desc.ViewDimension = D3D11_DSV_DIMENSION_TEXTURE2D;
                desc.Anonymous.Texture2D = D3D11_TEX2D_DSV { MipSlice: 0 };
            } else {
                desc.ViewDimension = D3D11_DSV_DIMENSION_TEXTURE2DARRAY;
                desc.Anonymous.Texture2DArray = D3D11_TEX2D_ARRAY_DSV {
                    MipSlice: 0,
                    FirstArraySlice: first,
                    ArraySize: count,
                };
            }
            let mut view = None;
            // SAFETY: the texture and description are valid for the call.
            unsafe { device.CreateDepthStencilView(&self.texture, Some(&desc), Some(&mut view)) }
                .context("CreateDepthStencilView")?;
            created(view, "CreateDepthStencilView")
        })
    }
}

impl Texture for D3D11Texture {
    type Native = ID3D11Texture2D;

    fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    fn debug_name(&self) -> &str {
        &self.name
    }

    fn native(&self) -> ID3D11Texture2D {
        self.texture.clone()
    }
}

pub struct D3D11Buffer {
    name: String,
    size: usize,
    immutable: bool,
    buffer: ID3D11Buffer,
    contexts: Rc<Contexts>,
}

impl ShaderBuffer for D3D11Buffer {
    fn size(&self) -> usize {
        self.size
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
        if data.len() != self.size {
            return Err(Error::UploadSizeMismatch {
                expected: self.size,
                actual: data.len(),
            });
        }
        let context = self.contexts.current();
        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        // SAFETY: a dynamic buffer mapped with WRITE_DISCARD exposes `size` writable bytes.
        unsafe {
            context
                .Map(&self.buffer, 0, D3D11_MAP_WRITE_DISCARD, 0, Some(&mut mapped))
                .context("Map")?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.pData as *mut u8, data.len());
            context.Unmap(&self.buffer, 0);
        }
        Ok(())
    }
}

pub struct D3D11Mesh {
    vertex_buffer: ID3D11Buffer,
    index_buffer: ID3D11Buffer,
    index_count: u32,
}

impl Mesh for D3D11Mesh {
    fn index_count(&self) -> u32 {
        self.index_count
    }
}

enum Program {
    Pixel(ID3D11PixelShader),
    Compute(ID3D11ComputeShader),
}

pub struct D3D11Shader {
    name: String,
    kind: Cell<ShaderKind>,
    program: Program,
}

impl Shader for D3D11Shader {
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
        false
    }
}

/// Disjoint query bracketing two timestamps.
pub struct D3D11Timer {
    contexts: Rc<Contexts>,
    disjoint: ID3D11Query,
    begin: ID3D11Query,
    end: ID3D11Query,
    state: SampleState,
}

impl D3D11Timer {
    fn read<T: Default>(&self, context: &ID3D11DeviceContext, query: &ID3D11Query) -> Option<T> {
        let mut data = T::default();
        // SAFETY: `data` is exactly the size the query writes.
        let result = unsafe {
            context.GetData(
                query,
                Some(&mut data as *mut T as *mut c_void),
                std::mem::size_of::<T>() as u32,
                0,
            )
        };
        result.ok().map(|_| data)
    }

    fn elapsed_us(&self) -> Option<u64> {
        let context = &self.contexts.immediate;
        let disjoint: D3D11_QUERY_DATA_TIMESTAMP_DISJOINT = self.read(context, &self.disjoint)?;
        let begin: u64 = self.read(context, &self.begin)?;
        let end: u64 = self.read(context, &self.end)?;
        // Unwritten data stays zeroed while the GPU has not caught up.
        if disjoint.Frequency == 0 || disjoint.Disjoint.as_bool() || end <= begin {
            return None;
        }
        Some(((end - begin) as f64 / disjoint.Frequency as f64 * 1e6) as u64)
    }
}

impl GpuTimer for D3D11Timer {
    fn start(&self) -> Result<()> {
        self.state.begin()?;
        let context = self.contexts.current();
        // SAFETY: the queries belong to the context's device.
        unsafe {
            context.Begin(&self.disjoint);
            context.End(&self.begin);
        }
        Ok(())
    }

    fn stop(&self) {
        let context = self.contexts.current();
        // SAFETY: as in `start`.
        unsafe {
            context.End(&self.end);
            context.End(&self.disjoint);
        }
        self.state.end();
    }

    fn query(&self, reset: bool) -> u64 {
        self.state.read(reset, || self.elapsed_us())
    }
}

#[derive(Default)]
struct Bindings {
    shader: Option<Rc<D3D11Shader>>,
    highest_srv: u32,
    highest_uav: u32,
    highest_rtv: u32,
    render_target: Option<(Rc<D3D11Texture>, Slice)>,
    depth: Option<(Rc<D3D11Texture>, Slice)>,
    mesh: Option<Rc<D3D11Mesh>>,
}

pub struct D3D11Device {
    name: String,
    device: ID3D11Device,
    contexts: Rc<Contexts>,
    quad_vertex_shader: ID3D11VertexShader,
    point_clamp: ID3D11SamplerState,
    linear_clamp: ID3D11SamplerState,
    quad_rasterizer: ID3D11RasterizerState,
    quad_rasterizer_msaa: ID3D11RasterizerState,
    mesh_vertex_shader: ID3D11VertexShader,
    mesh_pixel_shader: ID3D11PixelShader,
    mesh_layout: ID3D11InputLayout,
    mesh_transform: Rc<D3D11Buffer>,
    bindings: RefCell<Bindings>,
}

impl D3D11Device {
    pub fn new(device: ID3D11Device) -> Result<Self> {
        // SAFETY: plain COM calls on a live device.
        let (immediate, adapter) = unsafe {
            let immediate = device.GetImmediateContext().context("GetImmediateContext")?;
            let dxgi: IDXGIDevice = device.cast().context("QueryInterface(IDXGIDevice)")?;
            let adapter = dxgi.GetAdapter().context("GetAdapter")?;
            (immediate, adapter.GetDesc().context("GetDesc")?)
        };
        let name = format!("D3D11: {}", adapter_name(&adapter));
        logwise::info_sync!("Using Direct3D 11 on adapter: {name}", name = logwise::privacy::LogIt(&name));

        let contexts = Rc::new(Contexts {
            current: RefCell::new(immediate.clone()),
            immediate,
            deferred: Cell::new(false),
        });

        let quad_vs = compile_text(QUAD_VERTEX_SHADER, "quad vertex shader", "main", "vs_5_0")?;
        let mesh_vs = compile_text(MESH_SHADERS, "mesh shaders", "vsMain", "vs_5_0")?;
        let mesh_ps = compile_text(MESH_SHADERS, "mesh shaders", "psMain", "ps_5_0")?;

        let sampler_desc = |filter: D3D11_FILTER| D3D11_SAMPLER_DESC {
            Filter: filter,
            AddressU: D3D11_TEXTURE_ADDRESS_CLAMP,
            AddressV: D3D11_TEXTURE_ADDRESS_CLAMP,
            AddressW: D3D11_TEXTURE_ADDRESS_CLAMP,
            MaxAnisotropy: 1,
            ComparisonFunc: D3D11_COMPARISON_NEVER,
            MaxLOD: D3D11_FLOAT32_MAX,
            ..Default::default()
        };
        let rasterizer = |msaa: bool| D3D11_RASTERIZER_DESC {
            FillMode: D3D11_FILL_SOLID,
            CullMode: D3D11_CULL_NONE,
            FrontCounterClockwise: BOOL::from(true),
            DepthClipEnable: BOOL::from(true),
            MultisampleEnable: BOOL::from(msaa),
            ..Default::default()
        };
        let layout = [
            D3D11_INPUT_ELEMENT_DESC {
                SemanticName: s!("POSITION"),
                SemanticIndex: 0,
                Format: DXGI_FORMAT_R32G32B32_FLOAT,
                InputSlot: 0,
                AlignedByteOffset: 0,
                InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                InstanceDataStepRate: 0,
            },
            D3D11_INPUT_ELEMENT_DESC {
                SemanticName: s!("COLOR"),
                SemanticIndex: 0,
                Format: DXGI_FORMAT_R32G32B32_FLOAT,
                InputSlot: 0,
                AlignedByteOffset: 12,
                InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                InstanceDataStepRate: 0,
            },
        ];

        let mut quad_vertex_shader = None;
        let mut point_clamp = None;
        let mut linear_clamp = None;
        let mut quad_rasterizer = None;
        let mut quad_rasterizer_msaa = None;
        let mut mesh_vertex_shader = None;
        let mut mesh_pixel_shader = None;
        let mut mesh_layout = None;
        // SAFETY: every description and bytecode slice is valid for its call.
        unsafe {
            device
                .CreateVertexShader(&quad_vs, None, Some(&mut quad_vertex_shader))
                .context("CreateVertexShader")?;
            device
                .CreateSamplerState(&sampler_desc(D3D11_FILTER_MIN_MAG_MIP_POINT), Some(&mut point_clamp))
                .context("CreateSamplerState")?;
            device
                .CreateSamplerState(&sampler_desc(D3D11_FILTER_MIN_MAG_MIP_LINEAR), Some(&mut linear_clamp))
                .context("CreateSamplerState")?;
            device
                .CreateRasterizerState(&rasterizer(false), Some(&mut quad_rasterizer))
                .context("CreateRasterizerState")?;
            device
                .CreateRasterizerState(&rasterizer(true), Some(&mut quad_rasterizer_msaa))
                .context("CreateRasterizerState")?;
            device
                .CreateVertexShader(&mesh_vs, None, Some(&mut mesh_vertex_shader))
                .context("CreateVertexShader")?;
            device
                .CreatePixelShader(&mesh_ps, None, Some(&mut mesh_pixel_shader))
                .context("CreatePixelShader")?;
            device
                .CreateInputLayout(&layout, &mesh_vs, Some(&mut mesh_layout))
                .context("CreateInputLayout")?;
        }

        let mesh_transform = Rc::new(Self::dynamic_buffer(&device, &contexts, 64, "Mesh transform CB")?);

        Ok(D3D11Device {
            name,
            device,
            contexts,
            quad_vertex_shader: created(quad_vertex_shader, "CreateVertexShader")?,
            point_clamp: created(point_clamp, "CreateSamplerState")?,
            linear_clamp: created(linear_clamp, "CreateSamplerState")?,
            quad_rasterizer: created(quad_rasterizer, "CreateRasterizerState")?,
            quad_rasterizer_msaa: created(quad_rasterizer_msaa, "CreateRasterizerState")?,
            mesh_vertex_shader: created(mesh_vertex_shader, "CreateVertexShader")?,
            mesh_pixel_shader: created(mesh_pixel_shader, "CreatePixelShader")?,
            mesh_layout: created(mesh_layout, "CreateInputLayout")?,
            mesh_transform,
            bindings: RefCell::new(Bindings::default()),
        })
    }

    pub fn native(&self) -> &ID3D11Device {
        &self.device
    }

    fn dynamic_buffer(device: &ID3D11Device, contexts: &Rc<Contexts>, size: usize, name: &str) -> Result<D3D11Buffer> {
        let desc = D3D11_BUFFER_DESC {
            ByteWidth: size as u32,
            Usage: D3D11_USAGE_DYNAMIC,
            BindFlags: D3D11_BIND_CONSTANT_BUFFER.0 as u32,
            CPUAccessFlags: D3D11_CPU_ACCESS_WRITE.0 as u32,
            ..Default::default()
        };
        let mut buffer = None;
        // SAFETY: the description is valid for the call.
        unsafe { device.CreateBuffer(&desc, None, Some(&mut buffer)) }.context("CreateBuffer")?;
        let buffer = created(buffer, "CreateBuffer")?;
        set_debug_name(&buffer, name);
        Ok(D3D11Buffer {
            name: name.to_string(),
            size,
            immutable: false,
            buffer,
            contexts: contexts.clone(),
        })
    }

    fn context(&self) -> ID3D11DeviceContext {
        self.contexts.current()
    }

    fn create_query(&self, query: D3D11_QUERY) -> Result<ID3D11Query> {
        let desc = D3D11_QUERY_DESC { Query: query, MiscFlags: 0 };
        let mut out = None;
        // SAFETY: the description is valid for the call.
        unsafe { self.device.CreateQuery(&desc, Some(&mut out)) }.context("CreateQuery")?;
        created(out, "CreateQuery")
    }

    fn bound_shader(&self) -> Result<Rc<D3D11Shader>> {
        self.bindings.borrow().shader.clone().ok_or(Error::NoShaderBound)
    }

    fn set_viewport(&self, context: &ID3D11DeviceContext, desc: &TextureDesc) {
        let viewport = D3D11_VIEWPORT {
            TopLeftX: 0.0,
            TopLeftY: 0.0,
            Width: desc.width as f32,
            Height: desc.height as f32,
            MinDepth: 0.0,
            MaxDepth: 1.0,
        };
        // SAFETY: plain state setter.
        unsafe { context.RSSetViewports(Some(&[viewport])) };
    }

    fn unbind_all(&self, bindings: &mut Bindings, quad: bool) {
        let context = self.context();
        let rtvs: Vec<Option<ID3D11RenderTargetView>> = vec![None; bindings.highest_rtv as usize + 1];
        let srvs: Vec<Option<ID3D11ShaderResourceView>> = vec![None; bindings.highest_srv as usize + 1];
        let uavs: Vec<Option<ID3D11UnorderedAccessView>> = vec![None; bindings.highest_uav as usize + 1];
        // SAFETY: null views unbind the slots.
        unsafe {
            context.OMSetRenderTargets(Some(&rtvs), None);
            if quad {
                context.PSSetShaderResources(0, Some(&srvs));
            } else {
                context.CSSetShaderResources(0, Some(&srvs));
            }
            context.CSSetUnorderedAccessViews(0, uavs.len() as u32, Some(uavs.as_ptr()), None);
        }
        bindings.highest_rtv = 0;
        bindings.highest_srv = 0;
        bindings.highest_uav = 0;
        bindings.shader = None;
    }
}

impl Device for D3D11Device {
    type Texture = D3D11Texture;
    type Buffer = D3D11Buffer;
    type Shader = D3D11Shader;
    type Mesh = D3D11Mesh;
    type Timer = D3D11Timer;

    fn api(&self) -> Api {
        Api::D3D11
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn create_texture(
        &self,
        desc: &TextureDesc,
        debug_name: &str,
        initial_data: Option<(&[u8], u32)>,
    ) -> Result<Rc<D3D11Texture>> {
        let native_desc = D3D11_TEXTURE2D_DESC {
            Width: desc.width,
            Height: desc.height,
            MipLevels: desc.mip_count,
            ArraySize: desc.array_size,
            Format: dxgi_format(desc.format),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: desc.sample_count,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: bind_flags(desc),
            CPUAccessFlags: 0,
            MiscFlags: 0,
        };
        let data = initial_data.map(|(bytes, row_pitch)| D3D11_SUBRESOURCE_DATA {
            pSysMem: bytes.as_ptr() as *const c_void,
            SysMemPitch: row_pitch,
            SysMemSlicePitch: bytes.len() as u32,
        });
        let mut texture = None;
        // SAFETY: `data` borrows `initial_data`, which outlives the call.
        unsafe {
            self.device.CreateTexture2D(
                &native_desc,
                data.as_ref().map(|d| d as *const D3D11_SUBRESOURCE_DATA),
                Some(&mut texture),
            )
        }
        .context("CreateTexture2D")?;
        let texture = created(texture, "CreateTexture2D")?;
        Ok(Rc::new(D3D11Texture::new(desc, debug_name, texture)))
    }

    fn open_texture(&self, native: ID3D11Texture2D, desc: &TextureDesc, debug_name: &str) -> Result<Rc<D3D11Texture>> {
        Ok(Rc::new(D3D11Texture::new(desc, debug_name, native)))
    }

    fn create_buffer(
        &self,
        size: usize,
        debug_name: &str,
        initial_data: Option<&[u8]>,
        immutable: bool,
    ) -> Result<Rc<D3D11Buffer>> {
        let Some(initial) = initial_data else {
            return Ok(Rc::new(Self::dynamic_buffer(&self.device, &self.contexts, size, debug_name)?));
        };
        if initial.len() != size {
            return Err(Error::UploadSizeMismatch {
                expected: size,
                actual: initial.len(),
            });
        }
        let desc = D3D11_BUFFER_DESC {
            ByteWidth: size as u32,
            Usage: if immutable {
                D3D11_USAGE_IMMUTABLE
            } else {
                D3D11_USAGE_DYNAMIC
            },
            BindFlags: D3D11_BIND_CONSTANT_BUFFER.0 as u32,
            CPUAccessFlags: if immutable { 0 } else { D3D11_CPU_ACCESS_WRITE.0 as u32 },
            ..Default::default()
        };
        let data = D3D11_SUBRESOURCE_DATA {
            pSysMem: initial.as_ptr() as *const c_void,
            ..Default::default()
        };
        let mut buffer = None;
        // SAFETY: `data` points to `size` bytes.
        unsafe { self.device.CreateBuffer(&desc, Some(&data), Some(&mut buffer)) }.context("CreateBuffer")?;
        let buffer = created(buffer, "CreateBuffer")?;
        set_debug_name(&buffer, debug_name);
        Ok(Rc::new(D3D11Buffer {
            name: debug_name.to_string(),
            size,
            immutable,
            buffer,
            contexts: self.contexts.clone(),
        }))
    }

    fn create_simple_mesh(
        &self,
        vertices: &[SimpleMeshVertex],
        indices: &[u16],
        debug_name: &str,
    ) -> Result<Rc<D3D11Mesh>> {
        let immutable = |bytes: usize, bind: D3D11_BIND_FLAG, data: *const c_void| -> Result<ID3D11Buffer> {
            let desc = D3D11_BUFFER_DESC {
                ByteWidth: bytes as u32,
                Usage: D3D11_USAGE_IMMUTABLE,
                BindFlags: bind.0 as u32,
                ..Default::default()
            };
            let init = D3D11_SUBRESOURCE_DATA {
                pSysMem: data,
                ..Default::default()
            };
            let mut buffer = None;
            // SAFETY: `data` points to `bytes` bytes borrowed from the caller.
            unsafe { self.device.CreateBuffer(&desc, Some(&init), Some(&mut buffer)) }.context("CreateBuffer")?;
            let buffer = created(buffer, "CreateBuffer")?;
            set_debug_name(&buffer, debug_name);
            Ok(buffer)
        };
        let vertex_buffer = immutable(
            std::mem::size_of_val(vertices),
            D3D11_BIND_VERTEX_BUFFER,
            vertices.as_ptr() as *const c_void,
        )?;
        let index_buffer = immutable(
            std::mem::size_of_val(indices),
            D3D11_BIND_INDEX_BUFFER,
            indices.as_ptr() as *const c_void,
        )?;
        Ok(Rc::new(D3D11Mesh {
            vertex_buffer,
            index_buffer,
            index_count: indices.len() as u32,
        }))
    }

    fn create_shader(&self, source: &ShaderSource<'_>, kind: ShaderKind, debug_name: &str) -> Result<Rc<D3D11Shader>> {
        let program = match kind {
            ShaderKind::Quad => {
                let bytes = compile_file(source, "ps_5_0")?;
                let mut shader = None;
                // SAFETY: `bytes` is compiled bytecode.
                unsafe { self.device.CreatePixelShader(&bytes, None, Some(&mut shader)) }
                    .context("CreatePixelShader")?;
                let shader = created(shader, "CreatePixelShader")?;
                set_debug_name(&shader, debug_name);
                Program::Pixel(shader)
            }
            ShaderKind::Compute { .. } => {
                let bytes = compile_file(source, "cs_5_0")?;
                let mut shader = None;
                // SAFETY: `bytes` is compiled bytecode.
                unsafe { self.device.CreateComputeShader(&bytes, None, Some(&mut shader)) }
                    .context("CreateComputeShader")?;
                let shader = created(shader, "CreateComputeShader")?;
                set_debug_name(&shader, debug_name);
                Program::Compute(shader)
            }
        };
        Ok(Rc::new(D3D11Shader {
            name: debug_name.to_string(),
            kind: Cell::new(kind),
            program,
        }))
    }

    fn create_timer(&self) -> Result<D3D11Timer> {
        Ok(D3D11Timer {
            contexts: self.contexts.clone(),
            disjoint: self.create_query(D3D11_QUERY_TIMESTAMP_DISJOINT)?,
            begin: self.create_query(D3D11_QUERY_TIMESTAMP)?,
            end: self.create_query(D3D11_QUERY_TIMESTAMP)?,
            state: SampleState::default(),
        })
    }

    fn set_shader(&self, shader: &Rc<D3D11Shader>) -> Result<()> {
        let context = self.context();
        let sampler = match shader.kind().sampler() {
            SamplerFilter::PointClamp => &self.point_clamp,
            SamplerFilter::LinearClamp => &self.linear_clamp,
        };
        let samplers = [Some(sampler.clone())];
        // SAFETY: state setters with live objects.
        unsafe {
            match &shader.program {
                Program::Pixel(pixel) => {
                    context.OMSetBlendState(None, None, 0xffff_ffff);
                    context.OMSetDepthStencilState(None, 0);
                    context.IASetIndexBuffer(None, DXGI_FORMAT_UNKNOWN, 0);
                    context.IASetVertexBuffers(0, 0, None, None, None);
                    context.IASetInputLayout(None);
                    context.IASetPrimitiveTopology(D3D11_PRIMITIVE_TOPOLOGY_TRIANGLESTRIP);
                    context.VSSetShader(&self.quad_vertex_shader, None);
                    context.PSSetSamplers(0, Some(&samplers));
                    context.PSSetShader(pixel, None);
                }
                Program::Compute(compute) => {
                    context.CSSetSamplers(0, Some(&samplers));
                    context.CSSetShader(compute, None);
                }
            }
        }
        let mut bindings = self.bindings.borrow_mut();
        bindings.highest_srv = 0;
        bindings.highest_uav = 0;
        bindings.highest_rtv = 0;
        bindings.shader = Some(shader.clone());
        Ok(())
    }

    fn set_shader_input_texture(&self, slot: u32, texture: &Rc<D3D11Texture>, slice: Slice) -> Result<()> {
        let shader = self.bound_shader()?;
        let view = [Some(texture.shader_input_view(&self.device, slice)?)];
        let context = self.context();
        // SAFETY: binds a live view.
        unsafe {
            match shader.program {
                Program::Pixel(_) => context.PSSetShaderResources(slot, Some(&view)),
                Program::Compute(_) => context.CSSetShaderResources(slot, Some(&view)),
            }
        }
        let mut bindings = self.bindings.borrow_mut();
        bindings.highest_srv = bindings.highest_srv.max(slot);
        Ok(())
    }

    fn set_shader_input_buffer(&self, slot: u32, buffer: &Rc<D3D11Buffer>) -> Result<()> {
        let shader = self.bound_shader()?;
        let buffers = [Some(buffer.buffer.clone())];
        let context = self.context();
        // SAFETY: binds a live buffer.
        unsafe {
            match shader.program {
                Program::Pixel(_) => context.PSSetConstantBuffers(slot, Some(&buffers)),
                Program::Compute(_) => context.CSSetConstantBuffers(slot, Some(&buffers)),
            }
        }
        Ok(())
    }

    fn set_shader_output(&self, slot: u32, texture: &Rc<D3D11Texture>, slice: Slice) -> Result<()> {
        let shader = self.bound_shader()?;
        match shader.program {
            Program::Pixel(_) => {
                if slot != 0 {
                    return Err(Error::QuadOutputSlot { slot });
                }
                self.set_render_targets(&[(texture, slice)], None)?;
                let rasterizer = if texture.desc.sample_count > 1 {
                    &self.quad_rasterizer_msaa
                } else {
                    &self.quad_rasterizer
                };
                // SAFETY: plain state setter.
                unsafe { self.context().RSSetState(rasterizer) };
            }
            Program::Compute(_) => {
                let views = [Some(texture.unordered_access_view(&self.device, slice)?)];
                // SAFETY: binds a live view.
                unsafe {
                    self.context()
                        .CSSetUnorderedAccessViews(slot, 1, Some(views.as_ptr()), None)
                };
                let mut bindings = self.bindings.borrow_mut();
                bindings.highest_uav = bindings.highest_uav.max(slot);
            }
        }
        Ok(())
    }

    fn dispatch_shader(&self, preserve_bindings: bool) -> Result<()> {
        let shader = self.bound_shader()?;
        let context = self.context();
        let quad = matches!(shader.program, Program::Pixel(_));
        // SAFETY: the pipeline was set up by the binding calls.
        unsafe {
            match shader.kind() {
                ShaderKind::Quad => context.Draw(3, 0),
                ShaderKind::Compute { thread_groups: [x, y, z] } => context.Dispatch(x, y, z),
            }
        }
        if !preserve_bindings {
            self.unbind_all(&mut self.bindings.borrow_mut(), quad);
        }
        Ok(())
    }

    fn set_render_targets(
        &self,
        targets: &[(&Rc<D3D11Texture>, Slice)],
        depth: Option<(&Rc<D3D11Texture>, Slice)>,
    ) -> Result<()> {
        let mut views = Vec::with_capacity(targets.len());
        for (texture, slice) in targets {
            views.push(Some(texture.render_target_view(&self.device, *slice)?));
        }
        let depth_view = match depth {
            Some((texture, slice)) => Some(texture.depth_stencil_view(&self.device, slice)?),
            None => None,
        };
        let context = self.context();
        // SAFETY: binds live views.
        unsafe { context.OMSetRenderTargets(Some(&views), depth_view.as_ref()) };

        let mut bindings = self.bindings.borrow_mut();
        match targets.first() {
            Some((first, slice)) => {
                self.set_viewport(&context, &first.desc);
                bindings.render_target = Some(((*first).clone(), *slice));
                bindings.depth = depth.map(|(t, s)| (t.clone(), s));
                bindings.highest_rtv = bindings.highest_rtv.max(targets.len() as u32 - 1);
            }
            None => {
                bindings.render_target = None;
                bindings.depth = None;
            }
        }
        Ok(())
    }

    fn unset_render_targets(&self) {
        let views: [Option<ID3D11RenderTargetView>; 8] = Default::default();
        // SAFETY: null views unbind the slots.
        unsafe { self.context().OMSetRenderTargets(Some(&views), None) };
        let mut bindings = self.bindings.borrow_mut();
        bindings.render_target = None;
        bindings.depth = None;
        bindings.mesh = None;
    }

    fn clear_color(&self, top: f32, left: f32, bottom: f32, right: f32, color: [f32; 4]) -> Result<()> {
        let Some((texture, slice)) = self.bindings.borrow().render_target.clone() else {
            return Ok(());
        };
        let Ok(context) = self.context().cast::<ID3D11DeviceContext1>() else {
            // Feature level too low for ClearView.
            return Ok(());
        };
        let view = texture.render_target_view(&self.device, slice)?;
        let rect = RECT {
            left: left as i32,
            top: top as i32,
            right: right as i32,
            bottom: bottom as i32,
        };
        // SAFETY: `color` holds four floats.
        unsafe { context.ClearView(&view, color.as_ptr(), Some(&[rect])) };
        Ok(())
    }

    fn clear_depth(&self, value: f32) -> Result<()> {
        let Some((texture, slice)) = self.bindings.borrow().depth.clone() else {
            return Ok(());
        };
        let view = texture.depth_stencil_view(&self.device, slice)?;
        // SAFETY: clears a live view.
        unsafe {
            self.context()
                .ClearDepthStencilView(&view, D3D11_CLEAR_DEPTH.0 as u32, value, 0)
        };
        Ok(())
    }

    fn draw_mesh(&self, mesh: &Rc<D3D11Mesh>, transform: &[f32; 16]) -> Result<()> {
        let bytes: Vec<u8> = transform.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.mesh_transform.upload_data(&bytes)?;

        let context = self.context();
        let mut bindings = self.bindings.borrow_mut();
        let same_mesh = bindings.mesh.as_ref().is_some_and(|m| Rc::ptr_eq(m, mesh));
        if !same_mesh {
            let constants = [Some(self.mesh_transform.buffer.clone())];
            let vertex_buffers = [Some(mesh.vertex_buffer.clone())];
            let stride = std::mem::size_of::<SimpleMeshVertex>() as u32;
            let offset = 0u32;
            // SAFETY: binds live buffers and shaders.
            unsafe {
                context.VSSetConstantBuffers(0, Some(&constants));
                context.VSSetShader(&self.mesh_vertex_shader, None);
                context.PSSetShader(&self.mesh_pixel_shader, None);
                context.GSSetShader(None, None);
                context.IASetVertexBuffers(0, 1, Some(vertex_buffers.as_ptr()), Some(&stride), Some(&offset));
                context.IASetIndexBuffer(&mesh.index_buffer, DXGI_FORMAT_R16_UINT, 0);
                context.IASetPrimitiveTopology(D3D11_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
                context.IASetInputLayout(&self.mesh_layout);
            }
            bindings.mesh = Some(mesh.clone());
        }
        // SAFETY: the mesh pipeline is bound above.
        unsafe { context.DrawIndexed(mesh.index_count, 0, 0) };
        Ok(())
    }

    fn save_context(&self, clear: bool) -> Result<()> {
        if self.contexts.deferred.get() {
            logwise::warn_sync!("save_context called twice; keeping the current deferred context");
            return Ok(());
        }
        let mut deferred = None;
        // SAFETY: plain COM call.
        unsafe { self.device.CreateDeferredContext(0, Some(&mut deferred)) }.context("CreateDeferredContext")?;
        let deferred = created(deferred, "CreateDeferredContext")?;
        if clear {
            // SAFETY: resets a context we own.
            unsafe { deferred.ClearState() };
        }
        *self.contexts.current.borrow_mut() = deferred;
        self.contexts.deferred.set(true);
        Ok(())
    }

    fn restore_context(&self) -> Result<()> {
        if !self.contexts.deferred.get() {
            return Ok(());
        }
        let deferred = self.contexts.current();
        *self.contexts.current.borrow_mut() = self.contexts.immediate.clone();
        self.contexts.deferred.set(false);

        let mut list = None;
        // SAFETY: the deferred context is ours and finished exactly once.
        unsafe { deferred.FinishCommandList(false, Some(&mut list)) }.context("FinishCommandList")?;
        let list = created(list, "FinishCommandList")?;
        // SAFETY: replays on the immediate context, restoring its state afterwards.
        unsafe { self.contexts.immediate.ExecuteCommandList(&list, true) };
        Ok(())
    }

    fn flush_context(&self, blocking: bool) -> Result<()> {
        if !blocking {
            return Ok(());
        }
        let event = self.create_query(D3D11_QUERY_EVENT)?;
        let context = &self.contexts.immediate;
        // SAFETY: flushes and polls an event query we own.
        unsafe {
            context.End(&event);
            context.Flush();
            loop {
                let mut done = BOOL::default();
                let result = context.GetData(
                    &event,
                    Some(&mut done as *mut BOOL as *mut c_void),
                    std::mem::size_of::<BOOL>() as u32,
                    0,
                );
                if result.is_err() || done.as_bool() {
                    break;
                }
                std::thread::yield_now();
            }
        }
        Ok(())
    }

    fn read_texture(&self, texture: &Rc<D3D11Texture>, slice: Slice) -> Result<ReadbackImage> {
        let desc = texture.desc;
        let staging_desc = D3D11_TEXTURE2D_DESC {
            Width: desc.width,
            Height: desc.height,
            MipLevels: 1,
            ArraySize: 1,
            Format: dxgi_format(desc.format),
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Usage: D3D11_USAGE_STAGING,
            BindFlags: 0,
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            MiscFlags: 0,
        };
        let mut staging = None;
        // SAFETY: the description is valid for the call.
        unsafe { self.device.CreateTexture2D(&staging_desc, None, Some(&mut staging)) }.context("CreateTexture2D")?;
        let staging = created(staging, "CreateTexture2D")?;

        let subresource = slice.index().unwrap_or(0) * desc.mip_count;
        let context = &self.contexts.immediate;
        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        // SAFETY: the mapped staging texture holds `height` rows of `RowPitch` bytes.
        let data = unsafe {
            context.CopySubresourceRegion(&staging, 0, 0, 0, 0, &texture.texture, subresource, None);
            context.Map(&staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped)).context("Map")?;
            let len = mapped.RowPitch as usize * desc.height as usize;
            let data = std::slice::from_raw_parts(mapped.pData as *const u8, len).to_vec();
            context.Unmap(&staging, 0);
            data
        };
        Ok(ReadbackImage {
            width: desc.width,
            height: desc.height,
            row_pitch: mapped.RowPitch,
            format: desc.format,
            data,
        })
    }

    fn shutdown(&self) {
        *self.bindings.borrow_mut() = Bindings::default();
        logwise::info_sync!("D3D11 device shut down");
    }
}
