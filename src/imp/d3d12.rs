// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Direct3D 12 backend.

Work is recorded on a ring of command lists submitted to the application's queue. Each
ring slot remembers the fence value of its last submission and is only reset once the
GPU has passed it.

Textures are moved into the state each binding needs and put back into their home state
(the state the application or the runtime expects) before every submission. Shaders
build their root signature and pipeline state on first dispatch, see
[crate::graphics::resolve].
*/

use crate::error::{Error, Result};
use crate::graphics::format::view_format;
use crate::graphics::heap::{HeapKind, SlotAllocator};
use crate::graphics::resolve::{PipelineResolution, RootParameter, RootParameterKind};
use crate::graphics::timer::SampleState;
use crate::graphics::view_cache::ViewCache;
use crate::graphics::{
    Api, Device, GpuTimer, Mesh, SamplerFilter, Shader, ShaderBuffer, ShaderKind, ShaderSource, SimpleMeshVertex, Slice,
    Texture, TextureDesc, ViewKind,
};
use crate::imp::native::{NativeContext, QUAD_VERTEX_SHADER, adapter_name, compile_file, compile_text, created};
use crate::screenshot::ReadbackImage;
use openxr_sys as xr;
use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::mem::ManuallyDrop;
use std::rc::Rc;
use windows::Win32::Foundation::{CloseHandle, HANDLE, RECT};
use windows::Win32::Graphics::Direct3D::{D3D_PRIMITIVE_TOPOLOGY_TRIANGLESTRIP, ID3DBlob};
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT, DXGI_FORMAT_UNKNOWN, DXGI_SAMPLE_DESC};
use windows::Win32::Graphics::Dxgi::{CreateDXGIFactory1, IDXGIAdapter1, IDXGIFactory4};
use windows::Win32::System::Threading::{CreateEventW, INFINITE, WaitForSingleObject};
use windows::core::{HSTRING, Interface};

/// Two frames in flight, each possibly split in two submissions.
const COMMAND_LISTS: usize = 4;

fn dxgi_format(format: i64) -> DXGI_FORMAT {
    DXGI_FORMAT(format as i32)
}

fn align(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

fn set_debug_name<T: Interface>(object: &T, name: &str) {
    if let Ok(object) = object.cast::<ID3D12Object>() {
        // SAFETY: plain COM call.
        let _ = unsafe { object.SetName(&HSTRING::from(name)) };
    }
}

/// The state a texture is in between submissions.
fn home_state(desc: &TextureDesc) -> D3D12_RESOURCE_STATES {
    if desc.has_usage(xr::SwapchainUsageFlags::COLOR_ATTACHMENT) {
        D3D12_RESOURCE_STATE_RENDER_TARGET
    } else if desc.has_usage(xr::SwapchainUsageFlags::DEPTH_STENCIL_ATTACHMENT) {
        D3D12_RESOURCE_STATE_DEPTH_WRITE
    } else if desc.has_usage(xr::SwapchainUsageFlags::UNORDERED_ACCESS) {
        D3D12_RESOURCE_STATE_UNORDERED_ACCESS
    } else {
        D3D12_RESOURCE_STATE_COMMON
    }
}

fn transition(resource: &ID3D12Resource, before: D3D12_RESOURCE_STATES, after: D3D12_RESOURCE_STATES) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                // SAFETY: borrowed for the lifetime of the barrier without a reference count.
                pResource: unsafe { std::mem::transmute_copy(resource) },
                Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                StateBefore: before,
                StateAfter: after,
            }),
        },
    }
}

fn heap_properties(kind: D3D12_HEAP_TYPE) -> D3D12_HEAP_PROPERTIES {
    D3D12_HEAP_PROPERTIES {
        Type: kind,
        ..Default::default()
    }
}

fn buffer_desc(size: u64) -> D3D12_RESOURCE_DESC {
    D3D12_RESOURCE_DESC {
        Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
        Alignment: 0,
        Width: size,
        Height: 1,
        DepthOrArraySize: 1,
        MipLevels: 1,
        Format: DXGI_FORMAT_UNKNOWN,
        SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
        Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
        Flags: D3D12_RESOURCE_FLAG_NONE,
    }
}

fn texture_desc(desc: &TextureDesc) -> D3D12_RESOURCE_DESC {
    let mut flags = D3D12_RESOURCE_FLAG_NONE;
    if desc.has_usage(xr::SwapchainUsageFlags::COLOR_ATTACHMENT) {
        flags |= D3D12_RESOURCE_FLAG_ALLOW_RENDER_TARGET;
    }
    if desc.has_usage(xr::SwapchainUsageFlags::DEPTH_STENCIL_ATTACHMENT) {
        flags |= D3D12_RESOURCE_FLAG_ALLOW_DEPTH_STENCIL;
        if !desc.has_usage(xr::SwapchainUsageFlags::SAMPLED) {
            flags |= D3D12_RESOURCE_FLAG_DENY_SHADER_RESOURCE;
        }
    }
    if desc.has_usage(xr::SwapchainUsageFlags::UNORDERED_ACCESS) {
        flags |= D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS;
    }
    D3D12_RESOURCE_DESC {
        Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
        Alignment: 0,
        Width: desc.width as u64,
        Height: desc.height,
        DepthOrArraySize: desc.array_size as u16,
        MipLevels: desc.mip_count as u16,
        Format: dxgi_format(desc.format),
        SampleDesc: DXGI_SAMPLE_DESC {
            Count: desc.sample_count,
            Quality: 0,
        },
        Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
        Flags: flags,
    }
}

fn committed_resource(
    device: &ID3D12Device,
    heap: D3D12_HEAP_TYPE,
    desc: &D3D12_RESOURCE_DESC,
    state: D3D12_RESOURCE_STATES,
) -> Result<ID3D12Resource> {
    let mut resource: Option<ID3D12Resource> = None;
    // SAFETY: the descriptions are valid for the call.
    unsafe {
        device.CreateCommittedResource(
            &heap_properties(heap),
            D3D12_HEAP_FLAG_NONE,
            desc,
            state,
            None,
            &mut resource,
        )
    }
    .context("CreateCommittedResource")?;
    created(resource, "CreateCommittedResource")
}

fn first_and_count(desc: &TextureDesc, slice: Slice) -> (u32, u32) {
    match slice {
        Slice::All => (0, desc.array_size),
        Slice::Index(index) => (index, 1),
    }
}

/// A descriptor as seen by the CPU and, for shader-visible heaps, by shaders.
#[derive(Clone, Copy)]
struct Descriptor {
    cpu: D3D12_CPU_DESCRIPTOR_HANDLE,
    gpu: D3D12_GPU_DESCRIPTOR_HANDLE,
}

struct DescriptorHeap {
    heap: ID3D12DescriptorHeap,
    slots: SlotAllocator,
    increment: u32,
    cpu_start: D3D12_CPU_DESCRIPTOR_HANDLE,
    gpu_start: D3D12_GPU_DESCRIPTOR_HANDLE,
}

impl DescriptorHeap {
    fn new(device: &ID3D12Device, kind: HeapKind) -> Result<Self> {
        let heap_type = match kind {
            HeapKind::ShaderResource => D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
            HeapKind::Sampler => D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER,
            HeapKind::RenderTarget => D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
            HeapKind::DepthStencil => D3D12_DESCRIPTOR_HEAP_TYPE_DSV,
        };
        let desc = D3D12_DESCRIPTOR_HEAP_DESC {
            Type: heap_type,
            NumDescriptors: kind.capacity(),
            Flags: if kind.shader_visible() {
                D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE
            } else {
                D3D12_DESCRIPTOR_HEAP_FLAG_NONE
            },
            NodeMask: 0,
        };
        // SAFETY: plain COM calls with a valid description.
        unsafe {
            let heap: ID3D12DescriptorHeap = device.CreateDescriptorHeap(&desc).context("CreateDescriptorHeap")?;
            let cpu_start = heap.GetCPUDescriptorHandleForHeapStart();
            let gpu_start = if kind.shader_visible() {
                heap.GetGPUDescriptorHandleForHeapStart()
            } else {
                D3D12_GPU_DESCRIPTOR_HANDLE::default()
            };
            Ok(DescriptorHeap {
                heap,
                slots: SlotAllocator::new(kind),
                increment: device.GetDescriptorHandleIncrementSize(heap_type),
                cpu_start,
                gpu_start,
            })
        }
    }

    fn allocate(&self) -> Result<Descriptor> {
        let index = self.slots.allocate()? as u64 * self.increment as u64;
        Ok(Descriptor {
            cpu: D3D12_CPU_DESCRIPTOR_HANDLE {
                ptr: self.cpu_start.ptr + index as usize,
            },
            gpu: D3D12_GPU_DESCRIPTOR_HANDLE {
                ptr: self.gpu_start.ptr + index,
            },
        })
    }
}

struct CommandSlot {
    allocator: ID3D12CommandAllocator,
    list: ID3D12GraphicsCommandList,
    /// Fence value signaled after this slot's last submission.
    fence_value: Cell<u64>,
}

struct CommandRing {
    queue: ID3D12CommandQueue,
    fence: ID3D12Fence,
    event: HANDLE,
    last_signaled: Cell<u64>,
    slots: Vec<CommandSlot>,
    current: Cell<usize>,
}

impl CommandRing {
    fn new(device: &ID3D12Device, queue: ID3D12CommandQueue) -> Result<Self> {
        let mut slots = Vec::with_capacity(COMMAND_LISTS);
        for index in 0..COMMAND_LISTS {
            // SAFETY: plain COM calls.
            unsafe {
                let allocator: ID3D12CommandAllocator = device
                    .CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT)
                    .context("CreateCommandAllocator")?;
                let list: ID3D12GraphicsCommandList = device
                    .CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_DIRECT, &allocator, None)
                    .context("CreateCommandList")?;
                set_debug_name(&list, &format!("Layer command list {index}"));
                // Only the current list is left open for recording.
                if index != 0 {
                    list.Close().context("Close")?;
                }
                slots.push(CommandSlot {
                    allocator,
                    list,
                    fence_value: Cell::new(0),
                });
            }
        }
        // SAFETY: plain COM and Win32 calls.
        let (fence, event) = unsafe {
            let fence: ID3D12Fence = device.CreateFence(0, D3D12_FENCE_FLAG_NONE).context("CreateFence")?;
            let event = CreateEventW(None, false, false, None).context("CreateEventW")?;
            (fence, event)
        };
        Ok(CommandRing {
            queue,
            fence,
            event,
            last_signaled: Cell::new(0),
            slots,
            current: Cell::new(0),
        })
    }

    fn list(&self) -> &ID3D12GraphicsCommandList {
        &self.slots[self.current.get()].list
    }

    /// Fence value the next submission will signal.
    fn next_fence_value(&self) -> u64 {
        self.last_signaled.get() + 1
    }

    fn is_complete(&self, value: u64) -> bool {
        // SAFETY: plain COM call.
        unsafe { self.fence.GetCompletedValue() >= value }
    }

    fn wait(&self, value: u64) -> Result<()> {
        if self.is_complete(value) {
            return Ok(());
        }
        // SAFETY: the event handle is owned by the ring.
        unsafe {
            self.fence
                .SetEventOnCompletion(value, self.event)
                .context("SetEventOnCompletion")?;
            WaitForSingleObject(self.event, INFINITE);
        }
        Ok(())
    }

    /// Submits the current list and opens the next one.
    fn submit(&self, blocking: bool) -> Result<()> {
        let slot = &self.slots[self.current.get()];
        let value = self.next_fence_value();
        // SAFETY: the list is open and owned by the ring.
        unsafe {
            slot.list.Close().context("Close")?;
            let list: ID3D12CommandList = slot.list.cast().context("QueryInterface(ID3D12CommandList)")?;
            self.queue.ExecuteCommandLists(&[Some(list)]);
            self.queue.Signal(&self.fence, value).context("Signal")?;
        }
        self.last_signaled.set(value);
        slot.fence_value.set(value);
        if blocking {
            self.wait(value)?;
        }

        let next = (self.current.get() + 1) % self.slots.len();
        let slot = &self.slots[next];
        self.wait(slot.fence_value.get())?;
        // SAFETY: the GPU is done with this slot.
        unsafe {
            slot.allocator.Reset().context("Reset")?;
            slot.list.Reset(&slot.allocator, None).context("Reset")?;
        }
        self.current.set(next);
        Ok(())
    }
}

impl Drop for CommandRing {
    fn drop(&mut self) {
        let _ = self.wait(self.last_signaled.get());
        // SAFETY: the event was created by the ring.
        let _ = unsafe { CloseHandle(self.event) };
    }
}

pub struct D3D12Texture {
    desc: TextureDesc,
    name: String,
    resource: ID3D12Resource,
    home: D3D12_RESOURCE_STATES,
    state: Cell<D3D12_RESOURCE_STATES>,
    shader_input: ViewCache<Descriptor>,
    unordered_access: ViewCache<Descriptor>,
    render_target: ViewCache<Descriptor>,
    depth_stencil: ViewCache<Descriptor>,
}

impl D3D12Texture {
    fn new(desc: &TextureDesc, name: &str, resource: ID3D12Resource) -> Self {
        set_debug_name(&resource, name);
        let home = home_state(desc);
        D3D12Texture {
            desc: *desc,
            name: name.to_string(),
            resource,
            home,
            state: Cell::new(home),
            shader_input: ViewCache::new(ViewKind::ShaderInput, desc),
            unordered_access: ViewCache::new(ViewKind::UnorderedAccess, desc),
            render_target: ViewCache::new(ViewKind::RenderTarget, desc),
            depth_stencil: ViewCache::new(ViewKind::DepthStencil, desc),
        }
    }
}

impl Texture for D3D12Texture {
    type Native = ID3D12Resource;

    fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    fn debug_name(&self) -> &str {
        &self.name
    }

    fn native(&self) -> ID3D12Resource {
        self.resource.clone()
    }
}

pub struct D3D12Buffer {
    name: String,
    size: usize,
    buffer: ID3D12Resource,
    /// Staging copy for mutable buffers.
    upload: Option<ID3D12Resource>,
    state: Cell<D3D12_RESOURCE_STATES>,
    view: Descriptor,
    ring: Rc<CommandRing>,
}

impl ShaderBuffer for D3D12Buffer {
    fn size(&self) -> usize {
        self.size
    }

    fn is_immutable(&self) -> bool {
        self.upload.is_none()
    }

    fn upload_data(&self, data: &[u8]) -> Result<()> {
        let Some(upload) = &self.upload else {
            return Err(Error::Immutable {
                buffer: self.name.clone(),
            });
        };
        if data.len() != self.size {
            return Err(Error::UploadSizeMismatch {
                expected: self.size,
                actual: data.len(),
            });
        }
        let list = self.ring.list();
        // SAFETY: the upload buffer holds at least `size` bytes and is CPU-writable.
        unsafe {
            let mut mapped: *mut c_void = std::ptr::null_mut();
            upload.Map(0, None, Some(&mut mapped)).context("Map")?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped as *mut u8, data.len());
            upload.Unmap(0, None);

            let before = self.state.get();
            if before != D3D12_RESOURCE_STATE_COPY_DEST {
                list.ResourceBarrier(&[transition(&self.buffer, before, D3D12_RESOURCE_STATE_COPY_DEST)]);
            }
            list.CopyBufferRegion(&self.buffer, 0, upload, 0, data.len() as u64);
            list.ResourceBarrier(&[transition(
                &self.buffer,
                D3D12_RESOURCE_STATE_COPY_DEST,
                D3D12_RESOURCE_STATE_VERTEX_AND_CONSTANT_BUFFER,
            )]);
        }
        self.state.set(D3D12_RESOURCE_STATE_VERTEX_AND_CONSTANT_BUFFER);
        Ok(())
    }
}

/// Meshes are only drawn by the Direct3D 11 backend.
pub enum D3D12Mesh {}

impl Mesh for D3D12Mesh {
    fn index_count(&self) -> u32 {
        match *self {}
    }
}

struct Pipeline {
    root_signature: ID3D12RootSignature,
    state: ID3D12PipelineState,
}

pub struct D3D12Shader {
    name: String,
    kind: Cell<ShaderKind>,
    bytecode: Vec<u8>,
    /// Format and sample count of the render target, captured for quad pipelines.
    output: Cell<Option<(i64, u32)>>,
    resolution: RefCell<PipelineResolution<Pipeline, D3D12_GPU_DESCRIPTOR_HANDLE>>,
}

impl Shader for D3D12Shader {
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

/// Timestamp pair resolved into a readback buffer.
pub struct D3D12Timer {
    ring: Rc<CommandRing>,
    heap: ID3D12QueryHeap,
    readback: ID3D12Resource,
    frequency: u64,
    /// Fence value after which the resolved timestamps are readable.
    ready_at: Cell<u64>,
    state: SampleState,
}

impl D3D12Timer {
    fn elapsed_us(&self) -> Option<u64> {
        if self.frequency == 0 || !self.ring.is_complete(self.ready_at.get()) {
            return None;
        }
        let mut stamps = [0u64; 2];
        let range = D3D12_RANGE {
            Begin: 0,
            End: std::mem::size_of_val(&stamps),
        };
        // SAFETY: the readback buffer holds two timestamps and the GPU is done writing them.
        unsafe {
            let mut mapped: *mut c_void = std::ptr::null_mut();
            self.readback.Map(0, Some(&range), Some(&mut mapped)).ok()?;
            std::ptr::copy_nonoverlapping(mapped as *const u64, stamps.as_mut_ptr(), 2);
            self.readback.Unmap(0, Some(&D3D12_RANGE::default()));
        }
        let [begin, end] = stamps;
        if end <= begin {
            return None;
        }
        Some(((end - begin) as f64 / self.frequency as f64 * 1e6) as u64)
    }
}

impl GpuTimer for D3D12Timer {
    fn start(&self) -> Result<()> {
        self.state.begin()?;
        // SAFETY: records into the open list.
        unsafe { self.ring.list().EndQuery(&self.heap, D3D12_QUERY_TYPE_TIMESTAMP, 0) };
        Ok(())
    }

    fn stop(&self) {
        let list = self.ring.list();
        // SAFETY: records into the open list.
        unsafe {
            list.EndQuery(&self.heap, D3D12_QUERY_TYPE_TIMESTAMP, 1);
            list.ResolveQueryData(&self.heap, D3D12_QUERY_TYPE_TIMESTAMP, 0, 2, &self.readback, 0);
        }
        self.ready_at.set(self.ring.next_fence_value());
        self.state.end();
    }

    fn query(&self, reset: bool) -> u64 {
        self.state.read(reset, || self.elapsed_us())
    }
}

#[derive(Default)]
struct Bindings {
    shader: Option<Rc<D3D12Shader>>,
    render_target: Option<(Rc<D3D12Texture>, Slice)>,
    depth: Option<(Rc<D3D12Texture>, Slice)>,
}

pub struct D3D12Device {
    name: String,
    device: ID3D12Device,
    ring: Rc<CommandRing>,
    timestamp_frequency: u64,
    resource_heap: DescriptorHeap,
    sampler_heap: DescriptorHeap,
    render_target_heap: DescriptorHeap,
    depth_stencil_heap: DescriptorHeap,
    point_clamp: Descriptor,
    linear_clamp: Descriptor,
    quad_vertex_shader: Vec<u8>,
    bindings: RefCell<Bindings>,
    /// Textures moved out of their home state since the last submission.
    touched: RefCell<Vec<Rc<D3D12Texture>>>,
}

impl D3D12Device {
    pub fn new(device: ID3D12Device, queue: ID3D12CommandQueue) -> Result<Self> {
        // SAFETY: plain COM calls on live objects.
        let (adapter, timestamp_frequency) = unsafe {
            let factory: IDXGIFactory4 = CreateDXGIFactory1().context("CreateDXGIFactory1")?;
            let adapter: IDXGIAdapter1 = factory
                .EnumAdapterByLuid(device.GetAdapterLuid())
                .context("EnumAdapterByLuid")?;
            let desc = adapter.GetDesc().context("GetDesc")?;
            (desc, queue.GetTimestampFrequency().unwrap_or(0))
        };
        let name = format!("D3D12: {}", adapter_name(&adapter));
        logwise::info_sync!("Using Direct3D 12 on adapter: {name}", name = logwise::privacy::LogIt(&name));

        let ring = Rc::new(CommandRing::new(&device, queue)?);
        let resource_heap = DescriptorHeap::new(&device, HeapKind::ShaderResource)?;
        let sampler_heap = DescriptorHeap::new(&device, HeapKind::Sampler)?;
        let render_target_heap = DescriptorHeap::new(&device, HeapKind::RenderTarget)?;
        let depth_stencil_heap = DescriptorHeap::new(&device, HeapKind::DepthStencil)?;

        let point_clamp = sampler_heap.allocate()?;
        let linear_clamp = sampler_heap.allocate()?;
        let sampler = |filter: D3D12_FILTER| D3D12_SAMPLER_DESC {
            Filter: filter,
            AddressU: D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
            AddressV: D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
            AddressW: D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
            MaxAnisotropy: 1,
            ComparisonFunc: D3D12_COMPARISON_FUNC_NEVER,
            MaxLOD: D3D12_FLOAT32_MAX,
            ..Default::default()
        };
        // SAFETY: both handles point into the sampler heap.
        unsafe {
            device.CreateSampler(&sampler(D3D12_FILTER_MIN_MAG_MIP_POINT), point_clamp.cpu);
            device.CreateSampler(&sampler(D3D12_FILTER_MIN_MAG_MIP_LINEAR), linear_clamp.cpu);
        }

        let quad_vertex_shader = compile_text(QUAD_VERTEX_SHADER, "quad vertex shader", "main", "vs_5_0")?;

        Ok(D3D12Device {
            name,
            device,
            ring,
            timestamp_frequency,
            resource_heap,
            sampler_heap,
            render_target_heap,
            depth_stencil_heap,
            point_clamp,
            linear_clamp,
            quad_vertex_shader,
            bindings: RefCell::new(Bindings::default()),
            touched: RefCell::new(Vec::new()),
        })
    }

    pub fn native(&self) -> &ID3D12Device {
        &self.device
    }

    fn list(&self) -> &ID3D12GraphicsCommandList {
        self.ring.list()
    }

    fn require_state(&self, texture: &Rc<D3D12Texture>, state: D3D12_RESOURCE_STATES) {
        let before = texture.state.get();
        if before == state {
            return;
        }
        // SAFETY: records into the open list.
        unsafe { self.list().ResourceBarrier(&[transition(&texture.resource, before, state)]) };
        texture.state.set(state);
        if before == texture.home {
            self.touched.borrow_mut().push(texture.clone());
        }
    }

    fn restore_home_states(&self) {
        let touched = std::mem::take(&mut *self.touched.borrow_mut());
        let barriers: Vec<_> = touched
            .iter()
            .filter(|t| t.state.get() != t.home)
            .map(|t| {
                let barrier = transition(&t.resource, t.state.get(), t.home);
                t.state.set(t.home);
                barrier
            })
            .collect();
        if !barriers.is_empty() {
            // SAFETY: records into the open list.
            unsafe { self.list().ResourceBarrier(&barriers) };
        }
    }

    fn shader_input_view(&self, texture: &D3D12Texture, slice: Slice) -> Result<Descriptor> {
        texture.shader_input.get_or_create(slice, &texture.name, |slice| {
            let descriptor = self.resource_heap.allocate()?;
            let (first, count) = first_and_count(&texture.desc, slice);
            let mut desc = D3D12_SHADER_RESOURCE_VIEW_DESC {
                Format: dxgi_format(view_format(texture.desc.format, ViewKind::ShaderInput)),
                Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
                ..Default::default()
            };
            if texture.desc.array_size == 1 {
                desc.ViewDimension = D3D12_SRV_DIMENSION_TEXTURE2D;
                desc.Anonymous.Texture2D = D3D12_TEX2D_SRV {
                    MostDetailedMip: 0,
                    MipLevels: texture.desc.mip_count,
                    PlaneSlice: 0,
                    ResourceMinLODClamp: 0.0,
                };
            } else {
                desc.ViewDimension = D3D12_SRV_DIMENSION_TEXTURE2DARRAY;
                desc.Anonymous.Texture2DArray = D3D12_TEX2D_ARRAY_SRV {
                    MostDetailedMip: 0,
                    MipLevels: texture.desc.mip_count,
                    FirstArraySlice: first,
                    ArraySize: count,
                    PlaneSlice: 0,
                    ResourceMinLODClamp: 0.0,
                };
            }
            // SAFETY: the handle points into the resource heap.
            unsafe { self.device.CreateShaderResourceView(&texture.resource, Some(&desc), descriptor.cpu) };
            Ok(descriptor)
        })
    }

    fn unordered_access_view(&self, texture: &D3D12Texture, slice: Slice) -> Result<Descriptor> {
        texture.unordered_access.get_or_create(slice, &texture.name, |slice| {
            let descriptor = self.resource_heap.allocate()?;
            let (first, count) = first_and_count(&texture.desc, slice);
            let mut desc = D3D12_UNORDERED_ACCESS_VIEW_DESC {
                Format: dxgi_format(view_format(texture.desc.format, ViewKind::UnorderedAccess)),
                ..Default::default()
            };
            if texture.desc.array_size == 1 {
                desc.ViewDimension = D3D12_UAV_DIMENSION_TEXTURE2D;
                desc.Anonymous.Texture2D = D3D12_TEX2D_UAV {
                    MipSlice: 0,
                    PlaneSlice: 0,
                };
            } else {
                desc.ViewDimension = D3D12_UAV_DIMENSION_TEXTURE2DARRAY;
                desc.Anonymous.Texture2DArray = D3D12_TEX2D_ARRAY_UAV {
                    MipSlice: 0,
                    FirstArraySlice: first,
                    ArraySize: count,
                    PlaneSlice: 0,
                };
            }
            // SAFETY: the handle points into the resource heap.
            unsafe {
                self.device
                    .CreateUnorderedAccessView(&texture.resource, None, Some(&desc), descriptor.cpu)
            };
            Ok(descriptor)
        })
    }

    fn render_target_view(&self, texture: &D3D12Texture, slice: Slice) -> Result<Descriptor> {
        texture.render_target.get_or_create(slice, &texture.name, |slice| {
            let descriptor = self.render_target_heap.allocate()?;
            let (first, count) = first_and_count(&texture.desc, slice);
            let mut desc = D3D12_RENDER_TARGET_VIEW_DESC {
                Format: dxgi_format(view_format(texture.desc.format, ViewKind::RenderTarget)),
                ..Default::default()
            };
            if texture.desc.array_size == 1 {
                desc.ViewDimension = D3D12_RTV_DIMENSION_TEXTURE2D;
                desc.Anonymous.Texture2D = D3D12_TEX2D_RTV {
                    MipSlice: 0,
                    PlaneSlice: 0,
                };
            } else {
                desc.ViewDimension = D3D12_RTV_DIMENSION_TEXTURE2DARRAY;
                desc.Anonymous.Texture2DArray = D3D12_TEX2D_ARRAY_RTV {
                    MipSlice: 0,
                    FirstArraySlice: first,
                    ArraySize: count,
                    PlaneSlice: 0,
                };
            }
            // SAFETY: the handle points into the render target heap.
            unsafe { self.device.CreateRenderTargetView(&texture.resource, Some(&desc), descriptor.cpu) };
            Ok(descriptor)
        })
    }

    fn depth_stencil_view(&self, texture: &D3D12Texture, slice: Slice) -> Result<Descriptor> {
        texture.depth_stencil.get_or_create(slice, &texture.name, |slice| {
            let descriptor = self.depth_stencil_heap.allocate()?;
            let (first, count) = first_and_count(&texture.desc, slice);
            let mut desc = D3D12_DEPTH_STENCIL_VIEW_DESC {
                Format: dxgi_format(texture.desc.format),
                ..Default::default()
            };
            if texture.desc.array_size == 1 {
                desc.ViewDimension = D3D12_DSV_DIMENSION_TEXTURE2D;
                desc.Anonymous.Texture2D = D3D12_TEX2D_DSV { MipSlice: 0 };
            } else {
                desc.ViewDimension = D3D12_DSV_DIMENSION_TEXTURE2DARRAY;
                desc.Anonymous.Texture2DArray = D3D12_TEX2D_ARRAY_DSV {
                    MipSlice: 0,
                    FirstArraySlice: first,
                    ArraySize: count,
                };
            }
            // SAFETY: the handle points into the depth stencil heap.
            unsafe { self.device.CreateDepthStencilView(&texture.resource, Some(&desc), descriptor.cpu) };
            Ok(descriptor)
        })
    }

    fn bound_shader(&self) -> Result<Rc<D3D12Shader>> {
        self.bindings.borrow().shader.clone().ok_or(Error::NoShaderBound)
    }

    /// Records a binding for the pipeline being discovered, or swaps it into the frozen layout.
    fn bind_parameter(&self, shader: &D3D12Shader, kind: RootParameterKind, slot: u32, handle: D3D12_GPU_DESCRIPTOR_HANDLE) -> Result<()> {
        let mut resolution = shader.resolution.borrow_mut();
        if resolution.needs_resolve() {
            return resolution.register(kind, slot, handle);
        }
        if !resolution.rebind(kind, slot, handle) {
            logwise::warn_sync!(
                "Binding {kind} slot {slot} is not part of the pipeline of {shader}",
                kind = logwise::privacy::LogIt(&kind),
                slot = slot,
                shader = logwise::privacy::LogIt(&shader.name)
            );
        }
        Ok(())
    }

    fn root_signature(&self, parameters: &[RootParameter<D3D12_GPU_DESCRIPTOR_HANDLE>]) -> Result<ID3D12RootSignature> {
        let ranges: Vec<D3D12_DESCRIPTOR_RANGE> = parameters
            .iter()
            .map(|p| D3D12_DESCRIPTOR_RANGE {
                RangeType: match p.kind {
                    RootParameterKind::Sampler => D3D12_DESCRIPTOR_RANGE_TYPE_SAMPLER,
                    RootParameterKind::ConstantBuffer => D3D12_DESCRIPTOR_RANGE_TYPE_CBV,
                    RootParameterKind::ShaderResource => D3D12_DESCRIPTOR_RANGE_TYPE_SRV,
                    RootParameterKind::UnorderedAccess => D3D12_DESCRIPTOR_RANGE_TYPE_UAV,
                },
                NumDescriptors: 1,
                BaseShaderRegister: p.slot,
                RegisterSpace: 0,
                OffsetInDescriptorsFromTableStart: D3D12_DESCRIPTOR_RANGE_OFFSET_APPEND,
            })
            .collect();
        let root_parameters: Vec<D3D12_ROOT_PARAMETER> = ranges
            .iter()
            .map(|range| D3D12_ROOT_PARAMETER {
                ParameterType: D3D12_ROOT_PARAMETER_TYPE_DESCRIPTOR_TABLE,
                Anonymous: D3D12_ROOT_PARAMETER_0 {
                    DescriptorTable: D3D12_ROOT_DESCRIPTOR_TABLE {
                        NumDescriptorRanges: 1,
                        pDescriptorRanges: range,
                    },
                },
                ShaderVisibility: D3D12_SHADER_VISIBILITY_ALL,
            })
            .collect();
        let desc = D3D12_ROOT_SIGNATURE_DESC {
            NumParameters: root_parameters.len() as u32,
            pParameters: root_parameters.as_ptr(),
            NumStaticSamplers: 0,
            pStaticSamplers: std::ptr::null(),
            Flags: D3D12_ROOT_SIGNATURE_FLAG_NONE,
        };
        let mut blob: Option<ID3DBlob> = None;
        let mut errors: Option<ID3DBlob> = None;
        // SAFETY: `ranges` and `root_parameters` outlive the call.
        let serialized =
            unsafe { D3D12SerializeRootSignature(&desc, D3D_ROOT_SIGNATURE_VERSION_1, &mut blob, Some(&mut errors)) };
        if let Err(source) = serialized {
            if let Some(errors) = errors {
                // SAFETY: the blob owns its buffer.
                let message = unsafe {
                    String::from_utf8_lossy(std::slice::from_raw_parts(
                        errors.GetBufferPointer() as *const u8,
                        errors.GetBufferSize(),
                    ))
                    .into_owned()
                };
                logwise::error_sync!(
                    "Root signature serialization failed: {message}",
                    message = logwise::privacy::LogIt(&message)
                );
            }
            return Err(Error::Native {
                operation: "D3D12SerializeRootSignature",
                source,
            });
        }
        let blob = created(blob, "D3D12SerializeRootSignature")?;
        // SAFETY: the blob owns its buffer.
        unsafe {
            let bytes = std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize());
            self.device.CreateRootSignature(0, bytes).context("CreateRootSignature")
        }
    }

    fn build_pipeline(
        &self,
        shader: &D3D12Shader,
        parameters: &[RootParameter<D3D12_GPU_DESCRIPTOR_HANDLE>],
    ) -> Result<Pipeline> {
        let root_signature = self.root_signature(parameters)?;
        let bytecode = |code: &[u8]| D3D12_SHADER_BYTECODE {
            pShaderBytecode: code.as_ptr() as *const c_void,
            BytecodeLength: code.len(),
        };
        let state: ID3D12PipelineState = match shader.kind() {
            ShaderKind::Compute { .. } => {
                let desc = D3D12_COMPUTE_PIPELINE_STATE_DESC {
                    // SAFETY: borrowed for the duration of the call.
                    pRootSignature: unsafe { std::mem::transmute_copy(&root_signature) },
                    CS: bytecode(&shader.bytecode),
                    ..Default::default()
                };
                // SAFETY: the description and bytecode are valid for the call.
                unsafe { self.device.CreateComputePipelineState(&desc) }.context("CreateComputePipelineState")?
            }
            ShaderKind::Quad => {
                let (format, samples) = shader.output.get().unwrap_or((0, 1));
                let target_blend = D3D12_RENDER_TARGET_BLEND_DESC {
                    BlendEnable: false.into(),
                    LogicOpEnable: false.into(),
                    SrcBlend: D3D12_BLEND_ONE,
                    DestBlend: D3D12_BLEND_ZERO,
                    BlendOp: D3D12_BLEND_OP_ADD,
                    SrcBlendAlpha: D3D12_BLEND_ONE,
                    DestBlendAlpha: D3D12_BLEND_ZERO,
                    BlendOpAlpha: D3D12_BLEND_OP_ADD,
                    LogicOp: D3D12_LOGIC_OP_NOOP,
                    RenderTargetWriteMask: D3D12_COLOR_WRITE_ENABLE_ALL.0 as u8,
                };
                let mut rtv_formats = [DXGI_FORMAT_UNKNOWN; 8];
                rtv_formats[0] = dxgi_format(view_format(format, ViewKind::RenderTarget));
                let desc = D3D12_GRAPHICS_PIPELINE_STATE_DESC {
                    // SAFETY: borrowed for the duration of the call.
                    pRootSignature: unsafe { std::mem::transmute_copy(&root_signature) },
                    VS: bytecode(&self.quad_vertex_shader),
                    PS: bytecode(&shader.bytecode),
                    BlendState: D3D12_BLEND_DESC {
                        AlphaToCoverageEnable: false.into(),
                        IndependentBlendEnable: false.into(),
                        RenderTarget: [target_blend; 8],
                    },
                    SampleMask: u32::MAX,
                    RasterizerState: D3D12_RASTERIZER_DESC {
                        FillMode: D3D12_FILL_MODE_SOLID,
                        CullMode: D3D12_CULL_MODE_NONE,
                        DepthClipEnable: true.into(),
                        MultisampleEnable: (samples > 1).into(),
                        ..Default::default()
                    },
                    PrimitiveTopologyType: D3D12_PRIMITIVE_TOPOLOGY_TYPE_TRIANGLE,
                    NumRenderTargets: 1,
                    RTVFormats: rtv_formats,
                    SampleDesc: DXGI_SAMPLE_DESC {
                        Count: samples,
                        Quality: 0,
                    },
                    ..Default::default()
                };
                // SAFETY: the description and bytecode are valid for the call.
                unsafe { self.device.CreateGraphicsPipelineState(&desc) }.context("CreateGraphicsPipelineState")?
            }
        };
        set_debug_name(&state, &shader.name);
        logwise::info_sync!(
            "Pipeline for {shader} resolved with {count} root parameters",
            shader = logwise::privacy::LogIt(&shader.name),
            count = parameters.len()
        );
        Ok(Pipeline { root_signature, state })
    }
}

impl Device for D3D12Device {
    type Texture = D3D12Texture;
    type Buffer = D3D12Buffer;
    type Shader = D3D12Shader;
    type Mesh = D3D12Mesh;
    type Timer = D3D12Timer;

    fn api(&self) -> Api {
        Api::D3D12
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn create_texture(
        &self,
        desc: &TextureDesc,
        debug_name: &str,
        initial_data: Option<(&[u8], u32)>,
    ) -> Result<Rc<D3D12Texture>> {
        let native_desc = texture_desc(desc);
        let resource = committed_resource(&self.device, D3D12_HEAP_TYPE_DEFAULT, &native_desc, home_state(desc))?;
        let texture = Rc::new(D3D12Texture::new(desc, debug_name, resource));

        if let Some((data, row_pitch)) = initial_data {
            let aligned_pitch = align(row_pitch as u64, D3D12_TEXTURE_DATA_PITCH_ALIGNMENT as u64);
            let rows = desc.height as u64;
            let upload = committed_resource(
                &self.device,
                D3D12_HEAP_TYPE_UPLOAD,
                &buffer_desc(aligned_pitch * rows),
                D3D12_RESOURCE_STATE_GENERIC_READ,
            )?;
            // SAFETY: the upload buffer holds `rows` rows of `aligned_pitch` bytes.
            unsafe {
                let mut mapped: *mut c_void = std::ptr::null_mut();
                upload.Map(0, None, Some(&mut mapped)).context("Map")?;
                for (row, chunk) in data.chunks(row_pitch as usize).take(rows as usize).enumerate() {
                    let target = (mapped as *mut u8).add(row * aligned_pitch as usize);
                    std::ptr::copy_nonoverlapping(chunk.as_ptr(), target, chunk.len());
                }
                upload.Unmap(0, None);
            }

            self.require_state(&texture, D3D12_RESOURCE_STATE_COPY_DEST);
            let source = D3D12_TEXTURE_COPY_LOCATION {
                // SAFETY: borrowed for the duration of the call.
                pResource: unsafe { std::mem::transmute_copy(&upload) },
                Type: D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
                Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                    PlacedFootprint: D3D12_PLACED_SUBRESOURCE_FOOTPRINT {
                        Offset: 0,
                        Footprint: D3D12_SUBRESOURCE_FOOTPRINT {
                            Format: native_desc.Format,
                            Width: desc.width,
                            Height: desc.height,
                            Depth: 1,
                            RowPitch: aligned_pitch as u32,
                        },
                    },
                },
            };
            let destination = D3D12_TEXTURE_COPY_LOCATION {
                // SAFETY: as above.
                pResource: unsafe { std::mem::transmute_copy(&texture.resource) },
                Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
                Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 { SubresourceIndex: 0 },
            };
            // SAFETY: records into the open list.
            unsafe { self.list().CopyTextureRegion(&destination, 0, 0, 0, &source, None) };
            // The upload buffer must live until the copy executed.
            self.flush_context(true)?;
        }
        Ok(texture)
    }

    fn open_texture(&self, native: ID3D12Resource, desc: &TextureDesc, debug_name: &str) -> Result<Rc<D3D12Texture>> {
        Ok(Rc::new(D3D12Texture::new(desc, debug_name, native)))
    }

    fn create_buffer(
        &self,
        size: usize,
        debug_name: &str,
        initial_data: Option<&[u8]>,
        immutable: bool,
    ) -> Result<Rc<D3D12Buffer>> {
        if let Some(initial) = initial_data
            && initial.len() != size
        {
            return Err(Error::UploadSizeMismatch {
                expected: size,
                actual: initial.len(),
            });
        }
        let aligned = align(size as u64, D3D12_CONSTANT_BUFFER_DATA_PLACEMENT_ALIGNMENT as u64);
        let view = self.resource_heap.allocate()?;
        let frozen = immutable && initial_data.is_some();

        // Immutable buffers are read straight from the upload heap.
        let (buffer, upload, state) = if frozen {
            let buffer = committed_resource(
                &self.device,
                D3D12_HEAP_TYPE_UPLOAD,
                &buffer_desc(aligned),
                D3D12_RESOURCE_STATE_GENERIC_READ,
            )?;
            (buffer, None, D3D12_RESOURCE_STATE_GENERIC_READ)
        } else {
            let buffer = committed_resource(
                &self.device,
                D3D12_HEAP_TYPE_DEFAULT,
                &buffer_desc(aligned),
                D3D12_RESOURCE_STATE_COMMON,
            )?;
            let upload = committed_resource(
                &self.device,
                D3D12_HEAP_TYPE_UPLOAD,
                &buffer_desc(aligned),
                D3D12_RESOURCE_STATE_GENERIC_READ,
            )?;
            (buffer, Some(upload), D3D12_RESOURCE_STATE_COMMON)
        };
        set_debug_name(&buffer, debug_name);

        // SAFETY: the view describes the whole buffer; the handle points into the resource heap.
        unsafe {
            let desc = D3D12_CONSTANT_BUFFER_VIEW_DESC {
                BufferLocation: buffer.GetGPUVirtualAddress(),
                SizeInBytes: aligned as u32,
            };
            self.device.CreateConstantBufferView(Some(&desc), view.cpu);
        }

        let buffer = Rc::new(D3D12Buffer {
            name: debug_name.to_string(),
            size,
            buffer,
            upload,
            state: Cell::new(state),
            view,
            ring: self.ring.clone(),
        });
        if let Some(initial) = initial_data {
            if frozen {
                // SAFETY: the upload-heap buffer holds at least `size` bytes.
                unsafe {
                    let mut mapped: *mut c_void = std::ptr::null_mut();
                    buffer.buffer.Map(0, None, Some(&mut mapped)).context("Map")?;
                    std::ptr::copy_nonoverlapping(initial.as_ptr(), mapped as *mut u8, initial.len());
                    buffer.buffer.Unmap(0, None);
                }
            } else {
                buffer.upload_data(initial)?;
            }
        }
        Ok(buffer)
    }

    fn create_simple_mesh(
        &self,
        _vertices: &[SimpleMeshVertex],
        _indices: &[u16],
        _debug_name: &str,
    ) -> Result<Rc<D3D12Mesh>> {
        Err(Error::Unsupported {
            feature: "simple meshes",
            api: Api::D3D12,
        })
    }

    fn create_shader(&self, source: &ShaderSource<'_>, kind: ShaderKind, debug_name: &str) -> Result<Rc<D3D12Shader>> {
        let target = match kind {
            ShaderKind::Quad => "ps_5_0",
            ShaderKind::Compute { .. } => "cs_5_0",
        };
        let bytecode = compile_file(source, target)?;
        Ok(Rc::new(D3D12Shader {
            name: debug_name.to_string(),
            kind: Cell::new(kind),
            bytecode,
            output: Cell::new(None),
            resolution: RefCell::new(PipelineResolution::new()),
        }))
    }

    fn create_timer(&self) -> Result<D3D12Timer> {
        let desc = D3D12_QUERY_HEAP_DESC {
            Type: D3D12_QUERY_HEAP_TYPE_TIMESTAMP,
            Count: 2,
            NodeMask: 0,
        };
        let mut heap: Option<ID3D12QueryHeap> = None;
        // SAFETY: the description is valid for the call.
        unsafe { self.device.CreateQueryHeap(&desc, &mut heap) }.context("CreateQueryHeap")?;
        let readback = committed_resource(
            &self.device,
            D3D12_HEAP_TYPE_READBACK,
            &buffer_desc(16),
            D3D12_RESOURCE_STATE_COPY_DEST,
        )?;
        Ok(D3D12Timer {
            ring: self.ring.clone(),
            heap: created(heap, "CreateQueryHeap")?,
            readback,
            frequency: self.timestamp_frequency,
            ready_at: Cell::new(0),
            state: SampleState::default(),
        })
    }

    fn set_shader(&self, shader: &Rc<D3D12Shader>) -> Result<()> {
        let heaps = [
            Some(self.resource_heap.heap.clone()),
            Some(self.sampler_heap.heap.clone()),
        ];
        // SAFETY: records into the open list.
        unsafe { self.list().SetDescriptorHeaps(&heaps) };
        self.bindings.borrow_mut().shader = Some(shader.clone());
        let sampler = match shader.kind().sampler() {
            SamplerFilter::PointClamp => self.point_clamp.gpu,
            SamplerFilter::LinearClamp => self.linear_clamp.gpu,
        };
        self.bind_parameter(shader, RootParameterKind::Sampler, 0, sampler)
    }

    fn set_shader_input_texture(&self, slot: u32, texture: &Rc<D3D12Texture>, slice: Slice) -> Result<()> {
        let shader = self.bound_shader()?;
        let view = self.shader_input_view(texture, slice)?;
        self.require_state(
            texture,
            D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE | D3D12_RESOURCE_STATE_NON_PIXEL_SHADER_RESOURCE,
        );
        self.bind_parameter(&shader, RootParameterKind::ShaderResource, slot, view.gpu)
    }

    fn set_shader_input_buffer(&self, slot: u32, buffer: &Rc<D3D12Buffer>) -> Result<()> {
        let shader = self.bound_shader()?;
        self.bind_parameter(&shader, RootParameterKind::ConstantBuffer, slot, buffer.view.gpu)
    }

    fn set_shader_output(&self, slot: u32, texture: &Rc<D3D12Texture>, slice: Slice) -> Result<()> {
        let shader = self.bound_shader()?;
        match shader.kind() {
            ShaderKind::Quad => {
                if slot != 0 {
                    return Err(Error::QuadOutputSlot { slot });
                }
                self.set_render_targets(&[(texture, slice)], None)?;
                if shader.needs_resolve() {
                    shader.output.set(Some((texture.desc.format, texture.desc.sample_count)));
                }
                Ok(())
            }
            ShaderKind::Compute { .. } => {
                let view = self.unordered_access_view(texture, slice)?;
                self.require_state(texture, D3D12_RESOURCE_STATE_UNORDERED_ACCESS);
                self.bind_parameter(&shader, RootParameterKind::UnorderedAccess, slot, view.gpu)
            }
        }
    }

    fn dispatch_shader(&self, preserve_bindings: bool) -> Result<()> {
        let shader = self.bound_shader()?;
        let mut resolution = shader.resolution.borrow_mut();
        let (root_signature, state) = {
            let pipeline = resolution.resolve(|parameters| self.build_pipeline(&shader, parameters))?;
            (pipeline.root_signature.clone(), pipeline.state.clone())
        };
        let list = self.list();
        // SAFETY: records into the open list; every table points into the bound heaps.
        unsafe {
            match shader.kind() {
                ShaderKind::Quad => {
                    list.SetGraphicsRootSignature(&root_signature);
                    list.SetPipelineState(&state);
                    list.IASetPrimitiveTopology(D3D_PRIMITIVE_TOPOLOGY_TRIANGLESTRIP);
                }
                ShaderKind::Compute { .. } => {
                    list.SetComputeRootSignature(&root_signature);
                    list.SetPipelineState(&state);
                }
            }
        }
        for (index, parameter) in resolution.parameters().iter().enumerate() {
            // SAFETY: as above.
            unsafe {
                match shader.kind() {
                    ShaderKind::Quad => list.SetGraphicsRootDescriptorTable(index as u32, parameter.handle),
                    ShaderKind::Compute { .. } => list.SetComputeRootDescriptorTable(index as u32, parameter.handle),
                }
            }
        }
        // SAFETY: as above.
        unsafe {
            match shader.kind() {
                ShaderKind::Quad => list.DrawInstanced(3, 1, 0, 0),
                ShaderKind::Compute { thread_groups: [x, y, z] } => list.Dispatch(x, y, z),
            }
        }
        drop(resolution);
        if !preserve_bindings {
            self.bindings.borrow_mut().shader = None;
        }
        Ok(())
    }

    fn set_render_targets(
        &self,
        targets: &[(&Rc<D3D12Texture>, Slice)],
        depth: Option<(&Rc<D3D12Texture>, Slice)>,
    ) -> Result<()> {
        let mut views = Vec::with_capacity(targets.len());
        for (texture, slice) in targets {
            views.push(self.render_target_view(texture, *slice)?.cpu);
            self.require_state(texture, D3D12_RESOURCE_STATE_RENDER_TARGET);
        }
        let depth_view = match depth {
            Some((texture, slice)) => {
                let view = self.depth_stencil_view(texture, slice)?.cpu;
                self.require_state(texture, D3D12_RESOURCE_STATE_DEPTH_WRITE);
                Some(view)
            }
            None => None,
        };
        let list = self.list();
        // SAFETY: records into the open list; `views` outlives the call.
        unsafe {
            list.OMSetRenderTargets(
                views.len() as u32,
                (!views.is_empty()).then_some(views.as_ptr()),
                false,
                depth_view.as_ref().map(|v| v as *const D3D12_CPU_DESCRIPTOR_HANDLE),
            );
        }

        let mut bindings = self.bindings.borrow_mut();
        match targets.first() {
            Some((first, slice)) => {
                let viewport = D3D12_VIEWPORT {
                    TopLeftX: 0.0,
                    TopLeftY: 0.0,
                    Width: first.desc.width as f32,
                    Height: first.desc.height as f32,
                    MinDepth: 0.0,
                    MaxDepth: 1.0,
                };
                let scissor = RECT {
                    left: 0,
                    top: 0,
                    right: first.desc.width as i32,
                    bottom: first.desc.height as i32,
                };
                // SAFETY: as above.
                unsafe {
                    list.RSSetViewports(&[viewport]);
                    list.RSSetScissorRects(&[scissor]);
                }
                bindings.render_target = Some(((*first).clone(), *slice));
                bindings.depth = depth.map(|(t, s)| (t.clone(), s));
            }
            None => {
                bindings.render_target = None;
                bindings.depth = None;
            }
        }
        Ok(())
    }

    fn unset_render_targets(&self) {
        // SAFETY: records into the open list.
        unsafe { self.list().OMSetRenderTargets(0, None, false, None) };
        let mut bindings = self.bindings.borrow_mut();
        bindings.render_target = None;
        bindings.depth = None;
    }

    fn clear_color(&self, top: f32, left: f32, bottom: f32, right: f32, color: [f32; 4]) -> Result<()> {
        let Some((texture, slice)) = self.bindings.borrow().render_target.clone() else {
            return Ok(());
        };
        let view = self.render_target_view(&texture, slice)?;
        let rect = RECT {
            left: left as i32,
            top: top as i32,
            right: right as i32,
            bottom: bottom as i32,
        };
        // SAFETY: `color` holds four floats.
        unsafe { self.list().ClearRenderTargetView(view.cpu, color.as_ptr(), Some(&[rect])) };
        Ok(())
    }

    fn clear_depth(&self, value: f32) -> Result<()> {
        let Some((texture, slice)) = self.bindings.borrow().depth.clone() else {
            return Ok(());
        };
        let view = self.depth_stencil_view(&texture, slice)?;
        // SAFETY: records into the open list.
        unsafe {
            self.list()
                .ClearDepthStencilView(view.cpu, D3D12_CLEAR_FLAG_DEPTH, value, 0, None)
        };
        Ok(())
    }

    fn draw_mesh(&self, mesh: &Rc<D3D12Mesh>, _transform: &[f32; 16]) -> Result<()> {
        match **mesh {}
    }

    // The command list is private to the layer, there is no application state to protect.
    fn save_context(&self, _clear: bool) -> Result<()> {
        Ok(())
    }

    fn restore_context(&self) -> Result<()> {
        Ok(())
    }

    fn flush_context(&self, blocking: bool) -> Result<()> {
        self.restore_home_states();
        self.ring.submit(blocking)
    }

    fn read_texture(&self, texture: &Rc<D3D12Texture>, slice: Slice) -> Result<ReadbackImage> {
        let desc = texture.desc;
        let subresource = slice.index().unwrap_or(0) * desc.mip_count;
        let native_desc = texture_desc(&desc);
        let mut footprint = D3D12_PLACED_SUBRESOURCE_FOOTPRINT::default();
        let mut total = 0u64;
        // SAFETY: out-pointers are valid for one subresource.
        unsafe {
            self.device.GetCopyableFootprints(
                &native_desc,
                subresource,
                1,
                0,
                Some(&mut footprint),
                None,
                None,
                Some(&mut total),
            )
        };
        let readback = committed_resource(
            &self.device,
            D3D12_HEAP_TYPE_READBACK,
            &buffer_desc(total),
            D3D12_RESOURCE_STATE_COPY_DEST,
        )?;

        self.require_state(texture, D3D12_RESOURCE_STATE_COPY_SOURCE);
        let source = D3D12_TEXTURE_COPY_LOCATION {
            // SAFETY: borrowed for the duration of the call.
            pResource: unsafe { std::mem::transmute_copy(&texture.resource) },
            Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
            Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                SubresourceIndex: subresource,
            },
        };
        let destination = D3D12_TEXTURE_COPY_LOCATION {
            // SAFETY: as above.
            pResource: unsafe { std::mem::transmute_copy(&readback) },
            Type: D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
            Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                PlacedFootprint: footprint,
            },
        };
        // SAFETY: records into the open list.
        unsafe { self.list().CopyTextureRegion(&destination, 0, 0, 0, &source, None) };
        self.flush_context(true)?;

        let row_pitch = footprint.Footprint.RowPitch;
        let len = row_pitch as usize * desc.height as usize;
        // SAFETY: the GPU finished writing `total` bytes into the readback buffer.
        let data = unsafe {
            let mut mapped: *mut c_void = std::ptr::null_mut();
            readback.Map(0, None, Some(&mut mapped)).context("Map")?;
            let data = std::slice::from_raw_parts(mapped as *const u8, len.min(total as usize)).to_vec();
            readback.Unmap(0, Some(&D3D12_RANGE::default()));
            data
        };
        Ok(ReadbackImage {
            width: desc.width,
            height: desc.height,
            row_pitch,
            format: desc.format,
            data,
        })
    }

    fn shutdown(&self) {
        *self.bindings.borrow_mut() = Bindings::default();
        self.touched.borrow_mut().clear();
        logwise::info_sync!("D3D12 device shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphics::format::dxgi;

    #[test]
    fn home_state_follows_usage() {
        let color = TextureDesc::new(dxgi::R8G8B8A8_UNORM, 4, 4).with_usage(xr::SwapchainUsageFlags::COLOR_ATTACHMENT);
        assert_eq!(home_state(&color), D3D12_RESOURCE_STATE_RENDER_TARGET);
        let compute = TextureDesc::new(dxgi::R10G10B10A2_UNORM, 4, 4)
            .with_usage(xr::SwapchainUsageFlags::SAMPLED)
            .with_usage(xr::SwapchainUsageFlags::UNORDERED_ACCESS);
        assert_eq!(home_state(&compute), D3D12_RESOURCE_STATE_UNORDERED_ACCESS);
        let sampled = TextureDesc::new(dxgi::R8G8B8A8_UNORM, 4, 4).with_usage(xr::SwapchainUsageFlags::SAMPLED);
        assert_eq!(home_state(&sampled), D3D12_RESOURCE_STATE_COMMON);
    }

    #[test]
    fn constant_buffers_are_padded() {
        assert_eq!(align(80, 256), 256);
        assert_eq!(align(256, 256), 256);
        assert_eq!(align(257, 256), 512);
    }
}
