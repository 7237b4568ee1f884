// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Pieces both Direct3D backends share: error mapping, shader compilation and the
//! graphics binding handed over at session creation.

use crate::error::{Error, Result};
use crate::graphics::ShaderSource;
use crate::imp::d3d11::D3D11Device;
use crate::imp::d3d12::D3D12Device;
use openxr_sys as xr;
use std::ffi::{CString, c_void};
use std::rc::Rc;
use windows::Win32::Foundation::E_POINTER;
use windows::Win32::Graphics::Direct3D::Fxc::{D3DCOMPILE_ENABLE_STRICTNESS, D3DCOMPILE_OPTIMIZATION_LEVEL3, D3DCompile, D3DCompileFromFile};
use windows::Win32::Graphics::Direct3D::{D3D_SHADER_MACRO, ID3DBlob};
use windows::Win32::Graphics::Direct3D11::ID3D11Device;
use windows::Win32::Graphics::Direct3D12::{ID3D12CommandQueue, ID3D12Device};
use windows::Win32::Graphics::Dxgi::DXGI_ADAPTER_DESC;
use windows::core::{HSTRING, Interface, PCSTR};

/// Full-screen triangle, drawn with `Draw(3, 0)` and no vertex buffer.
pub(crate) const QUAD_VERTEX_SHADER: &str = r#"
void main(in uint id : SV_VertexID, out float4 position : SV_Position, out float2 texcoord : TEXCOORD0) {
    texcoord = float2((id == 1) ? 2.0 : 0.0, (id == 2) ? 2.0 : 0.0);
    position = float4(texcoord * float2(2.0, -2.0) + float2(-1.0, 1.0), 0.0, 1.0);
}
"#;

/// Flat-colored geometry for [crate::graphics::Device::draw_mesh].
pub(crate) const MESH_SHADERS: &str = r#"
cbuffer Transform : register(b0) {
    row_major float4x4 transform;
};
struct VSOutput {
    float4 position : SV_POSITION;
    float3 color : COLOR0;
};
VSOutput vsMain(float3 position : POSITION, float3 color : COLOR0) {
    VSOutput output;
    output.position = mul(float4(position, 1.0), transform);
    output.color = color;
    return output;
}
float4 psMain(VSOutput input) : SV_TARGET {
    return float4(input.color, 1.0);
}
"#;

pub(crate) trait NativeContext<T> {
    fn context(self, operation: &'static str) -> Result<T>;
}

impl<T> NativeContext<T> for windows::core::Result<T> {
    fn context(self, operation: &'static str) -> Result<T> {
        self.map_err(|source| Error::Native { operation, source })
    }
}

/// Unwraps an out-parameter that a successful call left empty.
pub(crate) fn created<T>(value: Option<T>, operation: &'static str) -> Result<T> {
    value.ok_or_else(|| Error::Native {
        operation,
        source: windows::core::Error::from(E_POINTER),
    })
}

pub(crate) fn adapter_name(desc: &DXGI_ADAPTER_DESC) -> String {
    let len = desc.Description.iter().position(|&c| c == 0).unwrap_or(desc.Description.len());
    String::from_utf16_lossy(&desc.Description[..len])
}

fn blob_bytes(blob: &ID3DBlob) -> Vec<u8> {
    // SAFETY: the blob owns `GetBufferSize()` bytes at `GetBufferPointer()`.
    unsafe { std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize()).to_vec() }
}

fn compile_errors(blob: Option<&ID3DBlob>, error: &windows::core::Error) -> String {
    match blob {
        Some(blob) => String::from_utf8_lossy(&blob_bytes(blob)).trim_end_matches('\0').trim().to_string(),
        None => error.message().to_string(),
    }
}

fn cstring(value: &str, path: &str) -> Result<CString> {
    CString::new(value).map_err(|_| Error::ShaderCompile {
        path: path.to_string(),
        message: format!("{value:?} contains a NUL byte"),
    })
}

/// Compiles an HLSL file with FXC. `target` is a profile such as `cs_5_0`.
pub(crate) fn compile_file(source: &ShaderSource<'_>, target: &str) -> Result<Vec<u8>> {
    let path = source.path.display().to_string();
    let entry = cstring(source.entry_point, &path)?;
    let target = cstring(target, &path)?;
    let mut define_strings = Vec::with_capacity(source.defines.len());
    for (name, value) in source.defines {
        define_strings.push((cstring(name, &path)?, cstring(value, &path)?));
    }
    let mut macros: Vec<D3D_SHADER_MACRO> = define_strings
        .iter()
        .map(|(name, value)| D3D_SHADER_MACRO {
            Name: PCSTR(name.as_ptr() as *const u8),
            Definition: PCSTR(value.as_ptr() as *const u8),
        })
        .collect();
    macros.push(D3D_SHADER_MACRO::default());

    let mut code: Option<ID3DBlob> = None;
    let mut errors: Option<ID3DBlob> = None;
    // SAFETY: every string outlives the call and `macros` is null-terminated.
    let result = unsafe {
        D3DCompileFromFile(
            &HSTRING::from(source.path.as_os_str()),
            Some(macros.as_ptr()),
            None,
            PCSTR(entry.as_ptr() as *const u8),
            PCSTR(target.as_ptr() as *const u8),
            D3DCOMPILE_OPTIMIZATION_LEVEL3 | D3DCOMPILE_ENABLE_STRICTNESS,
            0,
            &mut code,
            Some(&mut errors),
        )
    };
    if let Err(error) = result {
        let message = compile_errors(errors.as_ref(), &error);
        logwise::error_sync!(
            "Shader compilation failed for {path}: {message}",
            path = logwise::privacy::LogIt(&path),
            message = logwise::privacy::LogIt(&message)
        );
        return Err(Error::ShaderCompile { path, message });
    }
    let code = created(code, "D3DCompileFromFile")?;
    Ok(blob_bytes(&code))
}

/// Compiles HLSL held in memory, for the shaders the backends carry themselves.
pub(crate) fn compile_text(text: &str, name: &str, entry_point: &str, target: &str) -> Result<Vec<u8>> {
    let source_name = cstring(name, name)?;
    let entry = cstring(entry_point, name)?;
    let target = cstring(target, name)?;
    let mut code: Option<ID3DBlob> = None;
    let mut errors: Option<ID3DBlob> = None;
    // SAFETY: `text` is valid for `text.len()` bytes; the C strings outlive the call.
    let result = unsafe {
        D3DCompile(
            text.as_ptr() as *const c_void,
            text.len(),
            PCSTR(source_name.as_ptr() as *const u8),
            None,
            None,
            PCSTR(entry.as_ptr() as *const u8),
            PCSTR(target.as_ptr() as *const u8),
            D3DCOMPILE_OPTIMIZATION_LEVEL3,
            0,
            &mut code,
            Some(&mut errors),
        )
    };
    if let Err(error) = result {
        return Err(Error::ShaderCompile {
            path: name.to_string(),
            message: compile_errors(errors.as_ref(), &error),
        });
    }
    let code = created(code, "D3DCompile")?;
    Ok(blob_bytes(&code))
}

/// The device the application bound its session to.
#[derive(Debug, Clone)]
pub enum GraphicsBinding {
    D3D11 { device: ID3D11Device },
    D3D12 { device: ID3D12Device, queue: ID3D12CommandQueue },
}

impl GraphicsBinding {
    /**
    Finds a Direct3D binding in the `next` chain of `XrSessionCreateInfo`.

    Returns `None` for any other graphics API; such sessions are passed through untouched.

    # Safety

    `next` must be null or point to a valid chain of OpenXR input structures.
    */
    pub unsafe fn from_next_chain(next: *const c_void) -> Option<Self> {
        let mut entry = next as *const xr::BaseInStructure;
        while !entry.is_null() {
            // SAFETY: the caller guarantees a valid chain.
            let header = unsafe { &*entry };
            match header.ty {
                xr::StructureType::GRAPHICS_BINDING_D3D11_KHR => {
                    // SAFETY: the structure type identifies the binding.
                    let binding = unsafe { &*(entry as *const xr::GraphicsBindingD3D11KHR) };
                    let raw = binding.device as *mut c_void;
                    // SAFETY: the application passes a live ID3D11Device.
                    let device = unsafe { ID3D11Device::from_raw_borrowed(&raw) }?.clone();
                    return Some(GraphicsBinding::D3D11 { device });
                }
                xr::StructureType::GRAPHICS_BINDING_D3D12_KHR => {
                    // SAFETY: the structure type identifies the binding.
                    let binding = unsafe { &*(entry as *const xr::GraphicsBindingD3D12KHR) };
                    let raw_device = binding.device as *mut c_void;
                    let raw_queue = binding.queue as *mut c_void;
                    // SAFETY: the application passes a live device and queue.
                    let device = unsafe { ID3D12Device::from_raw_borrowed(&raw_device) }?.clone();
                    // SAFETY: as above.
                    let queue = unsafe { ID3D12CommandQueue::from_raw_borrowed(&raw_queue) }?.clone();
                    return Some(GraphicsBinding::D3D12 { device, queue });
                }
                _ => entry = header.next,
            }
        }
        logwise::warn_sync!("Unsupported graphics runtime");
        None
    }
}

pub enum OpenedDevice {
    D3D11(Rc<D3D11Device>),
    D3D12(Rc<D3D12Device>),
}

/// Wraps the application's device in the matching backend.
pub fn open_device(binding: GraphicsBinding) -> Result<OpenedDevice> {
    match binding {
        GraphicsBinding::D3D11 { device } => Ok(OpenedDevice::D3D11(Rc::new(D3D11Device::new(device)?))),
        GraphicsBinding::D3D12 { device, queue } => Ok(OpenedDevice::D3D12(Rc::new(D3D12Device::new(device, queue)?))),
    }
}
