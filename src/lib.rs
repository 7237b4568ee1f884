// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*! xr_postchain is the core of an OpenXR API layer that inserts GPU processing between
what an application renders and what the runtime composites.

Applications render into textures the layer owns. At frame submission each swapchain
image is walked through a short chain of stages, and the runtime receives the result:

| Stage          | Input                       | Output                                 | Shader           |
|----------------|-----------------------------|----------------------------------------|------------------|
| Pre-processor  | application image           | same size, for the next stage          | `preprocess.hlsl`  |
| Upscaler       | application resolution      | display resolution                     | `FSR.hlsl` (EASU, RCAS) |
| Post-processor | display resolution          | the runtime's swapchain image          | `postprocess.hlsl` |

Every stage is optional. Without any, the application renders straight into the runtime's
images and the layer only forwards calls.

# Layout

* [graphics] is the device abstraction the stages are written against: textures, buffers,
  shaders, timers, render targets and the shared pieces the backends build on (lazy view
  caches, bump descriptor heaps, deferred pipeline resolution).
* The backends live behind it: Direct3D 11 and Direct3D 12 on Windows, and a headless
  recorder behind the `testing` feature.
* [stages] holds the stage traits and the shipping implementations.
* [chain] builds the per-swapchain texture chains and walks them each frame.
* [layer] intercepts the OpenXR calls that need patching.
* [screenshot] exports the final image of a frame as PNG.

# Configuration

Tunables (scaling factor, sharpness, FOV, eye separation, prediction dampening, which stages
run) are read through [config::ConfigProvider]; [config::MemoryConfig] is the in-process
store. Paths that are not user tunables are in [config::LayerSettings].

# Logging

Everything logs through [logwise](https://sealedabstract.com/code/logwise). Per-frame
events are `trace`, session and swapchain lifecycle is `info`, recovered failures are
`warn` and errors reported back to the application are `error`.
*/

pub mod chain;
pub mod config;
pub mod error;
pub mod graphics;
pub mod imp;
pub mod layer;
pub mod screenshot;
pub mod stages;
pub mod utilities;

pub use error::{Error, ErrorClass, Result};
pub use layer::{Layer, LayerStatistics, Overlay, Runtime};
