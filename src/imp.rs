// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Backends implementing [crate::graphics::Device].
//!
//! Direct3D 11 and 12 are only built on Windows. The headless recorder is built for tests
//! and behind the `testing` feature.

#[cfg(any(test, feature = "testing"))]
pub mod headless;

#[cfg(windows)]
mod native;
#[cfg(windows)]
pub mod d3d11;
#[cfg(windows)]
pub mod d3d12;

#[cfg(windows)]
pub use native::{GraphicsBinding, OpenedDevice, open_device};
