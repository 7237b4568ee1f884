// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Crate-wide error type.
//!
//! Errors fall in two classes. Environment errors come from the driver or the
//! installation (a resource could not be created, a shader did not compile) and
//! end the session. Contract errors are programming mistakes in the layer or a
//! stage plugin (a view kind the texture cannot provide, a dispatch with no
//! shader, an incomplete chain) and are surfaced instead of rendering a wrong
//! frame.

use crate::graphics::heap::HeapKind;
use crate::graphics::{Api, ViewKind};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[cfg(windows)]
    #[error("{operation} failed: {source}")]
    Native {
        operation: &'static str,
        #[source]
        source: windows::core::Error,
    },
    #[error("failed to compile {path}: {message}")]
    ShaderCompile { path: String, message: String },
    #[error("texture {texture} was not created with the usage a {kind:?} view requires")]
    Capability { kind: ViewKind, texture: String },
    #[error("slice {slice} is out of range for {texture} (array size {array_size})")]
    SliceOutOfRange {
        texture: String,
        slice: u32,
        array_size: u32,
    },
    #[error("No shader is set")]
    NoShaderBound,
    #[error("quad shaders can only output to slot 0, not slot {slot}")]
    QuadOutputSlot { slot: u32 },
    #[error("buffer {buffer} is immutable")]
    Immutable { buffer: String },
    #[error("upload of {actual} bytes does not match buffer size {expected}")]
    UploadSizeMismatch { expected: usize, actual: usize },
    #[error("timer started again before its previous sample was consumed")]
    TimerAlreadyStarted,
    #[error("{kind:?} descriptor heap exhausted (capacity {capacity})")]
    HeapExhausted { kind: HeapKind, capacity: u32 },
    #[error("pipeline already resolved, parameters can no longer be registered")]
    PipelineResolved,
    #[error("Processing chain incomplete! (stopped at {next} of {len})")]
    ChainIncomplete { next: usize, len: usize },
    #[error("{feature} is not supported on {api:?}")]
    Unsupported { feature: &'static str, api: Api },
    #[error("texture format {format} cannot be exported")]
    UnsupportedFormat { format: i64 },
    #[error(transparent)]
    Png(#[from] png::EncodingError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Driver, device or installation failure.
    Environment,
    /// Misuse of the device or the chain by the layer itself.
    Contract,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            #[cfg(windows)]
            Error::Native { .. } => ErrorClass::Environment,
            Error::ShaderCompile { .. } | Error::Png(_) | Error::Io(_) => ErrorClass::Environment,
            Error::Capability { .. }
            | Error::SliceOutOfRange { .. }
            | Error::NoShaderBound
            | Error::QuadOutputSlot { .. }
            | Error::Immutable { .. }
            | Error::UploadSizeMismatch { .. }
            | Error::TimerAlreadyStarted
            | Error::HeapExhausted { .. }
            | Error::PipelineResolved
            | Error::ChainIncomplete { .. }
            | Error::Unsupported { .. }
            | Error::UnsupportedFormat { .. } => ErrorClass::Contract,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_errors_are_contract_violations() {
        let error = Error::ChainIncomplete { next: 1, len: 3 };
        assert_eq!(error.class(), ErrorClass::Contract);
        assert_eq!(error.to_string(), "Processing chain incomplete! (stopped at 1 of 3)");
    }

    #[test]
    fn compile_errors_are_environment_failures() {
        let error = Error::ShaderCompile {
            path: "FSR.hlsl".to_string(),
            message: "syntax error".to_string(),
        };
        assert_eq!(error.class(), ErrorClass::Environment);
    }
}
