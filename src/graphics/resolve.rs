// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Deferred pipeline construction.

A D3D12 pipeline needs its full root signature up front, but shaders only learn which
slots they use from the first bind sequence. A [PipelineResolution] records each binding
as a root parameter while unresolved. The first dispatch builds the pipeline from the
recorded parameters, after which the parameter list is frozen and is replayed on every
later dispatch.
*/

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootParameterKind {
    Sampler,
    ConstantBuffer,
    ShaderResource,
    UnorderedAccess,
}

/// One recorded binding. `handle` is what the backend needs to rebind it at dispatch time.
#[derive(Debug, Clone, PartialEq)]
pub struct RootParameter<H> {
    pub kind: RootParameterKind,
    pub slot: u32,
    pub handle: H,
}

#[derive(Debug)]
enum State<P> {
    Unresolved,
    Resolved(P),
}

#[derive(Debug)]
pub struct PipelineResolution<P, H> {
    state: State<P>,
    parameters: Vec<RootParameter<H>>,
}

impl<P, H> Default for PipelineResolution<P, H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P, H> PipelineResolution<P, H> {
    pub fn new() -> Self {
        PipelineResolution {
            state: State::Unresolved,
            parameters: Vec::new(),
        }
    }

    pub fn needs_resolve(&self) -> bool {
        matches!(self.state, State::Unresolved)
    }

    /// Appends a parameter to the layout being discovered.
    pub fn register(&mut self, kind: RootParameterKind, slot: u32, handle: H) -> Result<()> {
        if !self.needs_resolve() {
            return Err(Error::PipelineResolved);
        }
        self.parameters.push(RootParameter { kind, slot, handle });
        Ok(())
    }

    /// Replaces the handle of a parameter that is already part of the frozen layout.
    ///
    /// Returns `false` when no parameter of that kind and slot exists.
    pub fn rebind(&mut self, kind: RootParameterKind, slot: u32, handle: H) -> bool {
        match self.parameters.iter_mut().find(|p| p.kind == kind && p.slot == slot) {
            Some(parameter) => {
                parameter.handle = handle;
                true
            }
            None => false,
        }
    }

    /// Builds the pipeline from the recorded parameters if that has not happened yet.
    pub fn resolve(&mut self, build: impl FnOnce(&[RootParameter<H>]) -> Result<P>) -> Result<&P> {
        if let State::Unresolved = self.state {
            let pipeline = build(&self.parameters)?;
            self.state = State::Resolved(pipeline);
        }
        match &self.state {
            State::Resolved(pipeline) => Ok(pipeline),
            State::Unresolved => unreachable!("resolved above"),
        }
    }

    pub fn pipeline(&self) -> Option<&P> {
        match &self.state {
            State::Resolved(pipeline) => Some(pipeline),
            State::Unresolved => None,
        }
    }

    /// Recorded parameters in root signature order.
    pub fn parameters(&self) -> &[RootParameter<H>] {
        &self.parameters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_dispatch_freezes_the_layout() {
        let mut resolution = PipelineResolution::<String, u64>::new();
        assert!(resolution.needs_resolve());
        resolution.register(RootParameterKind::Sampler, 0, 0).unwrap();
        resolution.register(RootParameterKind::ConstantBuffer, 0, 10).unwrap();
        resolution.register(RootParameterKind::ShaderResource, 0, 20).unwrap();

        let pipeline = resolution
            .resolve(|parameters| Ok(format!("{} parameters", parameters.len())))
            .unwrap();
        assert_eq!(pipeline, "3 parameters");
        assert!(!resolution.needs_resolve());

        assert!(matches!(
            resolution.register(RootParameterKind::UnorderedAccess, 0, 30),
            Err(Error::PipelineResolved)
        ));
    }

    #[test]
    fn resolving_twice_keeps_the_first_pipeline() {
        let mut resolution = PipelineResolution::<u32, ()>::new();
        resolution.resolve(|_| Ok(1)).unwrap();
        let pipeline = resolution.resolve(|_| Ok(2)).unwrap();
        assert_eq!(*pipeline, 1);
    }

    #[test]
    fn failed_build_stays_unresolved() {
        let mut resolution = PipelineResolution::<u32, ()>::new();
        assert!(resolution.resolve(|_| Err(Error::NoShaderBound)).is_err());
        assert!(resolution.needs_resolve());
        assert!(resolution.pipeline().is_none());
    }

    #[test]
    fn rebinding_updates_handles_in_place() {
        let mut resolution = PipelineResolution::<(), u64>::new();
        resolution.register(RootParameterKind::ShaderResource, 0, 1).unwrap();
        resolution.resolve(|_| Ok(())).unwrap();
        assert!(resolution.rebind(RootParameterKind::ShaderResource, 0, 5));
        assert!(!resolution.rebind(RootParameterKind::UnorderedAccess, 0, 5));
        assert_eq!(resolution.parameters()[0].handle, 5);
    }
}
