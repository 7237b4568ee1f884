// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Bump allocation of descriptor slots.
//!
//! Slots are handed out in order and never returned; a session allocates views for the
//! lifetime of its textures, which is the lifetime of the session. The native heap is
//! owned by the backend, this only tracks which index is next.

use crate::error::{Error, Result};
use std::cell::Cell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// Constant buffer, shader resource and unordered access views.
    ShaderResource,
    Sampler,
    RenderTarget,
    DepthStencil,
}

impl HeapKind {
    /// Number of slots a session gets for this kind.
    pub const fn capacity(self) -> u32 {
        match self {
            HeapKind::ShaderResource => 256,
            HeapKind::Sampler => 16,
            HeapKind::RenderTarget => 64,
            HeapKind::DepthStencil => 16,
        }
    }

    /// Whether the heap must be visible to shaders.
    pub const fn shader_visible(self) -> bool {
        matches!(self, HeapKind::ShaderResource | HeapKind::Sampler)
    }
}

#[derive(Debug)]
pub struct SlotAllocator {
    kind: HeapKind,
    capacity: u32,
    next: Cell<u32>,
}

impl SlotAllocator {
    pub fn new(kind: HeapKind) -> Self {
        Self::with_capacity(kind, kind.capacity())
    }

    pub fn with_capacity(kind: HeapKind, capacity: u32) -> Self {
        SlotAllocator {
            kind,
            capacity,
            next: Cell::new(0),
        }
    }

    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn allocated(&self) -> u32 {
        self.next.get()
    }

    /// Returns the next free slot index.
    pub fn allocate(&self) -> Result<u32> {
        let slot = self.next.get();
        if slot >= self.capacity {
            logwise::error_sync!(
                "Descriptor heap {kind} exhausted",
                kind = logwise::privacy::LogIt(&self.kind)
            );
            return Err(Error::HeapExhausted {
                kind: self.kind,
                capacity: self.capacity,
            });
        }
        self.next.set(slot + 1);
        Ok(slot)
    }
}
