// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Lazily created texture views.

Each texture owns one [ViewCache] per view kind. A view for the whole texture or for one
array slice is created the first time it is asked for and returned from then on. Whether
a kind is allowed at all is decided once, from the texture's usage, when the cache is built.
*/

use crate::error::{Error, Result};
use crate::graphics::{Slice, TextureDesc, ViewKind};
use std::cell::OnceCell;

#[derive(Debug)]
pub struct ViewCache<V> {
    kind: ViewKind,
    permitted: bool,
    whole: OnceCell<V>,
    slices: Box<[OnceCell<V>]>,
}

impl<V: Clone> ViewCache<V> {
    pub fn new(kind: ViewKind, desc: &TextureDesc) -> Self {
        ViewCache {
            kind,
            permitted: desc.permits(kind),
            whole: OnceCell::new(),
            slices: (0..desc.array_size).map(|_| OnceCell::new()).collect(),
        }
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    pub fn is_permitted(&self) -> bool {
        self.permitted
    }

    /// Returns the cached view for `slice`, creating it with `create` on first use.
    ///
    /// A failed `create` leaves the entry empty so a later call tries again.
    pub fn get_or_create(
        &self,
        slice: Slice,
        texture: &str,
        create: impl FnOnce(Slice) -> Result<V>,
    ) -> Result<V> {
        if !self.permitted {
            return Err(Error::Capability {
                kind: self.kind,
                texture: texture.to_string(),
            });
        }
        let cell = match slice {
            Slice::All => &self.whole,
            Slice::Index(index) => self
                .slices
                .get(index as usize)
                .ok_or_else(|| Error::SliceOutOfRange {
                    texture: texture.to_string(),
                    slice: index,
                    array_size: self.slices.len() as u32,
                })?,
        };
        if let Some(view) = cell.get() {
            return Ok(view.clone());
        }
        let view = create(slice)?;
        Ok(cell.get_or_init(|| view).clone())
    }

    /// Number of views created so far.
    pub fn materialized(&self) -> usize {
        self.whole.get().is_some() as usize + self.slices.iter().filter(|c| c.get().is_some()).count()
    }
}
