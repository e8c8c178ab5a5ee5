// SPDX-License-Identifier: BSD-3-Clause

//! Per-owner block tracking above the arena.
//!
//! A `MemMap` groups the blocks belonging to one logical owner (a batch,
//! one module's records of one flush interval, a module's fixed-size
//! record pool) so the owner can be torn down in one call. Two policies:
//!
//! - **hold-in-use**: the map records every outstanding block and frees
//!   them all on destroy. Used for per-batch and per-snapshot scopes whose
//!   blocks die together.
//! - **hold-free**: the map pools freed blocks of one fixed size for
//!   reuse, so steady-state module allocation stops fragmenting the arena.

use crate::arena::{Arena, ShmBlock};
use crate::error::Error;

/// Block retention policy of a [`MemMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemPolicy {
    /// Track live blocks; bulk-free them on teardown.
    HoldInUse,
    /// Pool freed blocks of this fixed size for reuse.
    HoldFree {
        /// The one block size this map serves.
        block_size: usize,
    },
}

/// A set of arena blocks with a common owner and policy.
#[derive(Debug)]
pub struct MemMap {
    policy: MemPolicy,
    held: Vec<ShmBlock>,
}

impl MemMap {
    /// Creates an empty map with the given policy.
    #[must_use]
    pub fn new(policy: MemPolicy) -> Self {
        MemMap { policy, held: Vec::new() }
    }

    /// The policy this map was created with.
    #[must_use]
    pub fn policy(&self) -> MemPolicy {
        self.policy
    }

    /// Allocates through this map.
    ///
    /// Under hold-free the request length must equal the pool's block size
    /// and a pooled block is preferred over a fresh arena allocation.
    #[track_caller]
    pub fn alloc(&mut self, arena: &mut Arena, len: usize) -> Result<ShmBlock, Error> {
        match self.policy {
            MemPolicy::HoldInUse => {
                let block = arena.alloc(len)?;
                self.held.push(block);
                Ok(block)
            }
            MemPolicy::HoldFree { block_size } => {
                debug_assert_eq!(len, block_size, "hold-free maps serve one size");
                if let Some(block) = self.held.pop() {
                    return Ok(block);
                }
                arena.alloc(block_size)
            }
        }
    }

    /// Releases one block through this map.
    pub fn free(&mut self, arena: &mut Arena, block: ShmBlock) {
        match self.policy {
            MemPolicy::HoldInUse => {
                if let Some(at) = self.held.iter().position(|b| *b == block) {
                    let _ = self.held.swap_remove(at);
                }
                arena.free(block);
            }
            MemPolicy::HoldFree { .. } => {
                self.held.push(block);
            }
        }
    }

    /// Number of blocks currently held (live blocks under hold-in-use,
    /// pooled blocks under hold-free).
    #[must_use]
    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Frees every held block and consumes the map.
    pub fn destroy(mut self, arena: &mut Arena) {
        for block in self.held.drain(..) {
            arena.free(block);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(missing_docs, clippy::unwrap_used)]
    use super::*;
    use crate::region::{ShmHandle, ShmRegion};

    fn arena(size: usize) -> Arena {
        Arena::new(ShmRegion::map(ShmHandle::new(size).unwrap()).unwrap())
    }

    #[test]
    fn hold_in_use_bulk_frees() {
        let mut a = arena(4096);
        let mut map = MemMap::new(MemPolicy::HoldInUse);
        for _ in 0..10 {
            let _ = map.alloc(&mut a, 64).unwrap();
        }
        assert_eq!(map.held(), 10);
        assert_eq!(a.used(), 640);
        map.destroy(&mut a);
        assert_eq!(a.used(), 0);
        assert!(a.leaks().is_empty());
    }

    #[test]
    fn hold_free_reuses_blocks() {
        let mut a = arena(4096);
        let mut map = MemMap::new(MemPolicy::HoldFree { block_size: 64 });
        let b1 = map.alloc(&mut a, 64).unwrap();
        let ofs = b1.ofs();
        map.free(&mut a, b1);
        assert_eq!(a.used(), 64, "pooled block stays allocated in the arena");
        let b2 = map.alloc(&mut a, 64).unwrap();
        assert_eq!(b2.ofs(), ofs);
        map.free(&mut a, b2);
        map.destroy(&mut a);
        assert_eq!(a.used(), 0);
    }

    #[test]
    fn hold_in_use_individual_free() {
        let mut a = arena(4096);
        let mut map = MemMap::new(MemPolicy::HoldInUse);
        let b = map.alloc(&mut a, 64).unwrap();
        map.free(&mut a, b);
        assert_eq!(map.held(), 0);
        assert_eq!(a.used(), 0);
        map.destroy(&mut a);
    }
}
