// SPDX-License-Identifier: BSD-3-Clause

//! First-fit offset allocator over the shared region.
//!
//! The arena lives in the creating process only; its bookkeeping (free
//! spans, usage counters, leak attribution) is ordinary heap state. What it
//! hands out are [`ShmBlock`] offset/length pairs that any process mapping
//! the same region can resolve.

#[cfg(debug_assertions)]
use std::collections::HashMap;
#[cfg(debug_assertions)]
use std::panic::Location;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::region::ShmRegion;

/// Allocation granularity; every block offset and length is a multiple.
pub const ALIGN: usize = 8;

/// A span inside the shared region, valid in any process that maps it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShmBlock {
    ofs: u32,
    len: u32,
}

impl ShmBlock {
    /// Reconstructs a block reference from its offset and length, e.g.
    /// when decoding a batch descriptor in a consumer process.
    #[must_use]
    pub fn new(ofs: u32, len: u32) -> Self {
        ShmBlock { ofs, len }
    }

    /// Offset of the first byte.
    #[must_use]
    pub fn ofs(&self) -> u32 {
        self.ofs
    }

    /// Length in bytes as requested at allocation time.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.len
    }

    /// True for zero-length blocks (never produced by the arena).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone, Copy)]
struct Span {
    ofs: u32,
    len: u32,
}

/// The allocator. One per shared region, owned by the capture process.
#[derive(Debug)]
pub struct Arena {
    region: ShmRegion,
    /// Free spans sorted by offset, adjacent spans coalesced.
    free: Vec<Span>,
    used: usize,
    #[cfg(debug_assertions)]
    origins: HashMap<u32, &'static Location<'static>>,
}

impl Arena {
    /// Wraps a freshly mapped region; the whole of it starts free.
    #[must_use]
    pub fn new(region: ShmRegion) -> Self {
        let capacity = region.len() as u32;
        Arena {
            region,
            free: vec![Span { ofs: 0, len: capacity }],
            used: 0,
            #[cfg(debug_assertions)]
            origins: HashMap::new(),
        }
    }

    /// Total capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    /// Bytes currently allocated (including alignment padding).
    #[must_use]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Fraction of the region currently allocated, in `[0, 1]`.
    #[must_use]
    pub fn usage(&self) -> f64 {
        self.used as f64 / self.region.len() as f64
    }

    /// The region, e.g. to duplicate its handle for a new consumer.
    #[must_use]
    pub fn region(&self) -> &ShmRegion {
        &self.region
    }

    /// Allocates `len` bytes, first-fit.
    ///
    /// In debug builds the caller location is recorded for leak
    /// attribution (see [`Arena::leaks`]).
    #[track_caller]
    pub fn alloc(&mut self, len: usize) -> Result<ShmBlock, Error> {
        let rounded = len.max(1).next_multiple_of(ALIGN) as u32;
        let pos = self.free.iter().position(|s| s.len >= rounded).ok_or(Error::OutOfMemory {
            requested: len,
            capacity: self.capacity(),
            used: self.used,
        })?;
        let span = self.free[pos];
        if span.len == rounded {
            let _ = self.free.remove(pos);
        } else {
            self.free[pos] = Span { ofs: span.ofs + rounded, len: span.len - rounded };
        }
        self.used += rounded as usize;
        let block = ShmBlock { ofs: span.ofs, len: rounded };
        #[cfg(debug_assertions)]
        {
            let prev = self.origins.insert(block.ofs, Location::caller());
            debug_assert!(prev.is_none(), "arena handed out offset {} twice", block.ofs);
        }
        Ok(block)
    }

    /// Returns a block to the free list, coalescing neighbors.
    pub fn free(&mut self, block: ShmBlock) {
        #[cfg(debug_assertions)]
        debug_assert!(
            self.origins.remove(&block.ofs).is_some(),
            "freeing unknown or already-freed block at offset {}",
            block.ofs
        );
        self.used = self.used.saturating_sub(block.len as usize);
        let pos = self.free.partition_point(|s| s.ofs < block.ofs);
        self.free.insert(pos, Span { ofs: block.ofs, len: block.len });
        // merge with successor then predecessor
        if pos + 1 < self.free.len() && self.free[pos].ofs + self.free[pos].len == self.free[pos + 1].ofs
        {
            self.free[pos].len += self.free[pos + 1].len;
            let _ = self.free.remove(pos + 1);
        }
        if pos > 0 && self.free[pos - 1].ofs + self.free[pos - 1].len == self.free[pos].ofs {
            self.free[pos - 1].len += self.free[pos].len;
            let _ = self.free.remove(pos);
        }
    }

    /// Read access to an allocated block.
    pub fn get(&self, block: ShmBlock) -> Result<&[u8], Error> {
        self.region.get(block.ofs, block.len as usize)
    }

    /// Write access to an allocated block.
    pub fn get_mut(&mut self, block: ShmBlock) -> Result<&mut [u8], Error> {
        self.region.get_mut(block.ofs, block.len as usize)
    }

    /// Simultaneous write access to one block and read access to another.
    ///
    /// The capture loop updates a flow record while reading the packet
    /// that hit it; both live in this arena. The blocks must be disjoint,
    /// which allocation guarantees for distinct blocks.
    pub fn get_pair(&mut self, w: ShmBlock, r: ShmBlock) -> Result<(&mut [u8], &[u8]), Error> {
        let w_end = w.ofs as usize + w.len as usize;
        let r_end = r.ofs as usize + r.len as usize;
        if w_end > self.region.len() || r_end > self.region.len() {
            return Err(Error::BadBlock { ofs: w.ofs.max(r.ofs), len: w.len.max(r.len), capacity: self.region.len() });
        }
        if w.ofs < r_end as u32 && r.ofs < w_end as u32 {
            return Err(Error::BadBlock { ofs: r.ofs, len: r.len, capacity: self.region.len() });
        }
        // SAFETY: bounds checked above and the two spans are disjoint, so
        // the shared slice cannot alias the mutable one. The raw pointer
        // carries whole-mapping provenance.
        let r_ptr = unsafe { self.region.base().add(r.ofs as usize) };
        let w_slice = self.region.get_mut(w.ofs, w.len as usize)?;
        let r_slice = unsafe { std::slice::from_raw_parts(r_ptr, r.len as usize) };
        Ok((w_slice, r_slice))
    }

    /// Outstanding allocations with the source location that made them.
    /// Debug builds only; the release build compiles to an empty list.
    #[must_use]
    pub fn leaks(&self) -> Vec<(u32, String)> {
        #[cfg(debug_assertions)]
        {
            self.origins.iter().map(|(ofs, loc)| (*ofs, loc.to_string())).collect()
        }
        #[cfg(not(debug_assertions))]
        {
            Vec::new()
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
    fn alloc_rounds_to_alignment() {
        let mut a = arena(4096);
        let b = a.alloc(3).unwrap();
        assert_eq!(b.len() as usize, ALIGN);
        assert_eq!(a.used(), ALIGN);
    }

    #[test]
    fn freed_space_is_reused() {
        let mut a = arena(4096);
        let b1 = a.alloc(64).unwrap();
        let _b2 = a.alloc(64).unwrap();
        let ofs = b1.ofs();
        a.free(b1);
        let b3 = a.alloc(64).unwrap();
        assert_eq!(b3.ofs(), ofs);
    }

    #[test]
    fn coalescing_allows_large_realloc() {
        let mut a = arena(4096);
        let blocks: Vec<_> = (0..8).map(|_| a.alloc(512).unwrap()).collect();
        assert!(a.alloc(512).is_err());
        for b in blocks {
            a.free(b);
        }
        // after freeing everything, one whole-region allocation must fit
        let whole = a.alloc(4096).unwrap();
        assert_eq!(whole.ofs(), 0);
    }

    #[test]
    fn exhaustion_reports_usage() {
        let mut a = arena(1024);
        let _b = a.alloc(1024).unwrap();
        let err = a.alloc(8).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { used: 1024, .. }));
    }

    #[test]
    fn blocks_are_readable_and_writable() {
        let mut a = arena(4096);
        let b = a.alloc(16).unwrap();
        a.get_mut(b).unwrap()[..4].copy_from_slice(b"flow");
        assert_eq!(&a.get(b).unwrap()[..4], b"flow");
    }

    #[cfg(debug_assertions)]
    #[test]
    fn leaks_carry_caller_location() {
        let mut a = arena(4096);
        let _kept = a.alloc(8).unwrap();
        let freed = a.alloc(8).unwrap();
        a.free(freed);
        let leaks = a.leaks();
        assert_eq!(leaks.len(), 1);
        assert!(leaks[0].1.contains("arena.rs"));
    }
}
