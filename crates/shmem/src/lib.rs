// SPDX-License-Identifier: BSD-3-Clause

//! Shared memory for the CoMo measurement core.
//!
//! One memfd-backed region holds every packet and capture-side flow record.
//! Capture creates the region and is the only process that allocates and
//! frees inside it; export and capture clients receive the memfd over the
//! IPC bus, map it at their own address and resolve [`ShmBlock`] offsets
//! read-only. All cross-process references are offsets, never addresses.
//!
//! Layering, bottom to top:
//!
//! - [`region::ShmHandle`] / [`region::ShmRegion`]: the memfd and its
//!   per-process mapping.
//! - [`arena::Arena`]: a first-fit offset allocator owned by the creating
//!   process.
//! - [`memmap::MemMap`]: per-owner block tracking with the hold-in-use
//!   (bulk free on teardown) and hold-free (fixed-size reuse pool)
//!   policies.
//! - [`pool::BytePool`]: the process-local cousin of the hold-free policy,
//!   for state that never crosses a process boundary.

// The region hands out slices derived from a raw mapping; the ownership
// protocol (a block is referenced by exactly one owner between alloc and
// free) is what keeps the derived references disjoint.
#![allow(unsafe_code)]

pub mod arena;
pub mod error;
pub mod memmap;
pub mod pool;
pub mod region;

pub use arena::{Arena, ShmBlock};
pub use error::Error;
pub use memmap::{MemMap, MemPolicy};
pub use pool::BytePool;
pub use region::{ShmHandle, ShmRegion};
