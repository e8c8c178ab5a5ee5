// SPDX-License-Identifier: BSD-3-Clause

//! The memfd-backed shared region and its per-process mapping.
//!
//! The creating process builds a [`ShmHandle`] once, before any consumer
//! attaches; consumers receive a duplicate of the file descriptor over the
//! IPC bus and map it themselves. Mappings land at different addresses in
//! different processes, which is why nothing in the system ever exchanges
//! pointers into the region, only offsets.

use std::fs::File;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::ptr::NonNull;

use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap};

use crate::error::Error;

/// The shared region's backing file: an anonymous memfd plus its size.
#[derive(Debug)]
pub struct ShmHandle {
    file: File,
    size: usize,
}

impl ShmHandle {
    /// Creates an anonymous shared region of `size` bytes.
    pub fn new(size: usize) -> Result<Self, Error> {
        let create = || -> std::io::Result<File> {
            let memfd = memfd::MemfdOptions::default()
                .create("como-arena")
                .map_err(std::io::Error::other)?;
            let file = memfd.into_file();
            file.set_len(size as u64)?;
            Ok(file)
        };
        let file = create().map_err(|source| Error::Create { size, source })?;
        Ok(ShmHandle { file, size })
    }

    /// Adopts a file descriptor received from the creating process.
    pub fn from_file(file: File) -> Result<Self, Error> {
        let size = file
            .metadata()
            .map_err(|source| Error::Create { size: 0, source })?
            .len() as usize;
        Ok(ShmHandle { file, size })
    }

    /// Duplicates the handle, e.g. to send it to another process.
    pub fn try_clone(&self) -> Result<Self, Error> {
        let file = self
            .file
            .try_clone()
            .map_err(|source| Error::Create { size: self.size, source })?;
        Ok(ShmHandle { file, size: self.size })
    }

    /// Size of the region in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The raw descriptor, for ancillary-data transmission.
    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Unwraps the backing file, e.g. to ship the descriptor to a consumer.
    #[must_use]
    pub fn into_file(self) -> File {
        self.file
    }
}

impl AsFd for ShmHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

/// A process-local mapping of a [`ShmHandle`].
#[derive(Debug)]
pub struct ShmRegion {
    ptr: NonNull<libc::c_void>,
    len: usize,
    handle: ShmHandle,
}

// SAFETY: the mapping is plain memory; the region is only ever used from
// the single thread that owns it, moving it there at startup is fine.
unsafe impl Send for ShmRegion {}

impl ShmRegion {
    /// Maps the region into this process, read-write.
    pub fn map(handle: ShmHandle) -> Result<Self, Error> {
        let len = NonZeroUsize::new(handle.size()).ok_or(Error::Create {
            size: 0,
            source: std::io::Error::other("zero-sized region"),
        })?;
        // SAFETY: mapping a file we own, at a kernel-chosen address.
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &handle,
                0,
            )?
        };
        Ok(ShmRegion { ptr, len: len.get(), handle })
    }

    /// Size of the mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the mapping is empty (never the case for a mapped region).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The backing handle.
    #[must_use]
    pub fn handle(&self) -> &ShmHandle {
        &self.handle
    }

    /// Read access to `[ofs, ofs + len)`.
    pub fn get(&self, ofs: u32, len: usize) -> Result<&[u8], Error> {
        self.check(ofs, len)?;
        // SAFETY: bounds checked above; writers and readers operate on
        // disjoint blocks by the allocation protocol.
        Ok(unsafe { std::slice::from_raw_parts(self.base().add(ofs as usize), len) })
    }

    /// Write access to `[ofs, ofs + len)`.
    ///
    /// Only the arena (in the creating process) calls this; consumers of
    /// the region never mutate it.
    pub(crate) fn get_mut(&mut self, ofs: u32, len: usize) -> Result<&mut [u8], Error> {
        self.check(ofs, len)?;
        // SAFETY: bounds checked; `&mut self` serializes writers.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.base().add(ofs as usize), len) })
    }

    fn check(&self, ofs: u32, len: usize) -> Result<(), Error> {
        let end = ofs as usize + len;
        if end > self.len {
            return Err(Error::BadBlock { ofs, len: len as u32, capacity: self.len });
        }
        Ok(())
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.ptr.as_ptr().cast()
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap of exactly this size.
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            debug_assert!(false, "munmap failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(missing_docs, clippy::unwrap_used)]
    use super::*;

    #[test]
    fn create_map_write_read() {
        let handle = ShmHandle::new(4096).unwrap();
        let mut region = ShmRegion::map(handle).unwrap();
        region.get_mut(128, 4).unwrap().copy_from_slice(b"como");
        assert_eq!(region.get(128, 4).unwrap(), b"como");
    }

    #[test]
    fn second_mapping_sees_writes() {
        let handle = ShmHandle::new(4096).unwrap();
        let dup = handle.try_clone().unwrap();
        let mut writer = ShmRegion::map(handle).unwrap();
        let reader = ShmRegion::map(dup).unwrap();

        writer.get_mut(0, 8).unwrap().copy_from_slice(b"pipeline");
        assert_eq!(reader.get(0, 8).unwrap(), b"pipeline");
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let handle = ShmHandle::new(4096).unwrap();
        let region = ShmRegion::map(handle).unwrap();
        assert!(matches!(region.get(4090, 100), Err(Error::BadBlock { .. })));
    }
}
