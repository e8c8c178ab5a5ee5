// SPDX-License-Identifier: BSD-3-Clause

//! Errors for the shared-memory layer.

/// All errors the shared-memory layer can produce.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The backing memfd could not be created or sized.
    #[error("cannot create shared region of {size} bytes: {source}")]
    Create {
        /// Requested region size.
        size: usize,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The region could not be mapped into this process.
    #[error("cannot map shared region: {0}")]
    Map(#[from] nix::errno::Errno),

    /// The arena has no free span large enough.
    ///
    /// Allocation failure is fatal for the owning process; callers above
    /// the capture quotas treat the region as oversubscribed.
    #[error("shared arena exhausted: requested {requested} bytes, capacity {capacity}, in use {used}")]
    OutOfMemory {
        /// Bytes requested.
        requested: usize,
        /// Total arena capacity.
        capacity: usize,
        /// Bytes currently allocated.
        used: usize,
    },

    /// A block reference does not fall inside the region.
    #[error("block [{ofs}, +{len}) outside region of {capacity} bytes")]
    BadBlock {
        /// Block offset.
        ofs: u32,
        /// Block length.
        len: u32,
        /// Region capacity.
        capacity: usize,
    },
}
