// SPDX-License-Identifier: BSD-3-Clause

//! Storage errors.

/// All errors the storage server and client can produce.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Filesystem failure on a stream directory or segment.
    #[error("storage I/O on `{path}`: {source}")]
    Io {
        /// The stream or segment involved.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Bus failure talking to the storage process.
    #[error("storage ipc: {0}")]
    Ipc(#[from] como_ipc::Error),

    /// The server refused a request; mirrors the `ERROR` reply frame.
    #[error("storage refused: {reason}")]
    Refused {
        /// Reason string from the server.
        reason: String,
    },

    /// A second writer tried to open a stream.
    #[error("stream `{stream}` already has a writer")]
    WriterExists {
        /// The contended stream.
        stream: String,
    },

    /// A request referenced a handle this connection never opened.
    #[error("unknown stream handle {handle}")]
    UnknownHandle {
        /// The bogus handle value.
        handle: u32,
    },

    /// A writer region or commit does not line up with the stream head.
    #[error("offset {offset} does not match stream head {head}")]
    BadOffset {
        /// Offset in the request.
        offset: u64,
        /// Current committed head.
        head: u64,
    },

    /// A reply frame that should carry a segment descriptor did not.
    #[error("region grant arrived without a segment descriptor")]
    MissingFd,
}
