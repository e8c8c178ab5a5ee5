// SPDX-License-Identifier: BSD-3-Clause

//! IPC errors.

use crate::message::MessageType;

/// All errors the message bus can produce.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Socket-level failure (includes `EPIPE` when the peer died).
    #[error("ipc transport error: {0}")]
    Io(#[from] std::io::Error),

    /// A payload exceeds the frame size cap.
    #[error("payload of {len} bytes exceeds the {max}-byte frame cap")]
    Oversize {
        /// Attempted payload length.
        len: usize,
        /// The cap.
        max: usize,
    },

    /// The wire carried a type code outside the closed message set.
    #[error("unknown message type {0:#06x}")]
    UnknownType(u16),

    /// A structured payload failed to decode.
    #[error("malformed {ty:?} payload: {source}")]
    Payload {
        /// The frame type whose payload was bad.
        ty: MessageType,
        /// Decoder error.
        #[source]
        source: bincode::Error,
    },

    /// File descriptor passing was requested on a TCP transport.
    #[error("file descriptor passing requires a unix-domain transport")]
    FdNotSupported,

    /// The connection closed while a frame was expected.
    #[error("peer closed the connection")]
    PeerGone,

    /// `recv` with a deadline expired.
    #[error("timed out waiting for a frame")]
    Timeout,

    /// A reply arrived with an unexpected type.
    #[error("expected {expected:?} reply, got {got:?}")]
    UnexpectedReply {
        /// The type the caller was waiting for.
        expected: MessageType,
        /// What actually arrived.
        got: MessageType,
    },

    /// The first frame on a connection was not a well-formed HELLO.
    #[error("peer did not introduce itself with HELLO")]
    BadHello,
}

impl Error {
    /// True for the transient "socket full" outcome of a nonblocking send;
    /// the caller retries at the next loop tick.
    #[must_use]
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::WouldBlock)
    }
}
