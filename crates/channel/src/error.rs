// SPDX-License-Identifier: BSD-3-Clause

//! Channel errors.

/// Errors produced when sending into a channel.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SendError<T> {
    /// The channel buffer is at capacity; the value is handed back.
    #[error("channel full")]
    Full(T),

    /// The receiver is gone; the value is handed back.
    #[error("channel closed")]
    Closed(T),
}

impl<T> SendError<T> {
    /// Recovers the value that could not be sent.
    pub fn into_inner(self) -> T {
        match self {
            SendError::Full(v) | SendError::Closed(v) => v,
        }
    }
}

/// Errors produced when receiving from a channel.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RecvError {
    /// All senders dropped and the buffer is drained.
    #[error("channel closed")]
    Closed,

    /// Nothing buffered right now (only returned by `try_recv`).
    #[error("channel empty")]
    Empty,
}
