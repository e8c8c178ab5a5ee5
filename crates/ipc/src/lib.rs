// SPDX-License-Identifier: BSD-3-Clause

//! Typed message bus between the CoMo pipeline processes.
//!
//! Peers belong to a class (supervisor, capture, export, storage, query)
//! and exchange small length-prefixed frames over stream sockets: Unix
//! domain between co-located processes, TCP when a peer lives on another
//! host. A frame is `{type: u16 LE, length: u16 LE, payload}` with the
//! payload capped at [`message::MAX_PAYLOAD`] bytes; frames on Unix
//! sockets may carry one file descriptor as ancillary data (the shared
//! arena memfd, a storage segment).
//!
//! Ordering is FIFO per direction of one connection; nothing is implied
//! across connections. Peer death surfaces as an EOF to the other side and
//! the supervisor decides what to do about it.

// Adopting descriptors received as ancillary data requires `from_raw_fd`.
#![allow(unsafe_code)]

pub mod bus;
pub mod channel;
pub mod codec;
pub mod error;
pub mod message;

pub use bus::{HandlerTable, IpcListener, connect_unix};
pub use channel::IpcChannel;
pub use error::Error;
pub use message::{Frame, MessageType, PeerClass};
