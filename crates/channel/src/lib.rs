// SPDX-License-Identifier: BSD-3-Clause

//! Single-threaded async channels.
//!
//! Every CoMo process stage is one cooperative task tree on a
//! current-thread runtime, so its internal queues never cross a thread
//! boundary. These channels exploit that: `Rc`/`RefCell` state, no atomics,
//! wakers only. Anything that does cross a process boundary goes through
//! the IPC bus instead.

pub mod error;
pub mod mpsc;

pub use error::{RecvError, SendError};
