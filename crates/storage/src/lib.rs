// SPDX-License-Identifier: BSD-3-Clause

//! The storage process: a bytestream log server.
//!
//! A *stream* is a logically append-only sequence of bytes identified by a
//! path. On disk it is a directory of *segments*: files named by the
//! 10-digit stream offset they start at, each capped at a configured
//! maximum size. Writers append through memory-mapped *regions* and commit
//! with `INFORM`; readers map committed spans of the same files. At most
//! one writer exists per stream at any instant; readers are unlimited.
//!
//! The server multiplexes all clients over one single-threaded task set;
//! blocking semantics (a reader waiting for data that is not there yet)
//! are implemented by parking the client's request until a writer commit
//! passes the requested offset.

// Region views are backed by mmap; the single-writer / stable-committed
// protocol is what keeps the mappings sound.
#![allow(unsafe_code)]

pub mod client;
pub mod error;
pub mod server;
pub mod stream;

pub use client::{Region, StorageClient, StreamHandle};
pub use error::Error;
pub use server::StorageServer;
