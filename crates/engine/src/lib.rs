// SPDX-License-Identifier: BSD-3-Clause

//! The measurement pipeline engine.
//!
//! Three mainloops and the contracts between them:
//!
//! - [`capture::CaptureLoop`] pulls packets from sniffers, classifies them
//!   against every active module's filter, updates in-arena flow tables
//!   and hands closed batches to subscribed capture clients.
//! - [`export::ExportLoop`] consumes flow-table snapshots, runs the back
//!   half of each module's contract and appends serialized records to the
//!   module's storage stream.
//! - [`client::CaptureClient`] is the subscriber side of the batch
//!   protocol, including sampling and deferred acknowledgment.
//!
//! Modules implement [`module::Module`]; sniffers implement
//! [`sniffer::Sniffer`]. Records and packets live in the shared arena and
//! cross process boundaries as offsets only.

pub mod batch;
pub mod capture;
pub mod client;
pub mod error;
pub mod export;
pub mod module;
pub mod sniffer;
pub mod table;
pub mod testing;

pub use capture::{CaptureLoop, CaptureOptions};
pub use client::CaptureClient;
pub use error::Error;
pub use export::ExportLoop;
pub use module::{Action, Module, ModuleInit, ModuleRegistry, UpdateResult};
pub use sniffer::{PktBuf, PollMode, Sniffer, SnifferInfo, SnifferNext};
