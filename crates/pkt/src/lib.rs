// SPDX-License-Identifier: BSD-3-Clause

//! Packet model for the CoMo measurement core.
//!
//! This crate defines the canonical packet descriptor shared by sniffers,
//! the capture process and measurement modules: a fixed-point timestamp, a
//! layered header with per-layer offsets into an immutable payload, and a
//! small self-describing metadata side channel. On top of the descriptor it
//! provides the metadesc negotiation machinery (what a sniffer can emit vs.
//! what a module can consume) and the packet filter derived from it.

pub mod error;
pub mod filter;
pub mod layers;
pub mod metadesc;
pub mod pkt;
pub mod pktmeta;
pub mod protoname;
pub mod timestamp;

pub use error::Error;
pub use filter::Filter;
pub use metadesc::{Metadesc, MetadescFlags, Template};
pub use pkt::{ComoType, L3Type, L4Type, LinkType, PktHdr, PktView};
pub use pktmeta::PktMeta;
pub use timestamp::Timestamp;
