// SPDX-License-Identifier: BSD-3-Clause

//! The sniffer contract.
//!
//! A sniffer adapts one packet source (a capture interface, a trace file,
//! another CoMo node) to the packet model. The capture loop drives every
//! sniffer from its single thread: selectable sources are polled when
//! their descriptor is ready, pure polled sources on their own interval,
//! file sources whenever there is room in the current batch.

use std::os::fd::RawFd;
use std::time::Duration;

use como_pkt::{LinkType, Metadesc, PktHdr};
use como_shmem::{Arena, MemMap, ShmBlock};

use crate::batch::encode_pkt;
use crate::error::Error;

/// How the capture loop should wait for a sniffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// A finite source (trace file); drive it whenever there is room.
    File,
    /// The descriptor becomes readable when packets are available.
    Select,
    /// No descriptor; poll on the given interval.
    Poll(Duration),
}

/// What a sniffer reports from `start`.
#[derive(Debug)]
pub struct SnifferInfo {
    /// Readiness descriptor, when the source has one.
    pub fd: Option<RawFd>,
    /// Waiting discipline.
    pub mode: PollMode,
    /// The packet shapes this sniffer emits.
    pub outdesc: Vec<Metadesc>,
}

/// Outcome of one `next` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnifferNext {
    /// This many packets were appended to the buffer.
    Packets(usize),
    /// Nothing available right now.
    Idle,
    /// The source is exhausted; `next` will not be called again.
    Eof,
}

/// The driver interface.
pub trait Sniffer {
    /// Opens the source and reports its properties.
    fn start(&mut self) -> Result<SnifferInfo, Error>;

    /// Fills up to `max` packets into `out`. Payload bytes written
    /// through `out` stay valid until the owning batch is reclaimed,
    /// which is after every subscriber acknowledged it.
    fn next(&mut self, out: &mut PktBuf<'_>, max: usize) -> Result<SnifferNext, Error>;

    /// Releases the source.
    fn stop(&mut self);

    /// Best-effort count of packets the source dropped since the last
    /// call (kernel buffer overruns and the like).
    fn dropped(&mut self) -> u64 {
        0
    }
}

/// Destination for the packets of one `next` call.
///
/// Packets land directly in the shared arena; the buffer records the
/// blocks so the capture loop can classify and batch them afterwards.
pub struct PktBuf<'a> {
    arena: &'a mut Arena,
    memmap: &'a mut MemMap,
    blocks: Vec<(ShmBlock, LinkType)>,
}

impl<'a> PktBuf<'a> {
    /// Wraps the arena and the owning batch memmap.
    pub fn new(arena: &'a mut Arena, memmap: &'a mut MemMap) -> Self {
        PktBuf { arena, memmap, blocks: Vec::new() }
    }

    /// Appends one packet. `link` names the framing at the start of the
    /// payload; layer parsing happens in the capture loop afterwards.
    pub fn push(
        &mut self,
        hdr: PktHdr,
        meta: &[u8],
        payload: &[u8],
        link: LinkType,
    ) -> Result<(), Error> {
        let block = encode_pkt(self.arena, self.memmap, &hdr, meta, payload)?;
        self.blocks.push((block, link));
        Ok(())
    }

    /// Packets appended so far in this call.
    #[must_use]
    pub fn count(&self) -> usize {
        self.blocks.len()
    }

    /// Consumes the buffer, returning the appended blocks.
    #[must_use]
    pub fn into_blocks(self) -> Vec<(ShmBlock, LinkType)> {
        self.blocks
    }
}
