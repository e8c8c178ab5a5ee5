// SPDX-License-Identifier: BSD-3-Clause

//! Packet trace module.
//!
//! Keeps a per-packet record with a payload snippet of configurable snap
//! length. Records are variable length on disk, so every stored record
//! carries its own length prefix; `replay` regenerates the captured
//! bytes so other modules can be driven from a stored trace.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use como_engine::error::ModuleError;
use como_engine::module::{Module, ModuleInit, PrintPhase, UpdateResult};
use como_pkt::{Metadesc, PktView, Timestamp, protoname};

use crate::parse_arg;

/// Fixed part of the capture record: `[ts: u64][wire_len: u32]
/// [snap_len: u32]`, followed by `snap_len` payload bytes.
const FIXED: usize = 16;

/// On-disk framing: a u16 length prefix before the fixed part.
const PREFIX: usize = 2;

/// The trace module.
#[derive(Debug)]
pub struct Trace {
    snaplen: usize,
}

impl Default for Trace {
    fn default() -> Self {
        Trace { snaplen: 64 }
    }
}

impl Module for Trace {
    fn init(&mut self, args: &HashMap<String, String>) -> Result<ModuleInit, ModuleError> {
        self.snaplen = parse_arg(args, "snaplen", 64usize)?.clamp(16, 1500);
        Ok(ModuleInit {
            indesc: Metadesc::any(),
            ca_record_size: FIXED + self.snaplen,
            ex_record_size: 0,
            flush_ivl: Timestamp::ZERO,
            flexible_flush: false,
            sorted_export: false,
        })
    }

    /// Every packet gets its own record; the key only spreads buckets.
    fn hash(&self, pkt: &PktView<'_>) -> u64 {
        pkt.hdr.ts.as_bits()
    }

    fn matches(&self, _pkt: &PktView<'_>, _rec: &[u8]) -> bool {
        false
    }

    fn update(&mut self, pkt: &PktView<'_>, rec: &mut [u8], _is_new: bool) -> UpdateResult {
        let snap = pkt.payload.len().min(self.snaplen);
        let mut b = &mut rec[..];
        b.put_u64_le(pkt.hdr.ts.as_bits());
        b.put_u32_le(pkt.hdr.len);
        b.put_u32_le(snap as u32);
        rec[FIXED..FIXED + snap].copy_from_slice(&pkt.payload[..snap]);
        UpdateResult::Ok
    }

    fn store(&mut self, rec: &[u8], buf: &mut BytesMut) -> Result<(), ModuleError> {
        if rec.len() < FIXED {
            return Err(ModuleError::Store("short trace record".to_owned()));
        }
        let snap = u32::from_le_bytes(rec[12..16].try_into().unwrap_or_default()) as usize;
        if rec.len() < FIXED + snap {
            return Err(ModuleError::Store("snippet longer than record".to_owned()));
        }
        buf.put_u16((FIXED + snap) as u16);
        let mut b = rec;
        buf.put_u64(b.get_u64_le());
        buf.put_u32(b.get_u32_le());
        buf.put_u32(b.get_u32_le());
        buf.put_slice(&rec[FIXED..FIXED + snap]);
        Ok(())
    }

    fn load(&self, buf: &[u8]) -> Result<(usize, Timestamp), ModuleError> {
        if buf.len() < PREFIX + FIXED {
            return Err(ModuleError::Load("short trace record".to_owned()));
        }
        let mut b = buf;
        let total = b.get_u16() as usize;
        let ts = b.get_u64();
        if total < FIXED || buf.len() < PREFIX + total {
            return Err(ModuleError::Load("truncated trace record".to_owned()));
        }
        Ok((PREFIX + total, Timestamp::from_bits(ts)))
    }

    fn print_phase(&mut self, phase: PrintPhase, _args: &[String]) -> String {
        match phase {
            PrintPhase::Header => "Timestamp         Len  Proto  Snippet\n".to_owned(),
            PrintPhase::Footer => String::new(),
        }
    }

    fn print(&mut self, rec: &[u8]) -> String {
        let mut b = &rec[PREFIX..];
        let ts = Timestamp::from_bits(b.get_u64());
        let wire = b.get_u32();
        let snap = b.get_u32() as usize;
        let snippet = &rec[PREFIX + FIXED..(PREFIX + FIXED + snap).min(rec.len())];
        // best effort: the snippet starts at the link layer of an
        // ethernet frame, the protocol byte sits at 14 + 9 when present
        let proto = snippet.get(23).copied().map_or("-".to_owned(), protoname::name);
        let hex: String = snippet.iter().take(16).map(|b| format!("{b:02x}")).collect();
        format!("{ts} {wire:>6} {proto:>6}  {hex}\n")
    }

    fn replay(&self, rec: &[u8]) -> Option<Vec<u8>> {
        if rec.len() < PREFIX + FIXED {
            return None;
        }
        let snap = u32::from_be_bytes(rec[PREFIX + 12..PREFIX + 16].try_into().ok()?) as usize;
        rec.get(PREFIX + FIXED..PREFIX + FIXED + snap).map(<[u8]>::to_vec)
    }
}

#[cfg(test)]
mod tests {
    #![allow(missing_docs, clippy::unwrap_used)]
    use como_pkt::{ComoType, PktHdr, pktmeta::PktMetaView};

    use super::*;

    #[test]
    fn each_packet_is_its_own_record() {
        let mut trace = Trace::default();
        let init = trace.init(&HashMap::new()).unwrap();
        assert_eq!(init.ca_record_size, FIXED + 64);

        let payload = vec![7u8; 100];
        let hdr = PktHdr::new(Timestamp::new(3, 0), 100, 100, ComoType::Link);
        let view = PktView { hdr, payload: &payload, meta: PktMetaView::empty() };
        assert!(!trace.matches(&view, &[0u8; 80]));

        let mut rec = vec![0u8; FIXED + 64];
        let _ = trace.update(&view, &mut rec, true);
        assert_eq!(u32::from_le_bytes(rec[12..16].try_into().unwrap()), 64);
    }

    #[test]
    fn variable_length_records_self_describe() {
        let mut trace = Trace::default();
        let args = HashMap::from([("snaplen".to_owned(), "32".to_owned())]);
        let _ = trace.init(&args).unwrap();

        let payload = vec![0xabu8; 20]; // shorter than snaplen
        let hdr = PktHdr::new(Timestamp::new(5, 0), 20, 20, ComoType::Link);
        let view = PktView { hdr, payload: &payload, meta: PktMetaView::empty() };
        let mut rec = vec![0u8; FIXED + 32];
        let _ = trace.update(&view, &mut rec, true);

        let mut buf = BytesMut::new();
        trace.store(&rec, &mut buf).unwrap();
        assert_eq!(buf.len(), PREFIX + FIXED + 20);

        let (len, ts) = trace.load(&buf).unwrap();
        assert_eq!(len, buf.len());
        assert_eq!(ts, Timestamp::from_secs(5));

        let replayed = trace.replay(&buf).unwrap();
        assert_eq!(replayed, payload);
    }

    #[test]
    fn two_stored_records_walk_cleanly() {
        let mut trace = Trace::default();
        let _ = trace.init(&HashMap::new()).unwrap();

        let mut stream = BytesMut::new();
        for (i, plen) in [(1u32, 30usize), (2, 50)] {
            let payload = vec![i as u8; plen];
            let hdr = PktHdr::new(Timestamp::from_secs(i), plen as u32, plen as u32, ComoType::Link);
            let view = PktView { hdr, payload: &payload, meta: PktMetaView::empty() };
            let mut rec = vec![0u8; FIXED + 64];
            let _ = trace.update(&view, &mut rec, true);
            trace.store(&rec, &mut stream).unwrap();
        }

        let (len1, ts1) = trace.load(&stream).unwrap();
        assert_eq!(ts1, Timestamp::from_secs(1));
        let (len2, ts2) = trace.load(&stream[len1..]).unwrap();
        assert_eq!(ts2, Timestamp::from_secs(2));
        assert_eq!(len1 + len2, stream.len());
    }
}
