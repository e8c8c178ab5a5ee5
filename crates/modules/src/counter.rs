// SPDX-License-Identifier: BSD-3-Clause

//! Counter module: packets and bytes seen per measurement interval.
//!
//! One flow record per interval (the hash is constant), stored directly
//! without an export table. NetFlow pseudo packets are scaled by their
//! sampling rate and deduplicated on the flow's first-packet flag.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use como_engine::error::ModuleError;
use como_engine::module::{Module, ModuleInit, PrintPhase, UpdateResult};
use como_pkt::{ComoType, Metadesc, PktView, Timestamp};

use crate::parse_arg;

/// Serialized record: `[ts: u64][bytes: u64][pkts: u32]`, network order.
pub const RECORD_LEN: usize = 20;

/// NetFlow pseudo packets carry their flow flags in this pktmeta entry;
/// bit 0 marks the first packet of the flow.
pub const NF_FLAGS_META: &str = "nf-flags";
/// Sampling rate applied upstream, u16 big endian.
pub const NF_SAMPLING_META: &str = "nf-sampling";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Pretty,
    Plain,
    Mbps,
}

/// The counter module.
#[derive(Debug)]
pub struct Counter {
    meas_ivl: u32,
    format: Format,
}

impl Default for Counter {
    fn default() -> Self {
        Counter { meas_ivl: 1, format: Format::Pretty }
    }
}

fn nf_scale(pkt: &PktView<'_>) -> u64 {
    pkt.meta
        .get(NF_SAMPLING_META)
        .and_then(|v| v.try_into().ok().map(u16::from_be_bytes))
        .map_or(1, u64::from)
}

impl Module for Counter {
    fn init(&mut self, args: &HashMap<String, String>) -> Result<ModuleInit, ModuleError> {
        self.meas_ivl = parse_arg(args, "interval", 1u32)?.max(1);
        Ok(ModuleInit {
            indesc: Metadesc::any(),
            ca_record_size: RECORD_LEN,
            ex_record_size: 0,
            flush_ivl: Timestamp::from_secs(self.meas_ivl),
            flexible_flush: false,
            sorted_export: false,
        })
    }

    fn check(&self, pkt: &PktView<'_>) -> bool {
        // per-flow streams: count only the first packet of each flow
        if pkt.hdr.ty == ComoType::NetFlow {
            return pkt
                .meta
                .get(NF_FLAGS_META)
                .is_none_or(|flags| flags.first().is_some_and(|f| f & 1 != 0));
        }
        true
    }

    fn update(&mut self, pkt: &PktView<'_>, rec: &mut [u8], is_new: bool) -> UpdateResult {
        let mut ts = u64::from_le_bytes(rec[..8].try_into().unwrap_or_default());
        let mut bytes = u64::from_le_bytes(rec[8..16].try_into().unwrap_or_default());
        let mut pkts = u32::from_le_bytes(rec[16..20].try_into().unwrap_or_default());
        if is_new {
            ts = pkt.hdr.ts.as_bits();
            bytes = 0;
            pkts = 0;
        }
        let scale = if pkt.hdr.ty == ComoType::NetFlow { nf_scale(pkt) } else { 1 };
        bytes += u64::from(pkt.hdr.len) * scale;
        pkts += scale as u32;
        rec[..8].copy_from_slice(&ts.to_le_bytes());
        rec[8..16].copy_from_slice(&bytes.to_le_bytes());
        rec[16..20].copy_from_slice(&pkts.to_le_bytes());
        UpdateResult::Ok
    }

    fn store(&mut self, rec: &[u8], buf: &mut BytesMut) -> Result<(), ModuleError> {
        if rec.len() < RECORD_LEN {
            return Err(ModuleError::Store("short counter record".to_owned()));
        }
        let ts = u64::from_le_bytes(rec[..8].try_into().unwrap_or_default());
        let bytes = u64::from_le_bytes(rec[8..16].try_into().unwrap_or_default());
        let pkts = u32::from_le_bytes(rec[16..20].try_into().unwrap_or_default());
        buf.put_u64(ts);
        buf.put_u64(bytes / u64::from(self.meas_ivl));
        buf.put_u32(pkts / self.meas_ivl);
        Ok(())
    }

    fn load(&self, buf: &[u8]) -> Result<(usize, Timestamp), ModuleError> {
        if buf.len() < RECORD_LEN {
            return Err(ModuleError::Load("short counter record".to_owned()));
        }
        let ts = (&buf[..8]).get_u64();
        Ok((RECORD_LEN, Timestamp::from_bits(ts)))
    }

    fn print_phase(&mut self, phase: PrintPhase, args: &[String]) -> String {
        match phase {
            PrintPhase::Header => {
                self.format = Format::Pretty;
                for arg in args {
                    match arg.as_str() {
                        "format=plain" => self.format = Format::Plain,
                        "format=mbps" => self.format = Format::Mbps,
                        "format=pretty" => self.format = Format::Pretty,
                        _ => {}
                    }
                }
                match self.format {
                    Format::Pretty => "Timestamp              Bytes      Pkts\n".to_owned(),
                    Format::Plain | Format::Mbps => String::new(),
                }
            }
            PrintPhase::Footer => String::new(),
        }
    }

    fn print(&mut self, rec: &[u8]) -> String {
        let mut b = rec;
        let ts = Timestamp::from_bits(b.get_u64());
        let bytes = b.get_u64();
        let pkts = b.get_u32();
        match self.format {
            Format::Pretty => format!("{:>12}.{:06} {:>10} {:>9}\n", ts.sec(), ts.usec(), bytes, pkts),
            Format::Plain => format!("{} {} {} {}\n", ts.sec(), ts.as_bits(), bytes, pkts),
            Format::Mbps => format!("{:.2} Mbps\n", 8.0 * bytes as f64 / 1_000_000.0),
        }
    }
}
