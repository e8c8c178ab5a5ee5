// SPDX-License-Identifier: BSD-3-Clause

//! Top-N ports module.
//!
//! Capture keeps one flow record per (protocol, destination port);
//! export merges them, sorts by byte count and keeps the heaviest `topn`
//! ports per protocol each interval. Accounting is by destination port,
//! the service side of a flow.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use como_engine::error::ModuleError;
use como_engine::module::{Action, Module, ModuleInit, PrintPhase, UpdateResult};
use como_pkt::{L4Type, Metadesc, PktView, Timestamp, protoname};

use crate::parse_arg;

/// Record layout, identical on both sides and on disk:
/// `[ts: u64][proto: u8][pad: u8][port: u16][bytes: u64][pkts: u32]`.
pub const RECORD_LEN: usize = 24;

const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

/// The top-N ports module.
#[derive(Debug)]
pub struct TopPorts {
    meas_ivl: u32,
    topn: usize,
    /// Per-protocol stored-record count of the current walk.
    quota: HashMap<u8, usize>,
    quota_ivl: Timestamp,
}

impl Default for TopPorts {
    fn default() -> Self {
        TopPorts {
            meas_ivl: 1,
            topn: 20,
            quota: HashMap::new(),
            quota_ivl: Timestamp::ZERO,
        }
    }
}

struct Rec {
    ts: u64,
    proto: u8,
    port: u16,
    bytes: u64,
    pkts: u32,
}

impl Rec {
    fn read(rec: &[u8]) -> Rec {
        let mut b = rec;
        let ts = b.get_u64_le();
        let proto = b.get_u8();
        let _ = b.get_u8();
        let port = b.get_u16_le();
        let bytes = b.get_u64_le();
        let pkts = b.get_u32_le();
        Rec { ts, proto, port, bytes, pkts }
    }

    fn write(&self, rec: &mut [u8]) {
        let mut b = rec;
        b.put_u64_le(self.ts);
        b.put_u8(self.proto);
        b.put_u8(0);
        b.put_u16_le(self.port);
        b.put_u64_le(self.bytes);
        b.put_u32_le(self.pkts);
    }
}

fn pkt_proto(pkt: &PktView<'_>) -> u8 {
    match pkt.hdr.l4 {
        L4Type::Tcp => IPPROTO_TCP,
        L4Type::Udp => IPPROTO_UDP,
        L4Type::None => 0,
    }
}

impl Module for TopPorts {
    fn init(&mut self, args: &HashMap<String, String>) -> Result<ModuleInit, ModuleError> {
        self.meas_ivl = parse_arg(args, "interval", 1u32)?.max(1);
        self.topn = parse_arg(args, "topn", 20usize)?.max(1);
        Ok(ModuleInit {
            indesc: Metadesc::with_templates(["none:none:none:~tcp", "none:none:none:~udp"])
                .map_err(|e| ModuleError::BadArg { arg: "indesc".to_owned(), reason: e.to_string() })?,
            ca_record_size: RECORD_LEN,
            ex_record_size: RECORD_LEN,
            flush_ivl: Timestamp::from_secs(self.meas_ivl),
            flexible_flush: true,
            sorted_export: true,
        })
    }

    fn hash(&self, pkt: &PktView<'_>) -> u64 {
        let port = pkt.dst_port().unwrap_or(0);
        (u64::from(pkt_proto(pkt)) << 16) | u64::from(port)
    }

    fn matches(&self, pkt: &PktView<'_>, rec: &[u8]) -> bool {
        let r = Rec::read(rec);
        pkt.dst_port() == Some(r.port) && pkt_proto(pkt) == r.proto
    }

    fn update(&mut self, pkt: &PktView<'_>, rec: &mut [u8], is_new: bool) -> UpdateResult {
        let mut r = Rec::read(rec);
        if is_new {
            r = Rec {
                ts: pkt.hdr.ts.align_to(Timestamp::from_secs(self.meas_ivl)).as_bits(),
                proto: pkt_proto(pkt),
                port: pkt.dst_port().unwrap_or(0),
                bytes: 0,
                pkts: 0,
            };
        }
        r.bytes += u64::from(pkt.ip_len().unwrap_or(pkt.hdr.len as u16));
        r.pkts += 1;
        r.write(rec);
        UpdateResult::Ok
    }

    fn ematch(&self, ex: &[u8], rec: &[u8]) -> bool {
        let e = Rec::read(ex);
        let r = Rec::read(rec);
        e.proto == r.proto && e.port == r.port
    }

    fn export(&mut self, ex: &mut [u8], rec: &[u8], is_new: bool) {
        let r = Rec::read(rec);
        if is_new {
            r.write(ex);
            return;
        }
        let mut e = Rec::read(ex);
        e.bytes += r.bytes;
        e.pkts += r.pkts;
        e.ts = e.ts.min(r.ts);
        e.write(ex);
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        // heaviest first
        Rec::read(b).bytes.cmp(&Rec::read(a).bytes)
    }

    fn action(&mut self, ex: &[u8], ivl: Timestamp, _now: Timestamp, _count: usize) -> Action {
        if ivl != self.quota_ivl {
            self.quota.clear();
            self.quota_ivl = ivl;
        }
        let proto = Rec::read(ex).proto;
        let used = self.quota.entry(proto).or_insert(0);
        if *used < self.topn {
            *used += 1;
            Action::STORE | Action::DISCARD
        } else {
            Action::DISCARD
        }
    }

    fn store(&mut self, rec: &[u8], buf: &mut BytesMut) -> Result<(), ModuleError> {
        if rec.len() < RECORD_LEN {
            return Err(ModuleError::Store("short topports record".to_owned()));
        }
        let r = Rec::read(rec);
        buf.put_u64(r.ts);
        buf.put_u8(r.proto);
        buf.put_u8(0);
        buf.put_u16(r.port);
        buf.put_u64(r.bytes);
        buf.put_u32(r.pkts);
        Ok(())
    }

    fn load(&self, buf: &[u8]) -> Result<(usize, Timestamp), ModuleError> {
        if buf.len() < RECORD_LEN {
            return Err(ModuleError::Load("short topports record".to_owned()));
        }
        let ts = (&buf[..8]).get_u64();
        Ok((RECORD_LEN, Timestamp::from_bits(ts)))
    }

    fn print_phase(&mut self, phase: PrintPhase, _args: &[String]) -> String {
        match phase {
            PrintPhase::Header => "Timestamp    Proto Port      Bytes      Pkts\n".to_owned(),
            PrintPhase::Footer => String::new(),
        }
    }

    fn print(&mut self, rec: &[u8]) -> String {
        let mut b = rec;
        let ts = Timestamp::from_bits(b.get_u64());
        let proto = b.get_u8();
        let _ = b.get_u8();
        let port = b.get_u16();
        let bytes = b.get_u64();
        let pkts = b.get_u32();
        format!("{:>10} {:>6} {:>5} {:>10} {:>9}\n", ts.sec(), protoname::name(proto), port, bytes, pkts)
    }
}
