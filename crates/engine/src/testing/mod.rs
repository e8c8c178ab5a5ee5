// SPDX-License-Identifier: BSD-3-Clause

//! Test utilities: a synthetic sniffer, frame builders and a minimal
//! module, shared by the engine's own tests and by downstream crates.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use como_pkt::{ComoType, LinkType, Metadesc, PktHdr, PktView, Timestamp};

use crate::error::{Error, ModuleError};
use crate::module::{Module, ModuleInit, UpdateResult};
use crate::sniffer::{PktBuf, PollMode, Sniffer, SnifferInfo, SnifferNext};

/// Transport protocol of a synthetic packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthProto {
    /// TCP with the given ports.
    Tcp,
    /// UDP with the given ports.
    Udp,
}

/// One packet the synthetic sniffer will emit.
#[derive(Debug, Clone, Copy)]
pub struct SynthPkt {
    /// Capture timestamp.
    pub ts: Timestamp,
    /// Transport protocol.
    pub proto: SynthProto,
    /// Source port.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
    /// Wire length of the whole frame.
    pub wire_len: u32,
}

/// Builds a complete Ethernet/IPv4/TCP-or-UDP frame for a [`SynthPkt`].
#[must_use]
pub fn build_frame(p: &SynthPkt) -> Vec<u8> {
    let mut frame = vec![0u8; 12];
    frame.put_u16(0x0800);
    let ip_len = p.wire_len.saturating_sub(14).max(40) as u16;
    // ipv4 header
    frame.put_u8(0x45);
    frame.put_u8(0);
    frame.put_u16(ip_len);
    frame.put_u32(0); // id + fragment
    frame.put_u8(64);
    frame.put_u8(match p.proto {
        SynthProto::Tcp => 6,
        SynthProto::Udp => 17,
    });
    frame.put_u16(0); // checksum
    frame.put_slice(&[10, 0, 0, 1]);
    frame.put_slice(&[10, 0, 0, 2]);
    // transport header
    frame.put_u16(p.src_port);
    frame.put_u16(p.dst_port);
    match p.proto {
        SynthProto::Tcp => {
            frame.put_u32(1); // seq
            frame.put_u32(0); // ack
            frame.put_u8(0x50); // data offset 5
            frame.put_u8(0);
            frame.put_u16(1024); // window
            frame.put_u32(0); // checksum + urgent
        }
        SynthProto::Udp => {
            frame.put_u16(ip_len - 20);
            frame.put_u16(0);
        }
    }
    frame
}

/// A sniffer fed from a prepared packet list, emitting at most
/// `per_next` packets per `next` call.
pub struct SynthSniffer {
    pkts: Vec<SynthPkt>,
    at: usize,
    per_next: usize,
    idle: usize,
    drops: u64,
}

impl SynthSniffer {
    /// Creates a sniffer over a fixed packet list.
    #[must_use]
    pub fn new(pkts: Vec<SynthPkt>) -> Self {
        SynthSniffer { pkts, at: 0, per_next: 64, idle: 0, drops: 0 }
    }

    /// Limits how many packets one `next` call emits.
    #[must_use]
    pub fn per_next(mut self, n: usize) -> Self {
        self.per_next = n.max(1);
        self
    }

    /// Reports idle for the first `n` calls, leaving subscribers time to
    /// attach before the stream starts.
    #[must_use]
    pub fn idle_first(mut self, n: usize) -> Self {
        self.idle = n;
        self
    }

    /// Pretends the source dropped `n` packets before the next call.
    pub fn inject_drops(&mut self, n: u64) {
        self.drops += n;
    }
}

impl Sniffer for SynthSniffer {
    fn start(&mut self) -> Result<SnifferInfo, Error> {
        Ok(SnifferInfo {
            fd: None,
            mode: PollMode::File,
            outdesc: vec![
                Metadesc::with_templates(["link:eth:any:any"]).map_err(Error::Pkt)?,
            ],
        })
    }

    fn next(&mut self, out: &mut PktBuf<'_>, max: usize) -> Result<SnifferNext, Error> {
        if self.idle > 0 {
            self.idle -= 1;
            return Ok(SnifferNext::Idle);
        }
        if self.at >= self.pkts.len() {
            return Ok(SnifferNext::Eof);
        }
        let take = self.per_next.min(max).min(self.pkts.len() - self.at);
        for p in &self.pkts[self.at..self.at + take] {
            let frame = build_frame(p);
            let hdr = PktHdr::new(p.ts, p.wire_len, frame.len() as u32, ComoType::Link);
            out.push(hdr, &[], &frame, LinkType::Eth)?;
        }
        self.at += take;
        Ok(SnifferNext::Packets(take))
    }

    fn stop(&mut self) {}

    fn dropped(&mut self) -> u64 {
        std::mem::take(&mut self.drops)
    }
}

/// Record layout: `[ts: u64][bytes: u64][pkts: u32]`, 20 bytes.
const PKTCOUNT_RECORD: usize = 20;

/// A minimal measurement module counting packets and wire bytes per
/// flush interval, stored without an export table.
#[derive(Debug, Default)]
pub struct PktCountModule {
    ivl: Timestamp,
}

impl Module for PktCountModule {
    fn init(&mut self, args: &HashMap<String, String>) -> Result<ModuleInit, ModuleError> {
        let secs: u32 = match args.get("interval") {
            Some(v) => v.parse().map_err(|_| ModuleError::BadArg {
                arg: "interval".to_owned(),
                reason: format!("`{v}` is not a number of seconds"),
            })?,
            None => 1,
        };
        self.ivl = Timestamp::from_secs(secs);
        Ok(ModuleInit {
            indesc: Metadesc::with_templates(["any:any:~ip:~tcp"])
                .map_err(|e| ModuleError::BadArg { arg: "indesc".to_owned(), reason: e.to_string() })?,
            ca_record_size: PKTCOUNT_RECORD,
            ex_record_size: 0,
            flush_ivl: self.ivl,
            flexible_flush: false,
            sorted_export: false,
        })
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
        bytes += u64::from(pkt.hdr.len);
        pkts += 1;
        rec[..8].copy_from_slice(&ts.to_le_bytes());
        rec[8..16].copy_from_slice(&bytes.to_le_bytes());
        rec[16..20].copy_from_slice(&pkts.to_le_bytes());
        UpdateResult::Ok
    }

    fn store(&mut self, rec: &[u8], buf: &mut BytesMut) -> Result<(), ModuleError> {
        let ts = u64::from_le_bytes(rec[..8].try_into().map_err(|_| short("record"))?);
        let bytes = u64::from_le_bytes(rec[8..16].try_into().map_err(|_| short("record"))?);
        let pkts = u32::from_le_bytes(rec[16..20].try_into().map_err(|_| short("record"))?);
        buf.put_u64(ts);
        buf.put_u64(bytes);
        buf.put_u32(pkts);
        Ok(())
    }

    fn load(&self, buf: &[u8]) -> Result<(usize, Timestamp), ModuleError> {
        if buf.len() < PKTCOUNT_RECORD {
            return Err(ModuleError::Load("short record".to_owned()));
        }
        let ts = (&buf[..8]).get_u64();
        Ok((PKTCOUNT_RECORD, Timestamp::from_bits(ts)))
    }

    fn print(&mut self, rec: &[u8]) -> String {
        let mut b = rec;
        let ts = Timestamp::from_bits(b.get_u64());
        let bytes = b.get_u64();
        let pkts = b.get_u32();
        format!("{ts} {bytes} {pkts}\n")
    }
}

fn short(what: &str) -> ModuleError {
    ModuleError::Store(format!("short {what}"))
}

/// Evenly spaced TCP packets, convenient for conservation tests.
#[must_use]
pub fn tcp_burst(count: usize, start: Timestamp, spacing_usec: u32, wire_len: u32) -> Vec<SynthPkt> {
    (0..count)
        .map(|i| SynthPkt {
            ts: Timestamp::from_bits(
                start.as_bits() + Timestamp::new(0, spacing_usec).as_bits() * i as u64,
            ),
            proto: SynthProto::Tcp,
            src_port: 40_000,
            dst_port: 80,
            wire_len,
        })
        .collect()
}
