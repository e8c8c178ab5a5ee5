// SPDX-License-Identifier: BSD-3-Clause

//! Classic-pcap file reader.
//!
//! Supports the 24-byte classic header in either byte order, microsecond
//! or nanosecond timestamps, Ethernet link type only. Records are read
//! through a carry buffer so a record split across two reads survives to
//! the next call.

use std::fs::File;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::path::PathBuf;

use como_engine::{Error, PktBuf, PollMode, Sniffer, SnifferInfo, SnifferNext};
use como_pkt::{ComoType, LinkType, Metadesc, PktHdr, Timestamp};
use tracing::{debug, warn};

const MAGIC_USEC: u32 = 0xa1b2_c3d4;
const MAGIC_NSEC: u32 = 0xa1b2_3c4d;
const GLOBAL_HDR_LEN: usize = 24;
const REC_HDR_LEN: usize = 16;
const DLT_EN10MB: u32 = 1;
const READ_CHUNK: usize = 1024 * 1024;

/// Reads packets from a classic pcap capture file.
pub struct PcapSniffer {
    path: PathBuf,
    file: Option<File>,
    swapped: bool,
    nanos: bool,
    carry: Vec<u8>,
    eof: bool,
    last_ts: Timestamp,
}

impl PcapSniffer {
    /// Creates a reader for the given file; nothing is opened until
    /// `start`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        PcapSniffer {
            path: path.into(),
            file: None,
            swapped: false,
            nanos: false,
            carry: Vec::new(),
            eof: false,
            last_ts: Timestamp::ZERO,
        }
    }

    fn u32_at(&self, buf: &[u8], at: usize) -> u32 {
        let b = [buf[at], buf[at + 1], buf[at + 2], buf[at + 3]];
        if self.swapped { u32::from_be_bytes(b) } else { u32::from_le_bytes(b) }
    }

    fn err(&self, reason: impl Into<String>) -> Error {
        Error::Sniffer { sniffer: self.path.display().to_string(), reason: reason.into() }
    }
}

impl Sniffer for PcapSniffer {
    fn start(&mut self) -> Result<SnifferInfo, Error> {
        let mut file = File::open(&self.path)
            .map_err(|e| self.err(format!("cannot open: {e}")))?;
        let mut hdr = [0u8; GLOBAL_HDR_LEN];
        file.read_exact(&mut hdr).map_err(|e| self.err(format!("short header: {e}")))?;

        let magic = u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
        (self.swapped, self.nanos) = match magic {
            MAGIC_USEC => (false, false),
            MAGIC_NSEC => (false, true),
            m if m == MAGIC_USEC.swap_bytes() => (true, false),
            m if m == MAGIC_NSEC.swap_bytes() => (true, true),
            other => return Err(self.err(format!("unrecognized magic {other:#010x}"))),
        };
        let linktype = self.u32_at(&hdr, 20);
        if linktype != DLT_EN10MB {
            return Err(self.err(format!("unsupported datalink {linktype}")));
        }
        debug!(path = %self.path.display(), swapped = self.swapped, nanos = self.nanos, "pcap open");

        let fd = file.as_raw_fd();
        self.file = Some(file);
        Ok(SnifferInfo {
            fd: Some(fd),
            mode: PollMode::File,
            outdesc: vec![Metadesc::with_templates(["link:eth:any:any"]).map_err(Error::Pkt)?],
        })
    }

    fn next(&mut self, out: &mut PktBuf<'_>, max: usize) -> Result<SnifferNext, Error> {
        let Some(file) = self.file.as_mut() else {
            return Ok(SnifferNext::Eof);
        };
        if !self.eof {
            let mut chunk = vec![0u8; READ_CHUNK];
            let n = file.read(&mut chunk).map_err(|e| {
                Error::Sniffer {
                    sniffer: self.path.display().to_string(),
                    reason: format!("read: {e}"),
                }
            })?;
            if n == 0 {
                self.eof = true;
            } else {
                self.carry.extend_from_slice(&chunk[..n]);
            }
        }

        let mut consumed = 0usize;
        let mut npkts = 0usize;
        while npkts < max && self.carry.len() - consumed >= REC_HDR_LEN {
            let rec = &self.carry[consumed..];
            let ts_sec = self.u32_at(rec, 0);
            let ts_frac = self.u32_at(rec, 4);
            let caplen = self.u32_at(rec, 8) as usize;
            let wire_len = self.u32_at(rec, 12);
            if rec.len() < REC_HDR_LEN + caplen {
                break; // partial record, keep for the next call
            }
            let usec = if self.nanos { ts_frac / 1000 } else { ts_frac };
            let ts = Timestamp::new(ts_sec, usec);
            if ts < self.last_ts {
                warn!(path = %self.path.display(), "timestamp regression in trace");
            }
            self.last_ts = self.last_ts.max(ts);

            let hdr = PktHdr::new(ts, wire_len, caplen as u32, ComoType::Link);
            out.push(hdr, &[], &rec[REC_HDR_LEN..REC_HDR_LEN + caplen], LinkType::Eth)?;
            consumed += REC_HDR_LEN + caplen;
            npkts += 1;
        }
        let _ = self.carry.drain(..consumed);

        if npkts > 0 {
            Ok(SnifferNext::Packets(npkts))
        } else if self.eof {
            if !self.carry.is_empty() {
                warn!(
                    path = %self.path.display(),
                    leftover = self.carry.len(),
                    "trailing garbage at end of trace"
                );
            }
            Ok(SnifferNext::Eof)
        } else {
            Ok(SnifferNext::Idle)
        }
    }

    fn stop(&mut self) {
        self.file = None;
        self.carry.clear();
    }
}

#[cfg(test)]
mod tests {
    #![allow(missing_docs, clippy::unwrap_used)]
    use std::io::Write;

    use como_pkt::L4Type;
    use como_shmem::{Arena, MemMap, MemPolicy, ShmHandle, ShmRegion};

    use super::*;

    fn pcap_file(records: &[(u32, u32, &[u8])]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC_USEC.to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&4u16.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 8]); // thiszone + sigfigs
        bytes.extend_from_slice(&65535u32.to_le_bytes());
        bytes.extend_from_slice(&DLT_EN10MB.to_le_bytes());
        for (sec, usec, data) in records {
            bytes.extend_from_slice(&sec.to_le_bytes());
            bytes.extend_from_slice(&usec.to_le_bytes());
            bytes.extend_from_slice(&(data.len() as u32).to_le_bytes());
            bytes.extend_from_slice(&(data.len() as u32 + 4).to_le_bytes());
            bytes.extend_from_slice(data);
        }
        f.write_all(&bytes).unwrap();
        f
    }

    fn eth_udp_frame() -> Vec<u8> {
        let mut p = vec![0u8; 12];
        p.extend_from_slice(&0x0800u16.to_be_bytes());
        let mut ip = vec![0x45, 0, 0, 36, 0, 0, 0, 0, 64, 17, 0, 0];
        ip.extend_from_slice(&[10, 0, 0, 1, 10, 0, 0, 2]);
        p.extend_from_slice(&ip);
        p.extend_from_slice(&53u16.to_be_bytes());
        p.extend_from_slice(&5353u16.to_be_bytes());
        p.extend_from_slice(&16u16.to_be_bytes());
        p.extend_from_slice(&0u16.to_be_bytes());
        p.extend_from_slice(&[0u8; 8]);
        p
    }

    fn drive(sniffer: &mut PcapSniffer) -> Vec<(Timestamp, u32, L4Type)> {
        let region = ShmRegion::map(ShmHandle::new(1 << 20).unwrap()).unwrap();
        let mut arena = Arena::new(region);
        let mut mm = MemMap::new(MemPolicy::HoldInUse);
        let mut got = Vec::new();
        loop {
            let mut buf = PktBuf::new(&mut arena, &mut mm);
            let outcome = sniffer.next(&mut buf, 64).unwrap();
            let blocks = buf.into_blocks();
            for (block, link) in &blocks {
                let bytes = arena.get(*block).unwrap().to_vec();
                let view = como_engine::batch::pkt_view(&bytes).unwrap();
                let mut hdr = view.hdr;
                let _ = como_pkt::layers::update_offsets(&mut hdr, view.payload, *link);
                got.push((hdr.ts, hdr.len, hdr.l4));
            }
            match outcome {
                SnifferNext::Eof => break,
                SnifferNext::Packets(_) | SnifferNext::Idle => {}
            }
        }
        got
    }

    #[test]
    fn reads_records_and_timestamps() {
        let frame = eth_udp_frame();
        let f = pcap_file(&[(1, 0, &frame), (1, 500_000, &frame), (2, 1, &frame)]);
        let mut sniffer = PcapSniffer::new(f.path());
        let info = sniffer.start().unwrap();
        assert_eq!(info.mode, PollMode::File);

        let got = drive(&mut sniffer);
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].0, Timestamp::new(1, 0));
        assert!(got[1].0 < got[2].0, "timestamps non-decreasing");
        assert_eq!(got[0].1, frame.len() as u32 + 4);
        assert_eq!(got[0].2, L4Type::Udp);
    }

    #[test]
    fn rejects_non_ethernet_traces() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC_USEC.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 16]);
        bytes.extend_from_slice(&101u32.to_le_bytes()); // DLT_RAW
        f.write_all(&bytes).unwrap();
        let mut sniffer = PcapSniffer::new(f.path());
        assert!(sniffer.start().is_err());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0u8; 24]).unwrap();
        let mut sniffer = PcapSniffer::new(f.path());
        assert!(sniffer.start().is_err());
    }

    #[test]
    fn big_endian_traces_parse() {
        let frame = eth_udp_frame();
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC_USEC.to_be_bytes());
        bytes.extend_from_slice(&2u16.to_be_bytes());
        bytes.extend_from_slice(&4u16.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 8]);
        bytes.extend_from_slice(&65535u32.to_be_bytes());
        bytes.extend_from_slice(&DLT_EN10MB.to_be_bytes());
        bytes.extend_from_slice(&7u32.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&frame);
        f.write_all(&bytes).unwrap();

        let mut sniffer = PcapSniffer::new(f.path());
        let _ = sniffer.start().unwrap();
        let got = drive(&mut sniffer);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, Timestamp::from_secs(7));
    }
}
