// SPDX-License-Identifier: BSD-3-Clause

//! Arena wire formats: packets, batch descriptors, snapshot tables.
//!
//! Everything capture shares with other processes is serialized into the
//! arena in little-endian fixed layouts so any process mapping the region
//! can decode it from offsets alone.
//!
//! Packet block: `[PktHdr][meta_len: u16][meta][payload]`.
//!
//! Batch descriptor: `[seq: u64][count: u32][pkts0_len: u32]
//! [pkts1_len: u32][last_ts: u64][ref_mask: u64][count x (ofs: u32,
//! len: u32)]`. The descriptor carries two packet-array lengths; the
//! second array is populated when a batch wraps the producing ring, and
//! consumers always walk `pkts0` then `pkts1`.
//!
//! Snapshot table: `[count: u32][count x (ofs: u32, len: u32)]`.

use bytes::{Buf, BufMut};
use como_pkt::{PktHdr, PktView, Timestamp, pktmeta::PktMetaView};
use como_shmem::{Arena, MemMap, ShmBlock};

use crate::error::Error;

const META_LEN_FIELD: usize = 2;

/// Serialized size of a packet block with the given meta and payload.
#[must_use]
pub fn pkt_wire_len(meta_len: usize, caplen: usize) -> usize {
    PktHdr::WIRE_LEN + META_LEN_FIELD + meta_len + caplen
}

/// Writes one packet into a fresh arena block owned by `memmap`.
pub fn encode_pkt(
    arena: &mut Arena,
    memmap: &mut MemMap,
    hdr: &PktHdr,
    meta: &[u8],
    payload: &[u8],
) -> Result<ShmBlock, Error> {
    let block = memmap.alloc(arena, pkt_wire_len(meta.len(), payload.len()))?;
    let mut buf = arena.get_mut(block)?;
    hdr.write_to(&mut buf);
    buf.put_u16_le(meta.len() as u16);
    buf.put_slice(meta);
    buf.put_slice(payload);
    Ok(block)
}

/// Decodes a packet block into a borrowed view.
pub fn pkt_view(bytes: &[u8]) -> Result<PktView<'_>, Error> {
    let hdr = PktHdr::read_from(bytes)?;
    let mut rest = &bytes[PktHdr::WIRE_LEN..];
    if rest.len() < META_LEN_FIELD {
        return Err(Error::Protocol { reason: "packet block too short for meta".to_owned() });
    }
    let meta_len = rest.get_u16_le() as usize;
    if rest.len() < meta_len + hdr.caplen as usize {
        return Err(Error::Protocol { reason: "packet block shorter than declared".to_owned() });
    }
    let (meta, payload) = rest.split_at(meta_len);
    Ok(PktView {
        hdr,
        payload: &payload[..hdr.caplen as usize],
        meta: PktMetaView::new(meta),
    })
}

/// Re-stamps the header of an encoded packet after offset parsing.
pub fn rewrite_hdr(bytes: &mut [u8], hdr: &PktHdr) {
    let mut head = &mut bytes[..PktHdr::WIRE_LEN];
    hdr.write_to(&mut head);
}

/// The parsed form of a batch descriptor.
#[derive(Debug, Clone)]
pub struct BatchDesc {
    /// Monotonic batch sequence number.
    pub seq: u64,
    /// Total packets in the batch.
    pub count: u32,
    /// Packets in the first array.
    pub pkts0_len: u32,
    /// Packets in the second array (ring wrap).
    pub pkts1_len: u32,
    /// Timestamp of the newest packet.
    pub last_ts: Timestamp,
    /// Subscribed clients at close time, one bit per client id.
    pub ref_mask: u64,
    /// Packet blocks, first array then second.
    pub pkts: Vec<ShmBlock>,
}

/// Serialized size of a batch descriptor for `count` packets.
#[must_use]
pub fn batch_wire_len(count: usize) -> usize {
    8 + 4 + 4 + 4 + 8 + 8 + count * 8
}

/// Writes a batch descriptor into a fresh arena block owned by `memmap`.
pub fn encode_batch(
    arena: &mut Arena,
    memmap: &mut MemMap,
    desc: &BatchDesc,
) -> Result<ShmBlock, Error> {
    let block = memmap.alloc(arena, batch_wire_len(desc.pkts.len()))?;
    let mut buf = arena.get_mut(block)?;
    buf.put_u64_le(desc.seq);
    buf.put_u32_le(desc.count);
    buf.put_u32_le(desc.pkts0_len);
    buf.put_u32_le(desc.pkts1_len);
    buf.put_u64_le(desc.last_ts.as_bits());
    buf.put_u64_le(desc.ref_mask);
    for b in &desc.pkts {
        buf.put_u32_le(b.ofs());
        buf.put_u32_le(b.len());
    }
    Ok(block)
}

/// Parses a batch descriptor from its block bytes.
pub fn decode_batch(mut bytes: &[u8]) -> Result<BatchDesc, Error> {
    if bytes.len() < batch_wire_len(0) {
        return Err(Error::Protocol { reason: "batch descriptor too short".to_owned() });
    }
    let seq = bytes.get_u64_le();
    let count = bytes.get_u32_le();
    let pkts0_len = bytes.get_u32_le();
    let pkts1_len = bytes.get_u32_le();
    let last_ts = Timestamp::from_bits(bytes.get_u64_le());
    let ref_mask = bytes.get_u64_le();
    if pkts0_len + pkts1_len != count || bytes.len() < count as usize * 8 {
        return Err(Error::Protocol { reason: "batch descriptor inconsistent".to_owned() });
    }
    let mut pkts = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let ofs = bytes.get_u32_le();
        let len = bytes.get_u32_le();
        pkts.push(ShmBlock::new(ofs, len));
    }
    Ok(BatchDesc { seq, count, pkts0_len, pkts1_len, last_ts, ref_mask, pkts })
}

/// Writes a snapshot record table into a fresh arena block.
pub fn encode_snapshot(
    arena: &mut Arena,
    memmap: &mut MemMap,
    records: &[ShmBlock],
) -> Result<ShmBlock, Error> {
    let block = memmap.alloc(arena, 4 + records.len() * 8)?;
    let mut buf = arena.get_mut(block)?;
    buf.put_u32_le(records.len() as u32);
    for b in records {
        buf.put_u32_le(b.ofs());
        buf.put_u32_le(b.len());
    }
    Ok(block)
}

/// Parses a snapshot record table.
pub fn decode_snapshot(mut bytes: &[u8]) -> Result<Vec<ShmBlock>, Error> {
    if bytes.len() < 4 {
        return Err(Error::Protocol { reason: "snapshot table too short".to_owned() });
    }
    let count = bytes.get_u32_le() as usize;
    if bytes.len() < count * 8 {
        return Err(Error::Protocol { reason: "snapshot table truncated".to_owned() });
    }
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let ofs = bytes.get_u32_le();
        let len = bytes.get_u32_le();
        records.push(ShmBlock::new(ofs, len));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    #![allow(missing_docs, clippy::unwrap_used)]
    use como_pkt::ComoType;
    use pretty_assertions::assert_eq;
    use como_shmem::{MemPolicy, ShmHandle, ShmRegion};

    use super::*;

    fn arena() -> Arena {
        Arena::new(ShmRegion::map(ShmHandle::new(64 * 1024).unwrap()).unwrap())
    }

    #[test]
    fn pkt_roundtrip_through_arena() {
        let mut a = arena();
        let mut mm = MemMap::new(MemPolicy::HoldInUse);
        let hdr = PktHdr::new(Timestamp::new(7, 3), 60, 16, ComoType::Link);
        let payload = [0xaau8; 16];
        let block = encode_pkt(&mut a, &mut mm, &hdr, b"", &payload).unwrap();

        let view = pkt_view(a.get(block).unwrap()).unwrap();
        assert_eq!(view.hdr, hdr);
        assert_eq!(view.payload, &payload);
        assert!(view.meta.get("x").is_none());
        mm.destroy(&mut a);
    }

    #[test]
    fn pkt_meta_survives_encoding() {
        let mut a = arena();
        let mut mm = MemMap::new(MemPolicy::HoldInUse);
        let hdr = PktHdr::new(Timestamp::ZERO, 10, 4, ComoType::NetFlow);
        let mut meta = como_pkt::PktMeta::new();
        meta.set("nf-sampling", &100u16.to_be_bytes()).unwrap();
        let block = encode_pkt(&mut a, &mut mm, &hdr, meta.as_bytes(), &[1, 2, 3, 4]).unwrap();

        let view = pkt_view(a.get(block).unwrap()).unwrap();
        assert_eq!(view.meta.get("nf-sampling"), Some(&100u16.to_be_bytes()[..]));
        mm.destroy(&mut a);
    }

    #[test]
    fn batch_descriptor_roundtrip() {
        let mut a = arena();
        let mut mm = MemMap::new(MemPolicy::HoldInUse);
        let pkts = vec![ShmBlock::new(64, 32), ShmBlock::new(128, 48)];
        let desc = BatchDesc {
            seq: 42,
            count: 2,
            pkts0_len: 2,
            pkts1_len: 0,
            last_ts: Timestamp::from_secs(9),
            ref_mask: 0b101,
            pkts,
        };
        let block = encode_batch(&mut a, &mut mm, &desc).unwrap();
        let back = decode_batch(a.get(block).unwrap()).unwrap();
        assert_eq!(back.seq, 42);
        assert_eq!(back.ref_mask, 0b101);
        assert_eq!(back.pkts.len(), 2);
        assert_eq!(back.pkts[1].ofs(), 128);
        mm.destroy(&mut a);
    }

    #[test]
    fn snapshot_table_roundtrip() {
        let mut a = arena();
        let mut mm = MemMap::new(MemPolicy::HoldInUse);
        let records = vec![ShmBlock::new(8, 24), ShmBlock::new(40, 24), ShmBlock::new(72, 24)];
        let block = encode_snapshot(&mut a, &mut mm, &records).unwrap();
        let back = decode_snapshot(a.get(block).unwrap()).unwrap();
        assert_eq!(back, records);
        mm.destroy(&mut a);
    }
}
