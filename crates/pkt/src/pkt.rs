// SPDX-License-Identifier: BSD-3-Clause

//! The canonical packet descriptor.
//!
//! A packet is a fixed-size header plus an immutable payload. The header
//! carries the capture timestamp, wire/captured lengths, the top-level type
//! reported by the sniffer and one tag + offset per nested layer. Offsets
//! index into the payload; the offset of an absent layer equals the offset
//! of the previous layer so that `l4_ofs - l3_ofs` is always a valid header
//! length computation.
//!
//! The serialized form (`WIRE_LEN` bytes, little endian) is what travels
//! through the shared arena between capture and its clients; the in-memory
//! form is what module callbacks see.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::pktmeta::PktMetaView;
use crate::timestamp::Timestamp;

/// Top-level type of a captured packet, i.e. what the first byte of the
/// payload is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComoType {
    /// No recognizable framing; offsets are meaningless.
    None,
    /// A link-layer frame (Ethernet family, HDLC, 802.11 data).
    Link,
    /// An 802.11 frame preceded by a radio pseudo-header.
    Radio,
    /// A NetFlow-derived pseudo packet.
    NetFlow,
    /// An sFlow-derived pseudo packet.
    Sflow,
}

/// Link-layer (L2) tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkType {
    /// Absent or unrecognized link layer.
    None,
    /// Plain Ethernet II framing.
    Eth,
    /// 802.1q tagged Ethernet; replaces [`LinkType::Eth`] when recognized.
    Vlan,
    /// Cisco ISL trunking encapsulation.
    Isl,
    /// Cisco HDLC (point-to-point links).
    Hdlc,
    /// IEEE 802.11 (variable length header).
    Ieee80211,
}

/// Network-layer (L3) tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum L3Type {
    /// Absent or unrecognized network layer.
    None,
    /// IPv4.
    Ip,
}

/// Transport-layer (L4) tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum L4Type {
    /// Absent or unrecognized transport layer.
    None,
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
}

/// The fixed packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PktHdr {
    /// Capture timestamp, monotonic per sniffer.
    pub ts: Timestamp,
    /// Length of the packet on the wire.
    pub len: u32,
    /// Number of payload bytes actually captured.
    pub caplen: u32,
    /// Top-level type reported by the sniffer.
    pub ty: ComoType,
    /// Link-layer tag.
    pub l2: LinkType,
    /// Network-layer tag.
    pub l3: L3Type,
    /// Transport-layer tag.
    pub l4: L4Type,
    /// Offset of the link-layer header in the payload.
    pub l2_ofs: u16,
    /// Offset of the network-layer header.
    pub l3_ofs: u16,
    /// Offset of the transport-layer header.
    pub l4_ofs: u16,
    /// Offset of the application payload (end of the parsed stack).
    pub l7_ofs: u16,
}

impl PktHdr {
    /// Size of the serialized header.
    pub const WIRE_LEN: usize = 8 + 4 + 4 + 4 + 8;

    /// Builds an unparsed header for a freshly captured packet.
    ///
    /// All layer tags start as `None` with zero offsets; the capture loop
    /// fills them in via [`crate::layers::update_offsets`].
    #[must_use]
    pub fn new(ts: Timestamp, len: u32, caplen: u32, ty: ComoType) -> Self {
        PktHdr {
            ts,
            len,
            caplen,
            ty,
            l2: LinkType::None,
            l3: L3Type::None,
            l4: L4Type::None,
            l2_ofs: 0,
            l3_ofs: 0,
            l4_ofs: 0,
            l7_ofs: 0,
        }
    }

    /// Serializes the header into `buf` (little endian, [`Self::WIRE_LEN`] bytes).
    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.ts.as_bits());
        buf.put_u32_le(self.len);
        buf.put_u32_le(self.caplen);
        buf.put_u8(como_type_code(self.ty));
        buf.put_u8(link_type_code(self.l2));
        buf.put_u8(l3_type_code(self.l3));
        buf.put_u8(l4_type_code(self.l4));
        buf.put_u16_le(self.l2_ofs);
        buf.put_u16_le(self.l3_ofs);
        buf.put_u16_le(self.l4_ofs);
        buf.put_u16_le(self.l7_ofs);
    }

    /// Decodes a header previously produced by [`Self::write_to`].
    pub fn read_from(mut buf: &[u8]) -> Result<PktHdr, Error> {
        if buf.len() < Self::WIRE_LEN {
            return Err(Error::TruncatedDescriptor {
                need: Self::WIRE_LEN,
                have: buf.len(),
            });
        }
        Ok(PktHdr {
            ts: Timestamp::from_bits(buf.get_u64_le()),
            len: buf.get_u32_le(),
            caplen: buf.get_u32_le(),
            ty: como_type_from_code(buf.get_u8()),
            l2: link_type_from_code(buf.get_u8()),
            l3: l3_type_from_code(buf.get_u8()),
            l4: l4_type_from_code(buf.get_u8()),
            l2_ofs: buf.get_u16_le(),
            l3_ofs: buf.get_u16_le(),
            l4_ofs: buf.get_u16_le(),
            l7_ofs: buf.get_u16_le(),
        })
    }
}

fn como_type_code(t: ComoType) -> u8 {
    match t {
        ComoType::None => 0,
        ComoType::Link => 1,
        ComoType::Radio => 2,
        ComoType::NetFlow => 3,
        ComoType::Sflow => 4,
    }
}

fn como_type_from_code(c: u8) -> ComoType {
    match c {
        1 => ComoType::Link,
        2 => ComoType::Radio,
        3 => ComoType::NetFlow,
        4 => ComoType::Sflow,
        _ => ComoType::None,
    }
}

fn link_type_code(t: LinkType) -> u8 {
    match t {
        LinkType::None => 0,
        LinkType::Eth => 1,
        LinkType::Vlan => 2,
        LinkType::Isl => 3,
        LinkType::Hdlc => 4,
        LinkType::Ieee80211 => 5,
    }
}

fn link_type_from_code(c: u8) -> LinkType {
    match c {
        1 => LinkType::Eth,
        2 => LinkType::Vlan,
        3 => LinkType::Isl,
        4 => LinkType::Hdlc,
        5 => LinkType::Ieee80211,
        _ => LinkType::None,
    }
}

fn l3_type_code(t: L3Type) -> u8 {
    match t {
        L3Type::None => 0,
        L3Type::Ip => 1,
    }
}

fn l3_type_from_code(c: u8) -> L3Type {
    match c {
        1 => L3Type::Ip,
        _ => L3Type::None,
    }
}

fn l4_type_code(t: L4Type) -> u8 {
    match t {
        L4Type::None => 0,
        L4Type::Tcp => 1,
        L4Type::Udp => 2,
    }
}

fn l4_type_from_code(c: u8) -> L4Type {
    match c {
        1 => L4Type::Tcp,
        2 => L4Type::Udp,
        _ => L4Type::None,
    }
}

/// A borrowed view of one packet: header, payload and metadata.
///
/// The payload is immutable for the packet's lifetime; module callbacks
/// receive a `PktView` and may hold on to nothing beyond the call.
#[derive(Debug, Clone, Copy)]
pub struct PktView<'a> {
    /// The parsed header.
    pub hdr: PktHdr,
    /// The captured bytes (`hdr.caplen` of them).
    pub payload: &'a [u8],
    /// Serialized metadata side channel, possibly empty.
    pub meta: PktMetaView<'a>,
}

impl<'a> PktView<'a> {
    /// Bytes of the network-layer header and everything after it.
    #[must_use]
    pub fn l3(&self) -> &'a [u8] {
        &self.payload[self.hdr.l3_ofs as usize..]
    }

    /// Bytes of the transport-layer header and everything after it.
    #[must_use]
    pub fn l4(&self) -> &'a [u8] {
        &self.payload[self.hdr.l4_ofs as usize..]
    }

    /// IPv4 protocol number, if the packet carries an IP header.
    #[must_use]
    pub fn ip_proto(&self) -> Option<u8> {
        if self.hdr.l3 != L3Type::Ip {
            return None;
        }
        self.payload.get(self.hdr.l3_ofs as usize + 9).copied()
    }

    /// IPv4 total length field, if present.
    #[must_use]
    pub fn ip_len(&self) -> Option<u16> {
        if self.hdr.l3 != L3Type::Ip {
            return None;
        }
        let ofs = self.hdr.l3_ofs as usize + 2;
        let b = self.payload.get(ofs..ofs + 2)?;
        Some(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Source IPv4 address in network order, if present.
    #[must_use]
    pub fn ip_src(&self) -> Option<[u8; 4]> {
        self.ip_field(12)
    }

    /// Destination IPv4 address in network order, if present.
    #[must_use]
    pub fn ip_dst(&self) -> Option<[u8; 4]> {
        self.ip_field(16)
    }

    fn ip_field(&self, at: usize) -> Option<[u8; 4]> {
        if self.hdr.l3 != L3Type::Ip {
            return None;
        }
        let ofs = self.hdr.l3_ofs as usize + at;
        let b = self.payload.get(ofs..ofs + 4)?;
        Some([b[0], b[1], b[2], b[3]])
    }

    /// TCP or UDP source port, if the packet has a transport header.
    #[must_use]
    pub fn src_port(&self) -> Option<u16> {
        self.port_at(0)
    }

    /// TCP or UDP destination port, if the packet has a transport header.
    #[must_use]
    pub fn dst_port(&self) -> Option<u16> {
        self.port_at(2)
    }

    fn port_at(&self, at: usize) -> Option<u16> {
        if self.hdr.l4 == L4Type::None {
            return None;
        }
        let ofs = self.hdr.l4_ofs as usize + at;
        let b = self.payload.get(ofs..ofs + 2)?;
        Some(u16::from_be_bytes([b[0], b[1]]))
    }
}
