// SPDX-License-Identifier: BSD-3-Clause

//! Layer recognition and offset computation.
//!
//! Capture calls [`update_offsets`] once per packet to fill the layer tags
//! and offsets of a [`PktHdr`] by inspecting the bytes at each boundary.
//! Parsing policies:
//!
//! - An absent layer's offset equals the offset of the previous layer.
//! - An unknown protocol at a layer sets the layer's tag to `None` and
//!   stops deeper parsing; the packet is still delivered.
//! - A structurally impossible header (bad IP version, header length
//!   smaller than the minimum) marks the packet corrupt; capture counts and
//!   drops it.
//! - VLAN and ISL are recognized after Ethernet framing and replace the L2
//!   tag.
//! - 802.11 headers are variable length; non-data frames carry no L3.

use crate::pkt::{ComoType, L3Type, L4Type, LinkType, PktHdr};

/// Ethertype for IPv4.
pub const ETHERTYPE_IP: u16 = 0x0800;
/// Ethertype for 802.1q VLAN tagging.
pub const ETHERTYPE_VLAN: u16 = 0x8100;

const ETH_HDR_LEN: usize = 14;
const VLAN_HDR_LEN: usize = 18;
const HDLC_HDR_LEN: usize = 4;
const ISL_HDR_LEN: usize = 26;
const LLC_SNAP_LEN: usize = 8;
const IP_MIN_HDR_LEN: usize = 20;
const UDP_HDR_LEN: usize = 8;

/// ISL frames are recognized by their 5-byte destination prefix.
const ISL_DA_UNICAST: [u8; 5] = [0x01, 0x00, 0x0c, 0x00, 0x00];
const ISL_DA_BROADCAST: [u8; 5] = [0x03, 0x00, 0x0c, 0x00, 0x00];

/// Result of header parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Offsets are filled in as far as the stack could be recognized.
    Ok,
    /// The packet is structurally broken and must be dropped and counted.
    Corrupt,
}

/// Computes the length of an 802.11 MAC header from its frame control
/// field (as read from the wire, little endian).
#[must_use]
pub fn ieee80211_hdr_len(fc: u16) -> usize {
    let ty = (fc >> 2) & 0x3;
    let subtype = (fc >> 4) & 0xf;
    let to_ds = fc & 0x0100 != 0;
    let from_ds = fc & 0x0200 != 0;
    match ty {
        // control frames: CTS and ACK have no third address
        1 => match subtype {
            0xc | 0xd => 10,
            _ => 16,
        },
        // data frames: 4-address when bridged, +2 for QoS subtypes
        2 => {
            let mut len = 24;
            if to_ds && from_ds {
                len += 6;
            }
            if subtype & 0x8 != 0 {
                len += 2;
            }
            len
        }
        // management and everything else
        _ => 24,
    }
}

/// True if the 802.11 frame control field denotes a data frame.
#[must_use]
pub fn ieee80211_is_data(fc: u16) -> bool {
    (fc >> 2) & 0x3 == 2
}

/// Fills layer tags and offsets of `hdr` by inspecting `payload`.
///
/// `link` is the framing the sniffer promises at `hdr.l2_ofs` (a pcap file
/// declares it in its global header, a DAG card in its record type).
pub fn update_offsets(hdr: &mut PktHdr, payload: &[u8], link: LinkType) -> ParseOutcome {
    let l2_ofs = hdr.l2_ofs as usize;
    hdr.l2 = LinkType::None;
    hdr.l3 = L3Type::None;
    hdr.l4 = L4Type::None;
    hdr.l3_ofs = hdr.l2_ofs;
    hdr.l4_ofs = hdr.l2_ofs;
    hdr.l7_ofs = hdr.l2_ofs;

    match hdr.ty {
        ComoType::None => return ParseOutcome::Ok,
        // pseudo packets start directly with the network layer; the
        // exporter-side bookkeeping travels in pktmeta
        ComoType::NetFlow | ComoType::Sflow => {
            return parse_ip(hdr, payload, l2_ofs);
        }
        ComoType::Link | ComoType::Radio => {}
    }

    let frame = &payload[l2_ofs.min(payload.len())..];
    let (ethertype, l3_ofs) = match link {
        LinkType::Eth | LinkType::Vlan | LinkType::Isl => match parse_eth_family(frame) {
            Some((l2, ethertype, consumed)) => {
                hdr.l2 = l2;
                (ethertype, l2_ofs + consumed)
            }
            None => return ParseOutcome::Ok,
        },
        LinkType::Hdlc => {
            if frame.len() < HDLC_HDR_LEN {
                return ParseOutcome::Ok;
            }
            hdr.l2 = LinkType::Hdlc;
            (u16::from_be_bytes([frame[2], frame[3]]), l2_ofs + HDLC_HDR_LEN)
        }
        LinkType::Ieee80211 => {
            if frame.len() < 2 {
                return ParseOutcome::Ok;
            }
            hdr.l2 = LinkType::Ieee80211;
            let fc = u16::from_le_bytes([frame[0], frame[1]]);
            let mac_len = ieee80211_hdr_len(fc);
            let boundary = l2_ofs + mac_len;
            hdr.l3_ofs = boundary.min(u16::MAX as usize) as u16;
            hdr.l4_ofs = hdr.l3_ofs;
            hdr.l7_ofs = hdr.l3_ofs;
            if !ieee80211_is_data(fc) || frame.len() < mac_len + LLC_SNAP_LEN {
                return ParseOutcome::Ok;
            }
            // LLC/SNAP: aa aa 03 <oui:3> <ethertype:2>
            let snap = &frame[mac_len..];
            if snap[0] != 0xaa || snap[1] != 0xaa || snap[2] != 0x03 {
                return ParseOutcome::Ok;
            }
            (u16::from_be_bytes([snap[6], snap[7]]), boundary + LLC_SNAP_LEN)
        }
        LinkType::None => return ParseOutcome::Ok,
    };

    hdr.l3_ofs = l3_ofs.min(u16::MAX as usize) as u16;
    hdr.l4_ofs = hdr.l3_ofs;
    hdr.l7_ofs = hdr.l3_ofs;

    if ethertype == ETHERTYPE_IP {
        parse_ip(hdr, payload, l3_ofs)
    } else {
        ParseOutcome::Ok
    }
}

/// Recognizes plain Ethernet, 802.1q and ISL framing. Returns the L2 tag,
/// the ethertype of the inner payload and the bytes consumed.
fn parse_eth_family(frame: &[u8]) -> Option<(LinkType, u16, usize)> {
    if frame.len() < ETH_HDR_LEN {
        return None;
    }
    if frame[..5] == ISL_DA_UNICAST || frame[..5] == ISL_DA_BROADCAST {
        let inner = ISL_HDR_LEN + ETH_HDR_LEN;
        if frame.len() < inner {
            return None;
        }
        let ethertype = u16::from_be_bytes([frame[inner - 2], frame[inner - 1]]);
        return Some((LinkType::Isl, ethertype, inner));
    }
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    if ethertype == ETHERTYPE_VLAN {
        if frame.len() < VLAN_HDR_LEN {
            return None;
        }
        let inner = u16::from_be_bytes([frame[16], frame[17]]);
        return Some((LinkType::Vlan, inner, VLAN_HDR_LEN));
    }
    Some((LinkType::Eth, ethertype, ETH_HDR_LEN))
}

/// Parses an IPv4 header at `ofs` and the transport header after it.
fn parse_ip(hdr: &mut PktHdr, payload: &[u8], ofs: usize) -> ParseOutcome {
    let Some(ip) = payload.get(ofs..) else {
        return ParseOutcome::Ok;
    };
    if ip.len() < IP_MIN_HDR_LEN {
        // short capture, leave the stack at the link boundary
        return ParseOutcome::Ok;
    }
    let version = ip[0] >> 4;
    let ihl = (ip[0] & 0xf) as usize * 4;
    if version != 4 || ihl < IP_MIN_HDR_LEN {
        return ParseOutcome::Corrupt;
    }
    hdr.l3 = L3Type::Ip;
    let l4_ofs = ofs + ihl;
    hdr.l4_ofs = l4_ofs.min(u16::MAX as usize) as u16;
    hdr.l7_ofs = hdr.l4_ofs;

    let proto = ip[9];
    let Some(l4) = payload.get(l4_ofs..) else {
        return ParseOutcome::Ok;
    };
    match proto {
        6 => {
            if l4.len() < IP_MIN_HDR_LEN {
                return ParseOutcome::Ok;
            }
            let data_ofs = (l4[12] >> 4) as usize * 4;
            if data_ofs < 20 {
                return ParseOutcome::Corrupt;
            }
            hdr.l4 = L4Type::Tcp;
            hdr.l7_ofs = (l4_ofs + data_ofs).min(u16::MAX as usize) as u16;
        }
        17 => {
            if l4.len() < UDP_HDR_LEN {
                return ParseOutcome::Ok;
            }
            hdr.l4 = L4Type::Udp;
            hdr.l7_ofs = (l4_ofs + UDP_HDR_LEN).min(u16::MAX as usize) as u16;
        }
        _ => {}
    }
    ParseOutcome::Ok
}

#[cfg(test)]
mod tests {
    #![allow(missing_docs, clippy::unwrap_used)]
    use super::*;
    use crate::timestamp::Timestamp;

    fn ip_hdr(proto: u8, total_len: u16) -> Vec<u8> {
        let mut ip = vec![0x45, 0, 0, 0, 0, 0, 0, 0, 64, proto, 0, 0];
        ip[2..4].copy_from_slice(&total_len.to_be_bytes());
        ip.extend_from_slice(&[10, 0, 0, 1]);
        ip.extend_from_slice(&[10, 0, 0, 2]);
        ip
    }

    fn eth_frame(ethertype: u16, body: &[u8]) -> Vec<u8> {
        let mut p = vec![0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb];
        p.extend_from_slice(&ethertype.to_be_bytes());
        p.extend_from_slice(body);
        p
    }

    fn hdr_for(payload: &[u8]) -> PktHdr {
        PktHdr::new(
            Timestamp::ZERO,
            payload.len() as u32,
            payload.len() as u32,
            ComoType::Link,
        )
    }

    #[test]
    fn eth_ip_udp_offsets() {
        let mut body = ip_hdr(17, 36);
        body.extend_from_slice(&[0u8; 16]); // udp header + data
        let p = eth_frame(ETHERTYPE_IP, &body);
        let mut hdr = hdr_for(&p);
        assert_eq!(update_offsets(&mut hdr, &p, LinkType::Eth), ParseOutcome::Ok);
        assert_eq!(hdr.l2, LinkType::Eth);
        assert_eq!(hdr.l3, L3Type::Ip);
        assert_eq!(hdr.l4, L4Type::Udp);
        assert_eq!(hdr.l3_ofs, 14);
        assert_eq!(hdr.l4_ofs, 34);
        assert_eq!(hdr.l7_ofs, 42);
    }

    #[test]
    fn vlan_replaces_eth_tag() {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x00, 0x64]); // vlan id
        body.extend_from_slice(&ETHERTYPE_IP.to_be_bytes());
        let mut ip = ip_hdr(6, 40);
        ip.extend_from_slice(&[0u8; 20]);
        body.extend_from_slice(&ip);
        let mut p = eth_frame(ETHERTYPE_VLAN, &body);
        // tcp data offset byte lives at l4_ofs + 12
        p[38 + 12] = 0x50;
        let mut hdr = hdr_for(&p);
        assert_eq!(update_offsets(&mut hdr, &p, LinkType::Eth), ParseOutcome::Ok);
        assert_eq!(hdr.l2, LinkType::Vlan);
        assert_eq!(hdr.l3_ofs, 18);
        assert_eq!(hdr.l4, L4Type::Tcp);
        assert_eq!(hdr.l4_ofs, 38);
        assert_eq!(hdr.l7_ofs, 58);
    }

    #[test]
    fn unknown_ethertype_stops_at_l2() {
        let p = eth_frame(0x86dd, &[0u8; 40]); // ipv6 is not parsed
        let mut hdr = hdr_for(&p);
        assert_eq!(update_offsets(&mut hdr, &p, LinkType::Eth), ParseOutcome::Ok);
        assert_eq!(hdr.l2, LinkType::Eth);
        assert_eq!(hdr.l3, L3Type::None);
        // absent layers share the boundary offset
        assert_eq!(hdr.l3_ofs, 14);
        assert_eq!(hdr.l4_ofs, 14);
        assert_eq!(hdr.l7_ofs, 14);
    }

    #[test]
    fn bad_ip_version_is_corrupt() {
        let mut body = ip_hdr(17, 36);
        body[0] = 0x65; // version 6 with ihl bits
        let p = eth_frame(ETHERTYPE_IP, &body);
        let mut hdr = hdr_for(&p);
        assert_eq!(update_offsets(&mut hdr, &p, LinkType::Eth), ParseOutcome::Corrupt);
    }

    #[test]
    fn isl_encapsulation_recognized() {
        let mut p = ISL_DA_UNICAST.to_vec();
        p.extend_from_slice(&[0u8; ISL_HDR_LEN - 5]); // rest of the ISL header
        let mut inner = ip_hdr(17, 36);
        inner.extend_from_slice(&[0u8; 16]);
        p.extend_from_slice(&eth_frame(ETHERTYPE_IP, &inner));
        let mut hdr = hdr_for(&p);
        assert_eq!(update_offsets(&mut hdr, &p, LinkType::Eth), ParseOutcome::Ok);
        assert_eq!(hdr.l2, LinkType::Isl);
        assert_eq!(hdr.l3_ofs, (ISL_HDR_LEN + 14) as u16);
        assert_eq!(hdr.l4, L4Type::Udp);
    }

    #[test]
    fn ieee80211_non_data_has_no_l3() {
        // beacon: type mgmt (0), subtype 8
        let fc = 0x0080u16;
        let mut p = fc.to_le_bytes().to_vec();
        p.extend_from_slice(&[0u8; 40]);
        let mut hdr = hdr_for(&p);
        assert_eq!(update_offsets(&mut hdr, &p, LinkType::Ieee80211), ParseOutcome::Ok);
        assert_eq!(hdr.l2, LinkType::Ieee80211);
        assert_eq!(hdr.l3, L3Type::None);
        assert_eq!(hdr.l3_ofs, 24);
    }

    #[test]
    fn ieee80211_qos_data_carries_ip() {
        // data frame (type 2), QoS subtype bit set -> 26 byte MAC header
        let fc: u16 = (2 << 2) | (8 << 4);
        let mut p = fc.to_le_bytes().to_vec();
        p.extend_from_slice(&[0u8; 24]); // rest of MAC header
        p.extend_from_slice(&[0xaa, 0xaa, 0x03, 0, 0, 0]);
        p.extend_from_slice(&ETHERTYPE_IP.to_be_bytes());
        let mut ip = ip_hdr(17, 36);
        ip.extend_from_slice(&[0u8; 16]);
        p.extend_from_slice(&ip);
        let mut hdr = hdr_for(&p);
        assert_eq!(update_offsets(&mut hdr, &p, LinkType::Ieee80211), ParseOutcome::Ok);
        assert_eq!(ieee80211_hdr_len(fc), 26);
        assert_eq!(hdr.l3, L3Type::Ip);
        assert_eq!(hdr.l3_ofs, 26 + 8);
        assert_eq!(hdr.l4, L4Type::Udp);
    }

    #[test]
    fn netflow_pseudo_packet_starts_at_ip() {
        let mut p = ip_hdr(6, 40);
        p.extend_from_slice(&[0u8; 20]);
        let mut hdr = PktHdr::new(Timestamp::ZERO, 40, p.len() as u32, ComoType::NetFlow);
        // tcp data offset lives at l4_ofs + 12 = 32
        p[32] = 0x50;
        assert_eq!(update_offsets(&mut hdr, &p, LinkType::None), ParseOutcome::Ok);
        assert_eq!(hdr.l2, LinkType::None);
        assert_eq!(hdr.l3, L3Type::Ip);
        assert_eq!(hdr.l3_ofs, 0);
        assert_eq!(hdr.l4, L4Type::Tcp);
    }
}
