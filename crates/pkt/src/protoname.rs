// SPDX-License-Identifier: BSD-3-Clause

//! IP protocol number to name mapping, used by per-packet print output.

/// Returns the conventional name for an IP protocol number, or `None` for
/// numbers without a well-known assignment.
#[must_use]
pub fn lookup(proto: u8) -> Option<&'static str> {
    Some(match proto {
        0 => "ip",
        1 => "icmp",
        2 => "igmp",
        4 => "ipencap",
        6 => "tcp",
        8 => "egp",
        9 => "igp",
        17 => "udp",
        41 => "ipv6",
        46 => "rsvp",
        47 => "gre",
        50 => "esp",
        51 => "ah",
        58 => "ipv6-icmp",
        89 => "ospf",
        94 => "ipip",
        103 => "pim",
        112 => "vrrp",
        115 => "l2tp",
        132 => "sctp",
        136 => "udplite",
        _ => return None,
    })
}

/// Like [`lookup`] but never fails: unknown numbers render as `proto-N`.
#[must_use]
pub fn name(proto: u8) -> String {
    match lookup(proto) {
        Some(n) => n.to_owned(),
        None => format!("proto-{proto}"),
    }
}
