// SPDX-License-Identifier: BSD-3-Clause

//! Sniffer drivers.
//!
//! Each driver adapts one source format to the sniffer contract. Hardware
//! drivers (DAG, BPF, ERF, radiotap) are out of scope; the classic-pcap
//! file reader covers offline runs and doubles as the reference driver.

pub mod pcap;

use como_engine::{Error, Sniffer};

/// Builds a sniffer by configured kind.
pub fn build(
    kind: &str,
    device: &str,
    _args: &std::collections::HashMap<String, String>,
) -> Result<Box<dyn Sniffer>, Error> {
    match kind {
        "pcap" => Ok(Box::new(pcap::PcapSniffer::new(device))),
        other => Err(Error::UnknownKind { kind: "sniffer", name: other.to_owned() }),
    }
}
