// SPDX-License-Identifier: BSD-3-Clause

//! Whole-pipeline runs: trace file in, stored records out.

#![allow(missing_docs, clippy::unwrap_used)]

use std::collections::HashSet;
use std::path::Path;

use como_config::Config;
use como_controller::query::{self, QueryArgs};
use como_controller::{Supervisor, roles};
use como_engine::module::Module;
use como_engine::testing::{SynthPkt, SynthProto, build_frame};
use como_pkt::Timestamp;

/// Writes a classic pcap file: `(sec, usec, frame, wire_len)` per record.
fn write_pcap(path: &Path, records: &[(u32, u32, Vec<u8>, u32)]) {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
    bytes.extend_from_slice(&2u16.to_le_bytes());
    bytes.extend_from_slice(&4u16.to_le_bytes());
    bytes.extend_from_slice(&[0u8; 8]);
    bytes.extend_from_slice(&65535u32.to_le_bytes());
    bytes.extend_from_slice(&1u32.to_le_bytes()); // ethernet
    for (sec, usec, frame, wire_len) in records {
        bytes.extend_from_slice(&sec.to_le_bytes());
        bytes.extend_from_slice(&usec.to_le_bytes());
        bytes.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&wire_len.to_le_bytes());
        bytes.extend_from_slice(frame);
    }
    std::fs::write(path, bytes).unwrap();
}

fn config(basedir: &Path, trace: &Path, modules_yaml: &str) -> Config {
    Config::from_yaml(&format!(
        r#"
memory: 8 MiB
storage:
  basedir: {}
sniffers:
  - name: trace0
    kind: pcap
    device: {}
modules:
{}"#,
        basedir.display(),
        trace.display(),
        modules_yaml,
    ))
    .unwrap()
}

#[test]
fn counter_over_a_pcap_file() {
    let dir = tempfile::tempdir().unwrap();
    let trace = dir.path().join("trace.pcap");

    // 10 packets, 800 wire bytes each, timestamps 1.0s .. 1.9s
    let records: Vec<_> = (0..10u32)
        .map(|i| {
            let frame = build_frame(&SynthPkt {
                ts: Timestamp::ZERO,
                proto: SynthProto::Tcp,
                src_port: 40_000 + i as u16,
                dst_port: 80,
                wire_len: 800,
            });
            (1u32, i * 100_000, frame, 800u32)
        })
        .collect();
    write_pcap(&trace, &records);

    let cfg = config(dir.path(), &trace, "  - name: counter\n    args:\n      interval: \"1\"\n");
    let report = Supervisor::new(cfg).unwrap().run_inline().unwrap();

    assert_eq!(report.capture.pkts, 10);
    assert_eq!(report.capture.corrupt, 0);
    assert_eq!(report.capture.flushes, 1, "all packets fall into one interval");
    assert_eq!(report.export.records, 1);

    // exactly one record at t=1 with bytes=8000, pkts=10
    let stored = std::fs::read(dir.path().join("counter/0000000000")).unwrap();
    assert_eq!(stored.len(), 20);
    assert_eq!(
        u64::from_be_bytes(stored[..8].try_into().unwrap()),
        Timestamp::from_secs(1).as_bits()
    );
    assert_eq!(u64::from_be_bytes(stored[8..16].try_into().unwrap()), 8000);
    assert_eq!(u32::from_be_bytes(stored[16..20].try_into().unwrap()), 10);

    // load() round-trips what store() wrote
    let mut counter = como_modules::counter::Counter::default();
    let _ = counter.init(&std::collections::HashMap::new()).unwrap();
    let (len, ts) = counter.load(&stored).unwrap();
    assert_eq!(len, 20);
    assert_eq!(ts, Timestamp::from_secs(1));
}

#[test]
fn topports_keeps_the_heaviest_ports_per_proto() {
    let dir = tempfile::tempdir().unwrap();
    let trace = dir.path().join("mix.pcap");

    let mut records = Vec::new();
    let mut synth = |i: u32, proto, dst_port, wire_len: u32| {
        let frame = build_frame(&SynthPkt {
            ts: Timestamp::ZERO,
            proto,
            src_port: 40_000 + i as u16,
            dst_port,
            wire_len,
        });
        records.push((1u32, i * 9_000, frame, wire_len));
    };
    for i in 0..40 {
        synth(i, SynthProto::Tcp, 80, 400);
    }
    for i in 40..70 {
        synth(i, SynthProto::Udp, 53, 200);
    }
    for i in 70..80 {
        synth(i, SynthProto::Tcp, 22, 100);
    }
    // 20 non-IP frames: recognizable ethernet, unknown ethertype
    for i in 80..100u32 {
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&0x86ddu16.to_be_bytes());
        frame.extend_from_slice(&[0u8; 60]);
        records.push((1, i * 9_000, frame, 74));
    }
    write_pcap(&trace, &records);

    let cfg = config(
        dir.path(),
        &trace,
        "  - name: topports\n    args:\n      topn: \"2\"\n      interval: \"1\"\n",
    );
    let report = Supervisor::new(cfg).unwrap().run_inline().unwrap();

    assert_eq!(report.capture.pkts, 100);
    // the 20 non-IP packets never reach the module
    assert_eq!(report.capture.modules[0].updates, 80);
    assert_eq!(report.export.records, 3);

    let stored = std::fs::read(dir.path().join("topports/0000000000")).unwrap();
    assert_eq!(stored.len(), 3 * 24);
    let mut got = HashSet::new();
    for rec in stored.chunks(24) {
        let proto = rec[8];
        let port = u16::from_be_bytes(rec[10..12].try_into().unwrap());
        let pkts = u32::from_be_bytes(rec[20..24].try_into().unwrap());
        let _ = got.insert((proto, port, pkts));
    }
    let want: HashSet<(u8, u16, u32)> =
        [(6, 80, 40), (6, 22, 10), (17, 53, 30)].into_iter().collect();
    assert_eq!(got, want);
}

#[test]
fn historical_query_walks_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    let trace = dir.path().join("trace.pcap");

    // two intervals: 5 packets at t=1, 5 packets at t=2
    let records: Vec<_> = (0..10u32)
        .map(|i| {
            let frame = build_frame(&SynthPkt {
                ts: Timestamp::ZERO,
                proto: SynthProto::Tcp,
                src_port: 40_000,
                dst_port: 80,
                wire_len: 100,
            });
            (1 + i / 5, (i % 5) * 100_000, frame, 100u32)
        })
        .collect();
    write_pcap(&trace, &records);

    let cfg = config(dir.path(), &trace, "  - name: counter\n");
    let supervisor = Supervisor::new(cfg.clone()).unwrap();
    let report = supervisor.run_inline().unwrap();
    assert_eq!(report.export.records, 2);

    // bring storage back for the query walk
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
    let storage_cfg = cfg.clone();
    let run_dir = supervisor.run_dir().to_path_buf();
    let storage_dir = run_dir.clone();
    let storage = std::thread::spawn(move || {
        roles::run_storage(&storage_cfg, &storage_dir, Some(stop_rx))
    });

    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    let local = tokio::task::LocalSet::new();
    rt.block_on(local.run_until(async move {
        let st = query::status(&run_dir, &cfg).await.unwrap();
        assert!(st.contains("counter counter 40"), "status was: {st}");

        // full fetch: both records, plain format
        let mut out = String::new();
        let args = QueryArgs {
            module: "counter".to_owned(),
            format: vec!["format=plain".to_owned()],
            ..QueryArgs::default()
        };
        let n = query::run_query(&run_dir, &cfg, &args, &mut out).await.unwrap();
        assert_eq!(n, 2);
        assert!(out.lines().count() == 2, "plain format has no header: {out}");

        // bounded fetch: only the second interval
        let mut out = String::new();
        let args = QueryArgs {
            module: "counter".to_owned(),
            start: Some(Timestamp::from_secs(2)),
            end: Some(Timestamp::from_secs(3)),
            format: vec!["format=plain".to_owned()],
            ..QueryArgs::default()
        };
        let n = query::run_query(&run_dir, &cfg, &args, &mut out).await.unwrap();
        assert_eq!(n, 1);
        assert!(out.starts_with('2'), "second interval starts at t=2: {out}");
    }));

    stop_tx.send(()).unwrap();
    storage.join().unwrap().unwrap();
}
