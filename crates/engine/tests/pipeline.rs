// SPDX-License-Identifier: BSD-3-Clause

//! Pipeline exercises: packet conservation, batch acknowledgment,
//! sampling, backpressure and the capture - export - storage path.

#![allow(missing_docs, clippy::unwrap_used)]

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use como_engine::capture::{CaptureLoop, CaptureOptions, CaptureStats};
use como_engine::export::ExportLoop;
use como_engine::module::{Module, ModuleHandle, ModuleRegistry};
use como_engine::testing::{PktCountModule, SynthPkt, SynthProto, SynthSniffer, tcp_burst};
use como_engine::{CaptureClient, Sniffer};
use como_ipc::{IpcListener, PeerClass};
use como_pkt::{L4Type, Timestamp};
use como_shmem::{Arena, ShmHandle, ShmRegion};
use como_storage::{StorageClient, StorageServer};

fn run_local<F, Fut>(f: F)
where
    F: FnOnce() -> Fut + 'static,
    Fut: Future<Output = ()> + 'static,
{
    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    let local = tokio::task::LocalSet::new();
    rt.block_on(local.run_until(f()));
}

fn arena(size: usize) -> Arena {
    Arena::new(ShmRegion::map(ShmHandle::new(size).unwrap()).unwrap())
}

fn registry() -> ModuleRegistry {
    let mut r = ModuleRegistry::new();
    r.register("pktcount", || Box::new(PktCountModule::default()));
    r
}

fn modules(yaml: &str) -> Vec<ModuleHandle> {
    let cfg = como_config::Config::from_yaml(yaml).unwrap();
    let reg = registry();
    cfg.modules
        .iter()
        .enumerate()
        .map(|(id, spec)| {
            ModuleHandle::build(&reg, id as u32, spec, Timestamp::from_secs(1)).unwrap()
        })
        .collect()
}

fn fast_opts() -> CaptureOptions {
    CaptureOptions {
        poll_ivl: Duration::from_millis(1),
        ..CaptureOptions::default()
    }
}

/// Mixed traffic for the filter-projection scenario: 40 TCP/80, 30
/// UDP/53, 10 TCP/22, 20 UDP elsewhere, one packet per millisecond.
fn mixed_traffic() -> Vec<SynthPkt> {
    let mut pkts = Vec::new();
    let mut push = |i: usize, proto, dst_port, wire_len| {
        pkts.push(SynthPkt {
            ts: Timestamp::new(1, (i * 1000) as u32),
            proto,
            src_port: 40_000 + i as u16,
            dst_port,
            wire_len,
        });
    };
    for i in 0..40 {
        push(i, SynthProto::Tcp, 80, 400);
    }
    for i in 40..70 {
        push(i, SynthProto::Udp, 53, 200);
    }
    for i in 70..80 {
        push(i, SynthProto::Tcp, 22, 100);
    }
    for i in 80..100 {
        push(i, SynthProto::Udp, 9999, 60);
    }
    pkts
}

#[test]
fn filter_projection_gates_update_calls() {
    run_local(|| async {
        // module filter comes from its metadesc: ip and tcp
        let mods = modules("storage:\n  basedir: /tmp\nmodules:\n  - name: pktcount\n");
        let sniffer: Box<dyn Sniffer> = Box::new(SynthSniffer::new(mixed_traffic()));
        let capture = CaptureLoop::new(
            arena(1 << 20),
            fast_opts(),
            mods,
            vec![("synth".to_owned(), sniffer)],
            None,
        )
        .unwrap();
        let stats = capture.run().await.unwrap();

        assert_eq!(stats.pkts, 100);
        // exactly one update per matching packet: 40 + 10 TCP
        assert_eq!(stats.modules[0].seen, 50);
        assert_eq!(stats.modules[0].updates, 50);
        assert_eq!(stats.corrupt, 0);
    });
}

#[test]
fn source_drops_are_credited_pessimistically() {
    run_local(|| async {
        let mods = modules("storage:\n  basedir: /tmp\nmodules:\n  - name: pktcount\n");
        let mut sniffer = SynthSniffer::new(tcp_burst(10, Timestamp::from_secs(1), 1000, 100));
        sniffer.inject_drops(7);
        let capture = CaptureLoop::new(
            arena(1 << 20),
            fast_opts(),
            mods,
            vec![("synth".to_owned(), Box::new(sniffer) as Box<dyn Sniffer>)],
            None,
        )
        .unwrap();
        let stats = capture.run().await.unwrap();
        assert_eq!(stats.modules[0].drops, 7);
    });
}

async fn spawn_capture(
    ipc_dir: &std::path::Path,
    opts: CaptureOptions,
    mods: Vec<ModuleHandle>,
    sniffer: SynthSniffer,
    arena_size: usize,
) -> tokio::task::JoinHandle<CaptureStats> {
    let listener = IpcListener::bind_unix(ipc_dir, PeerClass::Capture).unwrap();
    let capture = CaptureLoop::new(
        arena(arena_size),
        opts,
        mods,
        vec![("synth".to_owned(), Box::new(sniffer) as Box<dyn Sniffer>)],
        Some(listener),
    )
    .unwrap();
    tokio::task::spawn_local(async move { capture.run().await.unwrap() })
}

#[test]
fn client_sees_every_packet_and_acks_every_batch() {
    run_local(|| async {
        let ipc = tempfile::tempdir().unwrap();
        let sniffer = SynthSniffer::new(tcp_burst(500, Timestamp::from_secs(1), 500, 120))
            .per_next(50)
            .idle_first(30);
        let capture = spawn_capture(ipc.path(), fast_opts(), Vec::new(), sniffer, 1 << 20).await;

        let mut client = CaptureClient::connect(ipc.path(), PeerClass::Query, 1).await.unwrap();
        let mut seen = 0u64;
        while let Some(block) = client.next().await.unwrap() {
            let pkt = client.pkt(block).unwrap();
            // payload must be resolvable while the block is live
            assert_eq!(pkt.hdr.l4, L4Type::Tcp);
            assert_eq!(pkt.dst_port(), Some(80));
            seen += 1;
        }
        assert_eq!(seen, 500, "one delivery per captured packet");

        let stats = capture.await.unwrap();
        assert_eq!(stats.pkts, 500);
        assert!(stats.batches >= 1);
    });
}

#[test]
fn sampling_rate_thins_the_stream() {
    run_local(|| async {
        let ipc = tempfile::tempdir().unwrap();
        let sniffer = SynthSniffer::new(tcp_burst(1000, Timestamp::from_secs(1), 100, 80))
            .per_next(100)
            .idle_first(30);
        let capture = spawn_capture(ipc.path(), fast_opts(), Vec::new(), sniffer, 1 << 20).await;

        let mut client = CaptureClient::connect(ipc.path(), PeerClass::Query, 10).await.unwrap();
        let mut delivered = 0u64;
        while let Some(block) = client.next().await.unwrap() {
            // payload pointer must be valid at read time
            let pkt = client.pkt(block).unwrap();
            assert!(pkt.payload.len() >= 54);
            delivered += 1;
        }
        assert!(
            (80..=120).contains(&delivered),
            "sampling 10 over 1000 packets delivered {delivered}"
        );
        let _ = capture.await.unwrap();
    });
}

#[test]
fn lagging_client_is_dropped_pipeline_keeps_moving() {
    run_local(|| async {
        let ipc = tempfile::tempdir().unwrap();
        let opts = CaptureOptions {
            poll_ivl: Duration::from_millis(1),
            batch_max_pkts: 50,
            client_share_threshold: 0.01,
            ..CaptureOptions::default()
        };
        let sniffer = SynthSniffer::new(tcp_burst(2000, Timestamp::from_secs(1), 100, 200))
            .per_next(50)
            .idle_first(40);
        let capture = spawn_capture(ipc.path(), opts, Vec::new(), sniffer, 1 << 20).await;

        // one prompt client, one that subscribes and then goes silent
        let silent = CaptureClient::connect(ipc.path(), PeerClass::Query, 1).await.unwrap();
        let mut prompt = CaptureClient::connect(ipc.path(), PeerClass::Query, 1).await.unwrap();

        let mut seen = 0u64;
        while let Some(_block) = prompt.next().await.unwrap() {
            seen += 1;
        }
        assert_eq!(seen, 2000, "the prompt client must see the whole stream");

        let stats = capture.await.unwrap();
        assert_eq!(stats.clients_dropped, 1, "the silent client got cut");
        drop(silent);
    });
}

#[test]
fn counter_records_reach_storage() {
    run_local(|| async {
        let ipc = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();

        let storage_listener = IpcListener::bind_unix(ipc.path(), PeerClass::Storage).unwrap();
        let server = StorageServer::new(base.path().to_path_buf(), 1 << 20);
        let _storage = tokio::task::spawn_local(async move {
            let _ = server.run(storage_listener).await;
        });

        // 10 packets of 800 wire bytes inside [1.0, 1.9], interval 1s
        let pkts = tcp_burst(10, Timestamp::from_secs(1), 100_000, 800);
        let yaml = "storage:\n  basedir: /tmp\nmodules:\n  - name: pktcount\n    filter: all\n";
        let capture =
            spawn_capture(ipc.path(), fast_opts(), modules(yaml), SynthSniffer::new(pkts).idle_first(40), 1 << 20)
                .await;

        let export = ExportLoop::connect(ipc.path(), modules(yaml)).await.unwrap();
        let export = tokio::task::spawn_local(async move { export.run().await.unwrap() });

        let ca_stats = capture.await.unwrap();
        assert_eq!(ca_stats.pkts, 10);
        assert_eq!(ca_stats.flushes, 1, "one interval, one snapshot");

        let ex_stats = export.await.unwrap();
        assert_eq!(ex_stats.records, 1, "exactly one record at t=1");

        // the stored record: [ts u64][bytes u64][pkts u32] big endian
        let mut reader = StorageClient::connect(ipc.path(), PeerClass::Query).await.unwrap();
        let h = reader
            .open("pktcount", como_ipc::message::OpenMode::ReaderNonBlock, 0)
            .await
            .unwrap();
        let region = reader.region(h, 0, 4096).await.unwrap().expect("data stored");
        let rec = region.as_slice();
        assert_eq!(rec.len(), 20);
        assert_eq!(
            u64::from_be_bytes(rec[..8].try_into().unwrap()),
            Timestamp::from_secs(1).as_bits()
        );
        assert_eq!(u64::from_be_bytes(rec[8..16].try_into().unwrap()), 8000);
        assert_eq!(u32::from_be_bytes(rec[16..20].try_into().unwrap()), 10);

        // and the module's load accepts it back
        let mut module = PktCountModule::default();
        let _ = module.init(&HashMap::new()).unwrap();
        let (len, ts) = module.load(rec).unwrap();
        assert_eq!(len, 20);
        assert_eq!(ts, Timestamp::from_secs(1));
    });
}
