// SPDX-License-Identifier: BSD-3-Clause

//! End-to-end exercises of the storage server over the bus.

#![allow(missing_docs, clippy::unwrap_used)]

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use como_ipc::message::OpenMode;
use como_ipc::{IpcListener, PeerClass};
use como_storage::{StorageClient, StorageServer};

/// Spawns a storage server on the current `LocalSet` and returns a
/// connected client.
async fn start(ipc_dir: &Path, basedir: &Path, segment_cap: u64) -> StorageClient {
    let listener = IpcListener::bind_unix(ipc_dir, PeerClass::Storage).unwrap();
    let server = StorageServer::new(basedir.to_path_buf(), segment_cap);
    let _ = tokio::task::spawn_local(async move {
        let _ = server.run(listener).await;
    });
    StorageClient::connect(ipc_dir, PeerClass::Export).await.unwrap()
}

fn local_test<F, Fut>(f: F)
where
    F: FnOnce() -> Fut + 'static,
    Fut: Future<Output = ()> + 'static,
{
    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    let local = tokio::task::LocalSet::new();
    rt.block_on(local.run_until(f()));
}

#[test]
fn writer_append_and_reader_roundtrip() {
    local_test(|| async {
        let ipc = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        let mut client = start(ipc.path(), base.path(), 1 << 20).await;

        let w = client.open("counter", OpenMode::WriterBlock, 0).await.unwrap();
        assert_eq!(w.offset, 0);

        let mut head = 0u64;
        for i in 0..4u8 {
            let mut region = client.region(w, head, 100).await.unwrap().expect("grant");
            region.as_mut_slice().fill(i + 1);
            head = region.offset() + 100;
            client.inform(w, head).await.unwrap();
        }
        assert_eq!(head, 400);

        let r = client.open("counter", OpenMode::ReaderNonBlock, 0).await.unwrap();
        let region = client.region(r, 150, 1000).await.unwrap().expect("reader grant");
        assert_eq!(region.offset(), 150);
        // bytes 150..200 belong to record 2, 200..300 to record 3
        assert_eq!(region.as_slice()[0], 2);
        assert_eq!(region.as_slice()[60], 3);
        assert_eq!(region.len(), 250, "grant is capped at the committed head");
    });
}

#[test]
fn segment_rotation_and_aligned_seek() {
    local_test(|| async {
        let ipc = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        let mut client = start(ipc.path(), base.path(), 1024).await;

        let w = client.open("ports", OpenMode::WriterBlock, 0).await.unwrap();
        let mut head = 0u64;
        for i in 0..10u8 {
            let mut region = client.region(w, head, 200).await.unwrap().expect("grant");
            assert_eq!(region.len(), 200, "records never split across segments");
            region.as_mut_slice().fill(i);
            head = region.offset() + 200;
            client.inform(w, head).await.unwrap();
        }
        assert_eq!(head, 2000);
        // 1024-byte cap, 200-byte records: 5 per segment
        assert!(base.path().join("ports/0000000000").exists());
        assert!(base.path().join("ports/0000001000").exists());
        assert!(!base.path().join("ports/0000002000").exists());

        let r = client.open("ports", OpenMode::ReaderNonBlock, 0).await.unwrap();
        let pos = client.seek(r, 1050).await.unwrap().expect("data exists");
        assert_eq!(pos.offset, 1050);
        assert_eq!(pos.seg_start, 1000, "segment starts are append boundaries");

        // reading from the aligned boundary yields whole records
        let region = client.region(r, pos.seg_start, 2000).await.unwrap().expect("grant");
        assert_eq!(region.offset(), 1000);
        assert_eq!(region.as_slice()[0], 5);
        assert_eq!(region.as_slice()[399], 6);
    });
}

#[test]
fn writer_uniqueness_is_enforced() {
    local_test(|| async {
        let ipc = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        let mut c1 = start(ipc.path(), base.path(), 4096).await;
        let mut c2 = StorageClient::connect(ipc.path(), PeerClass::Query).await.unwrap();

        let w = c1.open("solo", OpenMode::WriterBlock, 0).await.unwrap();
        let err = c2.open("solo", OpenMode::WriterNonBlock, 0).await.unwrap_err();
        assert!(matches!(err, como_storage::Error::Refused { .. }), "{err}");

        // readers are always welcome
        let _r = c2.open("solo", OpenMode::ReaderNonBlock, 0).await.unwrap();

        // releasing the writer frees the slot
        c1.close(w, true).await.unwrap();
        let _w2 = c2.open("solo", OpenMode::WriterNonBlock, 0).await.unwrap();
    });
}

#[test]
fn nonblocking_reader_sees_nodata_blocking_reader_parks() {
    local_test(|| async {
        let ipc = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        let mut writer = start(ipc.path(), base.path(), 4096).await;
        let mut nb = StorageClient::connect(ipc.path(), PeerClass::Query).await.unwrap();
        let mut blocking = StorageClient::connect(ipc.path(), PeerClass::Query).await.unwrap();

        let w = writer.open("live", OpenMode::WriterBlock, 0).await.unwrap();

        let h = nb.open("live", OpenMode::ReaderNonBlock, 0).await.unwrap();
        assert!(nb.region(h, 0, 64).await.unwrap().is_none(), "empty stream has no data");
        assert!(nb.seek(h, 0).await.unwrap().is_none());

        let hb = blocking.open("live", OpenMode::ReaderBlock, 0).await.unwrap();
        let parked = tokio::task::spawn_local(async move {
            let region = blocking.region(hb, 0, 64).await.unwrap().expect("woken with data");
            (region.offset(), region.as_slice().to_vec())
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!parked.is_finished(), "reader must park until a commit");

        let mut region = writer.region(w, 0, 64).await.unwrap().expect("grant");
        region.as_mut_slice().fill(7);
        writer.inform(w, 64).await.unwrap();

        let (ofs, bytes) = parked.await.unwrap();
        assert_eq!(ofs, 0);
        assert_eq!(bytes, vec![7u8; 64]);
    });
}

#[test]
fn restart_recovers_committed_head() {
    local_test(|| async {
        let ipc = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        {
            let mut client = start(ipc.path(), base.path(), 4096).await;
            let w = client.open("x", OpenMode::WriterBlock, 0).await.unwrap();
            let mut region = client.region(w, 0, 500).await.unwrap().expect("grant");
            region.as_mut_slice().fill(9);
            // commit only part of the reservation, then vanish
            client.inform(w, 300).await.unwrap();
        }

        let ipc2 = tempfile::tempdir().unwrap();
        let mut client = start(ipc2.path(), base.path(), 4096).await;
        let w = client.open("x", OpenMode::WriterBlock, 0).await.unwrap();
        assert_eq!(w.offset, 300, "head recovered from the stamp");
        let region = {
            let r = client.open("x", OpenMode::ReaderNonBlock, 0).await.unwrap();
            client.region(r, 0, 4096).await.unwrap().expect("grant")
        };
        assert_eq!(region.len(), 300, "uncommitted tail bytes are gone");
    });
}
