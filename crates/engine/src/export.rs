// SPDX-License-Identifier: BSD-3-Clause

//! The export mainloop.
//!
//! Export receives flow-table snapshots from capture, runs the back half
//! of each module's contract and appends the resulting records to the
//! module's storage stream. Capture-side records are read from the shared
//! arena and handed back with `DONE` once the snapshot is fully
//! processed; export-side state lives in process-local pools and never
//! touches the arena.
//!
//! Records are appended to storage one at a time so a record never
//! straddles a segment boundary; each append commits with `INFORM`.

use bytes::BytesMut;
use como_ipc::message::{DoneMsg, FlushMsg, MessageType, OpenMode, encode};
use como_ipc::{IpcChannel, PeerClass, connect_unix};
use como_pkt::Timestamp;
use como_shmem::{BytePool, ShmRegion};
use como_storage::{StorageClient, StreamHandle};
use tracing::{debug, info, warn};

use crate::batch::decode_snapshot;
use crate::error::Error;
use crate::module::{Action, ModuleHandle, ModuleStatus};

/// Counters the export loop reports.
#[derive(Debug, Default, Clone)]
pub struct ExportStats {
    /// Snapshots processed.
    pub snapshots: u64,
    /// Records appended to storage.
    pub records: u64,
    /// Bytes appended to storage.
    pub bytes: u64,
    /// Records discarded because `store` failed.
    pub store_errors: u64,
}

struct ExRecord {
    buf: Box<[u8]>,
    ivl: Timestamp,
    discard: bool,
}

struct ExModule {
    handle: ModuleHandle,
    table: Vec<ExRecord>,
    pool: BytePool,
    writer: Option<(StreamHandle, u64)>,
}

/// The export process mainloop.
pub struct ExportLoop {
    chan: IpcChannel,
    storage: StorageClient,
    region: ShmRegion,
    modules: Vec<ExModule>,
    stats: ExportStats,
}

impl ExportLoop {
    /// Connects to capture and storage under `ipc_dir`. Capture greets the
    /// export connection with the arena descriptor; this blocks until that
    /// greeting arrives.
    pub async fn connect(
        ipc_dir: &std::path::Path,
        modules: Vec<ModuleHandle>,
    ) -> Result<Self, Error> {
        let (mut chan, _) = connect_unix(ipc_dir, PeerClass::Capture, PeerClass::Export).await?;
        let greeting = chan.recv().await?;
        if greeting.ty != MessageType::Sync {
            return Err(Error::Protocol {
                reason: format!("expected arena greeting, got {:?}", greeting.ty),
            });
        }
        let fd = greeting
            .fd
            .ok_or(Error::Protocol { reason: "greeting without arena fd".to_owned() })?;
        let handle = como_shmem::ShmHandle::from_file(std::fs::File::from(fd))?;
        let region = ShmRegion::map(handle)?;
        let storage = StorageClient::connect(ipc_dir, PeerClass::Export).await?;
        Ok(ExportLoop::assemble(chan, storage, region, modules))
    }

    /// Builds the loop from already-established connections.
    #[must_use]
    pub fn assemble(
        chan: IpcChannel,
        storage: StorageClient,
        region: ShmRegion,
        modules: Vec<ModuleHandle>,
    ) -> Self {
        let modules = modules
            .into_iter()
            .map(|handle| {
                let pool = BytePool::new(handle.init.ex_record_size.max(1));
                ExModule { handle, table: Vec::new(), pool, writer: None }
            })
            .collect();
        ExportLoop { chan, storage, region, modules, stats: ExportStats::default() }
    }

    /// Processes snapshots until capture says `EXIT` or goes away, then
    /// closes every output stream and returns the counters.
    pub async fn run(mut self) -> Result<ExportStats, Error> {
        info!("export running");
        loop {
            let frame = match self.chan.recv().await {
                Ok(f) => f,
                Err(como_ipc::Error::PeerGone) => {
                    warn!("capture connection lost");
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            match frame.ty {
                MessageType::Flush => {
                    let msg: FlushMsg = frame.decode()?;
                    self.process_snapshot(msg).await?;
                }
                MessageType::Exit => break,
                other => warn!(ty = ?other, "unexpected frame on export bus"),
            }
        }

        for m in 0..self.modules.len() {
            if let Some((handle, _)) = self.modules[m].writer.take() {
                self.storage.close(handle, true).await?;
            }
        }
        info!(
            snapshots = self.stats.snapshots,
            records = self.stats.records,
            "export done"
        );
        Ok(self.stats)
    }

    async fn process_snapshot(&mut self, msg: FlushMsg) -> Result<(), Error> {
        let m = msg.module as usize;
        if m >= self.modules.len() {
            warn!(module = m, "flush for unknown module");
            return Ok(());
        }
        let ivl = Timestamp::from_bits(msg.ivl_start);
        let records =
            decode_snapshot(self.region.get(msg.snapshot.ofs(), msg.snapshot.len() as usize)?)?;
        debug!(module = %self.modules[m].handle.name, count = records.len(), "snapshot");

        if self.modules[m].handle.status == ModuleStatus::Active {
            let outcome = if self.modules[m].handle.init.ex_record_size == 0 {
                self.store_direct(m, &records).await
            } else {
                self.merge_and_act(m, &records, ivl).await
            };
            if let Err(e) = outcome {
                // a broken module stops measuring but the pipeline lives on
                warn!(module = %self.modules[m].handle.name, error = %e, "module failed, disabling");
                self.modules[m].handle.status = ModuleStatus::Disabled;
            }
        }

        self.stats.snapshots += 1;
        let done = DoneMsg { module: msg.module, snapshot: msg.snapshot };
        self.chan.send(MessageType::Done, &encode(&done)?).await?;
        Ok(())
    }

    /// Modules without an export table: capture records go straight to
    /// `store`, in insertion order.
    async fn store_direct(
        &mut self,
        m: usize,
        records: &[como_shmem::ShmBlock],
    ) -> Result<(), Error> {
        let size = self.modules[m].handle.init.ca_record_size;
        for block in records {
            let mut buf = BytesMut::new();
            let stored = {
                let rec = self.region.get(block.ofs(), block.len() as usize)?;
                let module = &mut self.modules[m];
                module.handle.module.store(&rec[..size], &mut buf)
            };
            match stored {
                Ok(()) => self.append_record(m, &buf).await?,
                Err(e) => {
                    warn!(module = %self.modules[m].handle.name, error = %e, "store failed");
                    self.stats.store_errors += 1;
                }
            }
        }
        Ok(())
    }

    /// Modules with an export table: merge every capture record via
    /// `ematch`/`export`, then walk the table with `action`.
    async fn merge_and_act(
        &mut self,
        m: usize,
        records: &[como_shmem::ShmBlock],
        ivl: Timestamp,
    ) -> Result<(), Error> {
        let ca_size = self.modules[m].handle.init.ca_record_size;
        let ex_size = self.modules[m].handle.init.ex_record_size;

        for block in records {
            let rec = self.region.get(block.ofs(), block.len() as usize)?;
            let rec = &rec[..ca_size];
            let module = &mut self.modules[m];
            let found = module
                .table
                .iter()
                .position(|ex| !ex.discard && module.handle.module.ematch(&ex.buf, rec));
            match found {
                Some(at) => {
                    let ex = &mut module.table[at];
                    module.handle.module.export(&mut ex.buf, rec, false);
                }
                None => {
                    let mut buf = module.pool.alloc();
                    module.handle.module.export(&mut buf, rec, true);
                    module.table.push(ExRecord { buf, ivl, discard: false });
                }
            }
        }

        // modules without flexible flush observe the action walk in
        // insertion order, full stop; only flexible-flush modules may be
        // reordered, and the compare-sorted walk (top-N selection) is the
        // one reordering the engine performs
        let mut to_store: Vec<BytesMut> = Vec::new();
        {
            let module = &mut self.modules[m];
            if module.handle.init.flexible_flush && module.handle.init.sorted_export {
                let cmp = &module.handle.module;
                module
                    .table
                    .sort_by(|a, b| cmp.compare(&a.buf[..ex_size], &b.buf[..ex_size]));
            }
            let mut walked = 0usize;
            for at in 0..module.table.len() {
                if module.table[at].discard {
                    continue;
                }
                let act = {
                    let ex = &module.table[at];
                    module.handle.module.action(&ex.buf[..ex_size], ex.ivl, ivl, walked)
                };
                walked += 1;
                if act.contains(Action::STORE) {
                    let mut buf = BytesMut::new();
                    let ex = &module.table[at];
                    match module.handle.module.store(&ex.buf[..ex_size], &mut buf) {
                        Ok(()) => to_store.push(buf),
                        Err(e) => {
                            warn!(module = %module.handle.name, error = %e, "store failed");
                            self.stats.store_errors += 1;
                        }
                    }
                }
                if act.contains(Action::DISCARD) {
                    module.table[at].discard = true;
                }
                if act.contains(Action::STOP) {
                    break;
                }
            }
        }

        for buf in &to_store {
            self.append_record(m, buf).await?;
        }

        // drop discarded records back into the pool
        let module = &mut self.modules[m];
        let mut kept = Vec::with_capacity(module.table.len());
        for rec in module.table.drain(..) {
            if rec.discard {
                module.pool.free(rec.buf);
            } else {
                kept.push(rec);
            }
        }
        module.table = kept;
        Ok(())
    }

    /// Appends one serialized record to the module's output stream.
    async fn append_record(&mut self, m: usize, bytes: &[u8]) -> Result<(), Error> {
        if bytes.is_empty() {
            return Ok(());
        }
        if self.modules[m].writer.is_none() {
            let name = self.modules[m].handle.output.clone();
            let handle = self.storage.open(&name, OpenMode::WriterBlock, 0).await?;
            let head = handle.offset;
            self.modules[m].writer = Some((handle, head));
        }
        let (handle, head) = {
            let w = self.modules[m].writer.as_ref().ok_or(Error::Protocol {
                reason: "writer vanished".to_owned(),
            })?;
            (w.0, w.1)
        };
        let mut region = self
            .storage
            .region(handle, head, bytes.len() as u64)
            .await?
            .ok_or(Error::Protocol { reason: "writer got no region".to_owned() })?;
        let n = bytes.len().min(region.len());
        region.as_mut_slice()[..n].copy_from_slice(&bytes[..n]);
        let new_head = region.offset() + n as u64;
        drop(region);
        self.storage.inform(handle, new_head).await?;
        if let Some(w) = self.modules[m].writer.as_mut() {
            w.1 = new_head;
        }
        self.stats.records += 1;
        self.stats.bytes += n as u64;
        Ok(())
    }

    /// Read access to the accumulated counters.
    #[must_use]
    pub fn stats(&self) -> &ExportStats {
        &self.stats
    }
}
