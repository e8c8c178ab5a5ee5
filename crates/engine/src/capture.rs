// SPDX-License-Identifier: BSD-3-Clause

//! The capture mainloop.
//!
//! Single-threaded cooperative: one task owns the arena, the sniffers and
//! every module's capture state. Connections (export, capture clients,
//! the supervisor) are serviced by small per-connection tasks that relay
//! frames through local channels, so the loop itself only ever suspends
//! in one `select!`.
//!
//! Per iteration the loop drains ready sniffers into the open batch,
//! classifies each packet against every active module's filter, updates
//! flow tables, closes the batch when a trigger fires and flushes tables
//! on interval boundaries. Batches are reclaimed when every subscribed
//! client acknowledged them; snapshots when export hands them back.

use std::collections::HashMap;
use std::os::fd::{AsFd, OwnedFd};
use std::time::Duration;

use bytes::Bytes;
use como_channel::mpsc;
use como_ipc::message::{
    CcaAckBatch, CcaNewBatch, CcaOpenMsg, CcaOpenRes, DoneMsg, FlushMsg, MessageType, ModuleCtl,
    encode,
};
use como_ipc::{Frame, IpcChannel, IpcListener, PeerClass};
use como_pkt::{LinkType, Timestamp, layers};
use como_shmem::{Arena, MemMap, MemPolicy, ShmBlock};
use tracing::{debug, info, trace, warn};

use crate::batch::{BatchDesc, encode_batch, encode_snapshot, pkt_view, rewrite_hdr};
use crate::error::Error;
use crate::module::{ModuleHandle, ModuleStatus, UpdateResult};
use crate::sniffer::{PktBuf, PollMode, Sniffer, SnifferInfo, SnifferNext};
use crate::table::FlowTable;

const MAX_CLIENTS: usize = 64;
const EVENT_QUEUE: usize = 256;
const CLIENT_QUEUE: usize = 64;
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Tuning knobs of the capture loop.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// A batch closes at this many packets.
    pub batch_max_pkts: usize,
    /// Default flush interval for modules that declare none.
    pub flush_ivl: Timestamp,
    /// Arena share one lagging client may pin before it is dropped.
    pub client_share_threshold: f64,
    /// Arena share one module's live flow records may occupy; crossing it
    /// forces an early flush instead of running the arena dry.
    pub module_quota: f64,
    /// Loop tick driving polled and file sniffers.
    pub poll_ivl: Duration,
    /// Stop once every sniffer reports end of input (offline runs).
    pub exit_on_eof: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        CaptureOptions {
            batch_max_pkts: 8192,
            flush_ivl: Timestamp::from_secs(1),
            client_share_threshold: 0.34,
            module_quota: 0.25,
            poll_ivl: Duration::from_millis(10),
            exit_on_eof: true,
        }
    }
}

impl From<&como_config::CaptureConfig> for CaptureOptions {
    fn from(c: &como_config::CaptureConfig) -> Self {
        CaptureOptions {
            batch_max_pkts: c.batch_max_pkts,
            flush_ivl: Timestamp::from_duration(c.flush_ivl),
            client_share_threshold: c.client_share_threshold,
            module_quota: c.module_quota,
            ..CaptureOptions::default()
        }
    }
}

/// Counters the loop maintains and reports.
#[derive(Debug, Default, Clone)]
pub struct CaptureStats {
    /// Packets pulled from all sniffers.
    pub pkts: u64,
    /// Payload bytes pulled from all sniffers.
    pub bytes: u64,
    /// Structurally broken packets dropped at parse time.
    pub corrupt: u64,
    /// Batches closed.
    pub batches: u64,
    /// Flow-table snapshots handed to export.
    pub flushes: u64,
    /// Clients dropped for lagging.
    pub clients_dropped: u64,
    /// Per-module counters, indexed by module id.
    pub modules: Vec<ModuleStats>,
}

/// Per-module counters.
#[derive(Debug, Default, Clone)]
pub struct ModuleStats {
    /// Packets that passed filter and check.
    pub seen: u64,
    /// `update` invocations (equals `seen` while the module is healthy).
    pub updates: u64,
    /// Source-reported drops credited to this module.
    pub drops: u64,
}

/// Commands to a connection relay task.
enum ConnCmd {
    Send(MessageType, Bytes),
    SendFd(MessageType, Bytes, OwnedFd),
    Close,
}

/// Events from relay tasks into the mainloop.
enum CaEvent {
    Connected { conn: u64, class: PeerClass, tx: mpsc::Sender<ConnCmd> },
    Frame { conn: u64, frame: Frame },
    Gone { conn: u64 },
}

struct CaModule {
    handle: ModuleHandle,
    table: FlowTable,
    pool: MemMap,
    ivl_start: Timestamp,
    wants_flush: bool,
    record_bytes: usize,
}

struct CaSniffer {
    name: String,
    sniffer: Box<dyn Sniffer>,
    info: SnifferInfo,
    eof: bool,
}

struct CaClient {
    conn: u64,
    tx: mpsc::Sender<ConnCmd>,
    pinned: usize,
}

struct LiveBatch {
    mask: u64,
    memmap: MemMap,
    bytes: usize,
}

struct PendingSnapshot {
    module: u32,
    records: Vec<ShmBlock>,
    memmap: MemMap,
}

/// The capture process mainloop.
pub struct CaptureLoop {
    arena: Arena,
    opts: CaptureOptions,
    modules: Vec<CaModule>,
    sniffers: Vec<CaSniffer>,
    /// `compat[s][m]`: sniffer `s` can feed module `m`.
    compat: Vec<Vec<bool>>,
    listener: Option<IpcListener>,
    export: Option<(u64, mpsc::Sender<ConnCmd>)>,
    clients: Vec<Option<CaClient>>,
    conns: HashMap<u64, mpsc::Sender<ConnCmd>>,
    batches: HashMap<u32, LiveBatch>,
    snapshots: HashMap<u32, PendingSnapshot>,
    open: Vec<(ShmBlock, usize)>,
    open_memmap: MemMap,
    open_first_ts: Timestamp,
    open_bytes: usize,
    seq: u64,
    now: Timestamp,
    frozen: bool,
    stats: CaptureStats,
}

impl CaptureLoop {
    /// Builds the loop: starts every sniffer and runs metadesc
    /// negotiation between sniffers and modules. Modules no sniffer can
    /// feed are disabled up front.
    pub fn new(
        arena: Arena,
        opts: CaptureOptions,
        mut modules: Vec<ModuleHandle>,
        sniffers: Vec<(String, Box<dyn Sniffer>)>,
        listener: Option<IpcListener>,
    ) -> Result<Self, Error> {
        let mut started = Vec::new();
        for (name, mut sniffer) in sniffers {
            let info = sniffer.start()?;
            info!(sniffer = %name, mode = ?info.mode, "sniffer started");
            started.push(CaSniffer { name, sniffer, info, eof: false });
        }

        let mut compat = vec![vec![false; modules.len()]; started.len()];
        for (m, module) in modules.iter_mut().enumerate() {
            let mut any = false;
            for (s, sniffer) in started.iter().enumerate() {
                let matched = sniffer
                    .info
                    .outdesc
                    .iter()
                    .any(|out| como_pkt::metadesc::best_match(out, &module.init.indesc).is_some());
                compat[s][m] = matched;
                any = any || matched;
            }
            if !any && !started.is_empty() {
                warn!(module = %module.name, "no compatible sniffer, disabling");
                module.status = ModuleStatus::Disabled;
            }
        }

        let module_count = modules.len();
        let ca_modules = modules
            .into_iter()
            .map(|handle| {
                let pool = MemMap::new(MemPolicy::HoldFree {
                    block_size: handle.init.ca_record_size.max(1).next_multiple_of(8),
                });
                CaModule {
                    handle,
                    table: FlowTable::new(),
                    pool,
                    ivl_start: Timestamp::ZERO,
                    wants_flush: false,
                    record_bytes: 0,
                }
            })
            .collect();

        Ok(CaptureLoop {
            arena,
            opts,
            modules: ca_modules,
            sniffers: started,
            compat,
            listener,
            export: None,
            clients: (0..MAX_CLIENTS).map(|_| None).collect(),
            conns: HashMap::new(),
            batches: HashMap::new(),
            snapshots: HashMap::new(),
            open: Vec::new(),
            open_memmap: MemMap::new(MemPolicy::HoldInUse),
            open_first_ts: Timestamp::ZERO,
            open_bytes: 0,
            seq: 0,
            now: Timestamp::ZERO,
            frozen: false,
            stats: CaptureStats { modules: vec![ModuleStats::default(); module_count], ..CaptureStats::default() },
        })
    }

    /// Runs the loop until shutdown (or end of input for offline runs) and
    /// returns the final counters. Must run inside a `LocalSet`.
    pub async fn run(mut self) -> Result<CaptureStats, Error> {
        let (events_tx, mut events_rx) = mpsc::channel::<CaEvent>(EVENT_QUEUE);
        if let Some(listener) = self.listener.take() {
            spawn_acceptor(listener, events_tx.clone());
        }

        let mut shutdown = false;
        while !shutdown {
            let all_eof = self.sniffers.iter().all(|s| s.eof);
            if all_eof && self.opts.exit_on_eof {
                break;
            }
            tokio::select! {
                ev = events_rx.recv() => match ev {
                    Ok(ev) => shutdown = self.handle_event(ev)?,
                    Err(_) => break,
                },
                () = tokio::time::sleep(self.tick()) => {
                    if !self.frozen {
                        self.drive_sniffers()?;
                        self.maybe_close_batch()?;
                        self.maybe_flush(false)?;
                    }
                }
            }
        }

        // final interval: close what is open, flush every table
        self.maybe_close_batch_force()?;
        self.maybe_flush(true)?;
        self.drain(&mut events_rx).await?;
        if let Some((_, tx)) = &self.export {
            let _ = tx.try_send(ConnCmd::Send(MessageType::Exit, Bytes::new()));
        }
        for slot in self.clients.iter().flatten() {
            let _ = slot.tx.try_send(ConnCmd::Send(MessageType::CcaClose, Bytes::new()));
        }
        // leave the relay tasks a moment to push the farewell frames
        tokio::time::sleep(Duration::from_millis(20)).await;
        info!(pkts = self.stats.pkts, batches = self.stats.batches, "capture done");
        Ok(self.stats)
    }

    /// Loop tick: the shortest waiting discipline of any live sniffer,
    /// bounded by the configured poll interval.
    fn tick(&self) -> Duration {
        self.sniffers
            .iter()
            .filter(|s| !s.eof)
            .map(|s| match s.info.mode {
                PollMode::Poll(d) => d,
                PollMode::Select | PollMode::File => self.opts.poll_ivl,
            })
            .min()
            .unwrap_or(self.opts.poll_ivl)
    }

    /// Waits for outstanding batches and snapshots, bounded by a grace
    /// period after which laggards are cut loose.
    async fn drain(&mut self, events_rx: &mut mpsc::Receiver<CaEvent>) -> Result<(), Error> {
        let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
        while !(self.batches.is_empty() && self.snapshots.is_empty()) {
            tokio::select! {
                ev = events_rx.recv() => match ev {
                    Ok(ev) => {
                        let _ = self.handle_event(ev)?;
                    }
                    Err(_) => break,
                },
                () = tokio::time::sleep_until(deadline) => {
                    warn!(
                        batches = self.batches.len(),
                        snapshots = self.snapshots.len(),
                        "drain grace expired, reclaiming"
                    );
                    let batches: Vec<_> = self.batches.drain().map(|(_, b)| b).collect();
                    for b in batches {
                        b.memmap.destroy(&mut self.arena);
                    }
                    let snaps: Vec<_> = self.snapshots.drain().map(|(_, s)| s).collect();
                    for s in snaps {
                        self.release_snapshot_records(s);
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    fn release_snapshot_records(&mut self, snap: PendingSnapshot) {
        if let Some(module) = self.modules.get_mut(snap.module as usize) {
            for rec in snap.records {
                module.pool.free(&mut self.arena, rec);
            }
        }
        snap.memmap.destroy(&mut self.arena);
    }

    /// Returns true when the event asks for shutdown.
    fn handle_event(&mut self, ev: CaEvent) -> Result<bool, Error> {
        match ev {
            CaEvent::Connected { conn, class, tx } => {
                debug!(conn, ?class, "capture peer connected");
                if class == PeerClass::Export {
                    // greet export with the arena descriptor so it can
                    // resolve snapshot offsets
                    let fd = self
                        .arena
                        .region()
                        .handle()
                        .try_clone()
                        .map(|h| OwnedFd::from(h.into_file()))?;
                    let _ = tx.try_send(ConnCmd::SendFd(MessageType::Sync, Bytes::new(), fd));
                    self.export = Some((conn, tx.clone()));
                }
                let _ = self.conns.insert(conn, tx);
            }
            CaEvent::Gone { conn } => {
                let _ = self.conns.remove(&conn);
                if self.export.as_ref().is_some_and(|(c, _)| *c == conn) {
                    warn!("export connection lost");
                    self.export = None;
                }
                if let Some(id) = self.client_by_conn(conn) {
                    self.drop_client(id, "connection closed");
                }
            }
            CaEvent::Frame { conn, frame } => return self.handle_frame(conn, frame),
        }
        Ok(false)
    }

    fn client_by_conn(&self, conn: u64) -> Option<u32> {
        self.clients
            .iter()
            .position(|c| c.as_ref().is_some_and(|c| c.conn == conn))
            .map(|i| i as u32)
    }

    fn handle_frame(&mut self, conn: u64, frame: Frame) -> Result<bool, Error> {
        match frame.ty {
            MessageType::CcaOpen => {
                let _msg: CcaOpenMsg = frame.decode()?;
                self.open_client(conn)?;
            }
            MessageType::CcaAckBatch => {
                let msg: CcaAckBatch = frame.decode()?;
                self.ack_batch(msg);
            }
            MessageType::CcaClose => {
                if let Some(id) = self.client_by_conn(conn) {
                    self.drop_client(id, "client closed");
                }
            }
            MessageType::Done => {
                let msg: DoneMsg = frame.decode()?;
                if let Some(snap) = self.snapshots.remove(&msg.snapshot.ofs()) {
                    self.release_snapshot_records(snap);
                } else {
                    warn!(ofs = msg.snapshot.ofs(), "done for unknown snapshot");
                }
            }
            MessageType::ModuleDel => {
                let msg: ModuleCtl = frame.decode()?;
                if let Some(m) = self.modules.get_mut(msg.module as usize) {
                    info!(module = %m.handle.name, "module disabled");
                    m.handle.status = ModuleStatus::Disabled;
                }
            }
            MessageType::ModuleAdd | MessageType::ModuleStart => {
                let msg: ModuleCtl = frame.decode()?;
                if let Some(m) = self.modules.get_mut(msg.module as usize) {
                    m.handle.status = ModuleStatus::Active;
                }
            }
            MessageType::Freeze => self.frozen = true,
            MessageType::Sync => self.frozen = false,
            MessageType::Exit => return Ok(true),
            other => {
                warn!(ty = ?other, conn, "unexpected frame on capture bus");
            }
        }
        Ok(false)
    }

    fn open_client(&mut self, conn: u64) -> Result<(), Error> {
        let Some(tx) = self.conns.get(&conn).cloned() else {
            return Err(Error::Protocol { reason: format!("open from unknown conn {conn}") });
        };
        let Some(slot) = self.clients.iter().position(Option::is_none) else {
            warn!("client table full, refusing subscription");
            let _ = tx.try_send(ConnCmd::Send(MessageType::CcaError, Bytes::new()));
            return Ok(());
        };
        let fd = self
            .arena
            .region()
            .handle()
            .try_clone()
            .map(|h| OwnedFd::from(h.into_file()))?;
        let payload = encode(&CcaOpenRes { id: slot as u32 })?;
        let _ = tx.try_send(ConnCmd::SendFd(MessageType::CcaOpenRes, payload, fd));
        self.clients[slot] = Some(CaClient { conn, tx, pinned: 0 });
        debug!(id = slot, "capture client subscribed");
        Ok(())
    }

    fn ack_batch(&mut self, msg: CcaAckBatch) {
        let key = msg.batch.ofs();
        let Some(batch) = self.batches.get_mut(&key) else {
            warn!(ofs = key, "ack for unknown batch");
            return;
        };
        let bit = 1u64 << msg.id;
        if batch.mask & bit == 0 {
            warn!(id = msg.id, ofs = key, "duplicate ack");
            return;
        }
        batch.mask &= !bit;
        let bytes = batch.bytes;
        if let Some(Some(client)) = self.clients.get_mut(msg.id as usize) {
            client.pinned = client.pinned.saturating_sub(bytes);
        }
        if batch.mask == 0 {
            if let Some(batch) = self.batches.remove(&key) {
                trace!(ofs = key, "batch reclaimed");
                batch.memmap.destroy(&mut self.arena);
            }
        }
    }

    fn drop_client(&mut self, id: u32, why: &str) {
        let Some(client) = self.clients.get_mut(id as usize).and_then(Option::take) else {
            return;
        };
        info!(id, why, "dropping capture client");
        let _ = client.tx.try_send(ConnCmd::Close);
        let bit = 1u64 << id;
        let mut reclaim = Vec::new();
        for (key, batch) in &mut self.batches {
            if batch.mask & bit != 0 {
                batch.mask &= !bit;
                if batch.mask == 0 {
                    reclaim.push(*key);
                }
            }
        }
        for key in reclaim {
            if let Some(batch) = self.batches.remove(&key) {
                batch.memmap.destroy(&mut self.arena);
            }
        }
        self.stats.clients_dropped += 1;
    }

    /// Pulls packets from every ready sniffer into the open batch and runs
    /// classification and flow updates for each.
    fn drive_sniffers(&mut self) -> Result<(), Error> {
        for s in 0..self.sniffers.len() {
            if self.sniffers[s].eof {
                continue;
            }
            let room = self.opts.batch_max_pkts.saturating_sub(self.open.len());
            if room == 0 {
                break;
            }
            let mut buf = PktBuf::new(&mut self.arena, &mut self.open_memmap);
            let outcome = {
                let sn = &mut self.sniffers[s];
                sn.sniffer.next(&mut buf, room)
            };
            let blocks = buf.into_blocks();
            match outcome {
                Ok(SnifferNext::Packets(n)) => {
                    debug_assert_eq!(n, blocks.len());
                    self.ingest(s, blocks)?;
                }
                Ok(SnifferNext::Idle) => {
                    debug_assert!(blocks.is_empty());
                }
                Ok(SnifferNext::Eof) => {
                    // a driver may return residual packets along with EOF
                    self.ingest(s, blocks)?;
                    let sn = &mut self.sniffers[s];
                    info!(sniffer = %sn.name, "end of input");
                    sn.sniffer.stop();
                    sn.eof = true;
                }
                Err(e) => {
                    for (block, _) in blocks {
                        self.open_memmap.free(&mut self.arena, block);
                    }
                    let sn = &mut self.sniffers[s];
                    warn!(sniffer = %sn.name, error = %e, "sniffer read failed");
                    sn.sniffer.stop();
                    sn.eof = true;
                }
            }
            let drops = self.sniffers[s].sniffer.dropped();
            if drops > 0 {
                self.credit_drops(s, drops);
            }
        }
        Ok(())
    }

    /// Source drops are credited pessimistically: every active module the
    /// sniffer can feed gets the full count.
    fn credit_drops(&mut self, sniffer: usize, drops: u64) {
        for m in 0..self.modules.len() {
            if self.compat[sniffer][m] && self.modules[m].handle.status == ModuleStatus::Active {
                self.stats.modules[m].drops += drops;
            }
        }
    }

    /// Parses, classifies and folds a burst of packets from one sniffer.
    fn ingest(&mut self, _sniffer: usize, blocks: Vec<(ShmBlock, LinkType)>) -> Result<(), Error> {
        for (block, link) in blocks {
            // parse layer offsets in place
            let bytes = self.arena.get(block)?;
            let view = match pkt_view(bytes) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "undecodable packet block");
                    self.open_memmap.free(&mut self.arena, block);
                    self.stats.corrupt += 1;
                    continue;
                }
            };
            let mut hdr = view.hdr;
            let outcome = layers::update_offsets(&mut hdr, view.payload, link);
            if outcome == layers::ParseOutcome::Corrupt {
                self.open_memmap.free(&mut self.arena, block);
                self.stats.corrupt += 1;
                continue;
            }
            let (caplen, ts) = (hdr.caplen, hdr.ts);
            {
                let bytes = self.arena.get_mut(block)?;
                rewrite_hdr(bytes, &hdr);
            }

            self.stats.pkts += 1;
            self.stats.bytes += caplen as u64;
            if ts > self.now {
                self.now = ts;
            }
            if self.open.is_empty() {
                self.open_first_ts = ts;
            }
            self.open.push((block, _sniffer));
            self.open_bytes += caplen as usize;

            self.update_modules(block, ts)?;
        }
        Ok(())
    }

    /// Runs filter, check and the flow-table update of every module for
    /// one packet.
    fn update_modules(&mut self, pkt_block: ShmBlock, ts: Timestamp) -> Result<(), Error> {
        for m in 0..self.modules.len() {
            let wants = {
                let module = &self.modules[m];
                let view = pkt_view(self.arena.get(pkt_block)?)?;
                module.handle.wants(&view)
            };
            if !wants {
                continue;
            }
            // the packet may open a new measurement interval; snapshot
            // the previous one before folding it in
            {
                let module = &self.modules[m];
                let ivl = module.handle.init.flush_ivl;
                if !module.table.is_empty() && ts >= module.ivl_start.advance(ivl) {
                    self.flush_module(m)?;
                }
            }
            let module = &mut self.modules[m];
            if module.table.is_empty() && module.ivl_start == Timestamp::ZERO {
                module.ivl_start = ts.align_to(module.handle.init.flush_ivl);
            }
            self.stats.modules[m].seen += 1;

            let key = {
                let view = pkt_view(self.arena.get(pkt_block)?)?;
                self.modules[m].module_hash(&view)
            };

            // resolve collisions with the module's match callback
            let mut found = None;
            for cand in self.modules[m].table.bucket(key).to_vec() {
                let matched = {
                    let view = pkt_view(self.arena.get(pkt_block)?)?;
                    let rec = self.arena.get(cand)?;
                    let size = self.modules[m].handle.init.ca_record_size;
                    self.modules[m].handle.module.matches(&view, &rec[..size])
                };
                if matched {
                    found = Some(cand);
                    break;
                }
            }

            let (rec_block, is_new) = match found {
                Some(b) => (b, false),
                None => {
                    let size = self.modules[m].handle.init.ca_record_size.max(1).next_multiple_of(8);
                    let quota = (self.arena.capacity() as f64 * self.opts.module_quota) as usize;
                    let module = &mut self.modules[m];
                    let block = module.pool.alloc(&mut self.arena, size)?;
                    self.arena.get_mut(block)?.fill(0);
                    let module = &mut self.modules[m];
                    module.table.insert(key, block);
                    module.record_bytes += size;
                    if module.record_bytes > quota {
                        debug!(module = %module.handle.name, "record quota hit, forcing flush");
                        module.wants_flush = true;
                    }
                    (block, true)
                }
            };

            let result = {
                let (rec, pkt_bytes) = self.arena.get_pair(rec_block, pkt_block)?;
                let view = pkt_view(pkt_bytes)?;
                let size = self.modules[m].handle.init.ca_record_size;
                self.modules[m].handle.module.update(&view, &mut rec[..size], is_new)
            };
            self.stats.modules[m].updates += 1;
            if result == UpdateResult::Full {
                self.modules[m].wants_flush = true;
            }
        }
        Ok(())
    }

    /// Closes the open batch when a trigger fires: size cap, age, or a
    /// module's immediate-flush request.
    fn maybe_close_batch(&mut self) -> Result<(), Error> {
        if self.open.is_empty() {
            return Ok(());
        }
        let aged = self.now.delta(self.open_first_ts) >= self.opts.flush_ivl;
        let full = self.open.len() >= self.opts.batch_max_pkts;
        let forced = self.modules.iter().any(|m| m.wants_flush);
        if full || aged || forced {
            self.close_batch()?;
        }
        Ok(())
    }

    fn maybe_close_batch_force(&mut self) -> Result<(), Error> {
        if !self.open.is_empty() {
            self.close_batch()?;
        }
        Ok(())
    }

    fn close_batch(&mut self) -> Result<(), Error> {
        let mask = self
            .clients
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_some())
            .fold(0u64, |acc, (i, _)| acc | (1u64 << i));

        let pkts: Vec<ShmBlock> = self.open.iter().map(|(b, _)| *b).collect();
        let mut memmap = std::mem::replace(&mut self.open_memmap, MemMap::new(MemPolicy::HoldInUse));
        let bytes = std::mem::take(&mut self.open_bytes);
        self.open.clear();

        self.seq += 1;
        let desc = BatchDesc {
            seq: self.seq,
            count: pkts.len() as u32,
            pkts0_len: pkts.len() as u32,
            pkts1_len: 0,
            last_ts: self.now,
            ref_mask: mask,
            pkts,
        };
        let desc_block = encode_batch(&mut self.arena, &mut memmap, &desc)?;
        self.stats.batches += 1;
        trace!(seq = self.seq, count = desc.count, mask, "batch closed");

        if mask == 0 {
            // nobody subscribed: reclaim immediately
            memmap.destroy(&mut self.arena);
            return Ok(());
        }

        for (i, slot) in self.clients.iter_mut().enumerate() {
            let Some(client) = slot else { continue };
            client.pinned += bytes;
            let payload = encode(&CcaNewBatch { id: i as u32, batch: desc_block })?;
            let _ = client.tx.try_send(ConnCmd::Send(MessageType::CcaNewBatch, payload));
        }
        let _ = self.batches.insert(desc_block.ofs(), LiveBatch { mask, memmap, bytes });

        self.enforce_backpressure();
        Ok(())
    }

    /// Cuts loose any client pinning more than its share of the arena.
    fn enforce_backpressure(&mut self) {
        let cap = self.arena.capacity();
        let threshold = (cap as f64 * self.opts.client_share_threshold) as usize;
        let lagging: Vec<u32> = self
            .clients
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|c| (i, c.pinned)))
            .filter(|(_, pinned)| *pinned > threshold)
            .map(|(i, _)| i as u32)
            .collect();
        for id in lagging {
            self.drop_client(id, "pinned share over threshold");
        }
    }

    /// Flushes module tables whose interval elapsed (or all of them when
    /// `force` is set, at end of input).
    fn maybe_flush(&mut self, force: bool) -> Result<(), Error> {
        for m in 0..self.modules.len() {
            let due = {
                let module = &self.modules[m];
                if module.table.is_empty() {
                    false
                } else if force || module.wants_flush {
                    true
                } else {
                    self.now >= module.ivl_start.advance(module.handle.init.flush_ivl)
                }
            };
            if due {
                self.flush_module(m)?;
            }
            self.modules[m].wants_flush = false;
        }
        Ok(())
    }

    fn flush_module(&mut self, m: usize) -> Result<(), Error> {
        let (records, ivl_start) = {
            let module = &mut self.modules[m];
            let records = module.table.take();
            let ivl = module.ivl_start;
            module.ivl_start = Timestamp::ZERO;
            module.record_bytes = 0;
            (records, ivl)
        };
        if records.is_empty() {
            return Ok(());
        }
        let mut memmap = MemMap::new(MemPolicy::HoldInUse);
        let snap_block = encode_snapshot(&mut self.arena, &mut memmap, &records)?;
        self.stats.flushes += 1;
        debug!(module = %self.modules[m].handle.name, count = records.len(), "flush");

        match &self.export {
            Some((_, tx)) => {
                let msg = FlushMsg {
                    module: m as u32,
                    ivl_start: ivl_start.as_bits(),
                    snapshot: snap_block,
                    count: records.len() as u32,
                };
                let _ = tx.try_send(ConnCmd::Send(MessageType::Flush, encode(&msg)?));
                let _ = self.snapshots.insert(
                    snap_block.ofs(),
                    PendingSnapshot { module: m as u32, records, memmap },
                );
            }
            None => {
                // no export attached: measurements die here
                let snap = PendingSnapshot { module: m as u32, records, memmap };
                self.release_snapshot_records(snap);
            }
        }
        Ok(())
    }

    /// Read access to the accumulated counters.
    #[must_use]
    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }
}

impl CaModule {
    fn module_hash(&self, view: &como_pkt::PktView<'_>) -> u64 {
        self.handle.module.hash(view)
    }
}

/// Accepts connections and spawns a relay task per peer.
fn spawn_acceptor(listener: IpcListener, events: mpsc::Sender<CaEvent>) {
    let _ = tokio::task::spawn_local(async move {
        let mut next_conn: u64 = 1;
        loop {
            match listener.accept().await {
                Ok((chan, class)) => {
                    let conn = next_conn;
                    next_conn += 1;
                    let (cmd_tx, cmd_rx) = mpsc::channel(CLIENT_QUEUE);
                    if events
                        .send(CaEvent::Connected { conn, class, tx: cmd_tx })
                        .await
                        .is_err()
                    {
                        return;
                    }
                    spawn_relay(conn, chan, events.clone(), cmd_rx);
                }
                Err(e) => {
                    warn!(error = %e, "capture accept failed");
                }
            }
        }
    });
}

/// Relays frames between one connection and the mainloop.
fn spawn_relay(
    conn: u64,
    mut chan: IpcChannel,
    events: mpsc::Sender<CaEvent>,
    mut cmds: mpsc::Receiver<ConnCmd>,
) {
    let _ = tokio::task::spawn_local(async move {
        loop {
            tokio::select! {
                frame = chan.recv() => match frame {
                    Ok(frame) => {
                        if events.send(CaEvent::Frame { conn, frame }).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => {
                        let _ = events.send(CaEvent::Gone { conn }).await;
                        return;
                    }
                },
                cmd = cmds.recv() => match cmd {
                    Ok(ConnCmd::Send(ty, payload)) => {
                        if chan.send(ty, &payload).await.is_err() {
                            let _ = events.send(CaEvent::Gone { conn }).await;
                            return;
                        }
                    }
                    Ok(ConnCmd::SendFd(ty, payload, fd)) => {
                        if chan.send_with_fd(ty, &payload, fd.as_fd()).await.is_err() {
                            let _ = events.send(CaEvent::Gone { conn }).await;
                            return;
                        }
                    }
                    Ok(ConnCmd::Close) | Err(_) => return,
                },
            }
        }
    });
}
