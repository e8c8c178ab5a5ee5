// SPDX-License-Identifier: BSD-3-Clause

//! The capture-client side of the batch protocol.
//!
//! A capture client subscribes to the live packet stream: it receives
//! batch announcements, reads packets straight out of the shared arena
//! and acknowledges each batch when it moves past it. Acknowledgment is
//! deferred to the next `next` call so the packet handed out last stays
//! valid while the caller looks at it.
//!
//! Sampling: a client opened with rate `N > 1` advances by a uniformly
//! random step averaging `N` packets between deliveries; a step past the
//! end of the current batch acknowledges it and resumes in the next one
//! (the remainder is not carried over).

use std::fs::File;

use como_ipc::message::{CcaAckBatch, CcaNewBatch, CcaOpenMsg, CcaOpenRes, MessageType, encode};
use como_ipc::{IpcChannel, PeerClass, connect_unix};
use como_pkt::PktView;
use como_shmem::{ShmBlock, ShmHandle, ShmRegion};
use rand::rngs::SmallRng;
use rand::{RngExt, SeedableRng};
use tracing::{debug, warn};

use crate::batch::{BatchDesc, decode_batch, pkt_view};
use crate::error::Error;

struct CurBatch {
    block: ShmBlock,
    desc: BatchDesc,
    pos: usize,
}

/// A subscriber to the capture packet stream.
pub struct CaptureClient {
    chan: IpcChannel,
    region: ShmRegion,
    id: u32,
    sampling: u32,
    rng: SmallRng,
    cur: Option<CurBatch>,
    pending_ack: Option<ShmBlock>,
    delivered: u64,
}

impl CaptureClient {
    /// Connects to the capture socket under `ipc_dir` and subscribes with
    /// the given sampling rate (`1` delivers every packet).
    pub async fn connect(
        ipc_dir: &std::path::Path,
        class: PeerClass,
        sampling: u32,
    ) -> Result<Self, Error> {
        let (chan, _) = connect_unix(ipc_dir, PeerClass::Capture, class).await?;
        CaptureClient::open(chan, sampling).await
    }

    /// Subscribes over an established channel.
    pub async fn open(mut chan: IpcChannel, sampling: u32) -> Result<Self, Error> {
        let payload = encode(&CcaOpenMsg { sampling })?;
        let frame = chan.wait_reply(MessageType::CcaOpen, &payload).await?;
        if frame.ty != MessageType::CcaOpenRes {
            return Err(Error::Protocol { reason: format!("subscription refused: {:?}", frame.ty) });
        }
        let res: CcaOpenRes = frame.decode()?;
        let fd = frame.fd.ok_or(Error::Protocol { reason: "grant without arena fd".to_owned() })?;
        let handle = ShmHandle::from_file(File::from(fd))?;
        let region = ShmRegion::map(handle)?;
        debug!(id = res.id, sampling, "capture client open");
        Ok(CaptureClient {
            chan,
            region,
            id: res.id,
            sampling: sampling.max(1),
            rng: SmallRng::seed_from_u64(u64::from(res.id) ^ 0x9e37_79b9_7f4a_7c15),
            cur: None,
            pending_ack: None,
            delivered: 0,
        })
    }

    /// The client id assigned by capture (its bit in batch masks).
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Packets delivered so far (after sampling).
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Returns the next delivered packet's block, or `None` when capture
    /// closed the subscription. The block stays readable until the next
    /// call.
    pub async fn next(&mut self) -> Result<Option<ShmBlock>, Error> {
        if let Some(block) = self.pending_ack.take() {
            self.send_ack(block).await?;
        }
        loop {
            if let Some(cur) = &mut self.cur {
                let pkt = cur.desc.pkts[cur.pos];
                let step = if self.sampling <= 1 {
                    1
                } else {
                    // uniform in [1, 2N-1]: mean N packets per delivery
                    self.rng.random_range(1..2 * self.sampling as usize)
                };
                cur.pos += step;
                if cur.pos >= cur.desc.pkts.len() {
                    let block = cur.block;
                    self.cur = None;
                    self.pending_ack = Some(block);
                }
                self.delivered += 1;
                return Ok(Some(pkt));
            }

            let frame = match self.chan.recv().await {
                Ok(f) => f,
                Err(como_ipc::Error::PeerGone) => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            match frame.ty {
                MessageType::CcaNewBatch => {
                    let msg: CcaNewBatch = frame.decode()?;
                    let bytes = self.region.get(msg.batch.ofs(), msg.batch.len() as usize)?;
                    let desc = decode_batch(bytes)?;
                    if desc.pkts.is_empty() {
                        self.send_ack(msg.batch).await?;
                        continue;
                    }
                    self.cur = Some(CurBatch { block: msg.batch, desc, pos: 0 });
                }
                MessageType::CcaClose => {
                    debug!(id = self.id, "subscription closed by capture");
                    return Ok(None);
                }
                other => warn!(ty = ?other, "unexpected frame on client channel"),
            }
        }
    }

    /// Resolves a delivered block to a packet view.
    pub fn pkt(&self, block: ShmBlock) -> Result<PktView<'_>, Error> {
        pkt_view(self.region.get(block.ofs(), block.len() as usize)?)
    }

    async fn send_ack(&mut self, block: ShmBlock) -> Result<(), Error> {
        let msg = CcaAckBatch { id: self.id, batch: block };
        self.chan.send(MessageType::CcaAckBatch, &encode(&msg)?).await?;
        Ok(())
    }
}
