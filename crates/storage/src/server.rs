// SPDX-License-Identifier: BSD-3-Clause

//! The storage server mainloop.
//!
//! One accept loop plus one task per client connection, all on a single
//! current-thread runtime. Stream state is shared between connection tasks
//! through `Rc<RefCell<..>>`; blocking requests park on a per-stream watch
//! of the committed head instead of blocking the loop.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs::File;
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::rc::Rc;

use como_ipc::message::{
    ErrorMsg, MessageType, OpenMode, SCloseMsg, SInformMsg, SOpenMsg, SOpenRes, SRegionMsg,
    SRegionRes, SSeekMsg, SSeekRes, encode,
};
use como_ipc::{IpcChannel, IpcListener};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::stream::StreamDir;

/// One stream as shared between connection tasks.
struct StreamShared {
    state: RefCell<StreamDir>,
    writer_taken: Cell<bool>,
    head_tx: watch::Sender<u64>,
}

struct ServerState {
    basedir: PathBuf,
    segment_cap: u64,
    streams: HashMap<String, Rc<StreamShared>>,
}

impl ServerState {
    fn stream(&mut self, name: &str) -> Result<Rc<StreamShared>, Error> {
        if let Some(s) = self.streams.get(name) {
            return Ok(s.clone());
        }
        let dir = StreamDir::open(&self.basedir, name, self.segment_cap)?;
        let (head_tx, _) = watch::channel(dir.head());
        let shared = Rc::new(StreamShared {
            state: RefCell::new(dir),
            writer_taken: Cell::new(false),
            head_tx,
        });
        let _ = self.streams.insert(name.to_owned(), shared.clone());
        Ok(shared)
    }
}

/// The storage process service.
pub struct StorageServer {
    state: Rc<RefCell<ServerState>>,
}

impl StorageServer {
    /// Creates a server rooted at `basedir` with the given segment cap.
    #[must_use]
    pub fn new(basedir: PathBuf, segment_cap: u64) -> Self {
        StorageServer {
            state: Rc::new(RefCell::new(ServerState {
                basedir,
                segment_cap,
                streams: HashMap::new(),
            })),
        }
    }

    /// Serves clients until the shutdown signal fires. Must run inside a
    /// `LocalSet`.
    pub async fn run_until(
        self,
        listener: IpcListener,
        mut stop: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<(), Error> {
        tokio::select! {
            r = self.run(listener) => r,
            _ = &mut stop => {
                info!("storage shutting down");
                Ok(())
            }
        }
    }

    /// Serves clients forever. Must run inside a `LocalSet`.
    pub async fn run(self, listener: IpcListener) -> Result<(), Error> {
        info!("storage serving");
        loop {
            let (chan, class) = match listener.accept().await {
                Ok(x) => x,
                Err(e) => {
                    warn!(error = %e, "storage accept failed");
                    continue;
                }
            };
            debug!(?class, "storage client connected");
            let state = self.state.clone();
            let _ = tokio::task::spawn_local(async move {
                if let Err(e) = serve_client(state, chan).await {
                    debug!(error = %e, "storage client finished with error");
                }
            });
        }
    }
}

/// Per-connection handle table entry.
struct Handle {
    stream: Rc<StreamShared>,
    mode: OpenMode,
    name: String,
}

async fn serve_client(
    state: Rc<RefCell<ServerState>>,
    mut chan: IpcChannel,
) -> Result<(), Error> {
    let mut handles: HashMap<u32, Handle> = HashMap::new();
    let mut next_handle: u32 = 1;

    let result = loop {
        let frame = match chan.recv().await {
            Ok(f) => f,
            Err(como_ipc::Error::PeerGone) => break Ok(()),
            Err(e) => break Err(Error::Ipc(e)),
        };
        match frame.ty {
            MessageType::SOpen => {
                let msg: SOpenMsg = frame.decode()?;
                let shared = state.borrow_mut().stream(&msg.path)?;
                if msg.mode.is_writer() && shared.writer_taken.get() {
                    warn!(stream = %msg.path, "second writer rejected");
                    refuse(&mut chan, format!("stream `{}` already has a writer", msg.path))
                        .await?;
                    continue;
                }
                if msg.mode.is_writer() {
                    shared.writer_taken.set(true);
                }
                let offset = shared.state.borrow().head();
                let handle = next_handle;
                next_handle += 1;
                let _ = handles.insert(
                    handle,
                    Handle { stream: shared, mode: msg.mode, name: msg.path.clone() },
                );
                chan.send(MessageType::SOpen, &encode(&SOpenRes { handle, offset })?).await?;
            }

            MessageType::SRegion => {
                let msg: SRegionMsg = frame.decode()?;
                let Some(h) = handles.get(&msg.handle) else {
                    refuse(&mut chan, format!("unknown handle {}", msg.handle)).await?;
                    continue;
                };
                if h.mode.is_writer() {
                    let grant = {
                        let mut dir = h.stream.state.borrow_mut();
                        dir.writer_region(msg.offset, msg.len).map(
                            |(file, seg_start, seg_ofs, len)| {
                                (file.try_clone(), seg_start, seg_ofs, len)
                            },
                        )
                    };
                    match grant {
                        Ok((Ok(file), seg_start, seg_ofs, len)) => {
                            send_region(&mut chan, &file, msg.offset, seg_start, seg_ofs, len)
                                .await?;
                        }
                        Ok((Err(e), ..)) => {
                            refuse(&mut chan, format!("segment clone failed: {e}")).await?;
                        }
                        Err(e) => refuse(&mut chan, e.to_string()).await?,
                    }
                } else {
                    // readers may park until data reaches the offset
                    let mut head_rx = h.stream.head_tx.subscribe();
                    loop {
                        let grant = {
                            let dir = h.stream.state.borrow();
                            dir.reader_region(msg.offset, msg.len).map(
                                |(file, seg_start, seg_ofs, len)| {
                                    (file.try_clone(), seg_start, seg_ofs, len)
                                },
                            )
                        };
                        match grant {
                            Some((Ok(file), seg_start, seg_ofs, len)) => {
                                let offset = seg_start + seg_ofs;
                                send_region(&mut chan, &file, offset, seg_start, seg_ofs, len)
                                    .await?;
                                break;
                            }
                            Some((Err(e), ..)) => {
                                refuse(&mut chan, format!("segment clone failed: {e}")).await?;
                                break;
                            }
                            None if h.mode.is_blocking() => {
                                if head_rx.changed().await.is_err() {
                                    refuse(&mut chan, "stream gone".to_owned()).await?;
                                    break;
                                }
                            }
                            None => {
                                chan.send(MessageType::SNodata, &[]).await?;
                                break;
                            }
                        }
                    }
                }
            }

            MessageType::SSeek => {
                let msg: SSeekMsg = frame.decode()?;
                let Some(h) = handles.get(&msg.handle) else {
                    refuse(&mut chan, format!("unknown handle {}", msg.handle)).await?;
                    continue;
                };
                let mut head_rx = h.stream.head_tx.subscribe();
                loop {
                    let pos = h.stream.state.borrow().seek(msg.offset);
                    match pos {
                        Some((offset, seg_start)) => {
                            chan.send(
                                MessageType::SSeek,
                                &encode(&SSeekRes { offset, seg_start })?,
                            )
                            .await?;
                            break;
                        }
                        None if h.mode.is_blocking() => {
                            if head_rx.changed().await.is_err() {
                                refuse(&mut chan, "stream gone".to_owned()).await?;
                                break;
                            }
                        }
                        None => {
                            chan.send(MessageType::SNodata, &[]).await?;
                            break;
                        }
                    }
                }
            }

            MessageType::SInform => {
                let msg: SInformMsg = frame.decode()?;
                let Some(h) = handles.get(&msg.handle) else {
                    refuse(&mut chan, format!("unknown handle {}", msg.handle)).await?;
                    continue;
                };
                if !h.mode.is_writer() {
                    refuse(&mut chan, "inform on a reader handle".to_owned()).await?;
                    continue;
                }
                let committed = {
                    let mut dir = h.stream.state.borrow_mut();
                    dir.inform(msg.offset)
                };
                match committed {
                    Ok(head) => {
                        let _ = h.stream.head_tx.send(head);
                        chan.send(MessageType::Ack, &[]).await?;
                    }
                    Err(e) => refuse(&mut chan, e.to_string()).await?,
                }
            }

            MessageType::SClose => {
                let msg: SCloseMsg = frame.decode()?;
                let Some(h) = handles.remove(&msg.handle) else {
                    refuse(&mut chan, format!("unknown handle {}", msg.handle)).await?;
                    continue;
                };
                if h.mode.is_writer() {
                    if msg.truncate {
                        h.stream.state.borrow_mut().truncate_to_head()?;
                    }
                    h.stream.writer_taken.set(false);
                    debug!(stream = %h.name, "writer closed");
                }
                chan.send(MessageType::Ack, &[]).await?;
            }

            MessageType::Exit => break Ok(()),

            other => {
                warn!(ty = ?other, "unexpected frame on storage connection, closing");
                break Ok(());
            }
        }
    };

    // a dying writer releases the stream and loses reserved bytes
    for (_, h) in handles {
        if h.mode.is_writer() {
            h.stream.writer_taken.set(false);
            if let Err(e) = h.stream.state.borrow_mut().truncate_to_head() {
                warn!(stream = %h.name, error = %e, "truncate on abandon failed");
            }
        }
    }
    result
}

async fn refuse(chan: &mut IpcChannel, reason: String) -> Result<(), Error> {
    warn!(%reason, "storage request refused");
    chan.send(MessageType::Error, &encode(&ErrorMsg { reason })?).await?;
    Ok(())
}

async fn send_region(
    chan: &mut IpcChannel,
    file: &File,
    offset: u64,
    _seg_start: u64,
    seg_ofs: u64,
    len: u64,
) -> Result<(), Error> {
    let res = SRegionRes { offset, seg_ofs, len };
    chan.send_with_fd(MessageType::SRegion, &encode(&res)?, file.as_fd()).await?;
    Ok(())
}
