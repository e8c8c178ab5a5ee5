// SPDX-License-Identifier: BSD-3-Clause

//! Listening endpoints, connection establishment and handler dispatch.
//!
//! A listening peer binds a socket named after its class inside the
//! run directory; clients connect by class. Both directions open with a
//! `HELLO` exchange so each side knows who it is talking to before any
//! other frame flows.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::debug;

use crate::channel::IpcChannel;
use crate::error::Error;
use crate::message::{Frame, Hello, MessageType, PeerClass, encode};

/// A listening bus endpoint.
#[derive(Debug)]
pub struct IpcListener {
    class: PeerClass,
    inner: ListenerInner,
}

#[derive(Debug)]
enum ListenerInner {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl IpcListener {
    /// Binds the Unix socket for `class` inside `dir`, replacing any stale
    /// socket file left by a previous run.
    pub fn bind_unix(dir: &Path, class: PeerClass) -> Result<Self, Error> {
        let path = socket_path(dir, class);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }
        let listener = UnixListener::bind(&path)?;
        debug!(class = ?class, path = %path.display(), "ipc listening");
        Ok(IpcListener { class, inner: ListenerInner::Unix(listener) })
    }

    /// Binds a TCP listener for peers reachable cross-host.
    pub async fn bind_tcp(addr: &str, class: PeerClass) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr).await?;
        debug!(class = ?class, addr, "ipc listening (tcp)");
        Ok(IpcListener { class, inner: ListenerInner::Tcp(listener) })
    }

    /// Accepts one connection and completes the `HELLO` exchange.
    pub async fn accept(&self) -> Result<(IpcChannel, PeerClass), Error> {
        let mut chan = match &self.inner {
            ListenerInner::Unix(l) => {
                let (stream, _) = l.accept().await?;
                IpcChannel::from_unix(stream)
            }
            ListenerInner::Tcp(l) => {
                let (stream, _) = l.accept().await?;
                IpcChannel::from_tcp(stream)
            }
        };
        let frame = chan.recv().await?;
        if frame.ty != MessageType::Hello {
            return Err(Error::BadHello);
        }
        let hello: Hello = frame.decode().map_err(|_| Error::BadHello)?;
        chan.send(MessageType::Hello, &encode(&Hello { class: self.class })?).await?;
        Ok((chan, hello.class))
    }
}

/// Path of the socket a peer of `class` listens on under `dir`.
#[must_use]
pub fn socket_path(dir: &Path, class: PeerClass) -> PathBuf {
    dir.join(class.socket_name())
}

/// Connects to the Unix socket of `server` under `dir`, introducing
/// ourselves as `class`. Returns the channel and the server's class as
/// confirmed by its `HELLO`.
pub async fn connect_unix(
    dir: &Path,
    server: PeerClass,
    class: PeerClass,
) -> Result<(IpcChannel, PeerClass), Error> {
    let path = socket_path(dir, server);
    let stream = UnixStream::connect(&path).await?;
    hello_exchange(IpcChannel::from_unix(stream), class).await
}

/// TCP variant of [`connect_unix`] for cross-host peers.
pub async fn connect_tcp(
    addr: &str,
    class: PeerClass,
) -> Result<(IpcChannel, PeerClass), Error> {
    let stream = TcpStream::connect(addr).await?;
    hello_exchange(IpcChannel::from_tcp(stream), class).await
}

async fn hello_exchange(
    mut chan: IpcChannel,
    class: PeerClass,
) -> Result<(IpcChannel, PeerClass), Error> {
    chan.send(MessageType::Hello, &encode(&Hello { class })?).await?;
    let frame = chan.recv().await?;
    if frame.ty != MessageType::Hello {
        return Err(Error::BadHello);
    }
    let hello: Hello = frame.decode().map_err(|_| Error::BadHello)?;
    Ok((chan, hello.class))
}

/// Per-process dispatch table mapping frame types to handlers.
///
/// Handlers run synchronously on the owning mainloop and may return an
/// immediate reply frame. A frame whose type has no handler is a protocol
/// error; the caller logs it and closes the offending connection.
pub struct HandlerTable<Ctx> {
    handlers: HashMap<MessageType, HandlerFn<Ctx>>,
}

type HandlerFn<Ctx> =
    Box<dyn FnMut(&mut Ctx, &Frame) -> Result<Option<(MessageType, Bytes)>, Error>>;

impl<Ctx> Default for HandlerTable<Ctx> {
    fn default() -> Self {
        HandlerTable { handlers: HashMap::new() }
    }
}

impl<Ctx> HandlerTable<Ctx> {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        HandlerTable::default()
    }

    /// Registers the handler for one frame type, replacing any previous
    /// registration.
    pub fn register<F>(&mut self, ty: MessageType, handler: F)
    where
        F: FnMut(&mut Ctx, &Frame) -> Result<Option<(MessageType, Bytes)>, Error> + 'static,
    {
        let _ = self.handlers.insert(ty, Box::new(handler));
    }

    /// Dispatches one frame.
    pub fn handle(
        &mut self,
        ctx: &mut Ctx,
        frame: &Frame,
    ) -> Result<Option<(MessageType, Bytes)>, Error> {
        match self.handlers.get_mut(&frame.ty) {
            Some(h) => h(ctx, frame),
            None => Err(Error::UnknownType(frame.ty.code())),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(missing_docs, clippy::unwrap_used)]
    use super::*;

    #[tokio::test]
    async fn hello_identifies_both_classes() {
        let dir = tempfile::tempdir().unwrap();
        let listener = IpcListener::bind_unix(dir.path(), PeerClass::Storage).unwrap();

        let server = tokio::spawn(async move {
            let (_chan, who) = listener.accept().await.unwrap();
            who
        });

        let (_chan, server_class) =
            connect_unix(dir.path(), PeerClass::Storage, PeerClass::Export).await.unwrap();
        assert_eq!(server_class, PeerClass::Storage);
        assert_eq!(server.await.unwrap(), PeerClass::Export);
    }

    #[tokio::test]
    async fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let first = IpcListener::bind_unix(dir.path(), PeerClass::Capture).unwrap();
        drop(first);
        // the socket file is still on disk; binding again must succeed
        let _second = IpcListener::bind_unix(dir.path(), PeerClass::Capture).unwrap();
    }

    #[tokio::test]
    async fn handler_table_dispatch() {
        let mut table: HandlerTable<u32> = HandlerTable::new();
        table.register(MessageType::Echo, |count, frame| {
            *count += 1;
            Ok(Some((MessageType::Ack, frame.payload.clone())))
        });

        let mut count = 0;
        let frame = Frame { ty: MessageType::Echo, payload: Bytes::from_static(b"x"), fd: None };
        let reply = table.handle(&mut count, &frame).unwrap();
        assert_eq!(count, 1);
        assert_eq!(reply.unwrap().0, MessageType::Ack);

        let frame = Frame { ty: MessageType::Freeze, payload: Bytes::new(), fd: None };
        assert!(matches!(table.handle(&mut count, &frame), Err(Error::UnknownType(_))));
    }
}
