// SPDX-License-Identifier: BSD-3-Clause

//! One bus connection.
//!
//! An [`IpcChannel`] wraps a stream socket and speaks frames. Sends are
//! buffered: `try_send` queues and pushes what the socket accepts without
//! waiting (the would-block outcome is surfaced so capture can throttle a
//! slow client instead of stalling), `send` drives the buffer to empty.
//! On Unix transports a frame may carry one descriptor as ancillary data;
//! descriptors received mid-stream are queued and attached to the next
//! frame decoded, which is exact for the strict request/reply exchanges
//! that use them.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use bytes::BytesMut;
use sendfd::{RecvWithFd, SendWithFd};
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::{TcpStream, UnixStream};

use crate::codec::{decode_frame, encode_frame};
use crate::error::Error;
use crate::message::{Frame, MessageType};

const READ_CHUNK: usize = 16 * 1024;
const MAX_RECV_FDS: usize = 8;

/// The underlying socket of a channel.
#[derive(Debug)]
pub(crate) enum Transport {
    /// Unix-domain stream, supports descriptor passing.
    Unix(UnixStream),
    /// TCP stream for cross-host peers.
    Tcp(TcpStream),
}

/// A connected bus endpoint.
#[derive(Debug)]
pub struct IpcChannel {
    transport: Transport,
    send_buf: BytesMut,
    recv_buf: BytesMut,
    pending_fds: VecDeque<OwnedFd>,
}

impl IpcChannel {
    /// Wraps a connected Unix stream.
    #[must_use]
    pub fn from_unix(stream: UnixStream) -> Self {
        IpcChannel {
            transport: Transport::Unix(stream),
            send_buf: BytesMut::new(),
            recv_buf: BytesMut::new(),
            pending_fds: VecDeque::new(),
        }
    }

    /// Wraps a connected TCP stream.
    #[must_use]
    pub fn from_tcp(stream: TcpStream) -> Self {
        IpcChannel {
            transport: Transport::Tcp(stream),
            send_buf: BytesMut::new(),
            recv_buf: BytesMut::new(),
            pending_fds: VecDeque::new(),
        }
    }

    /// True when descriptor passing is available.
    #[must_use]
    pub fn supports_fds(&self) -> bool {
        matches!(self.transport, Transport::Unix(_))
    }

    /// Queues a frame and pushes as much buffered data as the socket
    /// accepts right now. Returns `WouldBlock` (as [`Error::Io`]) when the
    /// socket is full; the frame stays queued and a later `send` or
    /// `flush` will finish it.
    pub fn try_send(&mut self, ty: MessageType, payload: &[u8]) -> Result<(), Error> {
        encode_frame(ty, payload, &mut self.send_buf)?;
        self.try_flush()
    }

    /// Sends a frame, waiting until the socket takes everything queued.
    pub async fn send(&mut self, ty: MessageType, payload: &[u8]) -> Result<(), Error> {
        encode_frame(ty, payload, &mut self.send_buf)?;
        self.flush().await
    }

    /// Sends a frame with an attached descriptor (Unix transports only).
    pub async fn send_with_fd(
        &mut self,
        ty: MessageType,
        payload: &[u8],
        fd: BorrowedFd<'_>,
    ) -> Result<(), Error> {
        let Transport::Unix(_) = self.transport else {
            return Err(Error::FdNotSupported);
        };
        // the descriptor must ride on the first byte of its own frame
        self.flush().await?;
        encode_frame(ty, payload, &mut self.send_buf)?;
        let raw = [fd.as_raw_fd()];
        let mut fd_pending = true;
        let Transport::Unix(stream) = &self.transport else {
            return Err(Error::FdNotSupported);
        };
        while !self.send_buf.is_empty() {
            stream.writable().await?;
            let fds: &[RawFd] = if fd_pending { &raw } else { &[] };
            match stream.send_with_fd(&self.send_buf, fds) {
                Ok(n) => {
                    let _ = self.send_buf.split_to(n);
                    if n > 0 {
                        fd_pending = false;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    /// Pushes buffered bytes without waiting.
    pub fn try_flush(&mut self) -> Result<(), Error> {
        while !self.send_buf.is_empty() {
            let n = match &self.transport {
                Transport::Unix(s) => s.try_write(&self.send_buf),
                Transport::Tcp(s) => s.try_write(&self.send_buf),
            };
            match n {
                Ok(n) => {
                    let _ = self.send_buf.split_to(n);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    /// Drives the send buffer to empty.
    pub async fn flush(&mut self) -> Result<(), Error> {
        while !self.send_buf.is_empty() {
            match &mut self.transport {
                Transport::Unix(s) => {
                    s.writable().await?;
                    match s.try_write(&self.send_buf) {
                        Ok(n) => {
                            let _ = self.send_buf.split_to(n);
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(e) => return Err(Error::Io(e)),
                    }
                }
                Transport::Tcp(s) => {
                    let buf = self.send_buf.split();
                    s.write_all(&buf).await?;
                }
            }
        }
        Ok(())
    }

    /// Bytes queued but not yet accepted by the socket.
    #[must_use]
    pub fn backlog(&self) -> usize {
        self.send_buf.len()
    }

    /// Receives the next frame, waiting as long as it takes.
    ///
    /// Returns [`Error::PeerGone`] when the peer closed the connection.
    pub async fn recv(&mut self) -> Result<Frame, Error> {
        loop {
            if let Some((ty, payload)) = decode_frame(&mut self.recv_buf)? {
                let fd = self.pending_fds.pop_front();
                return Ok(Frame { ty, payload, fd });
            }
            if !self.fill_recv_buf().await? {
                return Err(Error::PeerGone);
            }
        }
    }

    /// Like [`IpcChannel::recv`] with a deadline.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Frame, Error> {
        tokio::time::timeout(timeout, self.recv()).await.map_err(|_| Error::Timeout)?
    }

    /// Synchronous request/reply pair: sends one frame and returns the
    /// next frame the peer sends back.
    pub async fn wait_reply(&mut self, ty: MessageType, payload: &[u8]) -> Result<Frame, Error> {
        self.send(ty, payload).await?;
        self.recv().await
    }

    /// Reads more bytes (and any riding descriptors) into the receive
    /// buffer. Returns false on EOF.
    async fn fill_recv_buf(&mut self) -> Result<bool, Error> {
        match &mut self.transport {
            Transport::Unix(stream) => loop {
                let _ = stream.ready(Interest::READABLE).await?;
                let mut buf = [0u8; READ_CHUNK];
                let mut fds: [RawFd; MAX_RECV_FDS] = [-1; MAX_RECV_FDS];
                match stream.recv_with_fd(&mut buf, &mut fds) {
                    Ok((0, 0)) => return Ok(false),
                    Ok((nbytes, nfds)) => {
                        self.recv_buf.extend_from_slice(&buf[..nbytes]);
                        for fd in &fds[..nfds] {
                            // SAFETY: the kernel just handed us this
                            // descriptor; we are its only owner.
                            self.pending_fds.push_back(unsafe { OwnedFd::from_raw_fd(*fd) });
                        }
                        return Ok(true);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(Error::Io(e)),
                }
            },
            Transport::Tcp(stream) => {
                let mut buf = [0u8; READ_CHUNK];
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    return Ok(false);
                }
                self.recv_buf.extend_from_slice(&buf[..n]);
                Ok(true)
            }
        }
    }
}
