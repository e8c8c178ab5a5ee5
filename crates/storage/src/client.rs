// SPDX-License-Identifier: BSD-3-Clause

//! Client side of the storage protocol.
//!
//! A [`StorageClient`] wraps one bus connection to the storage process and
//! exposes open/region/seek/inform/close. Region grants arrive as a
//! segment file descriptor plus offsets; the client maps the span itself
//! (page-aligned underneath, exact span exposed) so reads and writes are
//! zero-copy against the segment file.

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use como_ipc::message::{
    ErrorMsg, MessageType, OpenMode, SCloseMsg, SInformMsg, SOpenMsg, SOpenRes, SRegionMsg,
    SRegionRes, SSeekMsg, SSeekRes, encode,
};
use como_ipc::{Frame, IpcChannel, PeerClass, connect_unix};
use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::error::Error;

/// An open stream on the server, bound to one client connection.
#[derive(Debug, Clone, Copy)]
pub struct StreamHandle {
    /// Server-assigned handle id.
    pub handle: u32,
    /// Committed head at open time.
    pub offset: u64,
    mode: OpenMode,
}

impl StreamHandle {
    /// The mode the stream was opened with.
    #[must_use]
    pub fn mode(&self) -> OpenMode {
        self.mode
    }
}

/// Outcome of a reader seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekPos {
    /// Smallest valid offset at or after the requested one.
    pub offset: u64,
    /// Start of the segment containing it (an append boundary).
    pub seg_start: u64,
}

/// A zero-copy view of stream bytes.
///
/// The view stays valid until the next `region`/`seek`/`close` on the same
/// handle, which is enforced here by value: fetching a new region consumes
/// nothing but the old one should be dropped first by convention.
#[derive(Debug)]
pub struct Region {
    map: RegionMap,
    data_ofs: usize,
    len: usize,
    offset: u64,
}

#[derive(Debug)]
enum RegionMap {
    Read(Mmap),
    Write(MmapMut),
}

impl Region {
    fn new(res: SRegionRes, file: &File, writable: bool) -> Result<Self, Error> {
        let page = page_size() as u64;
        let aligned = res.seg_ofs - (res.seg_ofs % page);
        let data_ofs = (res.seg_ofs - aligned) as usize;
        let map_len = data_ofs + res.len as usize;
        let map = if writable {
            // SAFETY: the server sized the file to cover the span; the
            // single-writer protocol keeps this mapping exclusive.
            RegionMap::Write(unsafe {
                MmapOptions::new().offset(aligned).len(map_len).map_mut(file).map_err(|source| {
                    Error::Io { path: "<region mmap>".to_owned(), source }
                })?
            })
        } else {
            // SAFETY: committed bytes are stable for the stream's life.
            RegionMap::Read(unsafe {
                MmapOptions::new().offset(aligned).len(map_len).map(file).map_err(|source| {
                    Error::Io { path: "<region mmap>".to_owned(), source }
                })?
            })
        };
        Ok(Region { map, data_ofs, len: res.len as usize, offset: res.offset })
    }

    /// Absolute stream offset of the first byte of the view.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Length of the view in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for an empty grant.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The bytes of the view.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match &self.map {
            RegionMap::Read(m) => &m[self.data_ofs..self.data_ofs + self.len],
            RegionMap::Write(m) => &m[self.data_ofs..self.data_ofs + self.len],
        }
    }

    /// Mutable bytes; only meaningful on writer regions.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.map {
            RegionMap::Write(m) => &mut m[self.data_ofs..self.data_ofs + self.len],
            RegionMap::Read(_) => &mut [],
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n <= 0 { 4096 } else { n as usize }
}

/// One connection to the storage process.
#[derive(Debug)]
pub struct StorageClient {
    chan: IpcChannel,
}

impl StorageClient {
    /// Connects to the storage socket under `ipc_dir`, introducing
    /// ourselves as `class`.
    pub async fn connect(ipc_dir: &Path, class: PeerClass) -> Result<Self, Error> {
        let (chan, _) = connect_unix(ipc_dir, PeerClass::Storage, class).await?;
        Ok(StorageClient { chan })
    }

    /// Wraps an already-established channel (used by inline mode).
    #[must_use]
    pub fn from_channel(chan: IpcChannel) -> Self {
        StorageClient { chan }
    }

    /// Opens a stream. `size` is an advisory total-size hint for writers.
    pub async fn open(
        &mut self,
        path: &str,
        mode: OpenMode,
        size: u64,
    ) -> Result<StreamHandle, Error> {
        let msg = SOpenMsg { path: path.to_owned(), mode, size };
        let reply = self.chan.wait_reply(MessageType::SOpen, &encode(&msg)?).await?;
        let res: SOpenRes = expect(reply, MessageType::SOpen)?.decode()?;
        Ok(StreamHandle { handle: res.handle, offset: res.offset, mode })
    }

    /// Requests a region of the stream. For writers this must start at the
    /// head; for readers anywhere at or below it. Returns `None` when a
    /// nonblocking reader is past the committed data.
    pub async fn region(
        &mut self,
        handle: StreamHandle,
        offset: u64,
        len: u64,
    ) -> Result<Option<Region>, Error> {
        let msg = SRegionMsg { handle: handle.handle, offset, len };
        let reply = self.chan.wait_reply(MessageType::SRegion, &encode(&msg)?).await?;
        if reply.ty == MessageType::SNodata {
            return Ok(None);
        }
        let frame = expect(reply, MessageType::SRegion)?;
        let res: SRegionRes = frame.decode()?;
        let fd = frame.fd.ok_or(Error::MissingFd)?;
        let file = File::from(fd);
        Ok(Some(Region::new(res, &file, handle.mode.is_writer())?))
    }

    /// Repositions a reader. Returns `None` for `NODATA` (nonblocking
    /// readers only; blocking readers park instead).
    pub async fn seek(
        &mut self,
        handle: StreamHandle,
        offset: u64,
    ) -> Result<Option<SeekPos>, Error> {
        let msg = SSeekMsg { handle: handle.handle, offset };
        let reply = self.chan.wait_reply(MessageType::SSeek, &encode(&msg)?).await?;
        if reply.ty == MessageType::SNodata {
            return Ok(None);
        }
        let res: SSeekRes = expect(reply, MessageType::SSeek)?.decode()?;
        Ok(Some(SeekPos { offset: res.offset, seg_start: res.seg_start }))
    }

    /// Writer commit up to `offset`; readers blocked below it wake up.
    pub async fn inform(&mut self, handle: StreamHandle, offset: u64) -> Result<(), Error> {
        let msg = SInformMsg { handle: handle.handle, offset };
        let reply = self.chan.wait_reply(MessageType::SInform, &encode(&msg)?).await?;
        let _ = expect(reply, MessageType::Ack)?;
        Ok(())
    }

    /// Releases the handle; writers may request tail truncation.
    pub async fn close(&mut self, handle: StreamHandle, truncate: bool) -> Result<(), Error> {
        let msg = SCloseMsg { handle: handle.handle, truncate };
        let reply = self.chan.wait_reply(MessageType::SClose, &encode(&msg)?).await?;
        let _ = expect(reply, MessageType::Ack)?;
        Ok(())
    }

    /// Region request with a deadline, for probing in tests and status
    /// checks.
    pub async fn region_timeout(
        &mut self,
        handle: StreamHandle,
        offset: u64,
        len: u64,
        timeout: Duration,
    ) -> Result<Option<Region>, Error> {
        match tokio::time::timeout(timeout, self.region(handle, offset, len)).await {
            Ok(r) => r,
            Err(_) => Err(Error::Ipc(como_ipc::Error::Timeout)),
        }
    }
}

/// Checks a reply frame's type, turning `ERROR` replies into
/// [`Error::Refused`].
fn expect(frame: Frame, want: MessageType) -> Result<Frame, Error> {
    if frame.ty == MessageType::Error {
        let reason = frame
            .decode::<ErrorMsg>()
            .map(|e| e.reason)
            .unwrap_or_else(|_| "unspecified".to_owned());
        return Err(Error::Refused { reason });
    }
    if frame.ty != want {
        return Err(Error::Ipc(como_ipc::Error::UnexpectedReply {
            expected: want,
            got: frame.ty,
        }));
    }
    Ok(frame)
}
