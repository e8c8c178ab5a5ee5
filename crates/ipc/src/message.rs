// SPDX-License-Identifier: BSD-3-Clause

//! The closed message set and its structured payloads.

use std::os::fd::OwnedFd;

use bytes::Bytes;
use como_shmem::ShmBlock;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::Error;

/// Maximum payload length of one frame.
pub const MAX_PAYLOAD: usize = 4096;

/// Classes a peer can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerClass {
    /// The supervisor process.
    Supervisor,
    /// The capture process.
    Capture,
    /// The export process.
    Export,
    /// The storage process.
    Storage,
    /// A query worker or remote query client.
    Query,
}

impl PeerClass {
    /// Conventional socket file name for a listening peer of this class.
    #[must_use]
    pub fn socket_name(&self) -> &'static str {
        match self {
            PeerClass::Supervisor => "supervisor.sock",
            PeerClass::Capture => "capture.sock",
            PeerClass::Export => "export.sock",
            PeerClass::Storage => "storage.sock",
            PeerClass::Query => "query.sock",
        }
    }
}

/// Every message type the bus carries. The set is closed: an unknown code
/// on the wire is a protocol error and closes the offending connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Generic failure reply carrying an [`ErrorMsg`].
    Error,
    /// Connection introduction carrying a [`Hello`].
    Hello,
    /// Barrier used during startup handshakes.
    Sync,
    /// Positive acknowledgment of a control request.
    Ack,
    /// Liveness probe; echoed back verbatim.
    Echo,
    /// Enable a module ([`ModuleCtl`]).
    ModuleAdd,
    /// Disable a module ([`ModuleCtl`]).
    ModuleDel,
    /// Start packet delivery to a module ([`ModuleCtl`]).
    ModuleStart,
    /// Pause the pipeline (used while the supervisor reconfigures).
    Freeze,
    /// A flow-table snapshot handoff from capture to export ([`FlushMsg`]).
    Flush,
    /// Export finished with a snapshot; capture may reclaim it ([`DoneMsg`]).
    Done,
    /// Orderly shutdown request.
    Exit,

    /// Storage: no data at or after the requested offset.
    SNodata,
    /// Storage: open a stream ([`SOpenMsg`], replied with [`SOpenRes`]).
    SOpen,
    /// Storage: close a handle ([`SCloseMsg`]).
    SClose,
    /// Storage: request a region ([`SRegionMsg`], replied with
    /// [`SRegionRes`] plus the segment descriptor).
    SRegion,
    /// Storage: reposition a reader ([`SSeekMsg`], replied with
    /// [`SSeekRes`] or [`MessageType::SNodata`]).
    SSeek,
    /// Storage: writer commit ([`SInformMsg`]).
    SInform,

    /// Capture client: refusal reply.
    CcaError,
    /// Capture client: subscribe ([`CcaOpenMsg`]).
    CcaOpen,
    /// Capture client: subscription granted ([`CcaOpenRes`] plus the
    /// arena memfd).
    CcaOpenRes,
    /// Capture client: unsubscribe.
    CcaClose,
    /// Capture client: a batch is ready ([`CcaNewBatch`]).
    CcaNewBatch,
    /// Capture client: batch consumed ([`CcaAckBatch`]).
    CcaAckBatch,
}

impl MessageType {
    /// Wire code of this type.
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            MessageType::Error => 0,
            MessageType::Hello => 1,
            MessageType::Sync => 2,
            MessageType::Ack => 3,
            MessageType::Echo => 4,
            MessageType::ModuleAdd => 5,
            MessageType::ModuleDel => 6,
            MessageType::ModuleStart => 7,
            MessageType::Freeze => 8,
            MessageType::Flush => 9,
            MessageType::Done => 10,
            MessageType::Exit => 11,
            MessageType::SNodata => 12,
            MessageType::SOpen => 13,
            MessageType::SClose => 14,
            MessageType::SRegion => 15,
            MessageType::SSeek => 16,
            MessageType::SInform => 17,
            MessageType::CcaError => 18,
            MessageType::CcaOpen => 19,
            MessageType::CcaOpenRes => 20,
            MessageType::CcaClose => 21,
            MessageType::CcaNewBatch => 22,
            MessageType::CcaAckBatch => 23,
        }
    }

    /// Decodes a wire code.
    pub fn from_code(code: u16) -> Result<Self, Error> {
        Ok(match code {
            0 => MessageType::Error,
            1 => MessageType::Hello,
            2 => MessageType::Sync,
            3 => MessageType::Ack,
            4 => MessageType::Echo,
            5 => MessageType::ModuleAdd,
            6 => MessageType::ModuleDel,
            7 => MessageType::ModuleStart,
            8 => MessageType::Freeze,
            9 => MessageType::Flush,
            10 => MessageType::Done,
            11 => MessageType::Exit,
            12 => MessageType::SNodata,
            13 => MessageType::SOpen,
            14 => MessageType::SClose,
            15 => MessageType::SRegion,
            16 => MessageType::SSeek,
            17 => MessageType::SInform,
            18 => MessageType::CcaError,
            19 => MessageType::CcaOpen,
            20 => MessageType::CcaOpenRes,
            21 => MessageType::CcaClose,
            22 => MessageType::CcaNewBatch,
            23 => MessageType::CcaAckBatch,
            other => return Err(Error::UnknownType(other)),
        })
    }
}

/// One received message.
#[derive(Debug)]
pub struct Frame {
    /// The message type.
    pub ty: MessageType,
    /// Raw payload bytes.
    pub payload: Bytes,
    /// Ancillary file descriptor, when the sender attached one.
    pub fd: Option<OwnedFd>,
}

impl Frame {
    /// Decodes the payload as the given structured message.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Error> {
        bincode::deserialize(&self.payload).map_err(|source| Error::Payload { ty: self.ty, source })
    }
}

/// Serializes a structured payload for sending.
pub fn encode<T: Serialize>(msg: &T) -> Result<Bytes, Error> {
    let buf = bincode::serialize(msg).map_err(|source| Error::Payload {
        ty: MessageType::Error,
        source,
    })?;
    if buf.len() > MAX_PAYLOAD {
        return Err(Error::Oversize { len: buf.len(), max: MAX_PAYLOAD });
    }
    Ok(Bytes::from(buf))
}

/// Connection introduction; always the first frame on a connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Hello {
    /// The class of the connecting peer.
    pub class: PeerClass,
}

/// Generic failure payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMsg {
    /// Human-readable reason, also logged by the sender.
    pub reason: String,
}

/// Module enable/disable/start control.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModuleCtl {
    /// Dense module id from the configuration order.
    pub module: u32,
}

/// Stream open modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenMode {
    /// Appending writer; `REGION` blocks while the tail is contended.
    WriterBlock,
    /// Appending writer; contention surfaces as an error.
    WriterNonBlock,
    /// Reader that parks on `SEEK`/`REGION` until data arrives.
    ReaderBlock,
    /// Reader that gets `SNodata` instead of parking.
    ReaderNonBlock,
}

impl OpenMode {
    /// True for the two writer modes.
    #[must_use]
    pub fn is_writer(&self) -> bool {
        matches!(self, OpenMode::WriterBlock | OpenMode::WriterNonBlock)
    }

    /// True for the two parking modes.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        matches!(self, OpenMode::WriterBlock | OpenMode::ReaderBlock)
    }
}

/// Storage `OPEN` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SOpenMsg {
    /// Stream path relative to the storage base directory.
    pub path: String,
    /// Access mode.
    pub mode: OpenMode,
    /// Writer-side hint of the expected total stream size; advisory.
    pub size: u64,
}

/// Storage `OPEN` success reply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SOpenRes {
    /// Handle to use in subsequent requests on this connection.
    pub handle: u32,
    /// Current stream head (committed bytes since stream creation).
    pub offset: u64,
}

/// Storage `REGION` request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SRegionMsg {
    /// Stream handle.
    pub handle: u32,
    /// Absolute stream offset the region should start at.
    pub offset: u64,
    /// Requested length; the grant may be shorter at a segment boundary.
    pub len: u64,
}

/// Storage `REGION` success reply; the frame carries the segment's file
/// descriptor so the client can map the span itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SRegionRes {
    /// Absolute stream offset the granted region starts at.
    pub offset: u64,
    /// Offset of the region inside the attached segment file.
    pub seg_ofs: u64,
    /// Granted length; never spans a segment boundary.
    pub len: u64,
}

/// Storage `SEEK` request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SSeekMsg {
    /// Stream handle.
    pub handle: u32,
    /// Requested position.
    pub offset: u64,
}

/// Storage `SEEK` success reply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SSeekRes {
    /// Smallest valid offset at or after the requested one.
    pub offset: u64,
    /// Start of the segment containing that offset. Segment starts are
    /// append boundaries, which readers that scan self-describing records
    /// use to align themselves.
    pub seg_start: u64,
}

/// Storage `INFORM` (writer commit).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SInformMsg {
    /// Stream handle.
    pub handle: u32,
    /// New committed head; must not decrease.
    pub offset: u64,
}

/// Storage `CLOSE`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SCloseMsg {
    /// Stream handle.
    pub handle: u32,
    /// Writer only: truncate the trailing segment to the committed head.
    pub truncate: bool,
}

/// Capture client subscription request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CcaOpenMsg {
    /// Requested sampling rate `N` (deliver roughly one packet in `N`);
    /// `1` means every packet.
    pub sampling: u32,
}

/// Capture client subscription grant; the frame carries the arena memfd.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CcaOpenRes {
    /// Client id; bit position in every batch's reference mask.
    pub id: u32,
}

/// Batch announcement to one capture client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CcaNewBatch {
    /// The receiving client's id.
    pub id: u32,
    /// Arena block holding the serialized batch descriptor.
    pub batch: ShmBlock,
}

/// Batch acknowledgment from one capture client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CcaAckBatch {
    /// The acknowledging client's id.
    pub id: u32,
    /// The batch descriptor block being released.
    pub batch: ShmBlock,
}

/// Flow-table snapshot handoff from capture to export.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FlushMsg {
    /// Module id the snapshot belongs to.
    pub module: u32,
    /// Start of the flush interval, as raw timestamp bits.
    pub ivl_start: u64,
    /// Arena block holding the record-offset table of the snapshot.
    pub snapshot: ShmBlock,
    /// Number of records in the snapshot.
    pub count: u32,
}

/// Snapshot completion notice from export back to capture.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DoneMsg {
    /// Module id the snapshot belonged to.
    pub module: u32,
    /// The snapshot block being handed back for bulk reclamation.
    pub snapshot: ShmBlock,
}

#[cfg(test)]
mod tests {
    #![allow(missing_docs, clippy::unwrap_used)]
    use super::*;

    #[test]
    fn type_codes_roundtrip() {
        for code in 0..24u16 {
            let ty = MessageType::from_code(code).unwrap();
            assert_eq!(ty.code(), code);
        }
        assert!(matches!(MessageType::from_code(999), Err(Error::UnknownType(999))));
    }

    #[test]
    fn structured_payload_roundtrip() {
        let msg = SOpenMsg { path: "counter".to_owned(), mode: OpenMode::WriterBlock, size: 0 };
        let bytes = encode(&msg).unwrap();
        let frame = Frame { ty: MessageType::SOpen, payload: bytes, fd: None };
        let back: SOpenMsg = frame.decode().unwrap();
        assert_eq!(back.path, "counter");
        assert_eq!(back.mode, OpenMode::WriterBlock);
    }
}
