// SPDX-License-Identifier: BSD-3-Clause

//! On-disk stream layout and recovery.
//!
//! A stream directory holds segment files named by the 10-digit stream
//! offset of their first byte, plus a `head` sidecar stamping the last
//! committed offset (u64 LE followed by its crc32). Segments are capped
//! at the configured maximum but may end earlier: the writer never splits
//! an append across segments, so every segment starts at an append
//! boundary.
//!
//! Recovery trusts the sidecar: bytes past the stamped head are leftovers
//! of an interrupted writer and are truncated away; a missing or corrupt
//! sidecar falls back to treating everything on disk as committed.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::Error;

const HEAD_FILE: &str = "head";
const HEAD_TMP: &str = "head.tmp";

/// One segment file.
#[derive(Debug)]
pub struct Segment {
    /// Stream offset of the segment's first byte; also its file name.
    pub start: u64,
    /// Bytes currently allocated in the file (committed or reserved).
    pub len: u64,
    /// The open file.
    pub file: File,
}

/// A stream directory with its segments and committed head.
#[derive(Debug)]
pub struct StreamDir {
    name: String,
    dir: PathBuf,
    segment_cap: u64,
    segments: Vec<Segment>,
    head: u64,
}

fn io_err(path: &Path, source: std::io::Error) -> Error {
    Error::Io { path: path.display().to_string(), source }
}

fn segment_file_name(start: u64) -> String {
    format!("{start:010}")
}

impl StreamDir {
    /// Opens or creates the stream directory under `basedir` and runs
    /// recovery.
    pub fn open(basedir: &Path, name: &str, segment_cap: u64) -> Result<Self, Error> {
        let dir = basedir.join(name);
        std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

        let mut segments = Vec::new();
        let entries = std::fs::read_dir(&dir).map_err(|e| io_err(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&dir, e))?;
            let fname = entry.file_name();
            let Some(fname) = fname.to_str() else { continue };
            if fname.len() != 10 || !fname.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            let start: u64 = fname.parse().map_err(|_| Error::Io {
                path: dir.display().to_string(),
                source: std::io::Error::other("unparseable segment name"),
            })?;
            let path = entry.path();
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| io_err(&path, e))?;
            let len = file.metadata().map_err(|e| io_err(&path, e))?.len();
            segments.push(Segment { start, len, file });
        }
        segments.sort_by_key(|s| s.start);

        let mut stream = StreamDir {
            name: name.to_owned(),
            dir,
            segment_cap,
            segments,
            head: 0,
        };
        stream.recover()?;
        Ok(stream)
    }

    fn recover(&mut self) -> Result<(), Error> {
        let disk_end = self.segments.last().map_or(0, |s| s.start + s.len);
        let stamped = self.read_head_stamp();
        let head = match stamped {
            Some(h) if h <= disk_end => h,
            Some(h) => {
                warn!(stream = %self.name, stamped = h, disk_end, "head stamp past data, clamping");
                disk_end
            }
            None => disk_end,
        };

        // a segment with no committed byte (start >= head) is writer
        // leftover; drop it, then truncate the boundary segment
        while self.segments.last().is_some_and(|s| s.start >= head) {
            if let Some(last) = self.segments.pop() {
                let path = self.dir.join(segment_file_name(last.start));
                debug!(stream = %self.name, segment = last.start, "removing uncommitted segment");
                std::fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
            }
        }
        if let Some(last) = self.segments.last_mut() {
            let committed = head - last.start;
            if last.len > committed {
                last.file.set_len(committed).map_err(|e| {
                    io_err(&self.dir.join(segment_file_name(last.start)), e)
                })?;
                last.len = committed;
            }
        }
        self.head = head;
        Ok(())
    }

    fn read_head_stamp(&self) -> Option<u64> {
        let mut file = File::open(self.dir.join(HEAD_FILE)).ok()?;
        let mut buf = [0u8; 12];
        file.read_exact(&mut buf).ok()?;
        let value = u64::from_le_bytes(buf[..8].try_into().ok()?);
        let crc = u32::from_le_bytes(buf[8..].try_into().ok()?);
        if crc32fast::hash(&buf[..8]) != crc {
            warn!(stream = %self.name, "corrupt head stamp, ignoring");
            return None;
        }
        Some(value)
    }

    fn write_head_stamp(&self) -> Result<(), Error> {
        let mut buf = [0u8; 12];
        buf[..8].copy_from_slice(&self.head.to_le_bytes());
        let crc = crc32fast::hash(&buf[..8]);
        buf[8..].copy_from_slice(&crc.to_le_bytes());
        let tmp = self.dir.join(HEAD_TMP);
        std::fs::write(&tmp, buf).map_err(|e| io_err(&tmp, e))?;
        let dst = self.dir.join(HEAD_FILE);
        std::fs::rename(&tmp, &dst).map_err(|e| io_err(&dst, e))?;
        Ok(())
    }

    /// The stream name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Committed head: everything below this offset is stable.
    #[must_use]
    pub fn head(&self) -> u64 {
        self.head
    }

    /// Number of segment files.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Grants the writer an appendable span at the head.
    ///
    /// Rotates to a fresh segment when the tail is full or the request
    /// would not fit the remaining capacity (appends never straddle
    /// segments). Returns the backing file, the segment's start offset,
    /// the span's offset inside the segment and the granted length.
    pub fn writer_region(&mut self, offset: u64, len: u64) -> Result<(&File, u64, u64, u64), Error> {
        if offset != self.head {
            return Err(Error::BadOffset { offset, head: self.head });
        }
        let needs_rotation = match self.segments.last() {
            None => true,
            Some(tail) => {
                let used = self.head - tail.start;
                used >= self.segment_cap || len.min(self.segment_cap) > self.segment_cap - used
            }
        };
        if needs_rotation {
            self.rotate()?;
        }
        let cap = self.segment_cap;
        let head = self.head;
        let dir = self.dir.clone();
        let tail = self.segments.last_mut().ok_or_else(|| Error::Io {
            path: dir.display().to_string(),
            source: std::io::Error::other("no tail segment after rotation"),
        })?;
        let seg_ofs = head - tail.start;
        let grant = len.min(cap - seg_ofs);
        let needed = seg_ofs + grant;
        if tail.len < needed {
            tail.file
                .set_len(needed)
                .map_err(|e| io_err(&dir.join(segment_file_name(tail.start)), e))?;
            tail.len = needed;
        }
        Ok((&tail.file, tail.start, seg_ofs, grant))
    }

    fn rotate(&mut self) -> Result<(), Error> {
        // reserved-but-uncommitted tail bytes die with the rotation
        if let Some(last) = self.segments.last_mut() {
            let committed = self.head - last.start;
            if last.len > committed {
                last.file.set_len(committed).map_err(|e| {
                    io_err(&self.dir.join(segment_file_name(last.start)), e)
                })?;
                last.len = committed;
            }
        }
        let path = self.dir.join(segment_file_name(self.head));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        debug!(stream = %self.name, start = self.head, "new segment");
        self.segments.push(Segment { start: self.head, len: 0, file });
        Ok(())
    }

    /// Grants a reader a committed span at or after `offset`.
    ///
    /// Returns `None` when no committed data exists at or past `offset`.
    pub fn reader_region(&self, offset: u64, len: u64) -> Option<(&File, u64, u64, u64)> {
        let (valid, _) = self.seek(offset)?;
        let seg = self
            .segments
            .iter()
            .rev()
            .find(|s| s.start <= valid)?;
        let committed_end = (seg.start + seg.len).min(self.head);
        let seg_ofs = valid - seg.start;
        let grant = len.min(committed_end - valid);
        Some((&seg.file, seg.start, seg_ofs, grant))
    }

    /// The smallest committed offset at or after `offset`, together with
    /// the start of the segment containing it. `None` when the stream has
    /// no such position yet.
    #[must_use]
    pub fn seek(&self, offset: u64) -> Option<(u64, u64)> {
        if offset >= self.head {
            return None;
        }
        let first = self.segments.first()?;
        let valid = offset.max(first.start);
        if valid >= self.head {
            return None;
        }
        let seg = self.segments.iter().rev().find(|s| s.start <= valid)?;
        Some((valid, seg.start))
    }

    /// Writer commit: advances the head to `offset` and stamps it.
    ///
    /// The head never moves backwards; a commit past the allocated tail is
    /// rejected.
    pub fn inform(&mut self, offset: u64) -> Result<u64, Error> {
        if offset <= self.head {
            return Ok(self.head);
        }
        let allocated_end = self.segments.last().map_or(0, |s| s.start + s.len);
        if offset > allocated_end {
            return Err(Error::BadOffset { offset, head: self.head });
        }
        self.head = offset;
        self.write_head_stamp()?;
        Ok(self.head)
    }

    /// Truncates reserved-but-uncommitted bytes off the tail segment.
    /// Called when the writer closes with the truncate flag, and implied
    /// by rotation and recovery.
    pub fn truncate_to_head(&mut self) -> Result<(), Error> {
        if let Some(last) = self.segments.last_mut() {
            let committed = self.head.saturating_sub(last.start);
            if last.len > committed {
                last.file.set_len(committed).map_err(|e| {
                    io_err(&self.dir.join(segment_file_name(last.start)), e)
                })?;
                last.len = committed;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(missing_docs, clippy::unwrap_used)]
    use std::os::unix::fs::FileExt;

    use pretty_assertions::assert_eq;

    use super::*;

    fn write_records(stream: &mut StreamDir, count: usize, size: usize) {
        for _ in 0..count {
            let head = stream.head();
            let (file, _seg_start, seg_ofs, grant) =
                stream.writer_region(head, size as u64).unwrap();
            assert!(grant >= size as u64, "short grant {grant}");
            let data = vec![0xabu8; size];
            file.write_all_at(&data, seg_ofs).unwrap();
            let _ = stream.inform(head + size as u64).unwrap();
        }
    }

    #[test]
    fn rotation_after_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = StreamDir::open(dir.path(), "ports", 1024).unwrap();
        write_records(&mut s, 10, 200);
        assert_eq!(s.head(), 2000);
        // 5 records fill 1000 of 1024 bytes; the 6th record rotates
        assert_eq!(s.segment_count(), 2);
        assert!(dir.path().join("ports/0000000000").exists());
        assert!(dir.path().join("ports/0000001000").exists());
    }

    #[test]
    fn seek_lands_on_committed_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = StreamDir::open(dir.path(), "ports", 1024).unwrap();
        write_records(&mut s, 10, 200);

        let (valid, seg_start) = s.seek(1050).unwrap();
        assert_eq!(valid, 1050);
        assert_eq!(seg_start, 1000);
        assert!(s.seek(2000).is_none(), "head itself is not readable yet");
        assert!(s.seek(9999).is_none());
    }

    #[test]
    fn reader_region_stops_at_segment_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = StreamDir::open(dir.path(), "x", 1024).unwrap();
        write_records(&mut s, 10, 200);

        let (_f, seg_start, seg_ofs, grant) = s.reader_region(900, 4096).unwrap();
        assert_eq!(seg_start, 0);
        assert_eq!(seg_ofs, 900);
        assert_eq!(grant, 100, "first segment committed 1000 bytes");
    }

    #[test]
    fn recovery_truncates_uncommitted_tail() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut s = StreamDir::open(dir.path(), "x", 4096).unwrap();
            // reserve 500 bytes but only commit 300
            let (file, _, seg_ofs, _) = s.writer_region(0, 500).unwrap();
            file.write_all_at(&[1u8; 500], seg_ofs).unwrap();
            let _ = s.inform(300).unwrap();
        }
        let s = StreamDir::open(dir.path(), "x", 4096).unwrap();
        assert_eq!(s.head(), 300);
        let meta = std::fs::metadata(dir.path().join("x/0000000000")).unwrap();
        assert_eq!(meta.len(), 300);
    }

    #[test]
    fn recovery_without_stamp_keeps_disk_contents() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut s = StreamDir::open(dir.path(), "x", 4096).unwrap();
            write_records(&mut s, 2, 100);
        }
        std::fs::remove_file(dir.path().join("x/head")).unwrap();
        let s = StreamDir::open(dir.path(), "x", 4096).unwrap();
        assert_eq!(s.head(), 200);
    }

    #[test]
    fn recovery_drops_wholly_uncommitted_segment() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut s = StreamDir::open(dir.path(), "x", 256).unwrap();
            write_records(&mut s, 2, 200); // two segments of 200
            // reserve a third segment without committing anything to it
            let (_f, seg_start, _, _) = s.writer_region(400, 100).unwrap();
            assert_eq!(seg_start, 400);
        }
        let s = StreamDir::open(dir.path(), "x", 256).unwrap();
        assert_eq!(s.head(), 400);
        assert_eq!(s.segment_count(), 2);
        assert!(!dir.path().join("x/0000000400").exists());
    }

    #[test]
    fn inform_never_regresses() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = StreamDir::open(dir.path(), "x", 4096).unwrap();
        write_records(&mut s, 1, 100);
        assert_eq!(s.inform(50).unwrap(), 100);
        assert!(matches!(s.inform(100_000), Err(Error::BadOffset { .. })));
    }

    #[test]
    fn writer_region_requires_head_offset() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = StreamDir::open(dir.path(), "x", 4096).unwrap();
        write_records(&mut s, 1, 100);
        assert!(matches!(s.writer_region(0, 10), Err(Error::BadOffset { .. })));
    }
}
