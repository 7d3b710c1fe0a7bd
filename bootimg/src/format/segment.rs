// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Seek, SeekFrom, Write};

use thiserror::Error;
use tracing::warn;

use crate::{
    entry::{Entry, EntryType},
    format::padding,
    stream::{read_retry, ReadSeek, ReadWriteSeek},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Operation is invalid in the current segment state")]
    InvalidState,
    #[error("No more entries")]
    EndOfEntries,
    #[error("Entry offset is not monotonically increasing: {0:#x}")]
    InvalidOffset(u64),
    #[error("Entry size is out of range: {0}")]
    InvalidSize(u64),
    #[error("Expected to write {expected} bytes, but wrote {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("Expected entry of type {expected}, but got {actual}")]
    UnexpectedEntryType {
        expected: EntryType,
        actual: EntryType,
    },
    #[error("Duplicate entry type: {0}")]
    DuplicateEntryType(EntryType),
    #[error("Unexpected EOF when reading entry data")]
    UnexpectedEof,
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Reader-side descriptor of one payload segment: where its data lives in the
/// file and whether a short read at the end of the file is tolerated.
#[derive(Clone, Copy, Debug)]
pub struct SegmentReaderEntry {
    pub ty: EntryType,
    pub offset: u64,
    pub size: u32,
    pub allow_truncation: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReaderState {
    Unset,
    Ready,
    AtEntry(usize),
    Exhausted,
}

/// Streaming read cursor over an ordered, non-overlapping list of segments.
/// The list is frozen after `set_entries`; crossing from one segment to the
/// next requires an explicit `read_entry` call.
pub struct SegmentReader {
    state: ReaderState,
    entries: Vec<SegmentReaderEntry>,
    read_end: u64,
    read_cur: u64,
}

impl SegmentReader {
    pub fn new() -> Self {
        Self {
            state: ReaderState::Unset,
            entries: vec![],
            read_end: 0,
            read_cur: 0,
        }
    }

    /// Validate and freeze the segment list. Segments must be ordered by
    /// increasing file offset, must not overlap, and may contain at most one
    /// entry per type.
    pub fn set_entries(&mut self, entries: Vec<SegmentReaderEntry>) -> Result<()> {
        let mut last_end = 0u64;

        for (i, entry) in entries.iter().enumerate() {
            if entry.offset < last_end {
                return Err(Error::InvalidOffset(entry.offset));
            }

            last_end = entry
                .offset
                .checked_add(u64::from(entry.size))
                .ok_or(Error::InvalidSize(u64::from(entry.size)))?;

            if entries[..i].iter().any(|e| e.ty == entry.ty) {
                warn!("Segment list contains more than one {} entry", entry.ty);
                return Err(Error::DuplicateEntryType(entry.ty));
            }
        }

        self.entries = entries;
        self.state = ReaderState::Ready;
        Ok(())
    }

    fn move_to(&mut self, file: &mut dyn ReadSeek, index: usize) -> Result<Entry> {
        let entry = self.entries[index];

        file.seek(SeekFrom::Start(entry.offset))?;

        self.state = ReaderState::AtEntry(index);
        self.read_cur = entry.offset;
        self.read_end = entry.offset + u64::from(entry.size);

        Ok(Entry::with_size(entry.ty, u64::from(entry.size)))
    }

    /// Advance the cursor to the next segment and seek the file to its start.
    pub fn read_entry(&mut self, file: &mut dyn ReadSeek) -> Result<Entry> {
        let next = match self.state {
            ReaderState::Unset => return Err(Error::InvalidState),
            ReaderState::Ready => 0,
            ReaderState::AtEntry(i) => i + 1,
            ReaderState::Exhausted => return Err(Error::EndOfEntries),
        };

        if next == self.entries.len() {
            self.state = ReaderState::Exhausted;
            return Err(Error::EndOfEntries);
        }

        self.move_to(file, next)
    }

    /// Move the cursor to the segment of the given type, regardless of the
    /// current position. There is at most one segment per type.
    pub fn go_to_entry(&mut self, file: &mut dyn ReadSeek, ty: EntryType) -> Result<Entry> {
        if self.state == ReaderState::Unset {
            return Err(Error::InvalidState);
        }

        match self.entries.iter().position(|e| e.ty == ty) {
            Some(i) => self.move_to(file, i),
            None => {
                self.state = ReaderState::Exhausted;
                Err(Error::EndOfEntries)
            }
        }
    }

    /// Read up to `buf.len()` bytes from the current segment. Returns 0 once
    /// the segment's residual is exhausted.
    pub fn read_data(&mut self, file: &mut dyn ReadSeek, buf: &mut [u8]) -> Result<usize> {
        let ReaderState::AtEntry(index) = self.state else {
            return Err(Error::InvalidState);
        };

        let residual = self.read_end - self.read_cur;
        let to_read = residual.min(buf.len() as u64) as usize;
        if to_read == 0 {
            return Ok(0);
        }

        let n = read_retry(&mut *file, &mut buf[..to_read])?;
        if n < to_read {
            if self.entries[index].allow_truncation {
                // The file ends inside this segment; report the short size
                // and make subsequent reads return 0.
                self.read_end = self.read_cur + n as u64;
            } else {
                return Err(Error::UnexpectedEof);
            }
        }

        self.read_cur += n as u64;
        Ok(n)
    }
}

/// Writer-side descriptor of one expected segment. Offset and size are filled
/// in as the segment is actually written; `align` is the padding unit applied
/// after the segment (0 = no padding).
#[derive(Clone, Copy, Debug)]
pub struct SegmentWriterEntry {
    pub ty: EntryType,
    pub offset: u64,
    pub size: Option<u32>,
    pub align: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriterState {
    Unset,
    Ready(usize),
    Queried(usize),
    Writing(usize),
}

/// Streaming write cursor over an ordered list of expected segments. The
/// caller drives each segment through `get_entry`, `write_entry`,
/// `write_data`, and `finish_entry`, in that order.
pub struct SegmentWriter {
    state: WriterState,
    entries: Vec<SegmentWriterEntry>,
    entry_size: u64,
}

impl SegmentWriter {
    pub fn new() -> Self {
        Self {
            state: WriterState::Unset,
            entries: vec![],
            entry_size: 0,
        }
    }

    pub fn set_entries(&mut self, entries: Vec<SegmentWriterEntry>) -> Result<()> {
        for (i, entry) in entries.iter().enumerate() {
            if entries[..i].iter().any(|e| e.ty == entry.ty) {
                return Err(Error::DuplicateEntryType(entry.ty));
            }
        }

        self.entries = entries;
        self.state = WriterState::Ready(0);
        Ok(())
    }

    pub fn entries(&self) -> &[SegmentWriterEntry] {
        &self.entries
    }

    /// Whether every expected entry has been written and finished.
    pub fn is_complete(&self) -> bool {
        matches!(self.state, WriterState::Ready(i) if i == self.entries.len())
    }

    /// The most recently finished entry, if any.
    pub fn last_finished(&self) -> Option<&SegmentWriterEntry> {
        match self.state {
            WriterState::Ready(i) if i > 0 => Some(&self.entries[i - 1]),
            _ => None,
        }
    }

    /// Return the next expected entry's type and any pre-declared size.
    pub fn get_entry(&mut self) -> Result<Entry> {
        let index = match self.state {
            WriterState::Unset | WriterState::Writing(_) => return Err(Error::InvalidState),
            WriterState::Ready(i) | WriterState::Queried(i) => i,
        };

        if index == self.entries.len() {
            return Err(Error::EndOfEntries);
        }

        self.state = WriterState::Queried(index);

        let entry = &self.entries[index];
        let mut out = Entry::new(entry.ty);
        out.set_size(entry.size.map(u64::from));
        Ok(out)
    }

    /// Begin the next expected segment. The entry's type must match; a
    /// declared size, if present, is validated in `finish_entry`.
    pub fn write_entry(&mut self, file: &mut dyn ReadWriteSeek, entry: &Entry) -> Result<()> {
        let index = match self.state {
            WriterState::Ready(i) | WriterState::Queried(i) if i < self.entries.len() => i,
            _ => return Err(Error::InvalidState),
        };

        let expected = self.entries[index].ty;
        if entry.entry_type() != expected {
            return Err(Error::UnexpectedEntryType {
                expected,
                actual: entry.entry_type(),
            });
        }

        if let Some(size) = entry.size() {
            let size = u32::try_from(size).map_err(|_| Error::InvalidSize(size))?;
            self.entries[index].size = Some(size);
        }

        self.entries[index].offset = file.stream_position()?;
        self.entry_size = 0;
        self.state = WriterState::Writing(index);
        Ok(())
    }

    /// Stream payload bytes into the current segment.
    pub fn write_data(&mut self, file: &mut dyn ReadWriteSeek, buf: &[u8]) -> Result<usize> {
        let WriterState::Writing(index) = self.state else {
            return Err(Error::InvalidState);
        };

        if let Some(size) = self.entries[index].size {
            let total = self.entry_size + buf.len() as u64;
            if total > u64::from(size) {
                return Err(Error::InvalidSize(total));
            }
        }

        file.write_all(buf)?;
        self.entry_size += buf.len() as u64;
        Ok(buf.len())
    }

    /// Finalize the current segment's offset and size, then pad the write
    /// position to the segment's alignment.
    pub fn finish_entry(&mut self, file: &mut dyn ReadWriteSeek) -> Result<()> {
        let WriterState::Writing(index) = self.state else {
            return Err(Error::InvalidState);
        };

        let entry = &mut self.entries[index];

        match entry.size {
            Some(size) => {
                if u64::from(size) != self.entry_size {
                    return Err(Error::SizeMismatch {
                        expected: size.into(),
                        actual: self.entry_size,
                    });
                }
            }
            None => {
                let size =
                    u32::try_from(self.entry_size).map_err(|_| Error::InvalidSize(self.entry_size))?;
                entry.size = Some(size);
            }
        }

        if entry.align > 0 {
            padding::write_zeros(&mut *file, entry.align)?;
        }

        self.state = WriterState::Ready(index + 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crate::entry::EntryType;

    use super::{Error, SegmentReader, SegmentReaderEntry, SegmentWriter, SegmentWriterEntry};

    fn reader_entries() -> Vec<SegmentReaderEntry> {
        vec![
            SegmentReaderEntry {
                ty: EntryType::Kernel,
                offset: 0,
                size: 4,
                allow_truncation: false,
            },
            SegmentReaderEntry {
                ty: EntryType::Ramdisk,
                offset: 8,
                size: 4,
                allow_truncation: false,
            },
        ]
    }

    #[test]
    fn reader_walks_entries_in_order() {
        let mut file = Cursor::new(b"KERN....RAMD".to_vec());
        let mut seg = SegmentReader::new();
        seg.set_entries(reader_entries()).unwrap();

        let entry = seg.read_entry(&mut file).unwrap();
        assert_eq!(entry.entry_type(), EntryType::Kernel);
        assert_eq!(entry.size(), Some(4));

        let mut buf = [0u8; 16];
        assert_eq!(seg.read_data(&mut file, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"KERN");
        assert_eq!(seg.read_data(&mut file, &mut buf).unwrap(), 0);

        let entry = seg.read_entry(&mut file).unwrap();
        assert_eq!(entry.entry_type(), EntryType::Ramdisk);
        assert_eq!(seg.read_data(&mut file, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"RAMD");

        assert!(matches!(
            seg.read_entry(&mut file),
            Err(Error::EndOfEntries)
        ));
        // Exhausted is sticky for read_entry.
        assert!(matches!(
            seg.read_entry(&mut file),
            Err(Error::EndOfEntries)
        ));
    }

    #[test]
    fn reader_go_to_entry_searches_whole_list() {
        let mut file = Cursor::new(b"KERN....RAMD".to_vec());
        let mut seg = SegmentReader::new();
        seg.set_entries(reader_entries()).unwrap();

        // Exhaust the list first.
        while seg.read_entry(&mut file).is_ok() {}

        let entry = seg.go_to_entry(&mut file, EntryType::Kernel).unwrap();
        assert_eq!(entry.entry_type(), EntryType::Kernel);

        let mut buf = [0u8; 4];
        assert_eq!(seg.read_data(&mut file, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"KERN");

        assert!(matches!(
            seg.go_to_entry(&mut file, EntryType::DeviceTree),
            Err(Error::EndOfEntries)
        ));
    }

    #[test]
    fn reader_rejects_bad_lists() {
        let mut seg = SegmentReader::new();

        // Overlapping offsets.
        let mut entries = reader_entries();
        entries[1].offset = 2;
        assert!(matches!(
            seg.set_entries(entries),
            Err(Error::InvalidOffset(2))
        ));

        // Duplicate types.
        let mut entries = reader_entries();
        entries[1].ty = EntryType::Kernel;
        assert!(matches!(
            seg.set_entries(entries),
            Err(Error::DuplicateEntryType(EntryType::Kernel))
        ));
    }

    #[test]
    fn reader_truncation() {
        // Segment claims 8 bytes, but the file ends after 4.
        let entries = vec![SegmentReaderEntry {
            ty: EntryType::DeviceTree,
            offset: 0,
            size: 8,
            allow_truncation: true,
        }];

        let mut file = Cursor::new(b"DTBX".to_vec());
        let mut seg = SegmentReader::new();
        seg.set_entries(entries.clone()).unwrap();
        seg.read_entry(&mut file).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(seg.read_data(&mut file, &mut buf).unwrap(), 4);
        assert_eq!(seg.read_data(&mut file, &mut buf).unwrap(), 0);

        // Without the truncation flag, the same read fails.
        let mut entries = entries;
        entries[0].allow_truncation = false;

        let mut file = Cursor::new(b"DTBX".to_vec());
        let mut seg = SegmentReader::new();
        seg.set_entries(entries).unwrap();
        seg.read_entry(&mut file).unwrap();

        assert!(matches!(
            seg.read_data(&mut file, &mut buf),
            Err(Error::UnexpectedEof)
        ));
    }

    #[test]
    fn reader_invalid_state() {
        let mut file = Cursor::new(Vec::new());
        let mut seg = SegmentReader::new();
        let mut buf = [0u8; 4];

        assert!(matches!(
            seg.read_entry(&mut file),
            Err(Error::InvalidState)
        ));
        assert!(matches!(
            seg.read_data(&mut file, &mut buf),
            Err(Error::InvalidState)
        ));

        seg.set_entries(reader_entries()).unwrap();
        // read_data before the first read_entry is still invalid.
        assert!(matches!(
            seg.read_data(&mut file, &mut buf),
            Err(Error::InvalidState)
        ));
    }

    #[test]
    fn writer_tracks_offsets_and_pads() {
        let mut file = Cursor::new(Vec::new());
        let mut seg = SegmentWriter::new();
        seg.set_entries(vec![
            SegmentWriterEntry {
                ty: EntryType::Kernel,
                offset: 0,
                size: None,
                align: 16,
            },
            SegmentWriterEntry {
                ty: EntryType::Ramdisk,
                offset: 0,
                size: None,
                align: 16,
            },
        ])
        .unwrap();

        let entry = seg.get_entry().unwrap();
        assert_eq!(entry.entry_type(), EntryType::Kernel);

        seg.write_entry(&mut file, &entry).unwrap();
        assert_eq!(seg.write_data(&mut file, b"KERN").unwrap(), 4);
        seg.finish_entry(&mut file).unwrap();

        let entry = seg.get_entry().unwrap();
        seg.write_entry(&mut file, &entry).unwrap();
        assert_eq!(seg.write_data(&mut file, b"RAMDISK").unwrap(), 7);
        seg.finish_entry(&mut file).unwrap();

        assert!(seg.is_complete());
        assert!(matches!(seg.get_entry(), Err(Error::EndOfEntries)));

        let entries = seg.entries();
        assert_eq!(entries[0].offset, 0);
        assert_eq!(entries[0].size, Some(4));
        assert_eq!(entries[1].offset, 16);
        assert_eq!(entries[1].size, Some(7));

        // Write position is page-aligned after each finish_entry.
        assert_eq!(file.get_ref().len(), 32);
    }

    #[test]
    fn writer_validates_declared_size() {
        let mut file = Cursor::new(Vec::new());
        let mut seg = SegmentWriter::new();
        seg.set_entries(vec![SegmentWriterEntry {
            ty: EntryType::Kernel,
            offset: 0,
            size: Some(4),
            align: 0,
        }])
        .unwrap();

        let entry = seg.get_entry().unwrap();
        seg.write_entry(&mut file, &entry).unwrap();
        seg.write_data(&mut file, b"KE").unwrap();

        assert!(matches!(
            seg.finish_entry(&mut file),
            Err(Error::SizeMismatch {
                expected: 4,
                actual: 2,
            })
        ));
    }

    #[test]
    fn writer_rejects_wrong_type_and_state() {
        let mut file = Cursor::new(Vec::new());
        let mut seg = SegmentWriter::new();

        assert!(matches!(seg.get_entry(), Err(Error::InvalidState)));

        seg.set_entries(vec![SegmentWriterEntry {
            ty: EntryType::Kernel,
            offset: 0,
            size: None,
            align: 0,
        }])
        .unwrap();

        assert!(matches!(
            seg.write_data(&mut file, b"x"),
            Err(Error::InvalidState)
        ));
        assert!(matches!(
            seg.finish_entry(&mut file),
            Err(Error::InvalidState)
        ));

        let entry = crate::entry::Entry::new(EntryType::Ramdisk);
        assert!(matches!(
            seg.write_entry(&mut file, &entry),
            Err(Error::UnexpectedEntryType { .. })
        ));
    }
}
