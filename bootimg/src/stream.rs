// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{self, Cursor, Read, Seek, SeekFrom, Write},
    sync::{Arc, Mutex},
};

use bstr::ByteSlice;

pub(crate) const ZEROS: [u8; 16384] = [0u8; 16384];

/// A trait for seekable readers. This is only needed because `dyn Read + Seek`
/// is not a valid construct in Rust yet.
pub trait ReadSeek: Read + Seek {}

impl<R: Read + Seek> ReadSeek for R {}

/// A trait for seekable writers. This is only needed because `dyn Write + Seek`
/// is not a valid construct in Rust yet.
pub trait WriteSeek: Write + Seek {}

impl<W: Write + Seek> WriteSeek for W {}

/// A trait for streams supporting both directions. Boot image writers need
/// read access to their own output to patch headers at close.
pub trait ReadWriteSeek: Read + Write + Seek {}

impl<T: Read + Write + Seek> ReadWriteSeek for T {}

/// Read into `buf`, retrying short reads until the buffer is full or the
/// stream reaches EOF. Returns the number of bytes read.
pub fn read_retry(mut reader: impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;

    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    Ok(total)
}

/// Extensions for readers to read fixed-size buffers.
pub trait ReadFixedSizeExt {
    /// Read fixed-size array.
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]>;

    /// Read fixed-sized [`Vec`].
    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>>;
}

impl<R: Read + ?Sized> ReadFixedSizeExt for R {
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Extensions for writers to easily write zeros (eg. for padding).
pub trait WriteZerosExt {
    fn write_zeros(&mut self, size: u64) -> io::Result<u64>;

    fn write_zeros_exact(&mut self, size: u64) -> io::Result<()> {
        let n = self.write_zeros(size)?;
        if n != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Expected to write {size} bytes, but reached EOF after {n} bytes"),
            ));
        }
        Ok(())
    }
}

impl<W: Write + ?Sized> WriteZerosExt for W {
    fn write_zeros(&mut self, size: u64) -> io::Result<u64> {
        // We don't use std::io::copy() on std::io::repeat(0) because it fails
        // if the writer hits EOF before all data is written.
        let mut written = 0;

        while written < size {
            let to_write = (size - written).min(ZEROS.len() as u64) as usize;
            let n = self.write(&ZEROS[..to_write])?;
            written += n as u64;

            if n < to_write {
                break;
            }
        }

        Ok(written)
    }
}

/// Search a stream for the first occurrence of `pattern` at or after `start`.
/// Returns the absolute offset of the match, if any. The stream position is
/// undefined afterwards.
pub fn search(file: &mut dyn ReadSeek, start: u64, pattern: &[u8]) -> io::Result<Option<u64>> {
    const CHUNK_SIZE: usize = 16384;

    if pattern.is_empty() || pattern.len() > CHUNK_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Invalid search pattern length",
        ));
    }

    file.seek(SeekFrom::Start(start))?;

    let mut buf = vec![0u8; CHUNK_SIZE + pattern.len() - 1];
    let mut base = start;
    let mut filled = 0usize;

    loop {
        let n = read_retry(&mut *file, &mut buf[filled..])?;
        let valid = filled + n;

        if valid >= pattern.len() {
            if let Some(pos) = buf[..valid].find(pattern) {
                return Ok(Some(base + pos as u64));
            }
        }

        if n == 0 {
            return Ok(None);
        }

        // Keep the tail so matches spanning chunk boundaries are found.
        let keep = pattern.len() - 1;
        buf.copy_within(valid - keep..valid, 0);
        base += (valid - keep) as u64;
        filled = keep;
    }
}

/// Extensions for file-like types to reopen themselves.
pub trait Reopen: Sized {
    /// Open a new handle to the same file. The new handle is independently
    /// seekable and the file offset is initially set to 0.
    fn reopen(&self) -> io::Result<Self>;
}

/// A small wrapper around a [`Cursor`] that allows multiple instances to share
/// the same underlying buffer. All reads, writes, and seeks are
/// single-threaded. This is useful when one handle is handed to a writer and
/// another is used to re-read the produced image.
#[derive(Clone, Default)]
pub struct SharedCursor {
    inner: Arc<Mutex<Cursor<Vec<u8>>>>,
    offset: u64,
}

impl SharedCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current buffer contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.lock().unwrap().get_ref().clone()
    }
}

impl Reopen for SharedCursor {
    fn reopen(&self) -> io::Result<Self> {
        Ok(Self {
            inner: self.inner.clone(),
            offset: 0,
        })
    }
}

impl Read for SharedCursor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        inner.seek(SeekFrom::Start(self.offset))?;

        let n = inner.read(buf)?;
        self.offset += n as u64;

        Ok(n)
    }
}

impl Write for SharedCursor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        inner.seek(SeekFrom::Start(self.offset))?;

        let n = inner.write(buf)?;
        self.offset += n as u64;

        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.flush()
    }
}

impl Seek for SharedCursor {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        self.offset = inner.seek(pos)?;
        Ok(self.offset)
    }
}
