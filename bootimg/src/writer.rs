// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fs::OpenOptions, io::Write as _, path::Path};

use crate::{
    entry::Entry,
    error::{Error, Result},
    format::{
        android::AndroidWriter, loki::LokiWriter, mtk::MtkWriter, sony_elf::SonyElfWriter,
        FormatCode, FormatWriter,
    },
    header::Header,
    stream::ReadWriteSeek,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    New,
    Opened,
    Header,
}

/// Boot image writer facade. Exactly one format must be set before opening;
/// the caller then supplies a header, drives each expected entry in order,
/// and closes, at which point the format back-patches its headers and
/// trailers.
pub struct Writer {
    format: Option<Box<dyn FormatWriter>>,
    file: Option<Box<dyn ReadWriteSeek>>,
    state: State,
    fatal: bool,
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

impl Writer {
    pub fn new() -> Self {
        Self {
            format: None,
            file: None,
            state: State::New,
            fatal: false,
        }
    }

    fn register(&mut self, format: Box<dyn FormatWriter>) -> Result<()> {
        if self.state != State::New || self.format.is_some() {
            return Err(Error::InvalidState);
        }

        self.format = Some(format);
        Ok(())
    }

    pub fn set_format_android(&mut self) -> Result<()> {
        self.register(Box::new(AndroidWriter::new()))
    }

    pub fn set_format_bump(&mut self) -> Result<()> {
        self.register(Box::new(AndroidWriter::new_bump()))
    }

    pub fn set_format_loki(&mut self) -> Result<()> {
        self.register(Box::new(LokiWriter::new()))
    }

    pub fn set_format_mtk(&mut self) -> Result<()> {
        self.register(Box::new(MtkWriter::new()))
    }

    pub fn set_format_sony_elf(&mut self) -> Result<()> {
        self.register(Box::new(SonyElfWriter::new()))
    }

    /// Forward a textual option to the configured format. Fails if the
    /// format does not recognize the key.
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<()> {
        if self.fatal {
            return Err(Error::InvalidState);
        }

        let format = self.format.as_mut().ok_or(Error::InvalidState)?;

        if format.set_option(key, value)? {
            Ok(())
        } else {
            Err(Error::UnsupportedFeature(key.to_owned()))
        }
    }

    pub fn open_filename(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        self.open(Box::new(file))
    }

    /// Bind an output stream. The stream must be readable and seekable so
    /// the format can back-patch its headers.
    pub fn open(&mut self, file: Box<dyn ReadWriteSeek>) -> Result<()> {
        if self.state != State::New || self.fatal {
            return Err(Error::InvalidState);
        }
        if self.format.is_none() {
            return Err(Error::FormatNotFound);
        }

        self.file = Some(file);
        self.state = State::Opened;
        Ok(())
    }

    fn parts(&mut self) -> Result<(&mut dyn FormatWriter, &mut dyn ReadWriteSeek)> {
        let Self { format, file, .. } = self;

        let (Some(format), Some(file)) = (format.as_mut(), file.as_mut()) else {
            return Err(Error::InvalidState);
        };

        Ok((format.as_mut(), file.as_mut()))
    }

    fn guard(&self, expected: State) -> Result<()> {
        if self.fatal || self.state != expected {
            return Err(Error::InvalidState);
        }
        Ok(())
    }

    fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.fatal = true;
            }
        }
        result
    }

    /// A header prototype with the supported-field mask of the configured
    /// format.
    pub fn get_header(&self) -> Result<Header> {
        let format = self.format.as_ref().ok_or(Error::InvalidState)?;
        Ok(format.get_header())
    }

    pub fn write_header(&mut self, header: &Header) -> Result<()> {
        self.guard(State::Opened)?;

        let (format, file) = self.parts()?;
        let result = format.write_header(file, header);

        if result.is_ok() {
            self.state = State::Header;
        }
        self.finish(result)
    }

    pub fn get_entry(&mut self) -> Result<Entry> {
        self.guard(State::Header)?;

        let (format, file) = self.parts()?;
        let result = format.get_entry(file);
        self.finish(result)
    }

    pub fn write_entry(&mut self, entry: &Entry) -> Result<()> {
        self.guard(State::Header)?;

        let (format, file) = self.parts()?;
        let result = format.write_entry(file, entry);
        self.finish(result)
    }

    pub fn write_data(&mut self, buf: &[u8]) -> Result<usize> {
        self.guard(State::Header)?;

        let (format, file) = self.parts()?;
        let result = format.write_data(file, buf);
        self.finish(result)
    }

    pub fn finish_entry(&mut self) -> Result<()> {
        self.guard(State::Header)?;

        let (format, file) = self.parts()?;
        let result = format.finish_entry(file);
        self.finish(result)
    }

    pub fn format(&self) -> Option<FormatCode> {
        self.format.as_ref().map(|f| f.format())
    }

    pub fn format_name(&self) -> Option<&'static str> {
        self.format().map(FormatCode::name)
    }

    pub fn format_code(&self) -> Option<u32> {
        self.format().map(FormatCode::to_raw)
    }

    /// Finalize the image (when fully written), flush, and release the
    /// stream. A partially-written output is left unfinalized and is the
    /// caller's to delete.
    pub fn close(&mut self) -> Result<()> {
        let mut result = Ok(());

        if self.file.is_some() {
            if !self.fatal && self.state == State::Header {
                let (format, file) = self.parts()?;
                result = format.close(file);
            }

            if result.is_ok() {
                if let Some(file) = self.file.as_mut() {
                    result = file.flush().map_err(Error::from);
                }
            }
        }

        self.file = None;
        self.state = State::New;
        self.fatal = false;

        result
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if self.file.is_some() {
            let _ = self.close();
        }
    }
}
