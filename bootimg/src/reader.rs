// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fs::File, io::BufReader, path::Path};

use tracing::debug;

use crate::{
    entry::{Entry, EntryType},
    error::{Error, Result},
    format::{
        android::AndroidReader, loki::LokiReader, mtk::MtkReader, sony_elf::SonyElfReader, Bid,
        FormatCode, FormatReader,
    },
    header::Header,
    stream::ReadSeek,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    New,
    Opened,
    Header,
}

/// Boot image reader facade. Formats are registered in order, the best
/// bidder is selected when a file is opened, and all subsequent calls are
/// routed to the winning format.
pub struct Reader {
    formats: Vec<Box<dyn FormatReader>>,
    file: Option<Box<dyn ReadSeek>>,
    selected: Option<usize>,
    state: State,
    fatal: bool,
}

impl Default for Reader {
    fn default() -> Self {
        Self::new()
    }
}

impl Reader {
    pub fn new() -> Self {
        Self {
            formats: vec![],
            file: None,
            selected: None,
            state: State::New,
            fatal: false,
        }
    }

    fn register(&mut self, format: Box<dyn FormatReader>) -> Result<()> {
        if self.state != State::New {
            return Err(Error::InvalidState);
        }
        if self.formats.iter().any(|f| f.format() == format.format()) {
            return Err(Error::InvalidArgument("format is already enabled"));
        }

        self.formats.push(format);
        Ok(())
    }

    pub fn enable_format_android(&mut self) -> Result<()> {
        self.register(Box::new(AndroidReader::new()))
    }

    pub fn enable_format_bump(&mut self) -> Result<()> {
        self.register(Box::new(AndroidReader::new_bump()))
    }

    pub fn enable_format_loki(&mut self) -> Result<()> {
        self.register(Box::new(LokiReader::new()))
    }

    pub fn enable_format_mtk(&mut self) -> Result<()> {
        self.register(Box::new(MtkReader::new()))
    }

    pub fn enable_format_sony_elf(&mut self) -> Result<()> {
        self.register(Box::new(SonyElfReader::new()))
    }

    /// Register every supported format. The registration order doubles as
    /// the bidding tie-break.
    pub fn enable_format_all(&mut self) -> Result<()> {
        self.enable_format_android()?;
        self.enable_format_bump()?;
        self.enable_format_loki()?;
        self.enable_format_mtk()?;
        self.enable_format_sony_elf()
    }

    /// Forward a textual option to every registered format. Fails if no
    /// format recognizes the key.
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<()> {
        if self.fatal {
            return Err(Error::InvalidState);
        }

        let mut handled = false;
        for format in &mut self.formats {
            handled |= format.set_option(key, value)?;
        }

        if handled {
            Ok(())
        } else {
            Err(Error::UnsupportedFeature(key.to_owned()))
        }
    }

    pub fn open_filename(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::open(path.as_ref())?;
        self.open(Box::new(BufReader::new(file)))
    }

    /// Bind a file and run the bidding protocol to select a format.
    pub fn open(&mut self, mut file: Box<dyn ReadSeek>) -> Result<()> {
        if self.state != State::New || self.fatal {
            return Err(Error::InvalidState);
        }
        if self.formats.is_empty() {
            return Err(Error::InvalidArgument("no formats enabled"));
        }

        let mut best_bid = 0;
        let mut best_index = None;

        for (i, format) in self.formats.iter_mut().enumerate() {
            match format.bid(file.as_mut(), best_bid)? {
                Bid::Unwinnable => {
                    debug!("{}: cannot outbid {} bits", format.format(), best_bid);
                }
                Bid::Score(bid) => {
                    debug!("{}: bid {} bits", format.format(), bid);

                    // Ties go to the earlier registration.
                    if bid > best_bid {
                        best_bid = bid;
                        best_index = Some(i);
                    }
                }
            }
        }

        let index = best_index.ok_or(Error::FormatNotFound)?;
        debug!("Best bidder: {} ({} bits)", self.formats[index].format(), best_bid);

        self.file = Some(file);
        self.selected = Some(index);
        self.state = State::Opened;
        Ok(())
    }

    fn parts(&mut self) -> Result<(&mut dyn FormatReader, &mut dyn ReadSeek)> {
        let Self {
            formats,
            file,
            selected,
            ..
        } = self;

        let (Some(index), Some(file)) = (*selected, file.as_mut()) else {
            return Err(Error::InvalidState);
        };

        Ok((formats[index].as_mut(), file.as_mut()))
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

    pub fn read_header(&mut self) -> Result<Header> {
        self.guard(State::Opened)?;

        let (format, file) = self.parts()?;
        let result = format.read_header(file);

        if result.is_ok() {
            self.state = State::Header;
        }
        self.finish(result)
    }

    pub fn read_entry(&mut self) -> Result<Entry> {
        self.guard(State::Header)?;

        let (format, file) = self.parts()?;
        let result = format.read_entry(file);
        self.finish(result)
    }

    pub fn go_to_entry(&mut self, ty: EntryType) -> Result<Entry> {
        self.guard(State::Header)?;

        let (format, file) = self.parts()?;
        let result = format.go_to_entry(file, ty);
        self.finish(result)
    }

    pub fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.guard(State::Header)?;

        let (format, file) = self.parts()?;
        let result = format.read_data(file, buf);
        self.finish(result)
    }

    /// The format selected by bidding, if a file is open.
    pub fn format(&self) -> Option<FormatCode> {
        self.selected.map(|i| self.formats[i].format())
    }

    pub fn format_name(&self) -> Option<&'static str> {
        self.format().map(FormatCode::name)
    }

    pub fn format_code(&self) -> Option<u32> {
        self.format().map(FormatCode::to_raw)
    }

    /// Release the file. Always succeeds, even from a poisoned state.
    pub fn close(&mut self) -> Result<()> {
        self.file = None;
        self.selected = None;
        self.state = State::New;
        self.fatal = false;
        Ok(())
    }
}
