//! # Delivery log
//!
//! Module dedicated to the log of row outcomes. The CSV log contains
//! one line per recipient of every processed row:
//!
//! ```text
//! number,email,log
//! 1,alice@example.com,"OK"
//! 2,,"Attachment not found: /home/bob/missing.pdf"
//! ```

use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    path::Path,
};

use super::RowOutcome;

const HEADER: &str = "number,email,log";

/// Sink of row outcomes.
pub trait DeliveryLog {
    fn record(&mut self, outcome: &RowOutcome) -> io::Result<()>;
}

/// CSV delivery log.
#[derive(Debug)]
pub struct CsvLog<W: Write> {
    writer: W,
}

impl<W: Write> CsvLog<W> {
    /// Create a log writing to the given writer, starting with the
    /// header line.
    pub fn new(mut writer: W) -> io::Result<Self> {
        writeln!(writer, "{HEADER}")?;
        Ok(Self { writer })
    }

    /// Create a log appending to the given writer, without header.
    pub fn append(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl CsvLog<BufWriter<File>> {
    /// Open the log file located at the given path in append mode.
    ///
    /// The header line is written only if the file is empty.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;

        let writer = BufWriter::new(file);

        match writer.get_ref().metadata()?.len() {
            0 => Self::new(writer),
            _ => Ok(Self::append(writer)),
        }
    }
}

impl<W: Write> DeliveryLog for CsvLog<W> {
    fn record(&mut self, outcome: &RowOutcome) -> io::Result<()> {
        let text = outcome.outcome.log_text().replace('"', "\"\"");

        match outcome.recipients.as_slice() {
            [] => writeln!(self.writer, "{},,\"{text}\"", outcome.number)?,
            recipients => {
                for email in recipients {
                    writeln!(self.writer, "{},{email},\"{text}\"", outcome.number)?;
                }
            }
        }

        self.writer.flush()
    }
}
