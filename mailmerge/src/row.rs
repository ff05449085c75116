//! # Row source
//!
//! Module dedicated to reading the data source of a merge. A data
//! source is a delimited text file whose first line contains the
//! field names. Every following line is exposed as a [`Row`], lazily,
//! in source order.

use std::{
    fs::File,
    io::{self, BufRead, BufReader, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    result,
};

use csv::{ReaderBuilder, StringRecord};
use serde::ser::{Serialize, SerializeMap, Serializer};
use thiserror::Error;
use tracing::debug;

/// The UTF-8 byte order mark, as decoded from the first field name.
const BOM: char = '\u{feff}';

/// The supported delimiters, by order of preference.
const DELIMITERS: [u8; 3] = [b',', b'\t', b';'];

/// The global `Result` alias of the module.
pub type Result<T> = result::Result<T, Error>;

/// The global `Error` enum of the module.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot find data source {1:?}")]
    OpenDataSourceError(#[source] io::Error, PathBuf),
    #[error("cannot sniff delimiter of data source {1:?}")]
    SniffDelimiterError(#[source] io::Error, PathBuf),
    #[error("cannot read field names of data source {1:?}")]
    ReadFieldNamesError(#[source] csv::Error, PathBuf),
    #[error("cannot parse data source {path:?} at line {line}")]
    ParseRowError {
        #[source]
        source: csv::Error,
        path: PathBuf,
        line: u64,
    },
    #[error("cannot read data source {1:?}")]
    ReadDataSourceError(#[source] io::Error, PathBuf),
    #[error("cannot parse data source {0:?} at line {1}: unterminated quoted field")]
    UnterminatedQuoteError(PathBuf, u64),
}

impl Error {
    /// Return the 1-based line number of the malformed row, if any.
    pub fn line(&self) -> Option<u64> {
        match self {
            Self::ParseRowError { line, .. } => Some(*line),
            Self::UnterminatedQuoteError(_, line) => Some(*line),
            _ => None,
        }
    }
}

/// An ordered mapping from field name to value.
///
/// Field names are unique within a row, and fields keep the order of
/// the data source header.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Row {
    fields: Vec<(String, String)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the given field, replacing the value of an existing
    /// field with the same name.
    pub fn insert(&mut self, key: impl ToString, val: impl ToString) {
        let key = key.to_string();
        let val = val.to_string();

        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = val,
            None => self.fields.push((key, val)),
        }
    }

    pub fn with(mut self, key: impl ToString, val: impl ToString) -> Self {
        self.insert(key, val);
        self
    }

    pub fn get(&self, key: impl AsRef<str>) -> Option<&str> {
        let key = key.as_ref();
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: ToString, V: ToString> FromIterator<(K, V)> for Row {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        iter.into_iter()
            .fold(Row::new(), |row, (key, val)| row.with(key, val))
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (key, val) in &self.fields {
            map.serialize_entry(key, val)?;
        }
        map.end()
    }
}

/// The data source of a merge.
///
/// The source only holds the path of the file: every call to
/// [`RowSource::rows`] reopens it, which makes the sequence of rows
/// restartable.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RowSource {
    path: PathBuf,
}

impl RowSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the data source and return the lazy sequence of its rows.
    ///
    /// A missing file is reported here, before any row is produced.
    pub fn rows(&self) -> Result<Rows> {
        let path = self.path.clone();

        let mut file =
            File::open(&path).map_err(|err| Error::OpenDataSourceError(err, path.clone()))?;

        let delimiter = {
            let mut sample = Vec::new();
            BufReader::new(&mut file)
                .read_until(b'\n', &mut sample)
                .map_err(|err| Error::SniffDelimiterError(err, path.clone()))?;
            sniff_delimiter(&sample)
        };

        file.seek(SeekFrom::Start(0))
            .map_err(|err| Error::SniffDelimiterError(err, path.clone()))?;

        debug!(?path, delimiter = %char::from(delimiter).escape_default(), "opening data source");

        let mut reader = ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(false)
            .from_reader(BufReader::new(file));

        let names = reader
            .headers()
            .map_err(|err| Error::ReadFieldNamesError(err, path.clone()))?
            .iter()
            .enumerate()
            .map(|(i, name)| match i {
                0 => name.trim_start_matches(BOM).to_owned(),
                _ => name.to_owned(),
            })
            .collect();

        Ok(Rows {
            path,
            delimiter,
            reader,
            names,
            lookahead: None,
            done: false,
        })
    }
}

/// The lazy sequence of rows of a data source.
///
/// Rows are read one record ahead, so that a quoted field left open
/// at the end of the file is reported instead of the truncated row
/// it swallowed.
pub struct Rows {
    path: PathBuf,
    delimiter: u8,
    reader: csv::Reader<BufReader<File>>,
    names: Vec<String>,
    lookahead: Option<Result<StringRecord>>,
    done: bool,
}

impl Rows {
    /// Return the field names of the data source.
    pub fn field_names(&self) -> &[String] {
        &self.names
    }

    fn read_record(&mut self) -> Result<Option<StringRecord>> {
        let mut record = StringRecord::new();
        match self.reader.read_record(&mut record) {
            Ok(true) => Ok(Some(record)),
            Ok(false) => Ok(None),
            Err(err) => {
                let line = err.position().map(|pos| pos.line()).unwrap_or_default();
                Err(Error::ParseRowError {
                    source: err,
                    path: self.path.clone(),
                    line,
                })
            }
        }
    }

    /// Check whether the given record, the last one of the source,
    /// swallowed the end of the file in a quoted field left open.
    fn is_unterminated(&mut self, record: &StringRecord) -> Result<bool> {
        let Some(pos) = record.position() else {
            return Ok(false);
        };

        let mut tail = Vec::new();
        let file = self.reader.get_mut();
        file.seek(SeekFrom::Start(pos.byte()))
            .and_then(|_| file.read_to_end(&mut tail))
            .map_err(|err| Error::ReadDataSourceError(err, self.path.clone()))?;

        Ok(ends_in_quoted_field(&tail, self.delimiter))
    }

    fn to_row(&self, record: &StringRecord) -> Row {
        Row {
            fields: self
                .names
                .iter()
                .cloned()
                .zip(record.iter().map(ToOwned::to_owned))
                .collect(),
        }
    }
}

impl Iterator for Rows {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let current = match self.lookahead.take() {
            Some(res) => res,
            None => self.read_record().transpose()?,
        };

        let current = match current {
            Ok(record) => record,
            Err(err) => {
                self.done = true;
                return Some(Err(err));
            }
        };

        match self.read_record() {
            Ok(Some(next)) => {
                self.lookahead = Some(Ok(next));
            }
            Ok(None) => {
                self.done = true;
                match self.is_unterminated(&current) {
                    Ok(false) => (),
                    Ok(true) => {
                        let line = current
                            .position()
                            .map(|pos| pos.line())
                            .unwrap_or_default();
                        let err = Error::UnterminatedQuoteError(self.path.clone(), line);
                        return Some(Err(err));
                    }
                    Err(err) => return Some(Err(err)),
                }
            }
            Err(err) => {
                self.lookahead = Some(Err(err));
            }
        }

        Some(Ok(self.to_row(&current)))
    }
}

/// Return `true` if the given bytes, read from the start of a record
/// to the end of the source, end inside a quoted field.
///
/// A quote only opens a quoted field at the start of a field: in the
/// middle of an unquoted field, it is a literal character. Inside a
/// quoted field, a doubled quote is an escaped quote.
fn ends_in_quoted_field(bytes: &[u8], delimiter: u8) -> bool {
    let mut bytes = bytes.iter().peekable();
    let mut field_start = true;
    let mut quoted = false;

    while let Some(byte) = bytes.next() {
        match *byte {
            b'"' if quoted => {
                if bytes.next_if_eq(&&b'"').is_none() {
                    quoted = false;
                }
            }
            b'"' if field_start => {
                quoted = true;
                field_start = false;
            }
            _ if quoted => (),
            b'\n' | b'\r' => field_start = true,
            byte => field_start = byte == delimiter,
        }
    }

    quoted
}

/// Guess the delimiter of the given header sample.
///
/// The most frequent delimiter found outside of quoted fields wins,
/// ties are broken by order of preference. Falls back to comma.
fn sniff_delimiter(sample: &[u8]) -> u8 {
    let mut counts = [0usize; DELIMITERS.len()];
    let mut quoted = false;

    for byte in sample {
        if *byte == b'"' {
            quoted = !quoted;
        } else if !quoted {
            if let Some(i) = DELIMITERS.iter().position(|d| d == byte) {
                counts[i] += 1;
            }
        }
    }

    let (best, count) = counts
        .iter()
        .enumerate()
        .fold((0, 0), |(best, max), (i, count)| match *count > max {
            true => (i, *count),
            false => (best, max),
        });

    match count {
        0 => DELIMITERS[0],
        _ => DELIMITERS[best],
    }
}
