//! Lazy, line-at-a-time reading of staged log files.
//!
//! A [`LogLines`] never holds more than one line in memory, so multi-gigabyte
//! files stream through in constant space. Re-opening the same path restarts
//! the sequence from the first line.

use crate::error::{CoreError, Result};
use crate::types::RawLogLine;
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

const READ_BUFFER_BYTES: usize = 256 * 1024;

/// Result of parsing one non-empty line.
#[derive(Debug)]
pub enum LineOutcome {
    Record(RawLogLine),
    Malformed { line_no: u64, reason: String },
}

pub struct LogLines {
    reader: Box<dyn BufRead + Send>,
    path: PathBuf,
    line_no: u64,
    buf: Vec<u8>,
    done: bool,
}

impl LogLines {
    /// Open a staged file, decompressing when the name ends in `.gz`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| CoreError::io(path, e))?;
        let reader: Box<dyn BufRead + Send> = if is_gzip(path) {
            Box::new(BufReader::with_capacity(
                READ_BUFFER_BYTES,
                MultiGzDecoder::new(file),
            ))
        } else {
            Box::new(BufReader::with_capacity(READ_BUFFER_BYTES, file))
        };
        Ok(Self::with_reader(reader, path))
    }

    pub fn with_reader(reader: Box<dyn BufRead + Send>, path: impl Into<PathBuf>) -> Self {
        Self {
            reader,
            path: path.into(),
            line_no: 0,
            buf: Vec::with_capacity(1024),
            done: false,
        }
    }

    /// Number of lines consumed so far, blank lines included.
    pub fn lines_read(&self) -> u64 {
        self.line_no
    }
}

impl Iterator for LogLines {
    type Item = Result<LineOutcome>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => self.done = true,
                Ok(_) => {
                    self.line_no += 1;
                    let line = trim_line(&self.buf);
                    if line.is_empty() {
                        continue;
                    }
                    return Some(Ok(match serde_json::from_slice::<RawLogLine>(line) {
                        Ok(record) => LineOutcome::Record(record),
                        Err(e) => LineOutcome::Malformed {
                            line_no: self.line_no,
                            reason: e.to_string(),
                        },
                    }));
                }
                Err(e) => {
                    // A broken stream (e.g. truncated gzip) cannot be resumed.
                    self.done = true;
                    return Some(Err(CoreError::io(self.path.clone(), e)));
                }
            }
        }
        None
    }
}

fn is_gzip(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("gz"))
        .unwrap_or(false)
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r' | b' ' | b'\t') {
        end -= 1;
    }
    &line[..end]
}
