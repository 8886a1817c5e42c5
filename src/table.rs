//! Line framing shared by the tab-separated tool outputs.
//!
//! Every table has the same outer shape: an optional block of `#` comment
//! lines, exactly one header line, then data lines whose first field is the
//! row key.

use std::io::{self, BufRead};

use thiserror::Error;

/// Physical line reader that tracks the 1-based line number.
pub struct Lines<R> {
    inner: R,
    line: u64,
    buf: String,
}

impl<R> Lines<R>
where
    R: BufRead,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            line: 0,
            buf: String::new(),
        }
    }

    /// Reads the next line into the internal buffer. Returns `false` at EOF.
    pub fn advance(&mut self) -> io::Result<bool> {
        self.buf.clear();
        match self.inner.read_line(&mut self.buf)? {
            0 => Ok(false),
            _ => {
                self.line += 1;
                Ok(true)
            }
        }
    }

    /// Current line without its terminator.
    pub fn current(&self) -> &str {
        trim_line_end(&self.buf)
    }

    /// Current line exactly as read, terminator included.
    pub fn raw(&self) -> &str {
        &self.buf
    }

    pub fn line_number(&self) -> u64 {
        self.line
    }

    /// Skips the leading comment block and returns the header line.
    ///
    /// Comment lines are pushed verbatim into `comments` when given. Returns
    /// `None` if the input ends before a header is found.
    pub fn read_preamble(
        &mut self,
        mut comments: Option<&mut Vec<String>>,
    ) -> io::Result<Option<String>> {
        while self.advance()? {
            if self.buf.starts_with('#') {
                if let Some(comments) = comments.as_deref_mut() {
                    comments.push(self.buf.clone());
                }
                continue;
            }
            return Ok(Some(self.current().to_string()));
        }
        Ok(None)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

pub fn trim_line_end(line: &str) -> &str {
    line.trim_end_matches(&['\n', '\r'][..])
}

/// Splits a data line into its leading key and the remainder.
pub fn split_key(line: &str) -> Result<(&str, &str), ParseErrorKind> {
    line.split_once('\t')
        .ok_or_else(|| ParseErrorKind::MissingDelimiter(line.chars().take(78).collect()))
}

/// Leading key of a line: text up to the first tab, or the whole line.
pub fn leading_key(line: &str) -> &str {
    line.split_once('\t').map_or(line, |(key, _)| key)
}

/// Sample names from a header line: every field after the key column.
pub fn header_samples(header: &str) -> Vec<String> {
    header
        .trim()
        .split('\t')
        .skip(1)
        .map(str::to_string)
        .collect()
}

/// Errors that can arise while parsing a table line.
#[derive(Debug, Error)]
#[error("line {line}: {kind}")]
pub struct ParseError {
    pub line: u64,
    pub raw: String,
    #[source]
    pub kind: ParseErrorKind,
}

#[derive(Debug, Error)]
pub enum ParseErrorKind {
    #[error("I/O error")]
    Io(#[from] io::Error),
    #[error("expected a tab after the row key: {0}")]
    MissingDelimiter(String),
    #[error("key does not start with a probeset id: {0}")]
    InvalidProbesetKey(String),
    #[error("invalid ploidy suffix in key {0}")]
    InvalidPloidy(String),
    #[error("key too short to carry an allele suffix: {0}")]
    InvalidAllele(String),
    #[error("probeset {0} reappears after its rows were closed")]
    NonContiguousGroup(String),
}
