//! Row-key to byte-offset index over a tab-separated table.

use std::{
    collections::HashMap,
    fs::File,
    io::{self, BufRead, BufReader, Seek, SeekFrom},
    path::Path,
};

use crate::{
    error::{Outcome, PipelineError, Warning},
    smart_reader::is_gzip,
    table::{leading_key, trim_line_end},
};

/// Maps each data row's leading key to the offset where that row starts.
///
/// Memory use is proportional to the number of keys, not the file size.
#[derive(Debug, Clone)]
pub struct KeyedLineIndex {
    offsets: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct ScanStats {
    duplicates: usize,
    first_duplicate: Option<String>,
}

impl KeyedLineIndex {
    /// Scans `path` once and records the offset of every data line.
    ///
    /// Comment lines (`#`) are skipped wherever they appear and exactly one
    /// header line is skipped. When a key occurs more than once the last
    /// occurrence wins and the result carries a [`Warning::DuplicateKeys`].
    pub fn build<P: AsRef<Path>>(path: P) -> Result<Outcome<Self>, PipelineError> {
        let path = path.as_ref();
        if is_gzip(path).map_err(PipelineError::io(path))? {
            return Err(PipelineError::MalformedInput {
                path: path.to_path_buf(),
                reason: String::from("compressed tables cannot be indexed by byte offset"),
            });
        }

        let file = File::open(path).map_err(PipelineError::io(path))?;
        let mut offsets = HashMap::new();
        let stats =
            scan(BufReader::new(file), &mut offsets).map_err(PipelineError::io(path))?;

        tracing::debug!(path = %path.display(), keys = offsets.len(), "built line index");

        let index = Self { offsets };
        Ok(match stats.first_duplicate {
            Some(first) => Outcome::Warning(
                index,
                Warning::DuplicateKeys {
                    path: path.to_path_buf(),
                    count: stats.duplicates,
                    first,
                },
            ),
            None => Outcome::Ok(index),
        })
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<u64> {
        self.offsets.get(key).copied()
    }

    /// Removes `key` and returns its offset.
    pub fn pop(&mut self, key: &str) -> Option<u64> {
        self.offsets.remove(key)
    }

    /// Consumes the index, returning the entries still present in file order.
    pub fn into_remaining(self) -> Vec<(String, u64)> {
        let mut entries: Vec<_> = self.offsets.into_iter().collect();
        entries.sort_unstable_by_key(|(_, offset)| *offset);
        entries
    }
}

fn scan<R: BufRead>(mut reader: R, offsets: &mut HashMap<String, u64>) -> io::Result<ScanStats> {
    let mut stats = ScanStats::default();
    let mut header_found = false;
    let mut offset = 0u64;
    let mut buf = String::new();

    loop {
        buf.clear();
        let read = reader.read_line(&mut buf)?;
        if read == 0 {
            break;
        }
        let start = offset;
        offset += read as u64;

        if buf.starts_with('#') {
            continue;
        }
        if !header_found {
            header_found = true;
            continue;
        }

        let line = trim_line_end(&buf);
        if line.is_empty() {
            continue;
        }

        let key = leading_key(line);
        if offsets.insert(key.to_string(), start).is_some() {
            stats.duplicates += 1;
            if stats.first_duplicate.is_none() {
                stats.first_duplicate = Some(key.to_string());
            }
        }
    }

    Ok(stats)
}

/// Seeks to `offset` and reads the single line starting there, without its
/// terminator.
pub fn read_line_at<R>(reader: &mut R, offset: u64) -> io::Result<String>
where
    R: BufRead + Seek,
{
    reader.seek(SeekFrom::Start(offset))?;
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let len = trim_line_end(&line).len();
    line.truncate(len);
    Ok(line)
}
