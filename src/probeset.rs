use std::{
    collections::HashSet,
    fs::File,
    io::{BufRead, BufWriter, Write},
    path::Path,
    sync::LazyLock,
};

use regex::Regex;

use crate::{error::PipelineError, smart_reader::open_input};

/// Prefix of non-polymorphic control probes in summary tables.
pub const NON_POLYMORPHIC_PREFIX: &str = "AFFX-NP-";

/// Header line of probeset list files.
pub const PROBESET_LIST_HEADER: &str = "probeset_id";

static PROBESET_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^((?:AX|AFFX-SP|AFFX-NP)-\d+).*$").expect("probeset id pattern is valid")
});

/// Extracts the probeset id from a composite row key such as `AX-11086525:1`
/// or `AX-11086525-A`.
pub fn probeset_id(key: &str) -> Option<&str> {
    PROBESET_ID
        .captures(key)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Reads a probeset list (`probeset_id` header, one id per line).
///
/// A first line that is not the header is treated as an id.
pub fn read_probeset_list<P: AsRef<Path>>(path: P) -> Result<HashSet<String>, PipelineError> {
    let path = path.as_ref();
    let reader = open_input(path).map_err(PipelineError::io(path))?;

    let mut ids = HashSet::new();
    let mut seen_first = false;
    for line in reader.lines() {
        let line = line.map_err(PipelineError::io(path))?;
        let id = line.trim();
        if id.is_empty() || id.starts_with('#') {
            continue;
        }
        if !seen_first {
            seen_first = true;
            if id == PROBESET_LIST_HEADER {
                continue;
            }
        }
        ids.insert(id.to_string());
    }

    tracing::debug!(path = %path.display(), count = ids.len(), "loaded probeset list");
    Ok(ids)
}

pub fn write_probeset_list<P, I, S>(path: P, ids: I) -> Result<(), PipelineError>
where
    P: AsRef<Path>,
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let path = path.as_ref();
    let file = File::create(path).map_err(PipelineError::io(path))?;
    let mut writer = BufWriter::new(file);
    let result = (|| {
        writeln!(writer, "{PROBESET_LIST_HEADER}")?;
        for id in ids {
            writeln!(writer, "{}", id.as_ref())?;
        }
        writer.flush()
    })();
    result.map_err(PipelineError::io(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    #[test]
    fn extracts_probeset_from_composite_keys() {
        assert_eq!(probeset_id("AX-11086525"), Some("AX-11086525"));
        assert_eq!(probeset_id("AX-11086525:1"), Some("AX-11086525"));
        assert_eq!(probeset_id("AX-11086525-A"), Some("AX-11086525"));
        assert_eq!(probeset_id("AFFX-SP-000001"), Some("AFFX-SP-000001"));
        assert_eq!(probeset_id("AFFX-NP-42-B"), Some("AFFX-NP-42"));
    }

    #[test]
    fn rejects_unknown_prefixes() {
        assert_eq!(probeset_id("rs123"), None);
        assert_eq!(probeset_id("AX-"), None);
        assert_eq!(probeset_id("xAX-1"), None);
        assert_eq!(probeset_id(""), None);
    }

    #[test]
    fn probeset_list_round_trip_skips_header() {
        let temp = assert_fs::TempDir::new().unwrap();
        let list = temp.child("improved.ps");
        write_probeset_list(list.path(), ["AX-2", "AX-1"]).unwrap();
        list.assert("probeset_id\nAX-2\nAX-1\n");

        let ids = read_probeset_list(list.path()).unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("AX-1"));
        assert!(!ids.contains(PROBESET_LIST_HEADER));
    }

    #[test]
    fn probeset_list_without_header() {
        let temp = assert_fs::TempDir::new().unwrap();
        let list = temp.child("target.ps");
        list.write_str("#comment\nAX-7\n\nAX-8\n").unwrap();
        let ids = read_probeset_list(list.path()).unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("AX-7"));
    }
}
