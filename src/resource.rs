//! Locating library and output files by wildcard pattern.

use std::path::{Path, PathBuf};

use regex::Regex;
use walkdir::WalkDir;

use crate::error::{Outcome, PipelineError, Warning};

fn wildcard_regex(pattern: &str) -> Result<Regex, PipelineError> {
    let translated = regex::escape(pattern)
        .replace(r"\*", ".*")
        .replace(r"\?", ".");
    Regex::new(&format!("^{translated}$"))
        .map_err(|e| PipelineError::MissingResource(format!("invalid pattern {pattern}: {e}")))
}

/// Files directly inside `dir` whose name matches `pattern`, sorted.
///
/// `*` matches any run of characters and `?` a single one. An empty result
/// is an error unless `missing_ok` is set.
pub fn find_files(
    dir: &Path,
    pattern: &str,
    missing_ok: bool,
) -> Result<Vec<PathBuf>, PipelineError> {
    let matcher = wildcard_regex(pattern)?;
    let mut found = Vec::new();

    if dir.is_dir() {
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| PipelineError::Io {
                path: dir.to_path_buf(),
                source: e.into(),
            })?;
            if entry.file_name().to_str().is_some_and(|n| matcher.is_match(n)) {
                let path = entry.path();
                found.push(path.canonicalize().map_err(PipelineError::io(path))?);
            }
        }
    }
    found.sort();

    if found.is_empty() && !missing_ok {
        return Err(PipelineError::MissingResource(format!(
            "{} does not contain file with pattern {pattern}",
            dir.display()
        )));
    }
    Ok(found)
}

/// The single file in `dir` matching `pattern`.
///
/// Several matches are recoverable: the first in sorted order is chosen and
/// an [`Warning::AmbiguousResource`] is attached.
pub fn find_file(dir: &Path, pattern: &str) -> Result<Outcome<PathBuf>, PipelineError> {
    let mut found = find_files(dir, pattern, false)?;
    let candidates = found.len();
    let chosen = found.swap_remove(0);
    if candidates > 1 {
        let warning = Warning::AmbiguousResource {
            dir: dir.to_path_buf(),
            pattern: pattern.to_string(),
            chosen: chosen.clone(),
            candidates,
        };
        return Ok(Outcome::Warning(chosen, warning));
    }
    Ok(Outcome::Ok(chosen))
}

/// Like [`find_file`], but a missing file is `None`.
pub fn find_optional_file(
    dir: &Path,
    pattern: &str,
) -> Result<Option<Outcome<PathBuf>>, PipelineError> {
    if find_files(dir, pattern, true)?.is_empty() {
        return Ok(None);
    }
    find_file(dir, pattern).map(Some)
}
