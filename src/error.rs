//! Pipeline error taxonomy.
//!
//! Fatal conditions are returned as `Err(PipelineError)`. Conditions the
//! pipeline can recover from (an ambiguous file lookup, duplicate keys in an
//! index) come back as [`Outcome::Warning`] next to a usable value, so the
//! caller decides whether to log and continue or escalate.

use std::{fmt, io, path::PathBuf};

use thiserror::Error;

use crate::runner::ProcessVerdict;
use crate::table::ParseError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },
    #[error("{}:{line}: {reason}", .path.display())]
    MalformedLine {
        path: PathBuf,
        line: u64,
        reason: String,
    },
    #[error("malformed input {}: {reason}", .path.display())]
    MalformedInput { path: PathBuf, reason: String },
    #[error("missing resource: {0}")]
    MissingResource(String),
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("command failed ({}): {command}", .verdict.failure_reason().unwrap_or_default())]
    ExternalToolFailure {
        command: String,
        verdict: Box<ProcessVerdict>,
    },
    #[error("CSV error in {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }

    pub(crate) fn csv(path: impl Into<PathBuf>) -> impl FnOnce(csv::Error) -> Self {
        let path = path.into();
        move |source| Self::Csv { path, source }
    }
}

/// Recoverable conditions reported alongside a usable value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    AmbiguousResource {
        dir: PathBuf,
        pattern: String,
        chosen: PathBuf,
        candidates: usize,
    },
    DuplicateKeys {
        path: PathBuf,
        count: usize,
        first: String,
    },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AmbiguousResource {
                dir,
                pattern,
                chosen,
                candidates,
            } => write!(
                f,
                "{} contains {candidates} files matching {pattern}; {} is used",
                dir.display(),
                chosen.display()
            ),
            Self::DuplicateKeys { path, count, first } => write!(
                f,
                "{} has {count} duplicated keys (first: {first}); the last occurrence of each is used",
                path.display()
            ),
        }
    }
}

/// A successful result, optionally carrying a recoverable warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Ok(T),
    Warning(T, Warning),
}

impl<T> Outcome<T> {
    pub fn value(&self) -> &T {
        match self {
            Self::Ok(value) | Self::Warning(value, _) => value,
        }
    }

    pub fn warning(&self) -> Option<&Warning> {
        match self {
            Self::Ok(_) => None,
            Self::Warning(_, warning) => Some(warning),
        }
    }

    pub fn into_parts(self) -> (T, Option<Warning>) {
        match self {
            Self::Ok(value) => (value, None),
            Self::Warning(value, warning) => (value, Some(warning)),
        }
    }

    /// Unwraps the value, logging the warning if there is one.
    pub fn into_value(self) -> T {
        let (value, warning) = self.into_parts();
        if let Some(warning) = warning {
            tracing::warn!("{warning}");
        }
        value
    }

    pub fn map<U, F>(self, f: F) -> Outcome<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            Self::Ok(value) => Outcome::Ok(f(value)),
            Self::Warning(value, warning) => Outcome::Warning(f(value), warning),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_exposes_warning() {
        let warning = Warning::DuplicateKeys {
            path: PathBuf::from("mod.tsv"),
            count: 2,
            first: String::from("AX-1"),
        };
        let outcome = Outcome::Warning(5, warning.clone());
        assert_eq!(*outcome.value(), 5);
        assert_eq!(outcome.warning(), Some(&warning));
        assert_eq!(outcome.map(|v| v * 2).into_parts(), (10, Some(warning)));
    }

    #[test]
    fn warning_display_names_chosen_file() {
        let warning = Warning::AmbiguousResource {
            dir: PathBuf::from("/lib"),
            pattern: String::from("*.xml"),
            chosen: PathBuf::from("/lib/a.xml"),
            candidates: 2,
        };
        let text = warning.to_string();
        assert!(text.contains("2 files matching *.xml"));
        assert!(text.contains("/lib/a.xml is used"));
    }
}
