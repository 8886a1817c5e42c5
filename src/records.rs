//! Grouped readers for sparse, probeset-keyed tables.
//!
//! One logical record (a probeset) may span several consecutive physical
//! lines, distinguished by a key suffix: a ploidy label in posteriors tables
//! (`AX-1:1`, `AX-1:2`) or an allele code in summary tables (`AX-1-A`,
//! `AX-1-B`). The reader carries the record under construction between
//! lines and yields it when the key changes or the input ends.

use std::{
    collections::{BTreeMap, HashSet},
    io::BufRead,
    path::Path,
    sync::Arc,
};

use clap::ValueEnum;

use crate::{
    error::PipelineError,
    probeset::{NON_POLYMORPHIC_PREFIX, probeset_id},
    smart_reader::open_input,
    table::{Lines, ParseError, ParseErrorKind, header_samples, split_key},
};

/// Ploidy label used when a posteriors key has no `:` suffix.
pub const DEFAULT_PLOIDY: &str = "2";

/// Layout of a grouped table.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum TableKind {
    /// Posterior cluster parameters, keyed `<probeset>[:<ploidy>]`.
    Posteriors,
    /// Allele summary signals, keyed `<probeset>-<allele>`.
    Summaries,
    /// One score row per probeset.
    Scores,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PosteriorRecord {
    pub probeset_id: String,
    /// Raw parameter strings by ploidy label.
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRecord {
    pub probeset_id: String,
    /// Raw signal strings by allele code.
    pub signals: BTreeMap<char, String>,
    pub samples: Arc<[String]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreRecord {
    pub probeset_id: String,
    pub scores: String,
    pub samples: Arc<[String]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupedRecord {
    Posterior(PosteriorRecord),
    Summary(SummaryRecord),
    Score(ScoreRecord),
}

impl GroupedRecord {
    pub fn probeset_id(&self) -> &str {
        match self {
            Self::Posterior(r) => &r.probeset_id,
            Self::Summary(r) => &r.probeset_id,
            Self::Score(r) => &r.probeset_id,
        }
    }

    /// Number of physical lines merged into this record.
    pub fn line_count(&self) -> usize {
        match self {
            Self::Posterior(r) => r.params.len(),
            Self::Summary(r) => r.signals.len(),
            Self::Score(_) => 1,
        }
    }
}

/// Lazily yields [`GroupedRecord`]s from a table.
///
/// A single forward pass: restart by reopening the input. Iteration stops
/// after the first error.
pub struct Reader<R> {
    lines: Lines<R>,
    state: GroupState,
    header_read: bool,
    finished: bool,
}

struct GroupState {
    kind: TableKind,
    samples: Arc<[String]>,
    pending: Option<GroupedRecord>,
    closed: HashSet<String>,
}

impl<R> Reader<R>
where
    R: BufRead,
{
    pub fn new(inner: R, kind: TableKind) -> Self {
        Self {
            lines: Lines::new(inner),
            state: GroupState {
                kind,
                samples: Arc::from(Vec::new()),
                pending: None,
                closed: HashSet::new(),
            },
            header_read: false,
            finished: false,
        }
    }

    pub fn posteriors(inner: R) -> Self {
        Self::new(inner, TableKind::Posteriors)
    }

    pub fn summaries(inner: R) -> Self {
        Self::new(inner, TableKind::Summaries)
    }

    pub fn scores(inner: R) -> Self {
        Self::new(inner, TableKind::Scores)
    }

    /// Sample names from the header; empty until the first record is read.
    pub fn samples(&self) -> &Arc<[String]> {
        &self.state.samples
    }

    fn fail(&mut self, kind: ParseErrorKind) -> Option<Result<GroupedRecord, ParseError>> {
        self.finished = true;
        Some(Err(ParseError {
            line: self.lines.line_number(),
            raw: self.lines.current().to_string(),
            kind,
        }))
    }
}

impl Reader<Box<dyn BufRead + Send>> {
    /// Opens a table of the given kind, decompressing GZIP transparently.
    pub fn open<P: AsRef<Path>>(path: P, kind: TableKind) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let input = open_input(path).map_err(PipelineError::io(path))?;
        Ok(Self::new(input, kind))
    }
}

impl<R> Iterator for Reader<R>
where
    R: BufRead,
{
    type Item = Result<GroupedRecord, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        if !self.header_read {
            self.header_read = true;
            match self.lines.read_preamble(None) {
                Ok(Some(header)) => {
                    self.state.samples = Arc::from(header_samples(&header));
                }
                Ok(None) => {
                    self.finished = true;
                    return None;
                }
                Err(e) => return self.fail(ParseErrorKind::Io(e)),
            }
        }

        loop {
            match self.lines.advance() {
                Ok(true) => {}
                Ok(false) => {
                    self.finished = true;
                    return self.state.pending.take().map(Ok);
                }
                Err(e) => return self.fail(ParseErrorKind::Io(e)),
            }

            let line = self.lines.current().trim();
            if line.is_empty() {
                continue;
            }

            match self.state.accept(line) {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => continue,
                Err(kind) => return self.fail(kind),
            }
        }
    }
}

impl GroupState {
    /// Folds one data line into the pending record, returning the previous
    /// record once its group is complete.
    fn accept(&mut self, line: &str) -> Result<Option<GroupedRecord>, ParseErrorKind> {
        if self.kind == TableKind::Summaries && line.starts_with(NON_POLYMORPHIC_PREFIX) {
            return Ok(None);
        }

        let (key, value) = split_key(line)?;
        if probeset_id(key).is_none() {
            return Err(ParseErrorKind::InvalidProbesetKey(key.to_string()));
        }

        if self.kind == TableKind::Scores {
            return Ok(Some(GroupedRecord::Score(ScoreRecord {
                probeset_id: key.to_string(),
                scores: value.to_string(),
                samples: Arc::clone(&self.samples),
            })));
        }

        let (probeset_id, sub_key) = match self.kind {
            TableKind::Posteriors => split_ploidy(key)?,
            _ => split_allele(key)?,
        };
        if crate::probeset::probeset_id(probeset_id) != Some(probeset_id) {
            return Err(ParseErrorKind::InvalidProbesetKey(key.to_string()));
        }

        if let Some(pending) = self.pending.as_mut()
            && pending.probeset_id() == probeset_id
        {
            insert_entry(pending, sub_key, value);
            return Ok(None);
        }

        if self.closed.contains(probeset_id) {
            return Err(ParseErrorKind::NonContiguousGroup(probeset_id.to_string()));
        }

        let mut record = match self.kind {
            TableKind::Posteriors => GroupedRecord::Posterior(PosteriorRecord {
                probeset_id: probeset_id.to_string(),
                params: BTreeMap::new(),
            }),
            _ => GroupedRecord::Summary(SummaryRecord {
                probeset_id: probeset_id.to_string(),
                signals: BTreeMap::new(),
                samples: Arc::clone(&self.samples),
            }),
        };
        insert_entry(&mut record, sub_key, value);

        let finished = self.pending.replace(record);
        if let Some(done) = &finished {
            self.closed.insert(done.probeset_id().to_string());
        }
        Ok(finished)
    }
}

enum SubKey<'a> {
    Ploidy(&'a str),
    Allele(char),
}

fn insert_entry(record: &mut GroupedRecord, sub_key: SubKey<'_>, value: &str) {
    match (record, sub_key) {
        (GroupedRecord::Posterior(r), SubKey::Ploidy(ploidy)) => {
            r.params.insert(ploidy.to_string(), value.to_string());
        }
        (GroupedRecord::Summary(r), SubKey::Allele(allele)) => {
            r.signals.insert(allele, value.to_string());
        }
        _ => unreachable!("sub-key kind follows the table kind"),
    }
}

fn split_ploidy(key: &str) -> Result<(&str, SubKey<'_>), ParseErrorKind> {
    let mut parts = key.split(':');
    let probeset_id = parts.next().unwrap_or(key);
    let ploidy = parts.next();
    if parts.next().is_some() || probeset_id.is_empty() || ploidy == Some("") {
        return Err(ParseErrorKind::InvalidPloidy(key.to_string()));
    }
    Ok((probeset_id, SubKey::Ploidy(ploidy.unwrap_or(DEFAULT_PLOIDY))))
}

fn split_allele(key: &str) -> Result<(&str, SubKey<'_>), ParseErrorKind> {
    let mut chars = key.char_indices();
    let (split, allele) = chars
        .next_back()
        .ok_or_else(|| ParseErrorKind::InvalidAllele(key.to_string()))?;
    let stem = &key[..split];
    let probeset_id = stem.strip_suffix('-').unwrap_or(stem);
    if probeset_id.is_empty() {
        return Err(ParseErrorKind::InvalidAllele(key.to_string()));
    }
    Ok((probeset_id, SubKey::Allele(allele)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(data: &str, kind: TableKind) -> Vec<GroupedRecord> {
        Reader::new(data.as_bytes(), kind)
            .collect::<Result<Vec<_>, _>>()
            .expect("parse")
    }

    #[test]
    fn posteriors_group_by_probeset() {
        let data = "#%header\nid\tBB\tAB\tAA\nAX-1:1\tp11\nAX-1:2\tp12\nAX-2\tp2\n";
        let records = collect(data, TableKind::Posteriors);
        assert_eq!(records.len(), 2);

        let GroupedRecord::Posterior(first) = &records[0] else {
            panic!("expected posterior record");
        };
        assert_eq!(first.probeset_id, "AX-1");
        assert_eq!(first.params.keys().collect::<Vec<_>>(), vec!["1", "2"]);
        assert_eq!(first.params["2"], "p12");

        let GroupedRecord::Posterior(second) = &records[1] else {
            panic!("expected posterior record");
        };
        assert_eq!(second.probeset_id, "AX-2");
        assert_eq!(second.params.keys().collect::<Vec<_>>(), vec![DEFAULT_PLOIDY]);
    }

    #[test]
    fn final_group_is_flushed_once() {
        let data = "id\tx\nAX-1\ta\nAX-2:1\tb\nAX-2:2\tc\n";
        let mut reader = Reader::posteriors(data.as_bytes());
        assert_eq!(reader.next().unwrap().unwrap().probeset_id(), "AX-1");
        let last = reader.next().unwrap().unwrap();
        assert_eq!(last.probeset_id(), "AX-2");
        assert_eq!(last.line_count(), 2);
        assert!(reader.next().is_none());
        assert!(reader.next().is_none());
    }

    #[test]
    fn summaries_skip_control_probes_and_share_samples() {
        let data = "#c\nprobeset_id\tS1.CEL\tS2.CEL\n\
                    AFFX-NP-1-A\t1\t1\n\
                    AX-10-A\t100\t110\n\
                    AX-10-B\t200\t210\n\
                    AFFX-NP-2-B\t1\t1\n\
                    AX-11-A\t300\t310\n";
        let mut reader = Reader::summaries(data.as_bytes());
        let records = reader.by_ref().collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(reader.samples().len(), 2);

        let GroupedRecord::Summary(first) = &records[0] else {
            panic!("expected summary record");
        };
        assert_eq!(first.probeset_id, "AX-10");
        assert_eq!(first.signals[&'A'], "100\t110");
        assert_eq!(first.signals[&'B'], "200\t210");
        assert_eq!(&*first.samples, &["S1.CEL".to_string(), "S2.CEL".to_string()]);

        let GroupedRecord::Summary(second) = &records[1] else {
            panic!("expected summary record");
        };
        assert!(Arc::ptr_eq(&first.samples, &second.samples));
    }

    #[test]
    fn scores_are_flat() {
        let data = "probeset_id\tA.CEL\tB.CEL\nAX-1\t0.1\t0.2\nAX-1\t0.3\t0.4\n";
        let records = collect(data, TableKind::Scores);
        assert_eq!(records.len(), 2);
        let GroupedRecord::Score(score) = &records[1] else {
            panic!("expected score record");
        };
        assert_eq!(score.scores, "0.3\t0.4");
        assert_eq!(score.samples.len(), 2);
    }

    #[test]
    fn reappearing_probeset_is_an_error() {
        let data = "id\tx\nAX-1:1\ta\nAX-2\tb\nAX-1:2\tc\n";
        let results: Vec<_> = Reader::posteriors(data.as_bytes()).collect();
        assert_eq!(results.len(), 2);
        let err = results[1].as_ref().unwrap_err();
        assert_eq!(err.line, 4);
        assert!(matches!(err.kind, ParseErrorKind::NonContiguousGroup(ref id) if id == "AX-1"));
    }

    #[test]
    fn malformed_keys_stop_iteration() {
        let mut reader = Reader::posteriors("id\tx\nAX-1:1:2\ta\nAX-2\tb\n".as_bytes());
        let err = reader.next().unwrap().unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::InvalidPloidy(_)));
        assert!(reader.next().is_none());

        let mut reader = Reader::scores("id\tx\nAX-1\n".as_bytes());
        let err = reader.next().unwrap().unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::MissingDelimiter(_)));

        let mut reader = Reader::summaries("id\tx\nrs42-A\t1\n".as_bytes());
        let err = reader.next().unwrap().unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::InvalidProbesetKey(ref k) if k == "rs42-A"));
        assert_eq!(err.raw, "rs42-A\t1");
    }

    #[test]
    fn split_probeset_id_must_be_complete() {
        let mut reader = Reader::summaries("probeset_id\tS1\nAX-1\t5\nAX-12-A\t1\n".as_bytes());
        let err = reader.next().unwrap().unwrap_err();
        assert_eq!(err.line, 2);
        assert!(matches!(err.kind, ParseErrorKind::InvalidProbesetKey(ref k) if k == "AX-1"));
        assert!(reader.next().is_none());
    }

    #[test]
    fn empty_inputs_yield_nothing() {
        assert!(collect("", TableKind::Posteriors).is_empty());
        assert!(collect("#only comments\n", TableKind::Summaries).is_empty());
        assert!(collect("id\tA\n\n", TableKind::Scores).is_empty());
    }

    #[test]
    fn allele_key_splitting() {
        assert!(matches!(split_allele("AX-1-A"), Ok(("AX-1", SubKey::Allele('A')))));
        assert!(matches!(split_allele("AX-1B"), Ok(("AX-1", SubKey::Allele('B')))));
        assert!(split_allele("A").is_err());
        assert!(split_allele("-A").is_err());
    }
}
