//! Patching a default result table with rows from a modified one.
//!
//! The static-column merge streams the default table and pulls replacement
//! rows out of the modified table by byte offset, so neither file is held in
//! memory. The dynamic-column merge handles tables whose sample columns
//! differ between the two runs.

use std::{
    collections::{HashMap, HashSet},
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
};

use serde::Serialize;

use crate::{
    error::{PipelineError, Warning},
    index::{KeyedLineIndex, read_line_at},
    probeset::probeset_id,
    smart_reader::{is_gzip, open_input},
    table::{Lines, leading_key},
};

/// Column holding the probeset id in dynamic-column tables.
pub const PROBESET_ID_COLUMN: &str = "probeset_id";

/// Which source supplies each probeset's row, and which probesets to keep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergePolicy {
    /// Probesets whose rows must come from the modified table. When empty,
    /// any row present in the modified table wins.
    pub improved: HashSet<String>,
    /// When non-empty, only these probesets are written.
    pub target: HashSet<String>,
}

impl MergePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_improved<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.improved = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_target<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target = ids.into_iter().map(Into::into).collect();
        self
    }

    /// True if the target filter lets `probeset_id` through.
    pub fn is_targeted(&self, probeset_id: &str) -> bool {
        self.target.is_empty() || self.target.contains(probeset_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    /// Rows copied from the default table.
    pub default_rows: usize,
    /// Default rows replaced by their modified counterpart.
    pub replaced_rows: usize,
    /// Rows present only in the modified table, appended at the end.
    pub appended_rows: usize,
    /// Rows dropped by the target filter.
    pub filtered_rows: usize,
    /// Keys that occurred more than once in the modified table.
    pub duplicate_modified_keys: usize,
}

impl MergeSummary {
    pub fn written_rows(&self) -> usize {
        self.default_rows + self.replaced_rows + self.appended_rows
    }
}

/// Merges two tables that share the same columns.
///
/// Comments and header come from `default`. Each default row is replaced by
/// the modified row with the same key according to `policy`; rows only the
/// modified table has are appended afterwards in file order.
pub fn merge_static_column_file<P, Q, O>(
    default: P,
    modified: Q,
    merged: O,
    policy: &MergePolicy,
) -> Result<MergeSummary, PipelineError>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
    O: AsRef<Path>,
{
    let default = default.as_ref();
    let modified = modified.as_ref();
    let merged = merged.as_ref();
    let mut summary = MergeSummary::default();

    let (mut index, warning) = KeyedLineIndex::build(modified)?.into_parts();
    if let Some(warning) = warning {
        if let Warning::DuplicateKeys { count, .. } = &warning {
            summary.duplicate_modified_keys = *count;
        }
        tracing::warn!("{warning}");
    }

    let modified_file = File::open(modified).map_err(PipelineError::io(modified))?;
    let mut modified_reader = BufReader::new(modified_file);

    if is_gzip(default).map_err(PipelineError::io(default))? {
        return Err(PipelineError::MalformedInput {
            path: default.to_path_buf(),
            reason: String::from("compressed default tables are not supported by the static merge"),
        });
    }
    let default_file = File::open(default).map_err(PipelineError::io(default))?;
    let mut lines = Lines::new(BufReader::new(default_file));

    let out_file = File::create(merged).map_err(PipelineError::io(merged))?;
    let mut out = BufWriter::new(out_file);

    let mut comments = Vec::new();
    let header = lines
        .read_preamble(Some(&mut comments))
        .map_err(PipelineError::io(default))?;
    for comment in &comments {
        out.write_all(comment.as_bytes())
            .map_err(PipelineError::io(merged))?;
    }
    if header.is_some() {
        let raw = lines.raw();
        out.write_all(raw.as_bytes())
            .map_err(PipelineError::io(merged))?;
        if !raw.ends_with('\n') {
            out.write_all(b"\n").map_err(PipelineError::io(merged))?;
        }
    }

    while lines.advance().map_err(PipelineError::io(default))? {
        let line = lines.current();
        if line.is_empty() {
            continue;
        }
        let key = leading_key(line);
        let psid = probeset_id(key).ok_or_else(|| PipelineError::MalformedLine {
            path: default.to_path_buf(),
            line: lines.line_number(),
            reason: format!("row key {key} does not start with a probeset id"),
        })?;

        // consumed even when filtered out, so it is not appended later
        let offset = index.pop(key);

        if !policy.is_targeted(psid) {
            summary.filtered_rows += 1;
            continue;
        }

        let modified_row = offset
            .map(|offset| read_line_at(&mut modified_reader, offset))
            .transpose()
            .map_err(PipelineError::io(modified))?;

        let row = if !policy.improved.is_empty() {
            if policy.improved.contains(psid) {
                let row = modified_row.ok_or_else(|| PipelineError::MalformedInput {
                    path: modified.to_path_buf(),
                    reason: format!("improved probeset {psid} has no row keyed {key}"),
                })?;
                summary.replaced_rows += 1;
                row
            } else {
                summary.default_rows += 1;
                line.to_string()
            }
        } else if let Some(row) = modified_row {
            summary.replaced_rows += 1;
            row
        } else {
            summary.default_rows += 1;
            line.to_string()
        };

        writeln!(out, "{row}").map_err(PipelineError::io(merged))?;
    }

    for (key, offset) in index.into_remaining() {
        let psid = probeset_id(&key).ok_or_else(|| PipelineError::MalformedInput {
            path: modified.to_path_buf(),
            reason: format!("row key {key} does not start with a probeset id"),
        })?;
        if !policy.is_targeted(psid) {
            summary.filtered_rows += 1;
            continue;
        }
        let row =
            read_line_at(&mut modified_reader, offset).map_err(PipelineError::io(modified))?;
        writeln!(out, "{row}").map_err(PipelineError::io(merged))?;
        summary.appended_rows += 1;
    }

    out.flush().map_err(PipelineError::io(merged))?;

    tracing::info!(
        output = %merged.display(),
        default_rows = summary.default_rows,
        replaced_rows = summary.replaced_rows,
        appended_rows = summary.appended_rows,
        filtered_rows = summary.filtered_rows,
        "merged result tables",
    );
    Ok(summary)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubsetSummary {
    pub kept_rows: usize,
    pub dropped_rows: usize,
}

/// Copies comments, header and the rows whose probeset is in `probesets`.
pub fn subset_file<P, O>(
    input: P,
    output: O,
    probesets: &HashSet<String>,
) -> Result<SubsetSummary, PipelineError>
where
    P: AsRef<Path>,
    O: AsRef<Path>,
{
    let input = input.as_ref();
    let output = output.as_ref();
    let mut lines = Lines::new(open_input(input).map_err(PipelineError::io(input))?);
    let file = File::create(output).map_err(PipelineError::io(output))?;
    let mut writer = BufWriter::new(file);
    let mut summary = SubsetSummary::default();

    let mut comments = Vec::new();
    let header = lines
        .read_preamble(Some(&mut comments))
        .map_err(PipelineError::io(input))?;
    for comment in &comments {
        writer
            .write_all(comment.as_bytes())
            .map_err(PipelineError::io(output))?;
    }
    if let Some(header) = header {
        writeln!(writer, "{header}").map_err(PipelineError::io(output))?;
    }

    while lines.advance().map_err(PipelineError::io(input))? {
        let line = lines.current();
        if line.is_empty() {
            continue;
        }
        let key = leading_key(line);
        let psid = probeset_id(key).ok_or_else(|| PipelineError::MalformedLine {
            path: input.to_path_buf(),
            line: lines.line_number(),
            reason: line.chars().take(78).collect(),
        })?;
        if probesets.contains(psid) {
            writeln!(writer, "{line}").map_err(PipelineError::io(output))?;
            summary.kept_rows += 1;
        } else {
            summary.dropped_rows += 1;
        }
    }

    writer.flush().map_err(PipelineError::io(output))?;
    tracing::info!(
        output = %output.display(),
        kept = summary.kept_rows,
        dropped = summary.dropped_rows,
        "wrote probeset subset",
    );
    Ok(summary)
}

/// Merges two tables whose column sets may differ.
///
/// Default rows of improved probesets are dropped, modified rows of improved
/// probesets are appended, and the target filter applies to both. The output
/// header lists the default columns followed by columns only the modified
/// table has; cells a source lacks are left empty. Comments are not carried.
pub fn merge_dynamic_column_file<P, Q, O>(
    default: P,
    modified: Q,
    merged: O,
    policy: &MergePolicy,
) -> Result<MergeSummary, PipelineError>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
    O: AsRef<Path>,
{
    let default = default.as_ref();
    let modified = modified.as_ref();
    let merged = merged.as_ref();

    let mut default_reader = tsv_reader(default)?;
    let mut modified_reader = tsv_reader(modified)?;
    let default_columns = headers(&mut default_reader, default)?;
    let modified_columns = headers(&mut modified_reader, modified)?;

    let mut columns = default_columns.clone();
    for column in &modified_columns {
        if !columns.contains(column) {
            columns.push(column.clone());
        }
    }

    let file = File::create(merged).map_err(PipelineError::io(merged))?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .quote_style(csv::QuoteStyle::Never)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(BufWriter::new(file));
    writer
        .write_record(&columns)
        .map_err(PipelineError::csv(merged))?;

    let mut summary = MergeSummary::default();
    let sources = [
        (default, &default_columns, &mut default_reader, false),
        (modified, &modified_columns, &mut modified_reader, true),
    ];
    for (path, source_columns, reader, from_modified) in sources {
        let id_column = column_position(source_columns, PROBESET_ID_COLUMN, path)?;
        let projection: Vec<Option<usize>> = columns
            .iter()
            .map(|c| source_columns.iter().position(|s| s == c))
            .collect();

        for record in reader.records() {
            let record = record.map_err(PipelineError::csv(path))?;
            let id = record.get(id_column).unwrap_or_default();
            if policy.improved.contains(id) != from_modified {
                continue;
            }
            if !policy.is_targeted(id) {
                summary.filtered_rows += 1;
                continue;
            }
            let row = projection
                .iter()
                .map(|position| position.and_then(|i| record.get(i)).unwrap_or_default());
            writer.write_record(row).map_err(PipelineError::csv(merged))?;
            if from_modified {
                summary.replaced_rows += 1;
            } else {
                summary.default_rows += 1;
            }
        }
    }

    writer.flush().map_err(PipelineError::io(merged))?;
    tracing::info!(
        output = %merged.display(),
        default_rows = summary.default_rows,
        replaced_rows = summary.replaced_rows,
        columns = columns.len(),
        "merged dynamic-column tables",
    );
    Ok(summary)
}

pub(crate) fn tsv_reader(
    path: &Path,
) -> Result<csv::Reader<Box<dyn BufRead + Send>>, PipelineError> {
    let input = open_input(path).map_err(PipelineError::io(path))?;
    Ok(csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .comment(Some(b'#'))
        .quoting(false)
        .from_reader(input))
}

pub(crate) fn headers<R: std::io::Read>(
    reader: &mut csv::Reader<R>,
    path: &Path,
) -> Result<Vec<String>, PipelineError> {
    Ok(reader
        .headers()
        .map_err(PipelineError::csv(path))?
        .iter()
        .map(str::to_string)
        .collect())
}

pub(crate) fn column_position(
    columns: &[String],
    name: &str,
    path: &Path,
) -> Result<usize, PipelineError> {
    columns
        .iter()
        .position(|c| c == name)
        .ok_or_else(|| PipelineError::MalformedInput {
            path: path.to_path_buf(),
            reason: format!("missing column {name}"),
        })
}

/// Column positions keyed by name, for tables read by header.
pub(crate) fn column_map(columns: &[String]) -> HashMap<&str, usize> {
    columns
        .iter()
        .enumerate()
        .map(|(i, c)| (c.as_str(), i))
        .collect()
}
