//! Per-sample metric tables produced by the genotyping tools, and the QC
//! tables written back out.

use std::{
    collections::HashMap,
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use flate2::{Compression, write::GzEncoder};
use serde::Serialize;

use crate::{
    error::PipelineError,
    merge::{column_map, column_position, headers, tsv_reader},
};

const NO_CALL: i32 = -1;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DqcRecord {
    pub cel_name: String,
    pub dqc: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallRate {
    pub cel_name: String,
    /// Percent of probesets with a call.
    pub call_rate: f64,
}

fn record_line(record: &csv::StringRecord) -> u64 {
    record.position().map_or(0, csv::Position::line)
}

fn parse_float(
    path: &Path,
    record: &csv::StringRecord,
    column: usize,
    name: &str,
) -> Result<f64, PipelineError> {
    let cell = record.get(column).unwrap_or_default().trim();
    if cell.is_empty() {
        return Ok(f64::NAN);
    }
    cell.parse().map_err(|_| PipelineError::MalformedLine {
        path: path.to_path_buf(),
        line: record_line(record),
        reason: format!("{name} is not a number: {cell}"),
    })
}

/// Reads `cel_files` and `axiom_dishqc_DQC` from a DQC report.
pub fn read_dqc_report<P: AsRef<Path>>(path: P) -> Result<Vec<DqcRecord>, PipelineError> {
    read_sample_metric(path.as_ref(), "axiom_dishqc_DQC")
        .map(|rows| rows.into_iter().map(|(cel_name, dqc)| DqcRecord { cel_name, dqc }).collect())
}

/// Reads `cel_files` and `call_rate` from a genotyping report.
pub fn call_rates_from_report_file<P: AsRef<Path>>(
    path: P,
) -> Result<Vec<CallRate>, PipelineError> {
    read_sample_metric(path.as_ref(), "call_rate").map(|rows| {
        rows.into_iter()
            .map(|(cel_name, call_rate)| CallRate { cel_name, call_rate })
            .collect()
    })
}

fn read_sample_metric(path: &Path, metric: &str) -> Result<Vec<(String, f64)>, PipelineError> {
    let mut reader = tsv_reader(path)?;
    let columns = headers(&mut reader, path)?;
    let name_col = column_position(&columns, "cel_files", path)?;
    let metric_col = column_position(&columns, metric, path)?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(PipelineError::csv(path))?;
        let name = record.get(name_col).unwrap_or_default().to_string();
        let value = parse_float(path, &record, metric_col, metric)?;
        rows.push((name, value));
    }
    tracing::debug!(path = %path.display(), metric, samples = rows.len(), "read sample metric");
    Ok(rows)
}

/// Computes each sample's call rate from a calls table.
///
/// Every column after the row key is a sample; the rate is the percentage of
/// rows whose call is not `-1`. A table without data rows yields NaN rates.
pub fn call_rates_from_calls_file<P: AsRef<Path>>(
    path: P,
) -> Result<Vec<CallRate>, PipelineError> {
    let path = path.as_ref();
    let mut reader = tsv_reader(path)?;
    let columns = headers(&mut reader, path)?;
    let samples = columns.get(1..).unwrap_or_default();

    let mut called = vec![0u64; samples.len()];
    let mut total = 0u64;
    for record in reader.records() {
        let record = record.map_err(PipelineError::csv(path))?;
        total += 1;
        for (i, count) in called.iter_mut().enumerate() {
            let cell = record.get(i + 1).unwrap_or_default();
            let code: i32 = cell.trim().parse().map_err(|_| PipelineError::MalformedLine {
                path: path.to_path_buf(),
                line: record_line(&record),
                reason: format!("call code is not an integer: {cell}"),
            })?;
            if code != NO_CALL {
                *count += 1;
            }
        }
    }

    Ok(samples
        .iter()
        .zip(called)
        .map(|(sample, n)| CallRate {
            cel_name: sample.clone(),
            call_rate: round10(n as f64 / total as f64 * 100.0),
        })
        .collect())
}

fn round10(value: f64) -> f64 {
    (value * 1e10).round() / 1e10
}

/// Reads the sample to plate barcode assignment.
///
/// The sample column may be named `cel_name` or `cel_files`; the barcode
/// column is `sbarcode`.
pub fn read_platemap<P: AsRef<Path>>(path: P) -> Result<HashMap<String, String>, PipelineError> {
    let path = path.as_ref();
    let mut reader = tsv_reader(path)?;
    let columns = headers(&mut reader, path)?;
    let positions = column_map(&columns);
    let name_col = positions
        .get("cel_name")
        .or_else(|| positions.get("cel_files"))
        .copied()
        .ok_or_else(|| PipelineError::MalformedInput {
            path: path.to_path_buf(),
            reason: String::from("missing column cel_name"),
        })?;
    let barcode_col = column_position(&columns, "sbarcode", path)?;

    let mut plates = HashMap::new();
    for record in reader.records() {
        let record = record.map_err(PipelineError::csv(path))?;
        plates.insert(
            record.get(name_col).unwrap_or_default().to_string(),
            record.get(barcode_col).unwrap_or_default().to_string(),
        );
    }
    Ok(plates)
}

/// Writes `rows` as a tab-separated table with a header taken from the
/// field names. With `compress` the file gets a `.tsv.gz` suffix and is
/// gzip-encoded. Returns the path actually written.
pub fn write_table<T, I>(path: &Path, rows: I, compress: bool) -> Result<PathBuf, PipelineError>
where
    T: Serialize,
    I: IntoIterator<Item = T>,
{
    let target = if compress {
        path.with_extension("tsv.gz")
    } else {
        path.to_path_buf()
    };
    let file = File::create(&target).map_err(PipelineError::io(&target))?;

    if compress {
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let encoder = serialize_rows(encoder, rows, &target)?;
        encoder
            .finish()
            .and_then(|mut inner| inner.flush())
            .map_err(PipelineError::io(&target))?;
    } else {
        let mut inner = serialize_rows(BufWriter::new(file), rows, &target)?;
        inner.flush().map_err(PipelineError::io(&target))?;
    }

    tracing::info!(path = %target.display(), "wrote table");
    Ok(target)
}

fn serialize_rows<W, T, I>(writer: W, rows: I, path: &Path) -> Result<W, PipelineError>
where
    W: Write,
    T: Serialize,
    I: IntoIterator<Item = T>,
{
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .quote_style(csv::QuoteStyle::Never)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(writer);
    for row in rows {
        writer.serialize(row).map_err(PipelineError::csv(path))?;
    }
    writer
        .into_inner()
        .map_err(|e| PipelineError::io(path)(e.into_error()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smart_reader::open_input;
    use assert_fs::prelude::*;
    use std::io::Read;

    #[test]
    fn dqc_report_columns() {
        let temp = assert_fs::TempDir::new().unwrap();
        let report = temp.child("apt-geno-qc.txt");
        report
            .write_str(
                "#%guid=x\ncel_files\taxiom_dishqc_DQC\tother\nA.CEL\t0.95\t1\nB.CEL\t0.41\t2\nC.CEL\t\t3\n",
            )
            .unwrap();
        let rows = read_dqc_report(report.path()).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], DqcRecord { cel_name: "A.CEL".into(), dqc: 0.95 });
        assert_eq!(rows[1].dqc, 0.41);
        assert!(rows[2].dqc.is_nan());
    }

    #[test]
    fn bad_metric_reports_line() {
        let temp = assert_fs::TempDir::new().unwrap();
        let report = temp.child("report.txt");
        report
            .write_str("cel_files\tcall_rate\nA.CEL\t99.1\nB.CEL\tabc\n")
            .unwrap();
        let err = call_rates_from_report_file(report.path()).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedLine { line: 3, .. }), "{err}");
    }

    #[test]
    fn call_rates_count_non_missing_calls() {
        let temp = assert_fs::TempDir::new().unwrap();
        let calls = temp.child("calls.txt");
        calls
            .write_str(
                "#%x=1\nprobeset_id\tA.CEL\tB.CEL\nAX-1\t0\t-1\nAX-2\t1\t-1\nAX-3\t2\t2\nAX-4\t-1\t1\n",
            )
            .unwrap();
        let rates = call_rates_from_calls_file(calls.path()).unwrap();
        assert_eq!(rates[0].cel_name, "A.CEL");
        assert_eq!(rates[0].call_rate, 75.0);
        assert_eq!(rates[1].call_rate, 50.0);
    }

    #[test]
    fn call_rates_of_empty_table_are_nan() {
        let temp = assert_fs::TempDir::new().unwrap();
        let calls = temp.child("calls.txt");
        calls.write_str("probeset_id\tA.CEL\n").unwrap();
        let rates = call_rates_from_calls_file(calls.path()).unwrap();
        assert!(rates[0].call_rate.is_nan());
    }

    #[test]
    fn platemap_accepts_either_sample_column() {
        let temp = assert_fs::TempDir::new().unwrap();
        let a = temp.child("a.tsv");
        a.write_str("cel_name\tsbarcode\nA.CEL\tP1\nB.CEL\tP2\n").unwrap();
        let b = temp.child("b.tsv");
        b.write_str("sbarcode\tcel_files\nP3\tC.CEL\n").unwrap();
        let c = temp.child("c.tsv");
        c.write_str("sample\tsbarcode\nA\tP1\n").unwrap();

        assert_eq!(read_platemap(a.path()).unwrap()["B.CEL"], "P2");
        assert_eq!(read_platemap(b.path()).unwrap()["C.CEL"], "P3");
        assert!(matches!(
            read_platemap(c.path()),
            Err(PipelineError::MalformedInput { .. })
        ));
    }

    #[derive(Serialize)]
    struct Row {
        cel_name: &'static str,
        dqc: f64,
    }

    #[test]
    fn tables_write_plain_and_gzip() {
        let temp = assert_fs::TempDir::new().unwrap();
        let rows = || [Row { cel_name: "A.CEL", dqc: 0.5 }, Row { cel_name: "B.CEL", dqc: 0.9 }];

        let plain = write_table(&temp.path().join("dqc.tsv"), rows(), false).unwrap();
        assert_eq!(
            std::fs::read_to_string(&plain).unwrap(),
            "cel_name\tdqc\nA.CEL\t0.5\nB.CEL\t0.9\n"
        );

        let packed = write_table(&temp.path().join("dqc.tsv"), rows(), true).unwrap();
        assert!(packed.to_string_lossy().ends_with("dqc.tsv.gz"));
        let mut text = String::new();
        open_input(&packed).unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "cel_name\tdqc\nA.CEL\t0.5\nB.CEL\t0.9\n");
    }
}
