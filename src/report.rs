//! Structured run report for downstream tool consumption.
//!
//! Writes a JSON file alongside the output describing the run: inputs,
//! outputs, settings and the statistics of the stage that ran.

use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::merge::{MergePolicy, MergeSummary, SubsetSummary};
use crate::qc::{QcRun, QcThresholds};

/// Complete report of one pipeline stage.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Tool version
    pub version: String,
    /// Timestamp of run (RFC 3339)
    pub timestamp: String,
    /// Subcommand that produced the report
    pub command: String,
    pub inputs: Vec<FileInfo>,
    pub outputs: Vec<FileInfo>,
    pub statistics: Statistics,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub role: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Statistics {
    Merge {
        improved_probesets: usize,
        target_probesets: usize,
        #[serde(flatten)]
        summary: MergeSummary,
    },
    Subset(SubsetSummary),
    Qc {
        thresholds: QcThresholds,
        samples: usize,
        passed_samples: usize,
        failed_samples: usize,
        plates: usize,
        failed_plates: usize,
    },
}

impl Statistics {
    pub fn merge(policy: &MergePolicy, summary: &MergeSummary) -> Self {
        Self::Merge {
            improved_probesets: policy.improved.len(),
            target_probesets: policy.target.len(),
            summary: summary.clone(),
        }
    }

    pub fn qc(thresholds: &QcThresholds, run: &QcRun) -> Self {
        let passed = run.n_passed();
        Self::Qc {
            thresholds: *thresholds,
            samples: run.samples.len(),
            passed_samples: passed,
            failed_samples: run.samples.len() - passed,
            plates: run.plates.len(),
            failed_plates: run.n_failed_plates(),
        }
    }
}

impl RunReport {
    /// Report path for an output: `merged.txt` gets `merged_report.json`.
    pub fn path_for(output_path: &Path) -> PathBuf {
        let stem = output_path
            .file_stem()
            .unwrap_or_default()
            .to_string_lossy();
        output_path.with_file_name(format!("{stem}_report.json"))
    }

    /// Write the report as JSON next to `output_path`.
    pub fn write(&self, output_path: &Path) -> Result<PathBuf, PipelineError> {
        let report_path = Self::path_for(output_path);
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| PipelineError::io(&report_path)(e.into()))?;

        std::fs::write(&report_path, json).map_err(PipelineError::io(&report_path))?;
        tracing::info!("Wrote run report to {}", report_path.display());

        Ok(report_path)
    }
}

/// Builder for constructing a RunReport as a stage runs.
#[derive(Debug, Default)]
pub struct RunReportBuilder {
    command: String,
    inputs: Vec<FileInfo>,
    outputs: Vec<FileInfo>,
}

impl RunReportBuilder {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn input(mut self, role: &str, path: &Path) -> Self {
        self.inputs.push(file_info(role, path));
        self
    }

    pub fn output(mut self, role: &str, path: &Path) -> Self {
        self.outputs.push(file_info(role, path));
        self
    }

    pub fn build(self, statistics: Statistics) -> RunReport {
        let now = time::OffsetDateTime::now_utc();
        let timestamp = now
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "unknown".to_string());

        RunReport {
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp,
            command: self.command,
            inputs: self.inputs,
            outputs: self.outputs,
            statistics,
        }
    }
}

fn file_info(role: &str, path: &Path) -> FileInfo {
    FileInfo {
        role: role.to_string(),
        path: path.to_string_lossy().to_string(),
    }
}
