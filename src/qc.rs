//! Sample and plate quality control.
//!
//! A sample must pass the dish QC (DQC) threshold, then its QC call rate
//! (QCCR) threshold, and finally its plate must not be flagged. A plate is
//! flagged when enough of its samples pass both sample-level checks and
//! their average QCCR is still below the plate threshold.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::Path,
};

use rayon::prelude::*;
use serde::Serialize;

use crate::{
    error::PipelineError,
    metrics::{CallRate, DqcRecord},
};

/// Resolved QC thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QcThresholds {
    pub dqc: f64,
    /// Percent.
    pub qccr: f64,
    /// Percent.
    pub avg_qccr: f64,
    pub min_samples_for_plate_qccr: usize,
}

impl Default for QcThresholds {
    fn default() -> Self {
        Self {
            dqc: 0.82,
            qccr: 97.0,
            avg_qccr: 98.5,
            min_samples_for_plate_qccr: 20,
        }
    }
}

impl QcThresholds {
    pub fn passes_dqc(&self, dqc: f64) -> bool {
        dqc >= self.dqc
    }

    /// QCCR only counts for samples that passed DQC.
    pub fn passes_qccr(&self, sample: &SampleMetrics) -> bool {
        self.passes_dqc(sample.dqc) && sample.qccr >= self.qccr
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleMetrics {
    pub sample_id: String,
    pub plate_barcode: String,
    pub dqc: f64,
    /// NaN when the sample was not genotyped.
    pub qccr: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QcResult {
    Pass,
    Fail,
}

impl fmt::Display for QcResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        })
    }
}

/// Final QC row for one sample, with its plate context joined in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleQcRecord {
    #[serde(rename = "cel_name")]
    pub sample_id: String,
    #[serde(rename = "sbarcode")]
    pub plate_barcode: String,
    pub dqc: f64,
    pub qccr: f64,
    pub n_samples_qccr_ok: usize,
    pub avg_qccr: f64,
    pub qc_result: QcResult,
    pub qc_note: String,
}

/// Plate numbers a sample's verdict depends on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlateContext {
    pub n_samples_qccr_ok: usize,
    pub avg_qccr: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlateAggregate {
    #[serde(rename = "sbarcode")]
    pub plate_barcode: String,
    pub n_samples: usize,
    pub n_samples_dqc_ok: usize,
    pub n_samples_qccr_ok: usize,
    pub dqc_pass_rate: f64,
    pub qccr_pass_rate: f64,
    pub plate_pass_rate: f64,
    pub avg_dqc: f64,
    /// Mean QCCR over samples passing both sample-level checks.
    pub avg_qccr: f64,
    pub passing_avg_qccr: bool,
    pub plate_qc_failed: bool,
}

/// DQC columns of a plate, written as their own table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlateDqcRow<'a> {
    pub sbarcode: &'a str,
    pub n_samples_dqc_ok: usize,
    pub dqc_pass_rate: f64,
    pub avg_dqc: f64,
}

impl PlateAggregate {
    pub fn context(&self) -> PlateContext {
        PlateContext {
            n_samples_qccr_ok: self.n_samples_qccr_ok,
            avg_qccr: self.avg_qccr,
        }
    }

    pub fn dqc_row(&self) -> PlateDqcRow<'_> {
        PlateDqcRow {
            sbarcode: &self.plate_barcode,
            n_samples_dqc_ok: self.n_samples_dqc_ok,
            dqc_pass_rate: self.dqc_pass_rate,
            avg_dqc: self.avg_dqc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QcRun {
    pub samples: Vec<SampleQcRecord>,
    pub plates: Vec<PlateAggregate>,
}

impl QcRun {
    pub fn n_passed(&self) -> usize {
        self.samples
            .iter()
            .filter(|s| s.qc_result == QcResult::Pass)
            .count()
    }

    pub fn n_failed_plates(&self) -> usize {
        self.plates.iter().filter(|p| p.plate_qc_failed).count()
    }
}

/// Formats a threshold the way the QC notes have always shown it: integral
/// values keep one decimal (`97.0`).
fn threshold_text(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

/// Applies the QC rules in order; the first rule that matches decides.
pub fn evaluate_sample(
    sample: &SampleMetrics,
    plate: PlateContext,
    thresholds: &QcThresholds,
) -> (QcResult, String) {
    // a missing (NaN) metric fails its rule
    if !thresholds.passes_dqc(sample.dqc) {
        return (QcResult::Fail, format!("DQC < {}", threshold_text(thresholds.dqc)));
    }
    if sample.qccr.is_nan() || sample.qccr < thresholds.qccr {
        return (
            QcResult::Fail,
            format!("QCCR < {}%", threshold_text(thresholds.qccr)),
        );
    }
    if plate.n_samples_qccr_ok < thresholds.min_samples_for_plate_qccr {
        return (QcResult::Pass, String::from("."));
    }
    if plate.avg_qccr < thresholds.avg_qccr {
        return (
            QcResult::Fail,
            format!(
                "Average QCCR of passing samples < {}%",
                threshold_text(thresholds.avg_qccr)
            ),
        );
    }
    (QcResult::Pass, String::from("."))
}

/// `numerator / denominator * 100`, NaN when the denominator is zero.
fn percent(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        f64::NAN
    } else {
        numerator as f64 / denominator as f64 * 100.0
    }
}

fn mean<I: IntoIterator<Item = f64>>(values: I) -> f64 {
    let (sum, n) = values
        .into_iter()
        .filter(|v| !v.is_nan())
        .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    if n == 0 { f64::NAN } else { sum / n as f64 }
}

fn aggregate_plate(
    barcode: &str,
    samples: &[&SampleMetrics],
    thresholds: &QcThresholds,
) -> PlateAggregate {
    let n_samples = samples.len();
    let n_samples_dqc_ok = samples
        .iter()
        .filter(|s| thresholds.passes_dqc(s.dqc))
        .count();
    let qccr_ok: Vec<f64> = samples
        .iter()
        .filter(|s| thresholds.passes_qccr(s))
        .map(|s| s.qccr)
        .collect();
    let n_samples_qccr_ok = qccr_ok.len();
    let avg_qccr = mean(qccr_ok);

    let plate_qc_failed =
        n_samples_qccr_ok >= thresholds.min_samples_for_plate_qccr && avg_qccr < thresholds.avg_qccr;
    if plate_qc_failed {
        tracing::warn!("QCCR_Plate\t{barcode}\tsamples {n_samples}\t{avg_qccr:5.2}\tfailed");
    }

    PlateAggregate {
        plate_barcode: barcode.to_string(),
        n_samples,
        n_samples_dqc_ok,
        n_samples_qccr_ok,
        dqc_pass_rate: percent(n_samples_dqc_ok, n_samples),
        qccr_pass_rate: percent(n_samples_qccr_ok, n_samples_dqc_ok),
        plate_pass_rate: percent(n_samples_qccr_ok, n_samples),
        avg_dqc: mean(samples.iter().map(|s| s.dqc)),
        avg_qccr,
        passing_avg_qccr: avg_qccr >= thresholds.avg_qccr,
        plate_qc_failed,
    }
}

/// Computes one aggregate per plate barcode, in barcode order.
pub fn aggregate_plates(samples: &[SampleMetrics], thresholds: &QcThresholds) -> Vec<PlateAggregate> {
    let mut groups: BTreeMap<&str, Vec<&SampleMetrics>> = BTreeMap::new();
    for sample in samples {
        groups.entry(sample.plate_barcode.as_str()).or_default().push(sample);
    }
    let groups: Vec<_> = groups.into_iter().collect();

    groups
        .par_iter()
        .map(|(barcode, members)| aggregate_plate(barcode, members, thresholds))
        .collect()
}

/// Evaluates every sample against its plate; records keep input order.
pub fn evaluate_samples(samples: &[SampleMetrics], thresholds: &QcThresholds) -> QcRun {
    let plates = aggregate_plates(samples, thresholds);
    let contexts: HashMap<&str, PlateContext> = plates
        .iter()
        .map(|p| (p.plate_barcode.as_str(), p.context()))
        .collect();

    let records = samples
        .iter()
        .map(|sample| {
            if !thresholds.passes_dqc(sample.dqc) {
                tracing::info!("DQC\t{}\t{:5.2}\tfailed", sample.sample_id, sample.dqc);
            } else if !thresholds.passes_qccr(sample) {
                tracing::info!("QCCR\t{}\t{:5.2}\tfailed", sample.sample_id, sample.qccr);
            }

            let plate = contexts[sample.plate_barcode.as_str()];
            let (qc_result, qc_note) = evaluate_sample(sample, plate, thresholds);
            SampleQcRecord {
                sample_id: sample.sample_id.clone(),
                plate_barcode: sample.plate_barcode.clone(),
                dqc: sample.dqc,
                qccr: sample.qccr,
                n_samples_qccr_ok: plate.n_samples_qccr_ok,
                avg_qccr: plate.avg_qccr,
                qc_result,
                qc_note,
            }
        })
        .collect();

    let run = QcRun {
        samples: records,
        plates,
    };
    tracing::info!(
        samples = run.samples.len(),
        passed = run.n_passed(),
        plates = run.plates.len(),
        failed_plates = run.n_failed_plates(),
        "sample QC evaluated",
    );
    run
}

/// Joins DQC values, call rates and the plate map into per-sample metrics,
/// in DQC report order.
///
/// Every sample needs a plate; a sample that passed DQC also needs a call
/// rate from `call_rate_source`.
pub fn join_metrics(
    dqc: &[DqcRecord],
    call_rates: &[CallRate],
    platemap: &HashMap<String, String>,
    thresholds: &QcThresholds,
    call_rate_source: &Path,
    platemap_source: &Path,
) -> Result<Vec<SampleMetrics>, PipelineError> {
    let rates: HashMap<&str, f64> = call_rates
        .iter()
        .map(|r| (r.cel_name.as_str(), r.call_rate))
        .collect();

    dqc.iter()
        .map(|record| {
            let plate_barcode = platemap.get(&record.cel_name).cloned().ok_or_else(|| {
                PipelineError::MalformedInput {
                    path: platemap_source.to_path_buf(),
                    reason: format!("no plate for sample {}", record.cel_name),
                }
            })?;
            let qccr = match rates.get(record.cel_name.as_str()) {
                Some(rate) => *rate,
                None if thresholds.passes_dqc(record.dqc) => {
                    return Err(PipelineError::MalformedInput {
                        path: call_rate_source.to_path_buf(),
                        reason: format!("no call rate for sample {}", record.cel_name),
                    });
                }
                None => f64::NAN,
            };
            Ok(SampleMetrics {
                sample_id: record.cel_name.clone(),
                plate_barcode,
                dqc: record.dqc,
                qccr,
            })
        })
        .collect()
}
