#![doc = include_str!("../README.md")]

pub mod cli;
pub mod error;
pub mod index;
pub mod merge;
pub mod metrics;
pub mod probeset;
pub mod qc;
pub mod records;
pub mod report;
pub mod resource;
pub mod runner;
pub mod smart_reader;
pub mod table;

pub use error::{Outcome, PipelineError, Warning};
pub use index::KeyedLineIndex;
pub use merge::{
    MergePolicy, MergeSummary, merge_dynamic_column_file, merge_static_column_file, subset_file,
};
pub use qc::{QcResult, QcThresholds, SampleMetrics, SampleQcRecord, evaluate_samples};
pub use records::{GroupedRecord, Reader, TableKind};
pub use runner::{CancellationToken, CommandRunner, ProcessVerdict, RunOptions, ToolPaths};
