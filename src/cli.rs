use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use crate::{
    error::PipelineError,
    merge::{MergePolicy, MergeSummary, merge_dynamic_column_file, merge_static_column_file, subset_file},
    metrics::{self, write_table},
    probeset::read_probeset_list,
    qc::{QcRun, QcThresholds, evaluate_samples, join_metrics},
    records::{Reader, TableKind},
    report::{RunReportBuilder, Statistics},
    runner::{CommandRunner, RunOptions, ToolPaths},
};

#[derive(Debug, Parser)]
#[command(author, version, about = "Merge, subset and QC Axiom genotyping result tables", long_about = None)]
struct Cli {
    /// Logging verbosity (e.g. error, warn, info, debug)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Patch a default table with rows from a modified table of the same layout
    Merge(MergeArgs),
    /// Merge two tables whose columns differ
    MergeDynamic(MergeArgs),
    /// Keep only the rows of the listed probesets
    Subset {
        #[arg(value_name = "INPUT")]
        input: PathBuf,
        #[arg(value_name = "OUTPUT")]
        output: PathBuf,
        /// Probeset list file (header `probeset_id`, one id per line)
        #[arg(long, value_name = "FILE")]
        probesets: PathBuf,
    },
    /// Group a posteriors, summaries or scores table into per-probeset records
    Records {
        #[arg(value_name = "INPUT")]
        input: PathBuf,
        #[arg(long, value_enum)]
        format: TableKind,
    },
    /// Run a shell command line and judge its outcome
    Run(RunArgs),
    /// Evaluate sample and plate QC
    Qc(QcArgs),
}

#[derive(Debug, Args)]
struct MergeArgs {
    /// Table produced with default settings
    #[arg(value_name = "DEFAULT")]
    default: PathBuf,
    /// Table produced with modified settings
    #[arg(value_name = "MODIFIED")]
    modified: PathBuf,
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,
    /// Probesets whose rows must come from the modified table
    #[arg(long, value_name = "FILE")]
    improved: Option<PathBuf>,
    /// Only write rows of these probesets
    #[arg(long, value_name = "FILE")]
    target: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Command line, passed to `sh -c`
    #[arg(value_name = "COMMAND")]
    command: String,
    /// Require a status line reporting zero errors
    #[arg(long)]
    check_status: bool,
    /// Kill the command after this many seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,
    /// Program that must be resolvable before running (repeatable)
    #[arg(long = "tool", value_name = "PROGRAM")]
    tools: Vec<String>,
    /// Folder searched for tools before PATH (repeatable)
    #[arg(long = "bin-dir", value_name = "DIR")]
    bin_dirs: Vec<PathBuf>,
}

#[derive(Debug, Args)]
struct QcArgs {
    /// DQC report with `cel_files` and `axiom_dishqc_DQC` columns
    #[arg(long, value_name = "FILE")]
    dqc_report: PathBuf,
    /// Calls table used to compute QC call rates
    #[arg(long, value_name = "FILE", conflicts_with = "report", required_unless_present = "report")]
    calls: Option<PathBuf>,
    /// Genotyping report with a `call_rate` column
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,
    /// Sample to plate barcode map (`cel_name`, `sbarcode`)
    #[arg(long, value_name = "FILE")]
    platemap: PathBuf,
    #[arg(long, value_name = "DIR")]
    output_dir: PathBuf,
    #[arg(long, default_value_t = QcThresholds::default().dqc)]
    dqc_threshold: f64,
    /// Percent
    #[arg(long, default_value_t = QcThresholds::default().qccr)]
    qccr_threshold: f64,
    /// Percent
    #[arg(long, default_value_t = QcThresholds::default().avg_qccr)]
    avg_qccr_threshold: f64,
    #[arg(long, default_value_t = QcThresholds::default().min_samples_for_plate_qccr)]
    min_samples_for_plate_qccr: usize,
    /// Gzip the QC tables
    #[arg(long)]
    compress: bool,
}

impl QcArgs {
    fn thresholds(&self) -> QcThresholds {
        QcThresholds {
            dqc: self.dqc_threshold,
            qccr: self.qccr_threshold,
            avg_qccr: self.avg_qccr_threshold,
            min_samples_for_plate_qccr: self.min_samples_for_plate_qccr,
        }
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Command::Merge(args) => merge(args, false),
        Command::MergeDynamic(args) => merge(args, true),
        Command::Subset {
            input,
            output,
            probesets,
        } => subset(&input, &output, &probesets),
        Command::Records { input, format } => records(&input, format),
        Command::Run(args) => run_command(args),
        Command::Qc(args) => qc(args),
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init()
        .ok();
    Ok(())
}

fn merge_policy(args: &MergeArgs) -> Result<MergePolicy> {
    let mut policy = MergePolicy::new();
    if let Some(path) = &args.improved {
        policy.improved = read_probeset_list(path)
            .with_context(|| format!("failed to read improved probesets {}", path.display()))?;
    }
    if let Some(path) = &args.target {
        policy.target = read_probeset_list(path)
            .with_context(|| format!("failed to read target probesets {}", path.display()))?;
    }
    Ok(policy)
}

fn merge(args: MergeArgs, dynamic: bool) -> Result<()> {
    let policy = merge_policy(&args)?;
    let (command, summary) = if dynamic {
        let summary =
            merge_dynamic_column_file(&args.default, &args.modified, &args.output, &policy)?;
        ("merge-dynamic", summary)
    } else {
        let summary =
            merge_static_column_file(&args.default, &args.modified, &args.output, &policy)?;
        ("merge", summary)
    };

    let mut report = RunReportBuilder::new(command)
        .input("default", &args.default)
        .input("modified", &args.modified);
    if let Some(path) = &args.improved {
        report = report.input("improved", path);
    }
    if let Some(path) = &args.target {
        report = report.input("target", path);
    }
    report
        .output("merged", &args.output)
        .build(Statistics::merge(&policy, &summary))
        .write(&args.output)?;

    print_merge_summary(&summary);
    Ok(())
}

fn subset(input: &Path, output: &Path, probesets: &Path) -> Result<()> {
    let wanted = read_probeset_list(probesets)
        .with_context(|| format!("failed to read probesets {}", probesets.display()))?;
    let summary = subset_file(input, output, &wanted)?;

    RunReportBuilder::new("subset")
        .input("table", input)
        .input("probesets", probesets)
        .output("subset", output)
        .build(Statistics::Subset(summary.clone()))
        .write(output)?;

    println!(
        "Kept {kept} rows; dropped {dropped}.",
        kept = summary.kept_rows,
        dropped = summary.dropped_rows
    );
    Ok(())
}

fn records(input: &Path, kind: TableKind) -> Result<()> {
    let reader = Reader::open(input, kind)?;
    let stdout = io::stdout();
    let mut out = io::BufWriter::new(stdout.lock());

    let mut n_records = 0usize;
    let mut n_lines = 0usize;
    for record in reader {
        let record = record.map_err(|source| PipelineError::Parse {
            path: input.to_path_buf(),
            source,
        })?;
        writeln!(out, "{}\t{}", record.probeset_id(), record.line_count())?;
        n_records += 1;
        n_lines += record.line_count();
    }
    out.flush()?;

    tracing::info!(records = n_records, lines = n_lines, "grouped records");
    Ok(())
}

fn run_command(args: RunArgs) -> Result<()> {
    let tools = ToolPaths::resolve(&args.tools, &args.bin_dirs)?;
    let runner = CommandRunner::new(&tools);

    let mut options = RunOptions {
        check_status_line: args.check_status,
        ..RunOptions::default()
    };
    if let Some(secs) = args.timeout {
        options = options.with_timeout(Duration::from_secs(secs));
    }

    let verdict = runner.execute(&args.command, &options)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for line in &verdict.output {
        writeln!(out, "{line}")?;
    }
    match verdict.n_errors {
        Some(n) => println!("Command finished: {} ({n} errors reported).", verdict.state),
        None => println!("Command finished: {}.", verdict.state),
    }
    Ok(())
}

fn qc(args: QcArgs) -> Result<()> {
    let thresholds = args.thresholds();
    std::fs::create_dir_all(&args.output_dir).with_context(|| {
        format!("failed to create output directory: {}", args.output_dir.display())
    })?;

    let dqc = metrics::read_dqc_report(&args.dqc_report)?;
    let (call_rate_source, call_rates) = match (&args.calls, &args.report) {
        (Some(calls), _) => (calls, metrics::call_rates_from_calls_file(calls)?),
        (None, Some(report)) => (report, metrics::call_rates_from_report_file(report)?),
        (None, None) => anyhow::bail!("either --calls or --report is required"),
    };
    let platemap = metrics::read_platemap(&args.platemap)?;
    let samples = join_metrics(
        &dqc,
        &call_rates,
        &platemap,
        &thresholds,
        call_rate_source,
        &args.platemap,
    )?;

    let run = evaluate_samples(&samples, &thresholds);

    let sample_table = write_table(
        &args.output_dir.join("sample_qc.tsv"),
        &run.samples,
        args.compress,
    )?;
    let plate_table = write_table(
        &args.output_dir.join("plate_qc.tsv"),
        &run.plates,
        args.compress,
    )?;
    let plate_dqc_table = write_table(
        &args.output_dir.join("plate_dqc.tsv"),
        run.plates.iter().map(|p| p.dqc_row()),
        args.compress,
    )?;

    RunReportBuilder::new("qc")
        .input("dqc_report", &args.dqc_report)
        .input("call_rates", call_rate_source)
        .input("platemap", &args.platemap)
        .output("sample_qc", &sample_table)
        .output("plate_qc", &plate_table)
        .output("plate_dqc", &plate_dqc_table)
        .build(Statistics::qc(&thresholds, &run))
        .write(&args.output_dir.join("qc.tsv"))?;

    print_qc_summary(&run);
    Ok(())
}

fn print_merge_summary(summary: &MergeSummary) {
    println!(
        "Wrote {written} rows ({default} default, {replaced} modified, {appended} modified-only).",
        written = summary.written_rows(),
        default = summary.default_rows,
        replaced = summary.replaced_rows,
        appended = summary.appended_rows,
    );

    if summary.filtered_rows > 0 {
        println!(
            "Skipped {count} rows outside the target probesets.",
            count = summary.filtered_rows
        );
    }

    if summary.duplicate_modified_keys > 0 {
        println!(
            "Warnings: {count} duplicated keys in the modified table; the last occurrence was used.",
            count = summary.duplicate_modified_keys
        );
    }
}

fn print_qc_summary(run: &QcRun) {
    let passed = run.n_passed();
    println!(
        "Evaluated {total} samples; {passed} passed, {failed} failed.",
        total = run.samples.len(),
        failed = run.samples.len() - passed,
    );
    if run.n_failed_plates() > 0 {
        println!(
            "Warnings: {count} of {plates} plates failed the average QCCR check.",
            count = run.n_failed_plates(),
            plates = run.plates.len()
        );
    }
}
