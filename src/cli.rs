//
// cli.rs
// Dicom-Sort-rs
//
// Defines the CLI surface with Clap and dispatches user-selected commands to the corresponding modules.
//

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::warn;

use crate::anonymize::{AnonymizationLevel, AnonymizationPolicy};
use crate::batch::{self, BatchOperation};
use crate::bids::{self, BidsOptions, Dcm2Bids};
use crate::classify::DerivedRules;
use crate::correlation::CorrelationTable;
use crate::hashing::{UidRoot, UID_ROOT_DEFAULT};
use crate::headers;
use crate::logging::init_logging;
use crate::path_builder::{PathTemplate, DEFAULT_TEMPLATE};
use crate::pipeline::{self, CancelToken, RunOutcome, SortOptions};
use crate::tags::TagArg;

/// Exit status of a sort interrupted by Ctrl-C.
const EXIT_CANCELLED: u8 = 130;

/// Command-line interface glue code: defines the available verbs and dispatches to modules.
#[derive(Parser)]
#[command(name = "dicom-sort", version)]
#[command(about = "Sort, anonymize and normalize DICOM trees", long_about = None)]
pub struct Cli {
    /// Log per-file decisions at info level on the console
    #[arg(short, long, global = true)]
    pub verbose: bool,
    /// Directory for dicom_processing.log (sort defaults to the output directory)
    #[arg(long, global = true, env = "DICOM_SORT_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Copy a DICOM tree into a study/series layout, optionally anonymizing and decompressing
    Sort(SortArgs),
    /// Decompress every compressed object under a directory, in place
    Decompress { directory: PathBuf },
    /// Rewrite every object under a directory as Explicit VR Little Endian, in place
    Explicit { directory: PathBuf },
    /// Write one TSV row of acquisition headers per distinct series
    Headers {
        directory: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Read every file instead of the first five
        #[arg(long)]
        all: bool,
    },
    /// Run dcm2bids over every subject/session of a sorted tree
    Bids {
        #[arg(long, default_value = "sourcedata", env = "DICOM_SORT_BIDS_INPUT")]
        dicomin: PathBuf,
        #[arg(long, default_value = "BIDSDIR", env = "DICOM_SORT_BIDS_DIR")]
        bidsdir: PathBuf,
        #[arg(long, default_value = "dcm2bids_config.json")]
        config: PathBuf,
        /// Only register sessions in studies.tsv, skip the conversion
        #[arg(long)]
        nobids: bool,
    },
}

#[derive(Args)]
pub struct SortArgs {
    #[arg(env = "DICOM_SORT_INPUT")]
    pub input: PathBuf,
    #[arg(env = "DICOM_SORT_OUTPUT")]
    pub output: PathBuf,
    /// Destination layout, e.g. %PatientID%/%StudyDate%/%SeriesNumber%_%SeriesDescription%
    #[arg(short, long, default_value = DEFAULT_TEMPLATE)]
    pub template: PathTemplate,
    #[arg(short, long, value_enum, default_value_t = Level::None)]
    pub level: Level,
    /// Original -> replacement patient IDs (csv, tsv, whitespace separated or spreadsheet)
    #[arg(short, long, env = "DICOM_SORT_CORRELATION")]
    pub correlation: Option<PathBuf>,
    #[arg(long)]
    pub anonymize_birth_date: bool,
    #[arg(long)]
    pub anonymize_acquisition_date: bool,
    #[arg(long)]
    pub anonymize_accession_number: bool,
    #[arg(long)]
    pub preserve_private_tags: bool,
    /// Read the original identifier from Patient Name instead of Patient ID
    #[arg(long)]
    pub id_from_patient_name: bool,
    /// Additional tags kept verbatim (GGGGEEEE, GGGG,EEEE or (GGGG,EEEE))
    #[arg(long = "keep-tag", value_delimiter = ';')]
    pub keep_tags: Vec<TagArg>,
    #[arg(long, default_value = UID_ROOT_DEFAULT)]
    pub uid_root: UidRoot,
    #[arg(long)]
    pub decompress: bool,
    #[arg(long)]
    pub skip_derived: bool,
    #[arg(long)]
    pub skip_burned_in: bool,
    /// JSON file overriding the derived-image heuristics
    #[arg(long, env = "DICOM_SORT_DERIVED_RULES")]
    pub derived_rules: Option<PathBuf>,
    /// Worker threads (defaults to the available parallelism)
    #[arg(short, long)]
    pub workers: Option<usize>,
    /// Print the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum Level {
    None,
    Basic,
    Strict,
}

impl From<Level> for AnonymizationLevel {
    fn from(value: Level) -> Self {
        match value {
            Level::None => AnonymizationLevel::None,
            Level::Basic => AnonymizationLevel::Basic,
            Level::Strict => AnonymizationLevel::Strict,
        }
    }
}

impl SortArgs {
    fn policy(&self) -> AnonymizationPolicy {
        AnonymizationPolicy {
            level: self.level.into(),
            anonymize_birth_date: self.anonymize_birth_date,
            anonymize_acquisition_date: self.anonymize_acquisition_date,
            anonymize_accession_number: self.anonymize_accession_number,
            preserve_private_tags: self.preserve_private_tags,
            id_from_patient_name: self.id_from_patient_name,
            extra_preserved_tags: self.keep_tags.iter().map(|t| t.0).collect(),
        }
    }

    fn options(&self) -> anyhow::Result<SortOptions> {
        let correlation = match &self.correlation {
            Some(path) => CorrelationTable::load(path)?,
            None => CorrelationTable::new(),
        };
        let derived_rules = match &self.derived_rules {
            Some(path) => DerivedRules::load(path)?,
            None => DerivedRules::default(),
        };
        Ok(SortOptions {
            workers: self.workers,
            decompress: self.decompress,
            skip_derived: self.skip_derived,
            skip_burned_in: self.skip_burned_in,
            derived_rules,
            correlation,
            uid_root: self.uid_root.clone(),
        })
    }
}

pub async fn run() -> anyhow::Result<ExitCode> {
    // Parse the raw CLI arguments once and dispatch to a subcommand handler.
    let cli = Cli::parse();

    let log_dir = match (&cli.log_dir, &cli.command) {
        (Some(dir), _) => Some(dir.clone()),
        (None, Commands::Sort(args)) => Some(args.output.clone()),
        _ => None,
    };
    let _guard = init_logging(log_dir.as_deref(), cli.verbose)?;

    match cli.command {
        Commands::Sort(args) => return sort(args).await,
        Commands::Decompress { directory } => {
            let bar = progress_bar()?;
            let summary = batch::process_directory(&directory, BatchOperation::Decompress, |p| bar.set_position(p.into()))?;
            bar.finish_and_clear();
            println!(
                "Decompressed {} of {} files ({} skipped, {} failed)",
                summary.rewritten, summary.total, summary.skipped, summary.failed
            );
        }
        Commands::Explicit { directory } => {
            let bar = progress_bar()?;
            let summary = batch::process_directory(&directory, BatchOperation::Explicit, |p| bar.set_position(p.into()))?;
            bar.finish_and_clear();
            println!(
                "Rewrote {} of {} files as Explicit VR Little Endian ({} skipped, {} failed)",
                summary.rewritten, summary.total, summary.skipped, summary.failed
            );
        }
        Commands::Headers { directory, output, all } => {
            let report = headers::collect(&directory, all)?;
            headers::write_tsv(&report, &output)?;
            println!(
                "Files read: {} | unreadable: {} | unique series: {} | output: {}",
                report.files_read,
                report.files_failed,
                report.rows.len(),
                output.display()
            );
        }
        Commands::Bids {
            dicomin,
            bidsdir,
            config,
            nobids,
        } => {
            let options = BidsOptions {
                source_dir: dicomin,
                bids_dir: bidsdir,
                config,
                skip_conversion: nobids,
            };
            let summary = bids::run(&options, &Dcm2Bids)?;
            println!(
                "Sessions: {} | converted: {} | failed: {}",
                summary.sessions, summary.converted, summary.failed
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn sort(args: SortArgs) -> anyhow::Result<ExitCode> {
    let policy = args.policy();
    let options = args.options()?;
    let cancel = CancelToken::new();

    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling after the running files");
                cancel.cancel();
            }
        })
    };

    let SortArgs {
        input,
        output,
        template,
        json,
        ..
    } = args;
    let report_dir = output.clone();
    let bar = progress_bar()?;
    let worker_bar = bar.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let on_progress = |p: u8| worker_bar.set_position(p.into());
        pipeline::run(&input, &output, &template, &policy, &options, on_progress, &cancel)
    })
    .await
    .context("Sort worker terminated unexpectedly")??;
    watcher.abort();
    bar.finish_and_clear();

    let summary = outcome.summary();
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        print_summary(&outcome, &report_dir);
    }

    Ok(match outcome {
        RunOutcome::Completed(_) => ExitCode::SUCCESS,
        RunOutcome::Cancelled(_) => ExitCode::from(EXIT_CANCELLED),
    })
}

fn print_summary(outcome: &RunOutcome, output: &Path) {
    let summary = outcome.summary();
    if outcome.is_cancelled() {
        println!("Sort cancelled.");
    } else {
        println!("Sort finished in {:.1}s.", summary.elapsed_secs);
    }
    println!("  Succeeded: {}", summary.succeeded);
    println!("  Failed:    {}", summary.failed);
    println!("  Skipped:   {}", summary.skipped);
    if summary.cancelled > 0 {
        println!("  Cancelled: {}", summary.cancelled);
    }
    if summary.unmapped_ids > 0 {
        println!(
            "  {} identifier(s) without a correlation entry, see {}",
            summary.unmapped_ids,
            output.join(pipeline::MISSING_IDS_FILE).display()
        );
    }
}

/// Percentage bar on stderr, driven by the `on_progress` callbacks.
fn progress_bar() -> anyhow::Result<ProgressBar> {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}%")?
            .progress_chars("#>-"),
    );
    Ok(bar)
}
