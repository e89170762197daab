//
// pipeline.rs
// Dicom-Sort-rs
//
// Parallel executor: enumerates the input tree, runs one unit per file on a bounded rayon pool,
// aggregates outcomes, reports progress and honours cooperative cancellation.
//

use std::fmt;
use std::fs;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Instant;

use rayon::ThreadPoolBuilder;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::anonymize::{AnonymizationPolicy, Anonymizer, UnmappedIds};
use crate::classify::{Classification, Classifier, DerivedRules};
use crate::correlation::CorrelationTable;
use crate::error::{SetupError, UnitError};
use crate::hashing::UidRoot;
use crate::models::RunSummary;
use crate::path_builder::{self, PathTemplate};
use crate::store::AttributeStore;
use crate::transcode;
use crate::uid_map::UidMap;

/// Extensions that are never imaging objects; skipped without being read.
pub const NON_DICOM_EXTENSIONS: &[&str] = &["png", "jpeg", "jpg", "gif", "bmp"];
pub const MISSING_IDS_FILE: &str = "missing_patient_ids.log";
pub const SUMMARY_FILE: &str = "sort_summary.json";

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Executor options besides the template and the anonymization policy.
#[derive(Debug, Clone, Default)]
pub struct SortOptions {
    /// Pool size; `None` uses the available parallelism.
    pub workers: Option<usize>,
    pub decompress: bool,
    pub skip_derived: bool,
    pub skip_burned_in: bool,
    pub derived_rules: DerivedRules,
    pub correlation: CorrelationTable,
    pub uid_root: UidRoot,
}

impl SortOptions {
    pub fn worker_count(&self) -> usize {
        self.workers
            .filter(|n| *n > 0)
            .unwrap_or_else(|| thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1))
    }

    fn classifier(&self) -> Result<Classifier, SetupError> {
        if !self.skip_derived && !self.skip_burned_in {
            return Ok(Classifier::keep_all());
        }
        Ok(Classifier::new(self.derived_rules.heuristics()?)
            .skip_derived(self.skip_derived)
            .skip_burned_in(self.skip_burned_in))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NonImageExtension,
    NotDicom,
    Derived(String),
    BurnedIn,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NonImageExtension => f.write_str("non-DICOM file extension"),
            SkipReason::NotDicom => f.write_str("not a DICOM object"),
            SkipReason::Derived(heuristic) => write!(f, "derived image ({heuristic})"),
            SkipReason::BurnedIn => f.write_str("burned-in annotation"),
        }
    }
}

/// Terminal state of one input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Processed { destination: PathBuf },
    Failed { reason: String },
    Skipped { reason: SkipReason },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(RunSummary),
    Cancelled(RunSummary),
}

impl RunOutcome {
    pub fn summary(&self) -> &RunSummary {
        match self {
            RunOutcome::Completed(summary) | RunOutcome::Cancelled(summary) => summary,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunOutcome::Cancelled(_))
    }
}

struct UnitContext<'a> {
    output_root: &'a Path,
    template: &'a PathTemplate,
    anonymizer: Anonymizer<'a>,
    classifier: Classifier,
    decompress: bool,
}

struct UnitReport {
    outcome: JobOutcome,
    unmapped: UnmappedIds,
}

/// Sort every file under `input_root` into `output_root`.
///
/// Only setup problems are returned as errors; per-file problems end up in the summary counters and the log.
/// `on_progress` is called on the calling thread with `floor(completed * 100 / total)` after each unit.
pub fn run<F>(
    input_root: &Path,
    output_root: &Path,
    template: &PathTemplate,
    policy: &AnonymizationPolicy,
    options: &SortOptions,
    mut on_progress: F,
    cancel: &CancelToken,
) -> Result<RunOutcome, SetupError>
where
    F: FnMut(u8),
{
    let started = Instant::now();

    if !input_root.is_dir() {
        return Err(SetupError::InputMissing(input_root.to_path_buf()));
    }
    fs::create_dir_all(output_root).map_err(|source| SetupError::OutputUncreatable {
        path: output_root.to_path_buf(),
        source,
    })?;

    let uid_map = UidMap::new(options.uid_root.clone());
    let ctx = UnitContext {
        output_root,
        template,
        anonymizer: Anonymizer::new(policy, &options.correlation, &uid_map),
        classifier: options.classifier()?,
        decompress: options.decompress,
    };
    let workers = options.worker_count();
    let pool = ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("dicom-sort-{i}"))
        .build()?;

    let files = enumerate_files(input_root);
    let total = files.len();
    info!(
        input = %input_root.display(),
        output = %output_root.display(),
        files = total,
        workers,
        level = ?policy.level,
        "Starting sort"
    );

    let mut summary = RunSummary {
        total,
        ..RunSummary::default()
    };
    let mut unmapped = UnmappedIds::default();
    let mut interrupted = cancel.is_cancelled();

    if total > 0 && !interrupted {
        let (tx, rx) = mpsc::channel::<UnitReport>();

        pool.in_place_scope(|scope| {
            for path in &files {
                let tx = tx.clone();
                let ctx = &ctx;
                scope.spawn(move |_| {
                    let report = if cancel.is_cancelled() {
                        UnitReport {
                            outcome: JobOutcome::Cancelled,
                            unmapped: UnmappedIds::default(),
                        }
                    } else {
                        run_unit(ctx, path)
                    };
                    // the driver may have stopped listening after a cancellation
                    let _ = tx.send(report);
                });
            }
            drop(tx);

            for report in rx.iter() {
                match report.outcome {
                    JobOutcome::Processed { .. } => summary.succeeded += 1,
                    JobOutcome::Failed { .. } => summary.failed += 1,
                    JobOutcome::Skipped { .. } => summary.skipped += 1,
                    JobOutcome::Cancelled => {}
                }
                unmapped.merge(report.unmapped);

                if !matches!(report.outcome, JobOutcome::Cancelled) {
                    on_progress(percent(summary.completed(), total));
                }
                if cancel.is_cancelled() {
                    interrupted = true;
                    break;
                }
            }
        });
    } else if total == 0 {
        on_progress(100);
    }
    drop(pool);

    summary.unmapped_ids = unmapped.len();
    summary.elapsed_secs = started.elapsed().as_secs_f64();

    if !unmapped.is_empty() {
        let path = output_root.join(MISSING_IDS_FILE);
        match unmapped.write_to(&path) {
            Ok(()) => info!(path = %path.display(), count = unmapped.len(), "Wrote unmapped identifiers"),
            Err(e) => error!(path = %path.display(), error = %e, "Failed to write unmapped identifiers"),
        }
    }

    if interrupted {
        summary.cancelled = total - summary.completed();
        warn!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            cancelled = summary.cancelled,
            "Sort cancelled"
        );
        return Ok(RunOutcome::Cancelled(summary));
    }

    write_summary(output_root, &summary);
    info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        skipped = summary.skipped,
        elapsed = summary.elapsed_secs,
        "Sort finished"
    );
    Ok(RunOutcome::Completed(summary))
}

/// All regular files below `root`, realized up front and sorted for a stable dispatch order.
pub fn enumerate_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "Failed to read directory entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

fn percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    (completed * 100 / total).min(100) as u8
}

fn write_summary(output_root: &Path, summary: &RunSummary) {
    let path = output_root.join(SUMMARY_FILE);
    let written = serde_json::to_string_pretty(summary)
        .map_err(|e| e.to_string())
        .and_then(|json| fs::write(&path, json).map_err(|e| e.to_string()));
    if let Err(e) = written {
        error!(path = %path.display(), error = %e, "Failed to write run summary");
    }
}

/// One unit of work. Errors and panics are contained here and become a failed outcome.
fn run_unit(ctx: &UnitContext<'_>, path: &Path) -> UnitReport {
    let mut unmapped = UnmappedIds::default();
    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| process_file(ctx, path, &mut unmapped))) {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            error!(path = %path.display(), error = %e, "Failed to process file");
            JobOutcome::Failed { reason: e.to_string() }
        }
        Err(_) => {
            error!(path = %path.display(), "Worker panicked while processing file");
            JobOutcome::Failed {
                reason: "worker panicked".to_string(),
            }
        }
    };
    UnitReport { outcome, unmapped }
}

fn has_non_dicom_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| NON_DICOM_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn process_file(ctx: &UnitContext<'_>, path: &Path, unmapped: &mut UnmappedIds) -> Result<JobOutcome, UnitError> {
    if has_non_dicom_extension(path) {
        info!(path = %path.display(), "Skipping non-DICOM extension");
        return Ok(JobOutcome::Skipped {
            reason: SkipReason::NonImageExtension,
        });
    }

    let mut store = match AttributeStore::open(path) {
        Ok(store) => store,
        Err(e) => {
            info!(path = %path.display(), error = %e, "Skipping unreadable file");
            return Ok(JobOutcome::Skipped {
                reason: SkipReason::NotDicom,
            });
        }
    };

    match ctx.classifier.classify(&store) {
        Classification::Keep => {}
        Classification::SkipDerived => {
            let heuristic = ctx.classifier.derived_by(&store).unwrap_or("derived").to_string();
            info!(path = %path.display(), heuristic = %heuristic, "Skipping derived image");
            return Ok(JobOutcome::Skipped {
                reason: SkipReason::Derived(heuristic),
            });
        }
        Classification::SkipBurnedIn => {
            info!(path = %path.display(), "Skipping image with burned-in annotation");
            return Ok(JobOutcome::Skipped {
                reason: SkipReason::BurnedIn,
            });
        }
    }

    if ctx.anonymizer.is_active() {
        ctx.anonymizer.anonymize(store.dataset_mut(), unmapped);
    }

    if ctx.decompress {
        if let Err(e) = transcode::decompress(&mut store) {
            warn!(path = %path.display(), error = %e, "Decompression failed, writing object unmodified");
        }
    }

    let dir = ctx.output_root.join(ctx.template.render(&store));
    fs::create_dir_all(&dir).map_err(|source| UnitError::CreateDir {
        path: dir.clone(),
        source,
    })?;
    let name = path_builder::file_name(&store).unwrap_or_else(|| path_builder::fallback_file_name(&dir, path));
    let destination = dir.join(name);
    store.save(&destination)?;

    debug!(source = %path.display(), destination = %destination.display(), "Sorted");
    Ok(JobOutcome::Processed { destination })
}
