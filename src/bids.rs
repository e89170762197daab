//
// bids.rs
// Dicom-Sort-rs
//
// Drives the external dcm2bids converter over a sorted `subject/date` tree and keeps studies.tsv,
// the stable subject/date -> session label registry.
//

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::{info, warn};

pub const STUDIES_FILE: &str = "studies.tsv";
const STUDIES_HEADER: &str = "subject\tsession\tdate";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Study {
    subject: String,
    session: String,
    date: String,
}

/// Session labels already handed out, backed by `studies.tsv` in the output directory.
#[derive(Debug)]
pub struct StudyRegistry {
    path: PathBuf,
    studies: Vec<Study>,
}

impl StudyRegistry {
    pub fn open(bids_dir: &Path) -> Result<Self> {
        let path = bids_dir.join(STUDIES_FILE);
        let mut studies = Vec::new();

        if path.exists() {
            let text = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
            for line in text.lines().skip(1).filter(|l| !l.trim().is_empty()) {
                let cols: Vec<&str> = line.split('\t').map(str::trim).collect();
                match cols.as_slice() {
                    [subject, session, date, ..] => studies.push(Study {
                        subject: subject.to_string(),
                        session: session.to_string(),
                        date: date.to_string(),
                    }),
                    _ => warn!(path = %path.display(), line, "Ignoring malformed studies.tsv row"),
                }
            }
        } else {
            fs::write(&path, format!("{STUDIES_HEADER}\n"))
                .with_context(|| format!("Failed to create {}", path.display()))?;
        }

        Ok(Self { path, studies })
    }

    /// Session label for a subject/date pair, assigning and recording `ses-NN` on first sight.
    pub fn session_for(&mut self, subject: &str, date: &str) -> Result<String> {
        if let Some(study) = self.studies.iter().find(|s| s.subject == subject && s.date == date) {
            return Ok(study.session.clone());
        }

        let next = self
            .studies
            .iter()
            .filter(|s| s.subject == subject)
            .filter_map(|s| s.session.strip_prefix("ses-").and_then(|n| n.parse::<u32>().ok()))
            .max()
            .unwrap_or(0)
            + 1;
        let study = Study {
            subject: subject.to_string(),
            session: format!("ses-{next:02}"),
            date: date.to_string(),
        };

        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        writeln!(file, "{}\t{}\t{}", study.subject, study.session, study.date)?;

        let label = study.session.clone();
        self.studies.push(study);
        Ok(label)
    }
}

/// The external format converter. Implemented by [`Dcm2Bids`]; tests substitute a recorder.
pub trait Converter {
    fn scaffold(&self, bids_dir: &Path) -> Result<()>;
    fn convert(&self, session_dir: &Path, subject: &str, session: &str, config: &Path, bids_dir: &Path) -> Result<()>;
}

/// Runs `dcm2bids` / `dcm2bids_scaffold` from `PATH`.
pub struct Dcm2Bids;

impl Dcm2Bids {
    fn execute(command: &mut Command) -> Result<()> {
        info!(command = ?command, "Executing");
        let output = command
            .output()
            .with_context(|| format!("Failed to launch {:?}", command.get_program()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            info!(output = %stdout.trim(), "converter stdout");
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            warn!(output = %stderr.trim(), "converter stderr");
        }
        if !output.status.success() {
            bail!("{:?} exited with {}", command.get_program(), output.status);
        }
        Ok(())
    }
}

impl Converter for Dcm2Bids {
    fn scaffold(&self, bids_dir: &Path) -> Result<()> {
        Self::execute(Command::new("dcm2bids_scaffold").arg("-o").arg(bids_dir))
    }

    fn convert(&self, session_dir: &Path, subject: &str, session: &str, config: &Path, bids_dir: &Path) -> Result<()> {
        Self::execute(
            Command::new("dcm2bids")
                .arg("-d")
                .arg(session_dir)
                .arg("-p")
                .arg(subject)
                .arg("-s")
                .arg(session)
                .arg("-c")
                .arg(config)
                .arg("-o")
                .arg(bids_dir),
        )
    }
}

#[derive(Debug, Clone)]
pub struct BidsOptions {
    /// Sorted tree laid out as `subject/date/...`.
    pub source_dir: PathBuf,
    pub bids_dir: PathBuf,
    pub config: PathBuf,
    /// Only scaffold and register sessions, do not run the converter.
    pub skip_conversion: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BidsSummary {
    pub sessions: usize,
    pub converted: usize,
    pub failed: usize,
}

pub fn run(options: &BidsOptions, converter: &dyn Converter) -> Result<BidsSummary> {
    if !options.source_dir.is_dir() {
        bail!("{} is not a directory", options.source_dir.display());
    }

    if !options.bids_dir.exists() {
        fs::create_dir_all(&options.bids_dir)
            .with_context(|| format!("Failed to create {}", options.bids_dir.display()))?;
        if let Err(e) = converter.scaffold(&options.bids_dir) {
            warn!(error = %e, "Scaffolding the BIDS directory failed");
        }
    }

    let mut registry = StudyRegistry::open(&options.bids_dir)?;
    let mut summary = BidsSummary::default();

    for subject_dir in subdirectories(&options.source_dir)? {
        let subject = dir_name(&subject_dir);
        for session_dir in subdirectories(&subject_dir)? {
            // session folders are named after the study date
            let date = dir_name(&session_dir);
            let session = registry.session_for(&subject, &date)?;
            summary.sessions += 1;

            if options.skip_conversion {
                continue;
            }
            match converter.convert(&session_dir, &subject, &session, &options.config, &options.bids_dir) {
                Ok(()) => summary.converted += 1,
                Err(e) => {
                    warn!(subject = %subject, session = %session, error = %e, "Conversion failed");
                    summary.failed += 1;
                }
            }
        }
    }

    info!(?summary, "BIDS conversion finished");
    Ok(summary)
}

fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
