//
// batch.rs
// Dicom-Sort-rs
//
// In-place bulk rewrites over a directory tree: decompression and Explicit VR Little Endian conversion.
//

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{bail, Result};
use dicom::transfer_syntax::entries::EXPLICIT_VR_LITTLE_ENDIAN;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::models::BatchSummary;
use crate::pipeline::enumerate_files;
use crate::store::AttributeStore;
use crate::transcode::{self, UncompressedTransferSyntax};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BatchOperation {
    /// Decompress encapsulated pixel data, leave native objects alone.
    Decompress,
    /// Decompress if needed and re-encode everything as Explicit VR Little Endian.
    Explicit,
}

enum FileResult {
    Rewritten,
    Unchanged,
    NotDicom,
}

/// Apply `operation` to every file under `dir`, in place. `on_progress` receives a percentage and may be
/// called from any worker thread.
pub fn process_directory<F>(dir: &Path, operation: BatchOperation, on_progress: F) -> Result<BatchSummary>
where
    F: Fn(u8) + Sync,
{
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }

    let files = enumerate_files(dir);
    let total = files.len();
    info!(dir = %dir.display(), ?operation, files = total, "Starting batch rewrite");

    let rewritten = AtomicUsize::new(0);
    let skipped = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let done = AtomicUsize::new(0);

    files.par_iter().for_each(|path| {
        match rewrite_file(path, operation) {
            Ok(FileResult::Rewritten) => {
                rewritten.fetch_add(1, Ordering::Relaxed);
            }
            Ok(FileResult::Unchanged) | Ok(FileResult::NotDicom) => {
                skipped.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Batch rewrite failed");
                failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        let completed = done.fetch_add(1, Ordering::Relaxed) + 1;
        on_progress((completed * 100 / total) as u8);
    });

    let summary = BatchSummary {
        total,
        rewritten: rewritten.into_inner(),
        skipped: skipped.into_inner(),
        failed: failed.into_inner(),
    };
    info!(?summary, "Batch rewrite finished");
    Ok(summary)
}

fn rewrite_file(path: &Path, operation: BatchOperation) -> Result<FileResult, StoreError> {
    let mut store = match AttributeStore::open(path) {
        Ok(store) => store,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Not a DICOM object, leaving it alone");
            return Ok(FileResult::NotDicom);
        }
    };

    match operation {
        BatchOperation::Decompress => {
            if !transcode::decompress(&mut store)? {
                return Ok(FileResult::Unchanged);
            }
        }
        BatchOperation::Explicit => {
            if !store.is_compressed() && store.transfer_syntax_uid() == EXPLICIT_VR_LITTLE_ENDIAN.uid() {
                return Ok(FileResult::Unchanged);
            }
            transcode::transcode(&mut store, UncompressedTransferSyntax::ExplicitVRLittleEndian)?;
        }
    }

    replace_file(store, path)?;
    Ok(FileResult::Rewritten)
}

/// Write next to the original, then rename over it, so an interrupted write never truncates the source.
fn replace_file(store: AttributeStore, path: &Path) -> Result<(), StoreError> {
    let mut partial = path.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);

    store.save(&partial)?;
    fs::rename(&partial, path).map_err(|e| {
        let _ = fs::remove_file(&partial);
        StoreError::Write {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
    })
}
