//
// error.rs
// Dicom-Sort-rs
//
// Error taxonomy: setup errors abort a run, unit errors are recovered per file, store errors come from reading and writing objects.
//

use std::path::PathBuf;

use thiserror::Error;

/// Failures that abort a run before any file is dispatched.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("input directory {0} does not exist or is not a directory")]
    InputMissing(PathBuf),

    #[error("failed to create output directory {path}: {source}")]
    OutputUncreatable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("failed to read correlation table {path}: {reason}")]
    CorrelationTable { path: PathBuf, reason: String },

    #[error("failed to load derived-image rules from {path}: {reason}")]
    DerivedRules { path: PathBuf, reason: String },

    #[error("invalid series description pattern {pattern:?}: {source}")]
    DerivedPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid path template {template:?}: {reason}")]
    Template { template: String, reason: String },

    #[error("{0} is not a valid UID root")]
    InvalidUidRoot(String),
}

/// Errors raised while opening or persisting a single imaging object.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("not a DICOM object: {0}")]
    NotDicom(String),

    #[error("failed to decode pixel data: {0}")]
    Decode(String),

    #[error("failed to build file meta information: {0}")]
    Meta(String),

    #[error("failed to write {path}: {reason}")]
    Write { path: PathBuf, reason: String },
}

/// Per-file failure inside the pipeline. Always converted into a failed outcome, never propagated.
#[derive(Error, Debug)]
pub enum UnitError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
