//
// lib.rs
// Dicom-Sort-rs
//
// Exposes the crate's modules and re-exports the sort entry points for binary and library consumers.
//

// Core pipeline: store -> classify -> anonymize -> transcode -> path_builder, driven by pipeline.
pub mod anonymize;
pub mod classify;
pub mod correlation;
pub mod dicom_access;
pub mod error;
pub mod hashing;
pub mod path_builder;
pub mod pipeline;
pub mod store;
pub mod tags;
pub mod transcode;
pub mod uid_map;

// Tools that run alongside the sorter.
pub mod batch;
pub mod bids;
pub mod headers;

pub mod cli;
pub mod logging;
pub mod models;

pub use anonymize::{AnonymizationLevel, AnonymizationPolicy};
pub use cli::{run as run_cli, Cli, Commands};
pub use error::{SetupError, StoreError, UnitError};
pub use models::RunSummary;
pub use path_builder::{build_path, PathTemplate};
pub use pipeline::{run, CancelToken, JobOutcome, RunOutcome, SortOptions};
