//
// main.rs
// Dicom-Sort-rs
//
// Tokio entry point that hands off execution to the CLI layer.
//

use std::process::ExitCode;

use dicom_sort::cli;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    cli::run().await
}
