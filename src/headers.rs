//
// headers.rs
// Dicom-Sort-rs
//
// Series-level header report: a fixed set of acquisition attributes, one TSV row per distinct series.
//

use std::collections::HashSet;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use dicom::core::Tag;
use serde::Serialize;
use tracing::{info, warn};

use crate::dicom_access::ElementAccess;
use crate::pipeline::enumerate_files;
use crate::store::AttributeStore;

/// Files sampled when the whole tree is not requested.
pub const DEFAULT_SAMPLE: usize = 5;

/// Reported attributes and their column titles, in output order.
pub const HEADER_FIELDS: [(Tag, &str); 23] = [
    (Tag(0x0010, 0x0020), "Patient ID"),
    (Tag(0x0008, 0x0020), "Study Date"),
    (Tag(0x0018, 0x0087), "Magnetic Field Strength"),
    (Tag(0x0008, 0x1090), "Manufacturer's Model Name"),
    (Tag(0x0008, 0x0080), "Institution Name"),
    (Tag(0x0008, 0x0050), "Accession Number"),
    (Tag(0x0020, 0x000D), "Study Instance UID"),
    (Tag(0x0020, 0x0011), "Series Number"),
    (Tag(0x0008, 0x103E), "Series Description"),
    (Tag(0x0020, 0x000E), "Series Instance UID"),
    (Tag(0x0054, 0x0081), "Number of Slices"),
    (Tag(0x0018, 0x1310), "Acquisition Matrix"),
    (Tag(0x0028, 0x0030), "Pixel Spacing"),
    (Tag(0x0018, 0x0088), "Spacing Between Slices"),
    (Tag(0x0018, 0x0050), "Slice Thickness"),
    (Tag(0x0018, 0x0080), "Repetition Time"),
    (Tag(0x0018, 0x0081), "Echo Time"),
    (Tag(0x0018, 0x0086), "Echo Number(s)"),
    (Tag(0x0018, 0x0091), "Echo Train Length"),
    (Tag(0x0018, 0x0082), "Inversion Time"),
    (Tag(0x0018, 0x1314), "Flip Angle"),
    (Tag(0x0018, 0x9073), "Acquisition Duration"),
    (Tag(0x0008, 0x0008), "Image Type"),
];

// positions of SeriesInstanceUID, SeriesDescription, SeriesNumber in HEADER_FIELDS
const SERIES_KEY: [usize; 3] = [9, 8, 7];

#[derive(Debug, Clone, Default, Serialize)]
pub struct HeaderReport {
    pub files_read: usize,
    pub files_failed: usize,
    /// One row per distinct series, values in [`HEADER_FIELDS`] order; absent attributes are empty.
    pub rows: Vec<Vec<String>>,
}

/// Read the first [`DEFAULT_SAMPLE`] files (or all of them) below `dir` and keep the first row seen for
/// each (SeriesInstanceUID, SeriesDescription, SeriesNumber).
pub fn collect(dir: &Path, read_all: bool) -> Result<HeaderReport> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }

    let mut files = enumerate_files(dir);
    if !read_all {
        files.truncate(DEFAULT_SAMPLE);
    }

    let mut report = HeaderReport::default();
    let mut seen = HashSet::new();
    for path in &files {
        let store = match AttributeStore::open(path) {
            Ok(store) => store,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Error reading DICOM file");
                report.files_failed += 1;
                continue;
            }
        };
        report.files_read += 1;

        let row = header_row(&store);
        let key: Vec<String> = SERIES_KEY.iter().map(|&i| row[i].clone()).collect();
        if key.iter().all(String::is_empty) {
            continue;
        }
        if seen.insert(key) {
            report.rows.push(row);
        }
    }

    info!(
        files = files.len(),
        failed = report.files_failed,
        series = report.rows.len(),
        "Collected header report"
    );
    Ok(report)
}

pub fn header_row(attrs: &dyn ElementAccess) -> Vec<String> {
    HEADER_FIELDS
        .iter()
        .map(|(tag, _)| {
            attrs
                .element_str(*tag)
                .map(|v| v.trim().replace(['\t', '\n', '\r'], " "))
                .unwrap_or_default()
        })
        .collect()
}

/// Write the report as TSV with a header row of column titles.
pub fn write_tsv(report: &HeaderReport, output: &Path) -> Result<()> {
    let file = fs::File::create(output).with_context(|| format!("Failed to create {}", output.display()))?;
    let mut out = BufWriter::new(file);

    let titles: Vec<&str> = HEADER_FIELDS.iter().map(|(_, title)| *title).collect();
    writeln!(out, "{}", titles.join("\t"))?;
    for row in &report.rows {
        writeln!(out, "{}", row.join("\t"))?;
    }
    out.flush()?;
    Ok(())
}
