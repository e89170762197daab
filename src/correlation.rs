//
// correlation.rs
// Dicom-Sort-rs
//
// Loads the optional mapping from original patient identifiers to caller-chosen replacements.
//

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use calamine::{open_workbook_auto, Reader};
use regex::Regex;
use tracing::{info, warn};

use crate::error::SetupError;

static DELIMITER: OnceLock<Regex> = OnceLock::new();
static WHITESPACE: OnceLock<Regex> = OnceLock::new();

/// Immutable original-ID -> replacement-ID table. Keys are case-sensitive; the last duplicate wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationTable {
    entries: HashMap<String, String>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a tab/comma/whitespace separated file, or the first sheet of a spreadsheet.
    pub fn load(path: &Path) -> Result<Self, SetupError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        let table = match ext.as_str() {
            "xlsx" | "xlsm" | "xls" | "ods" => Self::from_rows(read_spreadsheet(path)?),
            _ => {
                let text = fs::read_to_string(path).map_err(|e| SetupError::CorrelationTable {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
                Self::parse_delimited(&text)
            }
        };

        info!(path = %path.display(), entries = table.len(), "Loaded correlation table");
        Ok(table)
    }

    /// Parse delimited text: each line needs at least two columns (original, replacement).
    /// Lines containing a comma or tab are split on those only, so identifiers may contain spaces;
    /// other lines are split on whitespace.
    pub fn parse_delimited(text: &str) -> Self {
        let delimiter = DELIMITER.get_or_init(|| Regex::new(r"[,\t]").expect("valid delimiter regex"));
        let whitespace = WHITESPACE.get_or_init(|| Regex::new(r"\s+").expect("valid whitespace regex"));
        let rows = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                let separator = if delimiter.is_match(line) { delimiter } else { whitespace };
                separator.split(line).map(|s| s.to_string()).collect::<Vec<_>>()
            });
        Self::from_rows(rows)
    }

    fn from_rows(rows: impl IntoIterator<Item = Vec<String>>) -> Self {
        let mut entries = HashMap::new();
        for (idx, row) in rows.into_iter().enumerate() {
            let mut cells = row.into_iter().map(|c| c.trim().to_string()).filter(|c| !c.is_empty());
            match (cells.next(), cells.next()) {
                (Some(original), Some(replacement)) => {
                    if let Some(previous) = entries.insert(original.clone(), replacement.clone()) {
                        warn!(
                            row = idx + 1,
                            id = %original,
                            previous = %previous,
                            replacement = %replacement,
                            "Duplicate correlation entry, keeping the last one"
                        );
                    }
                }
                _ => warn!(row = idx + 1, "Skipping malformed correlation row"),
            }
        }
        Self { entries }
    }

    pub fn get(&self, original: &str) -> Option<&str> {
        self.entries.get(original).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for CorrelationTable {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

fn read_spreadsheet(path: &Path) -> Result<Vec<Vec<String>>, SetupError> {
    let fail = |reason: String| SetupError::CorrelationTable {
        path: path.to_path_buf(),
        reason,
    };

    let mut workbook = open_workbook_auto(path).map_err(|e| fail(e.to_string()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| fail("workbook has no sheets".to_string()))?
        .map_err(|e| fail(e.to_string()))?;

    Ok(range
        .rows()
        .map(|row| row.iter().map(|cell| cell.to_string()).collect())
        .collect())
}
