//
// path_builder.rs
// Dicom-Sort-rs
//
// Renders destination folders from a `%Placeholder%` template and picks collision-free file names.
//

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use dicom::core::Tag;

use crate::dicom_access::{ElementAccess, UNKNOWN};
use crate::error::SetupError;
use crate::hashing::pseudonym;

pub const DEFAULT_TEMPLATE: &str = "%PatientID%/%StudyDate%/%SeriesNumber%_%SeriesDescription%";
/// Series numbers are zero-padded to this width so folders sort lexicographically.
pub const SERIES_NUMBER_WIDTH: usize = 4;
const SERIES_SUFFIX_LENGTH: usize = 6;
const ILLEGAL_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8", "COM9", "LPT1",
    "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Field {
    PatientId,
    StudyDate,
    StudyTime,
    StudyDescription,
    SeriesNumber,
    SeriesDescription,
    SeriesSuffix,
    Modality,
}

impl Field {
    const ALL: [(&'static str, Field); 8] = [
        ("PatientID", Field::PatientId),
        ("StudyDate", Field::StudyDate),
        ("StudyTime", Field::StudyTime),
        ("StudyDescription", Field::StudyDescription),
        ("SeriesNumber", Field::SeriesNumber),
        ("SeriesDescription", Field::SeriesDescription),
        ("SeriesSuffix", Field::SeriesSuffix),
        ("Modality", Field::Modality),
    ];

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().find(|(n, _)| *n == name).map(|(_, f)| *f)
    }

    fn render(self, attrs: &dyn ElementAccess) -> String {
        match self {
            Field::PatientId => sanitize_component(&attrs.text_or_unknown(Tag(0x0010, 0x0020))),
            Field::StudyDate => sanitize_component(&attrs.text_or_unknown(Tag(0x0008, 0x0020))),
            Field::StudyTime => {
                let time = attrs.text_or_unknown(Tag(0x0008, 0x0030));
                sanitize_component(time.split('.').next().unwrap_or(UNKNOWN))
            }
            Field::StudyDescription => sanitize_description(&attrs.text_or_unknown(Tag(0x0008, 0x1030))),
            Field::SeriesNumber => pad_series_number(&attrs.text_or_unknown(Tag(0x0020, 0x0011))),
            Field::SeriesDescription => sanitize_description(&attrs.text_or_unknown(Tag(0x0008, 0x103E))),
            Field::SeriesSuffix => match attrs.element_str(Tag(0x0020, 0x000E)).filter(|s| !s.trim().is_empty()) {
                Some(uid) => pseudonym(uid.trim())[..SERIES_SUFFIX_LENGTH].to_string(),
                None => UNKNOWN.to_string(),
            },
            Field::Modality => sanitize_component(&attrs.text_or_unknown(Tag(0x0008, 0x0060))),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
enum Segment {
    Literal(String),
    Field(Field),
}

/// A parsed destination template such as [`DEFAULT_TEMPLATE`]. `/` separates folder levels.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PathTemplate {
    source: String,
    components: Vec<Vec<Segment>>,
}

impl PathTemplate {
    pub fn parse(template: &str) -> Result<Self, SetupError> {
        let fail = |reason: String| SetupError::Template {
            template: template.to_string(),
            reason,
        };

        let mut components = Vec::new();
        for raw in template.split(['/', '\\']).filter(|c| !c.is_empty()) {
            let pieces: Vec<&str> = raw.split('%').collect();
            if pieces.len() % 2 == 0 {
                return Err(fail(format!("unbalanced '%' in {raw:?}")));
            }

            let mut segments = Vec::new();
            for (idx, piece) in pieces.into_iter().enumerate() {
                if idx % 2 == 0 {
                    if !piece.is_empty() {
                        segments.push(Segment::Literal(piece.to_string()));
                    }
                } else {
                    let field = Field::from_name(piece).ok_or_else(|| {
                        let known: Vec<&str> = Field::ALL.iter().map(|(n, _)| *n).collect();
                        fail(format!("unknown placeholder %{piece}% (known: {})", known.join(", ")))
                    })?;
                    segments.push(Segment::Field(field));
                }
            }
            components.push(segments);
        }

        if components.is_empty() {
            return Err(fail("template has no path components".to_string()));
        }
        Ok(Self {
            source: template.to_string(),
            components,
        })
    }

    /// Relative destination folder for an object. Pure: same attributes, same path.
    pub fn render(&self, attrs: &dyn ElementAccess) -> PathBuf {
        self.components
            .iter()
            .map(|segments| {
                let rendered: String = segments
                    .iter()
                    .map(|segment| match segment {
                        Segment::Literal(text) => text.clone(),
                        Segment::Field(field) => field.render(attrs),
                    })
                    .collect();
                sanitize_component(&rendered)
            })
            .collect()
    }
}

impl Default for PathTemplate {
    fn default() -> Self {
        Self {
            source: DEFAULT_TEMPLATE.to_string(),
            components: vec![
                vec![Segment::Field(Field::PatientId)],
                vec![Segment::Field(Field::StudyDate)],
                vec![
                    Segment::Field(Field::SeriesNumber),
                    Segment::Literal("_".to_string()),
                    Segment::Field(Field::SeriesDescription),
                ],
            ],
        }
    }
}

impl FromStr for PathTemplate {
    type Err = SetupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PathTemplate::parse(s)
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

pub fn build_path(template: &PathTemplate, attrs: &dyn ElementAccess) -> PathBuf {
    template.render(attrs)
}

/// `<SOPInstanceUID>.dcm`, or `None` when the object has no instance UID.
pub fn file_name(attrs: &dyn ElementAccess) -> Option<String> {
    attrs
        .element_str(Tag(0x0008, 0x0018))
        .map(|uid| uid.trim().to_string())
        .filter(|uid| !uid.is_empty())
        .map(|uid| format!("{}.dcm", sanitize_component(&uid)))
}

/// First free name in `dir` derived from the source file name: `name.ext`, `name_1.ext`, `name_2.ext`, ...
pub fn fallback_file_name(dir: &Path, source: &Path) -> String {
    let stem = source
        .file_stem()
        .map(|s| sanitize_component(&s.to_string_lossy()))
        .unwrap_or_else(|| UNKNOWN.to_string());
    let ext = source
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut candidate = format!("{stem}{ext}");
    let mut counter = 1;
    while dir.join(&candidate).exists() {
        candidate = format!("{stem}_{counter}{ext}");
        counter += 1;
    }
    candidate
}

/// Zero-padded series number; non-numeric values pass through sanitized.
fn pad_series_number(raw: &str) -> String {
    match raw.trim().parse::<i64>() {
        Ok(n) if n >= 0 => format!("{:0width$}", n, width = SERIES_NUMBER_WIDTH),
        _ => sanitize_component(raw),
    }
}

/// Free-text fields: whitespace and dots become underscores and `*` is dropped before the generic cleanup.
pub fn sanitize_description(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| *c != '*')
        .map(|c| if c.is_whitespace() || c == '.' { '_' } else { c })
        .collect();
    sanitize_component(&cleaned)
}

/// Make a single path component safe on every platform.
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !ILLEGAL_CHARS.contains(c) && !c.is_control())
        .collect();
    let cleaned = cleaned.trim().trim_end_matches(['.', ' ']).to_string();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        return UNKNOWN.to_string();
    }
    let stem = cleaned.split('.').next().unwrap_or_default().to_ascii_uppercase();
    if RESERVED_NAMES.contains(&stem.as_str()) {
        return format!("_{cleaned}");
    }
    cleaned
}
