//
// classify.rs
// Dicom-Sort-rs
//
// Keep/skip decision per object: pluggable derived-image heuristics and the burned-in annotation flag.
//

use std::fs;
use std::path::Path;

use dicom::core::Tag;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dicom_access::ElementAccess;
use crate::error::SetupError;

const IMAGE_TYPE: Tag = Tag(0x0008, 0x0008);
const MANUFACTURER: Tag = Tag(0x0008, 0x0070);
const SERIES_DESCRIPTION: Tag = Tag(0x0008, 0x103E);
const SERIES_NUMBER: Tag = Tag(0x0020, 0x0011);
const BURNED_IN_ANNOTATION: Tag = Tag(0x0028, 0x0301);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub enum Classification {
    Keep,
    SkipDerived,
    SkipBurnedIn,
}

/// One vendor- or site-specific rule for spotting derived/secondary series.
/// Missing or malformed attributes must read as "not derived".
pub trait DerivedHeuristic: Send + Sync {
    fn name(&self) -> &str;
    fn is_derived(&self, attrs: &dyn ElementAccess) -> bool;
}

/// Flags objects whose Image Type lacks the primary marker or carries any derived marker.
pub struct ImageTypeHeuristic {
    primary_marker: String,
    derived_markers: Vec<String>,
}

impl ImageTypeHeuristic {
    pub fn new(primary_marker: &str, derived_markers: &[String]) -> Self {
        Self {
            primary_marker: primary_marker.to_uppercase(),
            derived_markers: derived_markers.iter().map(|m| m.to_uppercase()).collect(),
        }
    }
}

impl DerivedHeuristic for ImageTypeHeuristic {
    fn name(&self) -> &str {
        "image-type"
    }

    fn is_derived(&self, attrs: &dyn ElementAccess) -> bool {
        let values: Vec<String> = attrs
            .element_values(IMAGE_TYPE)
            .into_iter()
            .map(|v| v.to_uppercase())
            .collect();
        if values.is_empty() {
            return false;
        }
        !values.contains(&self.primary_marker) || values.iter().any(|v| self.derived_markers.contains(v))
    }
}

/// Flags survey/scout/localizer series by description.
pub struct SeriesDescriptionHeuristic {
    pattern: Regex,
}

impl SeriesDescriptionHeuristic {
    pub fn new(pattern: Regex) -> Self {
        Self { pattern }
    }
}

impl DerivedHeuristic for SeriesDescriptionHeuristic {
    fn name(&self) -> &str {
        "series-description"
    }

    fn is_derived(&self, attrs: &dyn ElementAccess) -> bool {
        attrs
            .element_str(SERIES_DESCRIPTION)
            .is_some_and(|d| self.pattern.is_match(&d))
    }
}

/// Flags objects from a manufacturer other than the expected ones.
pub struct VendorHeuristic {
    expected: Vec<String>,
}

impl VendorHeuristic {
    pub fn new(expected: &[String]) -> Self {
        Self {
            expected: expected.iter().map(|v| v.to_lowercase()).collect(),
        }
    }
}

impl DerivedHeuristic for VendorHeuristic {
    fn name(&self) -> &str {
        "vendor"
    }

    fn is_derived(&self, attrs: &dyn ElementAccess) -> bool {
        match attrs.element_str(MANUFACTURER).map(|m| m.trim().to_lowercase()) {
            Some(m) if !m.is_empty() => !self.expected.iter().any(|e| m.contains(e.as_str())),
            _ => false,
        }
    }
}

/// Flags series numbered above a threshold (some scanners number reconstructions from 1000 upwards).
pub struct SeriesNumberHeuristic {
    max: i64,
}

impl SeriesNumberHeuristic {
    pub fn new(max: i64) -> Self {
        Self { max }
    }
}

impl DerivedHeuristic for SeriesNumberHeuristic {
    fn name(&self) -> &str {
        "series-number"
    }

    fn is_derived(&self, attrs: &dyn ElementAccess) -> bool {
        attrs
            .element_str(SERIES_NUMBER)
            .and_then(|n| n.trim().parse::<i64>().ok())
            .is_some_and(|n| n > self.max)
    }
}

/// Derived-image rule set, loadable from JSON so sites can tune it without code changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DerivedRules {
    pub primary_marker: String,
    pub derived_markers: Vec<String>,
    pub series_description_pattern: Option<String>,
    pub expected_manufacturers: Vec<String>,
    pub max_series_number: Option<i64>,
}

impl Default for DerivedRules {
    fn default() -> Self {
        Self {
            primary_marker: "PRIMARY".to_string(),
            derived_markers: ["DERIVED", "SECONDARY", "PROJECTION IMAGE", "PERFUSION", "ADC"]
                .into_iter()
                .map(String::from)
                .collect(),
            series_description_pattern: Some(r"(?i)survey|scout|locali[sz]er".to_string()),
            expected_manufacturers: Vec::new(),
            max_series_number: None,
        }
    }
}

impl DerivedRules {
    pub fn load(path: &Path) -> Result<Self, SetupError> {
        let fail = |reason: String| SetupError::DerivedRules {
            path: path.to_path_buf(),
            reason,
        };
        let text = fs::read_to_string(path).map_err(|e| fail(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| fail(e.to_string()))
    }

    pub fn heuristics(&self) -> Result<Vec<Box<dyn DerivedHeuristic>>, SetupError> {
        let mut heuristics: Vec<Box<dyn DerivedHeuristic>> =
            vec![Box::new(ImageTypeHeuristic::new(&self.primary_marker, &self.derived_markers))];

        if let Some(pattern) = &self.series_description_pattern {
            let regex = Regex::new(pattern).map_err(|source| SetupError::DerivedPattern {
                pattern: pattern.clone(),
                source,
            })?;
            heuristics.push(Box::new(SeriesDescriptionHeuristic::new(regex)));
        }
        if !self.expected_manufacturers.is_empty() {
            heuristics.push(Box::new(VendorHeuristic::new(&self.expected_manufacturers)));
        }
        if let Some(max) = self.max_series_number {
            heuristics.push(Box::new(SeriesNumberHeuristic::new(max)));
        }
        Ok(heuristics)
    }
}

/// Pure keep/skip decision. Any heuristic flagging an object makes it derived.
pub struct Classifier {
    heuristics: Vec<Box<dyn DerivedHeuristic>>,
    skip_derived: bool,
    skip_burned_in: bool,
}

impl Classifier {
    pub fn new(heuristics: Vec<Box<dyn DerivedHeuristic>>) -> Self {
        Self {
            heuristics,
            skip_derived: true,
            skip_burned_in: true,
        }
    }

    /// A classifier that keeps everything.
    pub fn keep_all() -> Self {
        Self {
            heuristics: Vec::new(),
            skip_derived: false,
            skip_burned_in: false,
        }
    }

    pub fn skip_derived(mut self, enabled: bool) -> Self {
        self.skip_derived = enabled;
        self
    }

    pub fn skip_burned_in(mut self, enabled: bool) -> Self {
        self.skip_burned_in = enabled;
        self
    }

    pub fn classify(&self, attrs: &dyn ElementAccess) -> Classification {
        if self.skip_derived && self.derived_by(attrs).is_some() {
            Classification::SkipDerived
        } else if self.skip_burned_in && has_burned_in_annotation(attrs) {
            Classification::SkipBurnedIn
        } else {
            Classification::Keep
        }
    }

    /// Name of the first heuristic that flags the object as derived.
    pub fn derived_by(&self, attrs: &dyn ElementAccess) -> Option<&str> {
        self.heuristics
            .iter()
            .find(|h| h.is_derived(attrs))
            .map(|h| h.name())
    }
}

pub fn has_burned_in_annotation(attrs: &dyn ElementAccess) -> bool {
    attrs
        .element_str(BURNED_IN_ANNOTATION)
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("YES"))
}
