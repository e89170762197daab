//
// dicom_access.rs
// Dicom-Sort-rs
//
// Read-side accessors shared by the classifier, path builder and header report: every absent tag reads as a sentinel.
//

use dicom::core::Tag;
use dicom::dictionary_std::StandardDataDictionary;
use dicom::object::{DefaultDicomObject, InMemDicomObject};

/// Value reported for any attribute that is absent, empty or not representable as text.
pub const UNKNOWN: &str = "UNKNOWN";

/// Small helper trait to pull string values from different DICOM object shapes.
pub trait ElementAccess {
    fn element_str(&self, tag: Tag) -> Option<String>;
    fn has_element(&self, tag: Tag) -> bool;

    /// Trimmed text of the element, or [`UNKNOWN`] when absent or empty.
    fn text_or_unknown(&self, tag: Tag) -> String {
        self.element_str(tag)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| UNKNOWN.to_string())
    }

    /// Individual values of a multi-valued string element (split on `\`).
    fn element_values(&self, tag: Tag) -> Vec<String> {
        self.element_str(tag)
            .map(|s| {
                s.split('\\')
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn text_of(obj: &InMemDicomObject<StandardDataDictionary>, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches(['\0', ' ']).to_string())
}

impl ElementAccess for DefaultDicomObject {
    fn element_str(&self, tag: Tag) -> Option<String> {
        text_of(self, tag)
    }

    fn has_element(&self, tag: Tag) -> bool {
        self.element(tag).is_ok()
    }
}

impl ElementAccess for InMemDicomObject<StandardDataDictionary> {
    fn element_str(&self, tag: Tag) -> Option<String> {
        text_of(self, tag)
    }

    fn has_element(&self, tag: Tag) -> bool {
        self.element(tag).is_ok()
    }
}
