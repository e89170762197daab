//
// anonymize.rs
// Dicom-Sort-rs
//
// Policy-driven de-identification of one dataset: identifier resolution, date and accession toggles,
// strict per-category rewriting, UID remapping and restoration of the preserved-tag snapshot.
//

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::NaiveDate;
use dicom::core::value::Value;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::correlation::CorrelationTable;
use crate::dicom_access::{ElementAccess, UNKNOWN};
use crate::hashing::pseudonym;
use crate::store::{self, Dataset};
use crate::tags::{self, categorize, TagCategory, ANONYMIZED, PRESERVED_TAGS};
use crate::uid_map::UidMap;

/// Replacement for dates that cannot be parsed.
pub const EPOCH_DATE: &str = "20000101";
const ACCESSION_LENGTH: usize = 10;
// support hyphens as well, some exporters write them even though DA does not allow it
const DATE_FORMATS: [&str; 2] = ["%Y%m%d", "%Y-%m-%d"];

/// Graduated de-identification levels.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnonymizationLevel {
    #[default]
    None,
    Basic,
    Strict,
}

/// Level plus independent toggles. Every combination is valid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnonymizationPolicy {
    pub level: AnonymizationLevel,
    pub anonymize_birth_date: bool,
    pub anonymize_acquisition_date: bool,
    pub anonymize_accession_number: bool,
    pub preserve_private_tags: bool,
    /// Read the original identifier from Patient Name instead of Patient ID.
    pub id_from_patient_name: bool,
    /// Added to [`PRESERVED_TAGS`].
    pub extra_preserved_tags: Vec<Tag>,
}

impl AnonymizationPolicy {
    pub fn with_level(level: AnonymizationLevel) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }

    pub fn preserved_tags(&self) -> Vec<Tag> {
        let mut all = PRESERVED_TAGS.to_vec();
        all.extend(self.extra_preserved_tags.iter().copied().filter(|t| !PRESERVED_TAGS.contains(t)));
        all
    }

    fn has_toggles(&self) -> bool {
        self.anonymize_birth_date || self.anonymize_acquisition_date || self.anonymize_accession_number
    }
}

/// Original identifiers that had no correlation entry, collected for manual review.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnmappedIds(BTreeSet<String>);

impl UnmappedIds {
    pub fn insert(&mut self, id: impl Into<String>) {
        self.0.insert(id.into());
    }

    pub fn merge(&mut self, other: UnmappedIds) {
        self.0.extend(other.0);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// One identifier per line, sorted.
    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        let mut file = fs::File::create(path)?;
        for id in &self.0 {
            writeln!(file, "{id}")?;
        }
        Ok(())
    }
}

/// Applies an [`AnonymizationPolicy`] using a correlation table and the run-wide UID map.
pub struct Anonymizer<'a> {
    policy: &'a AnonymizationPolicy,
    correlation: &'a CorrelationTable,
    uid_map: &'a UidMap,
}

impl<'a> Anonymizer<'a> {
    pub fn new(policy: &'a AnonymizationPolicy, correlation: &'a CorrelationTable, uid_map: &'a UidMap) -> Self {
        Self {
            policy,
            correlation,
            uid_map,
        }
    }

    /// Whether running this anonymizer can change anything at all.
    pub fn is_active(&self) -> bool {
        self.rewrites_identity() || self.policy.has_toggles()
    }

    fn rewrites_identity(&self) -> bool {
        self.policy.level != AnonymizationLevel::None || !self.correlation.is_empty()
    }

    /// Rewrite `ds` in place. Absent attributes are never fabricated, except the patient ID and name,
    /// which always end up equal to the resolved replacement identifier.
    ///
    /// Limitation: only top-level elements are processed, not items nested inside sequences.
    pub fn anonymize(&self, ds: &mut Dataset, unmapped: &mut UnmappedIds) {
        let preserved = self.policy.preserved_tags();
        let saved = store::snapshot(ds, preserved.iter().copied());

        if self.rewrites_identity() {
            self.resolve_identity(ds, unmapped);
        }
        if self.policy.anonymize_birth_date {
            rewrite_date(ds, tags::PATIENT_BIRTH_DATE);
        }
        if self.policy.anonymize_acquisition_date {
            rewrite_date(ds, tags::ACQUISITION_DATE);
            rewrite_date(ds, tags::ACQUISITION_DATE_TIME);
        }
        if self.policy.anonymize_accession_number && ds.has_element(tags::ACCESSION_NUMBER) {
            put_str(ds, tags::ACCESSION_NUMBER, VR::SH, &random_accession());
        }
        if self.policy.level == AnonymizationLevel::Strict {
            self.strict_pass(ds, &preserved);
        }

        store::restore(ds, saved);
    }

    fn resolve_identity(&self, ds: &mut Dataset, unmapped: &mut UnmappedIds) {
        let source = if self.policy.id_from_patient_name {
            tags::PATIENT_NAME
        } else {
            tags::PATIENT_ID
        };
        let original = ds.text_or_unknown(source);

        let replacement = match self.correlation.get(&original) {
            Some(mapped) => mapped.to_string(),
            None if original == UNKNOWN => pseudonym(UNKNOWN),
            None => {
                unmapped.insert(original.clone());
                pseudonym(&original)
            }
        };
        debug!(source = %source, replacement = %replacement, "Resolved patient identifier");

        put_str(ds, tags::PATIENT_ID, VR::LO, &replacement);
        put_str(ds, tags::PATIENT_NAME, VR::PN, &replacement);
    }

    fn strict_pass(&self, ds: &mut Dataset, preserved: &[Tag]) {
        if !self.policy.preserve_private_tags {
            let private: Vec<Tag> = ds
                .iter()
                .map(|e| e.header().tag)
                .filter(|t| t.group() % 2 == 1)
                .collect();
            for tag in private {
                ds.remove_element(tag);
            }
        }

        let headers: Vec<(Tag, VR)> = ds.iter().map(|e| (e.header().tag, e.header().vr)).collect();

        for (tag, vr) in headers {
            let category = categorize(tag, vr, preserved);
            if matches!(
                category,
                TagCategory::PatientIdentity
                    | TagCategory::Private
                    | TagCategory::ReferenceUid
                    | TagCategory::Preserved
                    | TagCategory::Untouched
            ) {
                continue;
            }
            // sequences and pixel fragments carry no text to rewrite
            let Some(text) = primitive_text(ds, tag) else { continue };
            match category {
                TagCategory::Identifier => put_values(ds, tag, vr, &text, pseudonym),
                TagCategory::Date => put_values(ds, tag, vr, &text, january_first),
                TagCategory::Uid => put_values(ds, tag, vr, &text, |v| self.uid_map.map(v)),
                TagCategory::Demographic("") => {
                    ds.put(DataElement::new(tag, vr, PrimitiveValue::Empty));
                }
                TagCategory::Demographic(value) => put_str(ds, tag, vr, value),
                TagCategory::Other => put_str(ds, tag, vr, ANONYMIZED),
                TagCategory::PatientIdentity
                | TagCategory::Private
                | TagCategory::ReferenceUid
                | TagCategory::Preserved
                | TagCategory::Untouched => {}
            }
        }
    }
}

/// Move a date to January 1 of its year, keeping any trailing time part. Unparsable dates become [`EPOCH_DATE`].
pub fn january_first(value: &str) -> String {
    let value = value.trim();
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_and_remainder(value, format).ok())
        .map(|(date, remainder)| format!("{}0101{}", date.format("%Y"), remainder))
        .unwrap_or_else(|| EPOCH_DATE.to_string())
}

fn primitive_text(ds: &Dataset, tag: Tag) -> Option<String> {
    let elem = ds.element(tag).ok()?;
    match elem.value() {
        Value::Primitive(_) => elem.to_str().ok().map(|s| s.into_owned()),
        _ => None,
    }
}

fn rewrite_date(ds: &mut Dataset, tag: Tag) {
    let Ok(elem) = ds.element(tag) else { return };
    let vr = elem.header().vr;
    let Some(value) = ds.element_str(tag).filter(|v| !v.trim().is_empty()) else {
        return;
    };
    put_str(ds, tag, vr, &january_first(&value));
}

fn random_accession() -> String {
    let mut rng = rand::thread_rng();
    (0..ACCESSION_LENGTH)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

fn put_str(ds: &mut Dataset, tag: Tag, vr: VR, value: &str) {
    ds.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
}

/// Rewrite each component of a (possibly multi-valued) string element.
fn put_values(ds: &mut Dataset, tag: Tag, vr: VR, text: &str, rewrite: impl Fn(&str) -> String) {
    let values: Vec<String> = text
        .split('\\')
        .map(|v| v.trim_end_matches(['\0', ' ']).trim())
        .map(|v| if v.is_empty() { String::new() } else { rewrite(v) })
        .collect();

    let value = if values.len() == 1 {
        PrimitiveValue::from(values[0].as_str())
    } else {
        PrimitiveValue::Strs(values.into())
    };
    ds.put(DataElement::new(tag, vr, value));
}
