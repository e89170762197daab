//
// tags.rs
// Dicom-Sort-rs
//
// Static classification of attributes into anonymization categories, plus the preserved-tag allowlist.
//

use std::str::FromStr;

use dicom::core::{Tag, VR};

/// How strict anonymization treats one attribute.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TagCategory {
    /// Patient ID / Patient Name, rewritten by the identifier step.
    PatientIdentity,
    /// Secondary identifiers, pseudonymized with the same hash as the patient ID.
    Identifier,
    /// Person-related dates, moved to January 1 of the same year.
    Date,
    /// Demographics normalized to a fixed value.
    Demographic(&'static str),
    /// Vendor-private groups (odd group number).
    Private,
    /// UIDs passed through untouched so series and studies can still be correlated.
    ReferenceUid,
    /// UIDs rewritten through the shared UID map.
    Uid,
    /// Allowlisted attribute, restored verbatim after anonymization.
    Preserved,
    /// Identifying free text, replaced with [`ANONYMIZED`].
    Other,
    /// Everything else is left alone.
    Untouched,
}

/// Marker written into free-text attributes under strict anonymization.
pub const ANONYMIZED: &str = "ANONYMIZED";

/// Imaging geometry and acquisition parameters that survive any anonymization level.
pub const PRESERVED_TAGS: &[Tag] = &[
    Tag(0x0008, 0x0020), // StudyDate
    Tag(0x0008, 0x1030), // StudyDescription
    Tag(0x0008, 0x103E), // SeriesDescription
    Tag(0x0018, 0x0020), // ScanningSequence
    Tag(0x0018, 0x0024), // SequenceName
    Tag(0x0018, 0x0050), // SliceThickness
    Tag(0x0018, 0x0080), // RepetitionTime
    Tag(0x0018, 0x0081), // EchoTime
    Tag(0x0018, 0x0082), // InversionTime
    Tag(0x0018, 0x0086), // EchoNumbers
    Tag(0x0018, 0x0087), // MagneticFieldStrength
    Tag(0x0018, 0x0088), // SpacingBetweenSlices
    Tag(0x0018, 0x0091), // EchoTrainLength
    Tag(0x0018, 0x1030), // ProtocolName
    Tag(0x0018, 0x1310), // AcquisitionMatrix
    Tag(0x0018, 0x1314), // FlipAngle
    Tag(0x0018, 0x5100), // PatientPosition
    Tag(0x0018, 0x9073), // AcquisitionDuration
    Tag(0x0020, 0x0032), // ImagePositionPatient
    Tag(0x0020, 0x0037), // ImageOrientationPatient
    Tag(0x0020, 0x1041), // SliceLocation
    Tag(0x0028, 0x0010), // Rows
    Tag(0x0028, 0x0011), // Columns
    Tag(0x0028, 0x0030), // PixelSpacing
];

/// Reference UIDs exempt from remapping.
pub const REFERENCE_UIDS: &[Tag] = &[
    Tag(0x0008, 0x0016), // SOPClassUID
    Tag(0x0008, 0x1150), // ReferencedSOPClassUID
    Tag(0x0020, 0x000D), // StudyInstanceUID
    Tag(0x0020, 0x000E), // SeriesInstanceUID
    Tag(0x0020, 0x0052), // FrameOfReferenceUID
];

pub const PATIENT_NAME: Tag = Tag(0x0010, 0x0010);
pub const PATIENT_ID: Tag = Tag(0x0010, 0x0020);
pub const PATIENT_BIRTH_DATE: Tag = Tag(0x0010, 0x0030);
pub const ACCESSION_NUMBER: Tag = Tag(0x0008, 0x0050);
pub const ACQUISITION_DATE: Tag = Tag(0x0008, 0x0022);
pub const ACQUISITION_DATE_TIME: Tag = Tag(0x0008, 0x002A);

/// Category of a tag under strict anonymization. `preserved` is the effective allowlist.
pub fn categorize(tag: Tag, vr: VR, preserved: &[Tag]) -> TagCategory {
    if preserved.contains(&tag) {
        return TagCategory::Preserved;
    }
    if tag.group() % 2 == 1 {
        return TagCategory::Private;
    }
    if REFERENCE_UIDS.contains(&tag) {
        return TagCategory::ReferenceUid;
    }

    match (tag.group(), tag.element()) {
        (0x0010, 0x0010) | (0x0010, 0x0020) => TagCategory::PatientIdentity,
        (0x0010, 0x1000) | (0x0010, 0x1090) => TagCategory::Identifier, // OtherPatientIDs, MedicalRecordLocator
        (0x0010, 0x0030) | (0x0010, 0x21D0) => TagCategory::Date, // PatientBirthDate, LastMenstrualDate
        (0x0010, 0x0040) => TagCategory::Demographic("O"),
        (0x0010, 0x1010) => TagCategory::Demographic("000Y"),
        (0x0010, 0x1020) | (0x0010, 0x1030) | (0x0010, 0x0032) => TagCategory::Demographic(""),
        (0x0010, 0x1001) // OtherPatientNames
        | (0x0010, 0x1005) // PatientBirthName
        | (0x0010, 0x1040) // PatientAddress
        | (0x0010, 0x1060) // PatientMotherBirthName
        | (0x0010, 0x2154) // PatientTelephoneNumbers
        | (0x0010, 0x21F0) // PatientReligiousPreference
        | (0x0010, 0x4000) // PatientComments
        | (0x0008, 0x0080) // InstitutionName
        | (0x0008, 0x0081) // InstitutionAddress
        | (0x0008, 0x0090) // ReferringPhysicianName
        | (0x0008, 0x1050) // PerformingPhysicianName
        | (0x0008, 0x1070) // OperatorsName
        | (0x0038, 0x0400) // PatientInstitutionResidence
        => TagCategory::Other,
        _ if vr == VR::UI => TagCategory::Uid,
        _ => TagCategory::Untouched,
    }
}

/// Parse `GGGGEEEE`, `GGGG,EEEE` or `(GGGG,EEEE)`.
pub fn parse_tag(input: &str) -> Option<Tag> {
    let cleaned: String = input
        .trim()
        .chars()
        .filter(|c| !matches!(c, '(' | ')' | ',' | ' '))
        .collect();
    if cleaned.len() != 8 || !cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let group = u16::from_str_radix(&cleaned[..4], 16).ok()?;
    let element = u16::from_str_radix(&cleaned[4..], 16).ok()?;
    Some(Tag(group, element))
}

/// Newtype so tags can be parsed straight from CLI arguments.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TagArg(pub Tag);

impl FromStr for TagArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_tag(s)
            .map(TagArg)
            .ok_or_else(|| format!("{s} is not a valid tag"))
    }
}
