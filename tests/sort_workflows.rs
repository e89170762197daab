//
// sort_workflows.rs
// Dicom-Sort-rs
//
// End-to-end runs of the sorter over synthetic trees: layout, pseudonyms, correlation, cancellation,
// skip filters, decompression, per-file failures and cross-worker UID consistency.
//

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use dicom::core::value::{PixelFragmentSequence, Value};
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::StandardDataDictionary;
use dicom::object::{open_file, FileDicomObject, FileMetaTableBuilder, InMemDicomObject};
use dicom::transfer_syntax::entries::{EXPLICIT_VR_LITTLE_ENDIAN, RLE_LOSSLESS};
use dicom_sort::anonymize::{AnonymizationLevel, AnonymizationPolicy};
use dicom_sort::correlation::CorrelationTable;
use dicom_sort::hashing::pseudonym;
use dicom_sort::models::RunSummary;
use dicom_sort::path_builder::PathTemplate;
use dicom_sort::pipeline::{self, CancelToken, RunOutcome, SortOptions, MISSING_IDS_FILE, SUMMARY_FILE};
use dicom_sort::SetupError;
use tempfile::tempdir;

const PATIENT_NAME: Tag = Tag(0x0010, 0x0010);
const PATIENT_ID: Tag = Tag(0x0010, 0x0020);
const BIRTH_DATE: Tag = Tag(0x0010, 0x0030);
const SOP_INSTANCE_UID: Tag = Tag(0x0008, 0x0018);
const SERIES_INSTANCE_UID: Tag = Tag(0x0020, 0x000E);
const IRRADIATION_EVENT_UID: Tag = Tag(0x0008, 0x3010);
const SLICE_THICKNESS: Tag = Tag(0x0018, 0x0050);
const PIXEL_DATA: Tag = Tag(0x7fe0, 0x0010);

struct Instance<'a> {
    patient_id: &'a str,
    study_uid: &'a str,
    study_date: &'a str,
    series_uid: &'a str,
    series_number: &'a str,
    series_description: &'a str,
    instance_uid: String,
    image_type: &'a str,
    extra: Vec<(Tag, VR, &'a str)>,
}

impl<'a> Instance<'a> {
    fn new(patient_id: &'a str, study_uid: &'a str, series_uid: &'a str, index: usize) -> Self {
        Self {
            patient_id,
            study_uid,
            study_date: "20240115",
            series_uid,
            series_number: "1",
            series_description: "t1 mprage",
            instance_uid: format!("{series_uid}.{index}"),
            image_type: "ORIGINAL\\PRIMARY\\M\\ND",
            extra: Vec::new(),
        }
    }

    fn dataset(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty_with_dict(StandardDataDictionary);
        let text = [
            (Tag(0x0008, 0x0016), VR::UI, "1.2.840.10008.5.1.4.1.1.4"),
            (SOP_INSTANCE_UID, VR::UI, self.instance_uid.as_str()),
            (Tag(0x0008, 0x0008), VR::CS, self.image_type),
            (Tag(0x0008, 0x0020), VR::DA, self.study_date),
            (Tag(0x0008, 0x0060), VR::CS, "MR"),
            (Tag(0x0008, 0x103E), VR::LO, self.series_description),
            (PATIENT_NAME, VR::PN, "Doe^Jane"),
            (PATIENT_ID, VR::LO, self.patient_id),
            (Tag(0x0020, 0x000D), VR::UI, self.study_uid),
            (SERIES_INSTANCE_UID, VR::UI, self.series_uid),
            (Tag(0x0020, 0x0011), VR::IS, self.series_number),
            (SLICE_THICKNESS, VR::DS, "1.0"),
            (Tag(0x0028, 0x0004), VR::CS, "MONOCHROME2"),
        ];
        for (tag, vr, value) in text.into_iter().chain(self.extra.iter().copied()) {
            obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
        }
        let image = [
            (Tag(0x0028, 0x0002), 1_u16),
            (Tag(0x0028, 0x0010), 2),
            (Tag(0x0028, 0x0011), 2),
            (Tag(0x0028, 0x0100), 8),
            (Tag(0x0028, 0x0101), 8),
            (Tag(0x0028, 0x0102), 7),
            (Tag(0x0028, 0x0103), 0),
        ];
        for (tag, value) in image {
            obj.put(DataElement::new(tag, VR::US, PrimitiveValue::from(value)));
        }
        obj.put(DataElement::new(PIXEL_DATA, VR::OB, PrimitiveValue::from(vec![0_u8, 64, 128, 255])));
        obj
    }

    fn write(&self, path: &Path) {
        write_object(self.dataset(), &self.instance_uid, EXPLICIT_VR_LITTLE_ENDIAN.uid(), path);
    }

    /// Same object with its 2x2 pixels stored as a single RLE Lossless segment.
    fn write_rle(&self, path: &Path) {
        let mut segment = vec![0_u8; 64];
        segment[0..4].copy_from_slice(&1_u32.to_le_bytes());
        segment[4..8].copy_from_slice(&64_u32.to_le_bytes());
        segment.extend_from_slice(&[0x03, 0, 64, 128, 255, 0x80]);

        let mut obj = self.dataset();
        let fragments = PixelFragmentSequence::new(Vec::<u32>::new(), vec![segment]);
        obj.put(DataElement::new(PIXEL_DATA, VR::OB, Value::PixelSequence(fragments)));
        write_object(obj, &self.instance_uid, RLE_LOSSLESS.uid(), path);
    }
}

fn write_object(obj: InMemDicomObject, instance_uid: &str, transfer_syntax: &str, path: &Path) {
    let meta = FileMetaTableBuilder::new()
        .transfer_syntax(transfer_syntax)
        .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.4")
        .media_storage_sop_instance_uid(instance_uid)
        .build()
        .expect("meta");
    let mut file_obj = FileDicomObject::new_empty_with_dict_and_meta(StandardDataDictionary, meta);
    for elem in obj {
        file_obj.put(elem);
    }
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    file_obj.write_to_file(path).expect("write test dicom");
}

/// Two patients with one study each: P1 has series 1 (3 images) and 2 (2 images), P2 has one series of 5.
fn two_study_tree(root: &Path) {
    for i in 0..3 {
        Instance::new("P1", "1.2.100", "1.2.100.1", i).write(&root.join(format!("dump/a/IM{i}")));
    }
    for i in 0..2 {
        let mut instance = Instance::new("P1", "1.2.100", "1.2.100.2", i);
        instance.series_number = "2";
        instance.series_description = "flair";
        instance.write(&root.join(format!("dump/b/IM{i}")));
    }
    for i in 0..5 {
        let mut instance = Instance::new("P2", "1.2.200", "1.2.200.1", i);
        instance.study_date = "20240220";
        instance.write(&root.join(format!("other/IM{i}.dcm")));
    }
}

fn dicom_files(root: &Path) -> Vec<PathBuf> {
    pipeline::enumerate_files(root)
        .into_iter()
        .filter(|p| p.extension().is_some_and(|e| e == "dcm"))
        .collect()
}

fn text(path: &Path, tag: Tag) -> Option<String> {
    let obj = open_file(path).expect("open output");
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches(['\0', ' ']).to_string())
}

fn sort(
    input: &Path,
    output: &Path,
    policy: &AnonymizationPolicy,
    options: &SortOptions,
) -> RunOutcome {
    pipeline::run(
        input,
        output,
        &PathTemplate::default(),
        policy,
        options,
        |_| {},
        &CancelToken::new(),
    )
    .expect("run")
}

#[test]
fn basic_sort_lays_out_two_studies_with_one_pseudonym_per_patient() {
    let input = tempdir().expect("tempdir");
    let output = tempdir().expect("tempdir");
    two_study_tree(input.path());

    let outcome = sort(
        input.path(),
        output.path(),
        &AnonymizationPolicy::with_level(AnonymizationLevel::Basic),
        &SortOptions::default(),
    );
    let RunOutcome::Completed(summary) = outcome else {
        panic!("run was not completed");
    };
    assert_eq!(summary.succeeded, 10);
    assert_eq!(summary.failed + summary.skipped + summary.cancelled, 0);
    assert_eq!(summary.unmapped_ids, 2);

    let files = dicom_files(output.path());
    assert_eq!(files.len(), 10);

    let study_dirs: HashSet<PathBuf> = files
        .iter()
        .map(|f| f.parent().and_then(Path::parent).expect("study dir").to_path_buf())
        .collect();
    assert_eq!(study_dirs.len(), 2);
    assert!(output.path().join(pseudonym("P1")).join("20240115").join("0001_t1_mprage").is_dir());
    assert!(output.path().join(pseudonym("P1")).join("20240115").join("0002_flair").is_dir());
    assert!(output.path().join(pseudonym("P2")).join("20240220").join("0001_t1_mprage").is_dir());

    for file in &files {
        let id = text(file, PATIENT_ID).expect("patient id");
        assert!(id == pseudonym("P1") || id == pseudonym("P2"));
        assert_eq!(text(file, PATIENT_NAME), Some(id));
    }

    let unmapped = fs::read_to_string(output.path().join(MISSING_IDS_FILE)).expect("unmapped list");
    assert_eq!(unmapped.lines().collect::<Vec<_>>(), vec!["P1", "P2"]);

    let json = fs::read_to_string(output.path().join(SUMMARY_FILE)).expect("summary");
    let written: RunSummary = serde_json::from_str(&json).expect("parse summary");
    assert_eq!(written.succeeded, 10);
}

#[test]
fn correlation_entry_sets_the_final_identifier() {
    let input = tempdir().expect("tempdir");
    let output = tempdir().expect("tempdir");
    Instance::new("OLD1", "1.2.300", "1.2.300.1", 0).write(&input.path().join("IM0"));

    let options = SortOptions {
        correlation: CorrelationTable::parse_delimited("OLD1,NEW1\n"),
        ..SortOptions::default()
    };
    sort(
        input.path(),
        output.path(),
        &AnonymizationPolicy::with_level(AnonymizationLevel::Basic),
        &options,
    );

    let files = dicom_files(output.path());
    assert_eq!(files.len(), 1);
    assert_eq!(text(&files[0], PATIENT_ID).as_deref(), Some("NEW1"));
    assert_eq!(text(&files[0], PATIENT_NAME).as_deref(), Some("NEW1"));
    assert!(files[0].starts_with(output.path().join("NEW1")));
    assert!(!output.path().join(MISSING_IDS_FILE).exists());
}

#[test]
fn cancellation_after_three_units_reports_cancelled() {
    let input = tempdir().expect("tempdir");
    let output = tempdir().expect("tempdir");
    for i in 0..10 {
        Instance::new("P1", "1.2.400", "1.2.400.1", i).write(&input.path().join(format!("IM{i}")));
    }

    let cancel = CancelToken::new();
    let mut calls = 0;
    let options = SortOptions {
        workers: Some(1),
        ..SortOptions::default()
    };
    let outcome = pipeline::run(
        input.path(),
        output.path(),
        &PathTemplate::default(),
        &AnonymizationPolicy::default(),
        &options,
        |_| {
            calls += 1;
            if calls == 3 {
                cancel.cancel();
            }
        },
        &cancel,
    )
    .expect("run");

    let RunOutcome::Cancelled(summary) = outcome else {
        panic!("run was not cancelled");
    };
    assert!(summary.succeeded <= 3);
    assert_eq!(summary.completed() + summary.cancelled, 10);
    assert!(summary.cancelled >= 7);
    assert!(!output.path().join(SUMMARY_FILE).exists());
}

#[test]
fn pre_cancelled_run_dispatches_nothing() {
    let input = tempdir().expect("tempdir");
    let output = tempdir().expect("tempdir");
    Instance::new("P1", "1.2.500", "1.2.500.1", 0).write(&input.path().join("IM0"));

    let cancel = CancelToken::new();
    cancel.cancel();
    let outcome = pipeline::run(
        input.path(),
        output.path(),
        &PathTemplate::default(),
        &AnonymizationPolicy::default(),
        &SortOptions::default(),
        |_| {},
        &cancel,
    )
    .expect("run");
    assert!(outcome.is_cancelled());
    assert_eq!(outcome.summary().cancelled, 1);
    assert!(dicom_files(output.path()).is_empty());
}

#[test]
fn missing_birth_date_is_written_without_fabricating_one() {
    let input = tempdir().expect("tempdir");
    let output = tempdir().expect("tempdir");
    Instance::new("P1", "1.2.600", "1.2.600.1", 0).write(&input.path().join("IM0"));

    let policy = AnonymizationPolicy {
        anonymize_birth_date: true,
        ..AnonymizationPolicy::with_level(AnonymizationLevel::Basic)
    };
    let outcome = sort(input.path(), output.path(), &policy, &SortOptions::default());
    assert_eq!(outcome.summary().succeeded, 1);

    let files = dicom_files(output.path());
    assert_eq!(files.len(), 1);
    assert_eq!(text(&files[0], BIRTH_DATE), None);
}

#[test]
fn strict_sort_keeps_uid_remapping_consistent_across_workers() {
    let input = tempdir().expect("tempdir");
    let output = tempdir().expect("tempdir");
    for i in 0..8 {
        let mut instance = Instance::new("P1", "1.2.700", "1.2.700.1", i);
        instance.extra = vec![
            (IRRADIATION_EVENT_UID, VR::UI, "1.2.700.999"),
            (BIRTH_DATE, VR::DA, "19800615"),
            (Tag(0x0008, 0x0080), VR::LO, "General Hospital"),
        ];
        instance.write(&input.path().join(format!("IM{i}")));
    }

    let options = SortOptions {
        workers: Some(4),
        ..SortOptions::default()
    };
    let outcome = sort(
        input.path(),
        output.path(),
        &AnonymizationPolicy::with_level(AnonymizationLevel::Strict),
        &options,
    );
    assert_eq!(outcome.summary().succeeded, 8);

    let files = dicom_files(output.path());
    assert_eq!(files.len(), 8);

    let events: HashSet<String> = files
        .iter()
        .map(|f| text(f, IRRADIATION_EVENT_UID).expect("event uid"))
        .collect();
    assert_eq!(events.len(), 1);
    assert!(!events.contains("1.2.700.999"));

    let instances: HashSet<String> = files
        .iter()
        .map(|f| text(f, SOP_INSTANCE_UID).expect("instance uid"))
        .collect();
    assert_eq!(instances.len(), 8);
    for file in &files {
        let uid = text(file, SOP_INSTANCE_UID).expect("instance uid");
        assert!(uid.starts_with("2.25."));
        assert_eq!(file.file_name().and_then(|n| n.to_str()), Some(format!("{uid}.dcm").as_str()));
        assert_eq!(text(file, SERIES_INSTANCE_UID).as_deref(), Some("1.2.700.1"));
        assert_eq!(text(file, BIRTH_DATE).as_deref(), Some("19800101"));
        assert_eq!(text(file, Tag(0x0008, 0x0080)).as_deref(), Some("ANONYMIZED"));
        assert_eq!(text(file, SLICE_THICKNESS).as_deref(), Some("1.0"));
    }
}

#[test]
fn skip_filters_and_non_dicom_files_are_counted_as_skipped() {
    let input = tempdir().expect("tempdir");
    let output = tempdir().expect("tempdir");

    Instance::new("P1", "1.2.800", "1.2.800.1", 0).write(&input.path().join("keep"));
    let mut derived = Instance::new("P1", "1.2.800", "1.2.800.2", 0);
    derived.image_type = "DERIVED\\SECONDARY\\MPR";
    derived.write(&input.path().join("derived"));
    let mut burned = Instance::new("P1", "1.2.800", "1.2.800.3", 0);
    burned.extra = vec![(Tag(0x0028, 0x0301), VR::CS, "YES")];
    burned.write(&input.path().join("burned"));
    fs::write(input.path().join("preview.png"), b"\x89PNG").expect("write png");
    fs::write(input.path().join("notes.txt"), b"not an image").expect("write txt");

    let options = SortOptions {
        skip_derived: true,
        skip_burned_in: true,
        ..SortOptions::default()
    };
    let outcome = sort(input.path(), output.path(), &AnonymizationPolicy::default(), &options);
    let summary = outcome.summary();
    assert_eq!(summary.total, 5);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.skipped, 4);
    assert_eq!(summary.failed, 0);

    let files = dicom_files(output.path());
    assert_eq!(files.len(), 1);
    // level none without a correlation table leaves identifiers alone
    assert_eq!(text(&files[0], PATIENT_ID).as_deref(), Some("P1"));
}

#[test]
fn decompress_on_native_objects_is_harmless() {
    let input = tempdir().expect("tempdir");
    let output = tempdir().expect("tempdir");
    Instance::new("P1", "1.2.900", "1.2.900.1", 0).write(&input.path().join("IM0"));

    let options = SortOptions {
        decompress: true,
        ..SortOptions::default()
    };
    let outcome = sort(input.path(), output.path(), &AnonymizationPolicy::default(), &options);
    assert_eq!(outcome.summary().succeeded, 1);
}

#[test]
fn decompress_turns_rle_pixels_into_native_explicit_little_endian() {
    let input = tempdir().expect("tempdir");
    let output = tempdir().expect("tempdir");
    Instance::new("P1", "1.2.910", "1.2.910.1", 0).write_rle(&input.path().join("IM0"));

    let options = SortOptions {
        decompress: true,
        ..SortOptions::default()
    };
    let outcome = sort(input.path(), output.path(), &AnonymizationPolicy::default(), &options);
    assert_eq!(outcome.summary().succeeded, 1);

    let files = dicom_files(output.path());
    assert_eq!(files.len(), 1);
    let obj = open_file(&files[0]).expect("open output");
    assert_eq!(
        obj.meta().transfer_syntax().trim_end_matches(['\0', ' ']),
        EXPLICIT_VR_LITTLE_ENDIAN.uid()
    );
    let pixels = obj.element(PIXEL_DATA).expect("pixel data");
    assert!(matches!(pixels.value(), Value::Primitive(_)));
    assert_eq!(pixels.to_bytes().expect("bytes").as_ref(), &[0_u8, 64, 128, 255]);
}

#[test]
fn one_unwritable_patient_folder_fails_only_that_patient() {
    let input = tempdir().expect("tempdir");
    let output = tempdir().expect("tempdir");
    Instance::new("P1", "1.2.920", "1.2.920.1", 0).write(&input.path().join("IM0"));
    Instance::new("P2", "1.2.930", "1.2.930.1", 0).write(&input.path().join("IM1"));
    // a regular file where P1's patient folder would be created
    fs::write(output.path().join("P1"), b"occupied").expect("write blocker");

    let outcome = sort(input.path(), output.path(), &AnonymizationPolicy::default(), &SortOptions::default());
    let RunOutcome::Completed(summary) = outcome else {
        panic!("run was not completed");
    };
    assert_eq!(summary.total, 2);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);

    let files = dicom_files(output.path());
    assert_eq!(files.len(), 1);
    assert!(files[0].starts_with(output.path().join("P2")));
    assert!(output.path().join(SUMMARY_FILE).exists());
}

#[test]
fn unwritable_output_root_fails_before_dispatch() {
    let input = tempdir().expect("tempdir");
    let blocker = tempdir().expect("tempdir");
    let file = blocker.path().join("occupied");
    fs::write(&file, b"x").expect("write");

    let result = pipeline::run(
        input.path(),
        &file.join("out"),
        &PathTemplate::default(),
        &AnonymizationPolicy::default(),
        &SortOptions::default(),
        |_| {},
        &CancelToken::new(),
    );
    assert!(matches!(result, Err(SetupError::OutputUncreatable { .. })));
}
