//
// store.rs
// Dicom-Sort-rs
//
// In-memory attribute store for one imaging object: typed access, snapshots, compression flag and persistence.
//

use std::path::Path;

use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::StandardDataDictionary;
use dicom::object::{open_file, DefaultDicomObject, FileDicomObject, FileMetaTableBuilder, InMemDicomObject};
use dicom_core::value::Value;
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemElement;

use crate::dicom_access::ElementAccess;
use crate::error::StoreError;

/// The top-level dataset of an object, without file meta information.
pub type Dataset = InMemDicomObject<StandardDataDictionary>;

/// Secondary Capture, used when an object carries no SOP class at all.
const FALLBACK_SOP_CLASS_UID: &str = "1.2.840.10008.5.1.4.1.1.7";

pub struct AttributeStore {
    obj: DefaultDicomObject,
    target_ts: Option<String>,
}

impl AttributeStore {
    /// Open a file as an imaging object. Anything that does not parse is reported as [`StoreError::NotDicom`].
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let obj = open_file(path).map_err(|e| StoreError::NotDicom(e.to_string()))?;
        Ok(Self::from_object(obj))
    }

    pub fn from_object(obj: DefaultDicomObject) -> Self {
        Self { obj, target_ts: None }
    }

    pub fn object(&self) -> &DefaultDicomObject {
        &self.obj
    }

    /// Mutable access to the dataset; file meta information is regenerated on save.
    pub fn dataset_mut(&mut self) -> &mut Dataset {
        &mut self.obj
    }

    /// Transfer syntax the object will be written with.
    pub fn transfer_syntax_uid(&self) -> String {
        match &self.target_ts {
            Some(ts) => ts.clone(),
            None => self
                .obj
                .meta()
                .transfer_syntax()
                .trim_end_matches(['\0', ' '])
                .to_string(),
        }
    }

    /// Encode the object under another transfer syntax on save. The caller is responsible for the pixel data
    /// matching it.
    pub fn set_transfer_syntax(&mut self, uid: &str) {
        self.target_ts = Some(uid.to_string());
    }

    /// True when the pixel data is stored encapsulated (i.e. compressed).
    pub fn is_compressed(&self) -> bool {
        matches!(
            self.obj.element(tags::PIXEL_DATA).map(|e| e.value()),
            Ok(Value::PixelSequence(_))
        )
    }

    pub fn put_str(&mut self, tag: Tag, vr: VR, value: &str) {
        self.obj
            .put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
    }

    /// Write the object, regenerating file meta information so that it matches the (possibly remapped) dataset.
    pub fn save(self, path: &Path) -> Result<(), StoreError> {
        let ts = self.transfer_syntax_uid();
        let meta_instance_uid = self
            .obj
            .meta()
            .media_storage_sop_instance_uid()
            .trim_end_matches(['\0', ' '])
            .to_string();
        let file_obj = wrap_with_instance_uid(self.obj.into_inner(), &ts, Some(meta_instance_uid))?;
        file_obj.write_to_file(path).map_err(|e| StoreError::Write {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

impl ElementAccess for AttributeStore {
    fn element_str(&self, tag: Tag) -> Option<String> {
        self.obj.element_str(tag)
    }

    fn has_element(&self, tag: Tag) -> bool {
        self.obj.has_element(tag)
    }
}

/// Deep copies of the given tags present in `dataset`.
pub fn snapshot(dataset: &Dataset, wanted: impl IntoIterator<Item = Tag>) -> Vec<InMemElement> {
    wanted
        .into_iter()
        .filter_map(|tag| dataset.element(tag).ok().cloned())
        .collect()
}

/// Put snapshotted elements back verbatim, overwriting whatever is there now.
pub fn restore(dataset: &mut Dataset, saved: Vec<InMemElement>) {
    for elem in saved {
        dataset.put(elem);
    }
}

/// Attach freshly built file meta information to a bare dataset.
pub fn wrap_dataset(dataset: Dataset, transfer_syntax: &str) -> Result<DefaultDicomObject, StoreError> {
    wrap_with_instance_uid(dataset, transfer_syntax, None)
}

/// Like [`wrap_dataset`], falling back to `fallback_instance_uid` when the dataset has no SOP Instance UID.
fn wrap_with_instance_uid(
    dataset: Dataset,
    transfer_syntax: &str,
    fallback_instance_uid: Option<String>,
) -> Result<DefaultDicomObject, StoreError> {
    let sop_class_uid = dataset
        .element_str(tags::SOP_CLASS_UID)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| FALLBACK_SOP_CLASS_UID.to_string());
    let sop_instance_uid = dataset
        .element_str(tags::SOP_INSTANCE_UID)
        .filter(|s| !s.is_empty())
        .or(fallback_instance_uid.filter(|s| !s.is_empty()))
        .ok_or_else(|| StoreError::Meta("missing SOP Instance UID".to_string()))?;

    let file_meta = FileMetaTableBuilder::new()
        .transfer_syntax(transfer_syntax)
        .media_storage_sop_class_uid(sop_class_uid.as_str())
        .media_storage_sop_instance_uid(sop_instance_uid.as_str())
        .build()
        .map_err(|e| StoreError::Meta(e.to_string()))?;

    let mut file_obj = FileDicomObject::new_empty_with_dict_and_meta(StandardDataDictionary, file_meta);
    for elem in dataset {
        file_obj.put(elem);
    }
    Ok(file_obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom::transfer_syntax::entries::{EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN};

    fn dataset() -> Dataset {
        let mut obj = InMemDicomObject::new_empty_with_dict(StandardDataDictionary);
        obj.put(DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.3.4")));
        obj.put(DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from("P1")));
        obj.put(DataElement::new(tags::PIXEL_DATA, VR::OB, PrimitiveValue::from(vec![1_u8, 2, 3, 4])));
        obj
    }

    #[test]
    fn snapshot_and_restore_roundtrip_values() {
        let mut ds = dataset();
        let saved = snapshot(&ds, [tags::PATIENT_ID, tags::PATIENT_NAME]);
        assert_eq!(saved.len(), 1);

        ds.put(DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from("CHANGED")));
        restore(&mut ds, saved);
        assert_eq!(ds.element_str(tags::PATIENT_ID).as_deref(), Some("P1"));
    }

    #[test]
    fn native_pixel_data_is_not_compressed() {
        let obj = wrap_dataset(dataset(), EXPLICIT_VR_LITTLE_ENDIAN.uid()).expect("wrap");
        let store = AttributeStore::from_object(obj);
        assert!(!store.is_compressed());
        assert_eq!(store.transfer_syntax_uid(), EXPLICIT_VR_LITTLE_ENDIAN.uid());
    }

    #[test]
    fn wrapping_requires_instance_uid() {
        let mut ds = dataset();
        ds.remove_element(tags::SOP_INSTANCE_UID);
        assert!(wrap_dataset(ds, EXPLICIT_VR_LITTLE_ENDIAN.uid()).is_err());
    }

    #[test]
    fn save_regenerates_meta_for_new_transfer_syntax() {
        let dir = tempfile::tempdir().expect("tempdir");
        let obj = wrap_dataset(dataset(), EXPLICIT_VR_LITTLE_ENDIAN.uid()).expect("wrap");
        let mut store = AttributeStore::from_object(obj);
        store.put_str(tags::SOP_INSTANCE_UID, VR::UI, "2.25.42");
        store.set_transfer_syntax(IMPLICIT_VR_LITTLE_ENDIAN.uid());

        let path = dir.path().join("out.dcm");
        store.save(&path).expect("save");

        let reopened = AttributeStore::open(&path).expect("reopen");
        assert_eq!(reopened.transfer_syntax_uid(), IMPLICIT_VR_LITTLE_ENDIAN.uid());
        assert_eq!(
            reopened.object().meta().media_storage_sop_instance_uid().trim_end_matches('\0'),
            "2.25.42"
        );
        assert_eq!(reopened.element_str(tags::PATIENT_ID).as_deref(), Some("P1"));
    }

    #[test]
    fn open_rejects_non_dicom_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"hello").expect("write");
        assert!(matches!(AttributeStore::open(&path), Err(StoreError::NotDicom(_))));
    }
}
