//! Fixtures shared by the unit tests.

use std::path::{Path, PathBuf};

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use dicom_dictionary_std::tags;

const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";

pub(crate) struct InstanceSpec {
    sop: String,
    series: String,
    instance_number: Option<i32>,
}

impl InstanceSpec {
    /// An empty `series` leaves Series Instance UID out of the file.
    pub(crate) fn new(sop: &str, series: &str) -> Self {
        Self {
            sop: sop.to_string(),
            series: series.to_string(),
            instance_number: None,
        }
    }

    pub(crate) fn instance_number(mut self, n: i32) -> Self {
        self.instance_number = Some(n);
        self
    }
}

/// Writes a minimal CT instance as `<dir>/<sop>.dcm`.
pub(crate) fn write_instance(dir: &Path, spec: &InstanceSpec) -> PathBuf {
    let path = dir.join(format!("{}.dcm", spec.sop));
    write_instance_to(&path, spec);
    path
}

pub(crate) fn write_instance_to(path: &Path, spec: &InstanceSpec) {
    let mut elements = vec![
        DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(CT_IMAGE_STORAGE),
        ),
        DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(spec.sop.as_str()),
        ),
        DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.9")),
        DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("CT")),
    ];
    if !spec.series.is_empty() {
        elements.push(DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(spec.series.as_str()),
        ));
    }
    if let Some(n) = spec.instance_number {
        elements.push(DataElement::new(
            tags::INSTANCE_NUMBER,
            VR::IS,
            PrimitiveValue::from(n.to_string()),
        ));
    }

    let object = InMemDicomObject::from_element_iter(elements)
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(CT_IMAGE_STORAGE)
                .media_storage_sop_instance_uid(spec.sop.as_str()),
        )
        .expect("file meta should build");
    object.write_to_file(path).expect("fixture should be written");
}

/// Full Part 10 bytes of an instance, as a remote peer would serve them.
pub(crate) fn instance_bytes(spec: &InstanceSpec) -> Vec<u8> {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_instance(dir.path(), spec);
    std::fs::read(path).expect("fixture should be readable")
}
