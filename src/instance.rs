use std::path::{Path, PathBuf};

use dicom::object::{DefaultDicomObject, open_file};
use dicom_dictionary_std::tags;

use crate::error::UnitError;

/// One imported DICOM instance; the unit a loader inserts into a model.
///
/// Identity is the SOP Instance UID.
#[derive(Debug, Clone, PartialEq)]
pub struct DicomInstance {
    pub sop_instance_uid: String,
    pub series_instance_uid: String,
    pub study_instance_uid: Option<String>,
    pub sop_class_uid: Option<String>,
    pub modality: Option<String>,
    pub instance_number: Option<i32>,
    /// z component of Image Position (Patient)
    pub image_position_z: Option<f32>,
    pub table_position: Option<f32>,
    pub path: Option<PathBuf>,
}

impl DicomInstance {
    /// Reads `path` and extracts the identifying attributes.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, UnitError> {
        let path = path.as_ref();
        let object = open_file(path)?;
        Self::from_object(&object, Some(path.to_path_buf()))
    }

    pub fn from_object(
        object: &DefaultDicomObject,
        path: Option<PathBuf>,
    ) -> Result<Self, UnitError> {
        let sop_instance_uid = string_attr(object, tags::SOP_INSTANCE_UID)
            .ok_or(UnitError::MissingAttribute("SOPInstanceUID"))?;
        let series_instance_uid = string_attr(object, tags::SERIES_INSTANCE_UID)
            .ok_or(UnitError::MissingAttribute("SeriesInstanceUID"))?;

        Ok(Self {
            sop_instance_uid,
            series_instance_uid,
            study_instance_uid: string_attr(object, tags::STUDY_INSTANCE_UID),
            sop_class_uid: string_attr(object, tags::SOP_CLASS_UID),
            modality: string_attr(object, tags::MODALITY),
            instance_number: object
                .element(tags::INSTANCE_NUMBER)
                .ok()
                .and_then(|e| e.to_int::<i32>().ok()),
            image_position_z: object
                .element(tags::IMAGE_POSITION_PATIENT)
                .ok()
                .and_then(|e| e.to_multi_float32().ok())
                .and_then(|pos| pos.get(2).copied()),
            table_position: object
                .element(tags::TABLE_POSITION)
                .ok()
                .and_then(|e| e.to_float32().ok()),
            path,
        })
    }
}

fn string_attr(object: &DefaultDicomObject, tag: dicom::core::Tag) -> Option<String> {
    let value = object.element(tag).ok()?.to_str().ok()?;
    let trimmed = value.trim_end_matches(['\0', ' ']).trim_start();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InstanceSpec, write_instance};

    #[test]
    fn reads_identity_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_instance(
            dir.path(),
            &InstanceSpec::new("1.2.3.1", "1.2.3").instance_number(7),
        );

        let instance = DicomInstance::open(&path).expect("instance should parse");
        assert_eq!(instance.sop_instance_uid, "1.2.3.1");
        assert_eq!(instance.series_instance_uid, "1.2.3");
        assert_eq!(instance.instance_number, Some(7));
        assert_eq!(instance.modality.as_deref(), Some("CT"));
        assert_eq!(instance.path.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn missing_series_uid_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_instance(dir.path(), &InstanceSpec::new("1.2.3.9", ""));

        let err = DicomInstance::open(&path).expect_err("series uid is required");
        assert!(matches!(err, UnitError::MissingAttribute("SeriesInstanceUID")));
    }

    #[test]
    fn garbage_file_is_a_dicom_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.dcm");
        std::fs::write(&path, b"not a dicom file").expect("write");

        let err = DicomInstance::open(&path).expect_err("garbage must not parse");
        assert_eq!(err.as_label(), "unit_dicom");
    }
}
