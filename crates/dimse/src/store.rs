//! Persistence of pushed objects
//!
//! File names are a pure function of the object's identifying fields, so the
//! same object always lands on the same path and a re-sent object replaces
//! the earlier copy.

use std::path::{Path, PathBuf};

use dicom_dictionary_std::tags;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DimseError, Result};
use crate::types::text;

const UNKNOWN: &str = "unknown";

/// An object received through C-STORE, decoded but not yet persisted
#[derive(Debug, Clone)]
pub struct PushedObject {
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    /// Transfer syntax the object arrived in
    pub transfer_syntax: String,
    pub dataset: InMemDicomObject,
}

impl PushedObject {
    /// Build from a dataset, reading the SOP identifiers from it
    pub fn from_dataset(dataset: InMemDicomObject, transfer_syntax: impl Into<String>) -> Result<Self> {
        let sop_instance_uid = text(&dataset, tags::SOP_INSTANCE_UID).ok_or_else(|| {
            DimseError::DicomParsing("pushed object has no SOP Instance UID".to_string())
        })?;
        let sop_class_uid = text(&dataset, tags::SOP_CLASS_UID).ok_or_else(|| {
            DimseError::DicomParsing("pushed object has no SOP Class UID".to_string())
        })?;
        Ok(Self {
            sop_class_uid,
            sop_instance_uid,
            transfer_syntax: transfer_syntax.into(),
            dataset,
        })
    }
}

/// One accepted push, written to disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub sop_instance_uid: String,
    pub patient_id: Option<String>,
    pub study_instance_uid: Option<String>,
    pub series_instance_uid: Option<String>,
    pub path: PathBuf,
}

/// A push that could not be stored; it was acknowledged with `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreFailure {
    pub sop_instance_uid: Option<String>,
    pub status: u16,
    pub reason: String,
}

/// Fields the naming policy is computed from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamingFields {
    pub patient_id: Option<String>,
    pub date: Option<String>,
    pub description: Option<String>,
    pub sop_instance_uid: String,
}

impl NamingFields {
    /// Series-level fields first, study-level as fallback
    pub fn from_dataset(dataset: &InMemDicomObject, sop_instance_uid: &str) -> Self {
        Self {
            patient_id: text(dataset, tags::PATIENT_ID),
            date: text(dataset, tags::SERIES_DATE).or_else(|| text(dataset, tags::STUDY_DATE)),
            description: text(dataset, tags::SERIES_DESCRIPTION)
                .or_else(|| text(dataset, tags::STUDY_DESCRIPTION)),
            sop_instance_uid: sop_instance_uid.to_string(),
        }
    }

    /// `sub-{patient}_ses-{date}_{description}_{sop instance}.dcm`
    pub fn file_name(&self) -> String {
        format!(
            "sub-{}_ses-{}_{}_{}.dcm",
            component(self.patient_id.as_deref()),
            component(self.date.as_deref()),
            component(self.description.as_deref()),
            component(Some(&self.sop_instance_uid)),
        )
    }
}

fn component(value: Option<&str>) -> String {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => sanitize(v),
        None => UNKNOWN.to_string(),
    }
}

/// Replace everything outside `[A-Za-z0-9._-]` with `_`
pub fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Persists pushed objects. Called from blocking receiver workers.
pub trait StoreHandler: Send + Sync {
    fn store(&self, object: PushedObject) -> Result<StoredObject>;
}

/// Writes each object as a Part 10 file under one root directory
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path an object with these fields is written to
    pub fn path_for(&self, fields: &NamingFields) -> PathBuf {
        self.root.join(fields.file_name())
    }
}

impl StoreHandler for FilesystemStore {
    fn store(&self, object: PushedObject) -> Result<StoredObject> {
        let uid = object.sop_instance_uid.clone();
        let write_failure = |reason: String| DimseError::StoreWriteFailure {
            sop_instance_uid: uid.clone(),
            reason,
        };

        let fields = NamingFields::from_dataset(&object.dataset, &object.sop_instance_uid);
        let path = self.path_for(&fields);
        let stored = StoredObject {
            sop_instance_uid: object.sop_instance_uid.clone(),
            patient_id: fields.patient_id.clone(),
            study_instance_uid: text(&object.dataset, tags::STUDY_INSTANCE_UID),
            series_instance_uid: text(&object.dataset, tags::SERIES_INSTANCE_UID),
            path: path.clone(),
        };

        std::fs::create_dir_all(&self.root)
            .map_err(|e| write_failure(format!("create {}: {}", self.root.display(), e)))?;

        let file = object
            .dataset
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(object.transfer_syntax.as_str())
                    .media_storage_sop_class_uid(object.sop_class_uid.as_str())
                    .media_storage_sop_instance_uid(object.sop_instance_uid.as_str()),
            )
            .map_err(|e| write_failure(format!("file meta: {}", e)))?;

        // Write beside the target, then rename over it.
        let temp = tempfile::Builder::new()
            .prefix(".incoming-")
            .suffix(".part")
            .tempfile_in(&self.root)
            .map_err(|e| write_failure(format!("temporary file: {}", e)))?;
        file.write_to_file(temp.path())
            .map_err(|e| write_failure(format!("write: {}", e)))?;
        temp.persist(&path)
            .map_err(|e| write_failure(format!("rename to {}: {}", path.display(), e.error)))?;

        debug!(sop_instance_uid = %stored.sop_instance_uid, path = %path.display(), "Stored object");
        Ok(stored)
    }
}
