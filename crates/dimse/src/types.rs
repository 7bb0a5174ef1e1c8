//! Query descriptors and the records that flow between search and retrieval

use std::collections::{BTreeMap, BTreeSet};

use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use serde::{Deserialize, Serialize};

use crate::error::DimseError;

/// DICOM query/retrieve levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryLevel {
    /// Patient level
    Patient,
    /// Study level
    Study,
    /// Series level
    Series,
    /// Image level
    Image,
}

/// Information model the find/move SOP classes belong to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryRoot {
    Patient,
    #[default]
    Study,
}

/// Priority levels for C-FIND / C-MOVE requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovePriority {
    /// Low priority
    Low,
    /// Medium priority (default)
    #[default]
    Medium,
    /// High priority
    High,
}

impl MovePriority {
    /// Wire value of the Priority command element
    pub fn code(self) -> u16 {
        match self {
            MovePriority::Medium => 0x0000,
            MovePriority::High => 0x0001,
            MovePriority::Low => 0x0002,
        }
    }
}

/// Attributes usable as matching or return keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QueryKey {
    #[serde(rename = "PatientID")]
    PatientId,
    PatientName,
    StudyDate,
    StudyTime,
    StudyDescription,
    #[serde(rename = "StudyInstanceUID")]
    StudyInstanceUid,
    #[serde(rename = "SeriesInstanceUID")]
    SeriesInstanceUid,
    SeriesDescription,
    SeriesDate,
    SeriesTime,
    SeriesNumber,
    Modality,
    ReferringPhysicianName,
    AccessionNumber,
    AdmittingDiagnosesDescription,
    #[serde(rename = "SOPInstanceUID")]
    SopInstanceUid,
}

impl QueryKey {
    /// Every supported key, in dictionary order
    pub const ALL: [QueryKey; 16] = [
        QueryKey::PatientId,
        QueryKey::PatientName,
        QueryKey::StudyDate,
        QueryKey::StudyTime,
        QueryKey::StudyDescription,
        QueryKey::StudyInstanceUid,
        QueryKey::SeriesInstanceUid,
        QueryKey::SeriesDescription,
        QueryKey::SeriesDate,
        QueryKey::SeriesTime,
        QueryKey::SeriesNumber,
        QueryKey::Modality,
        QueryKey::ReferringPhysicianName,
        QueryKey::AccessionNumber,
        QueryKey::AdmittingDiagnosesDescription,
        QueryKey::SopInstanceUid,
    ];

    fn entry(self) -> (&'static str, Tag, VR) {
        match self {
            QueryKey::PatientId => ("PatientID", tags::PATIENT_ID, VR::LO),
            QueryKey::PatientName => ("PatientName", tags::PATIENT_NAME, VR::PN),
            QueryKey::StudyDate => ("StudyDate", tags::STUDY_DATE, VR::DA),
            QueryKey::StudyTime => ("StudyTime", tags::STUDY_TIME, VR::TM),
            QueryKey::StudyDescription => ("StudyDescription", tags::STUDY_DESCRIPTION, VR::LO),
            QueryKey::StudyInstanceUid => ("StudyInstanceUID", tags::STUDY_INSTANCE_UID, VR::UI),
            QueryKey::SeriesInstanceUid => {
                ("SeriesInstanceUID", tags::SERIES_INSTANCE_UID, VR::UI)
            }
            QueryKey::SeriesDescription => {
                ("SeriesDescription", tags::SERIES_DESCRIPTION, VR::LO)
            }
            QueryKey::SeriesDate => ("SeriesDate", tags::SERIES_DATE, VR::DA),
            QueryKey::SeriesTime => ("SeriesTime", tags::SERIES_TIME, VR::TM),
            QueryKey::SeriesNumber => ("SeriesNumber", tags::SERIES_NUMBER, VR::IS),
            QueryKey::Modality => ("Modality", tags::MODALITY, VR::CS),
            QueryKey::ReferringPhysicianName => (
                "ReferringPhysicianName",
                tags::REFERRING_PHYSICIAN_NAME,
                VR::PN,
            ),
            QueryKey::AccessionNumber => ("AccessionNumber", tags::ACCESSION_NUMBER, VR::SH),
            QueryKey::AdmittingDiagnosesDescription => (
                "AdmittingDiagnosesDescription",
                tags::ADMITTING_DIAGNOSES_DESCRIPTION,
                VR::LO,
            ),
            QueryKey::SopInstanceUid => ("SOPInstanceUID", tags::SOP_INSTANCE_UID, VR::UI),
        }
    }

    /// DICOM keyword of the attribute
    pub fn keyword(self) -> &'static str {
        self.entry().0
    }

    /// Tag of the attribute
    pub fn tag(self) -> Tag {
        self.entry().1
    }

    /// Value representation of the attribute
    pub fn vr(self) -> VR {
        self.entry().2
    }
}

impl std::str::FromStr for QueryKey {
    type Err = DimseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueryKey::ALL
            .iter()
            .find(|key| key.keyword().eq_ignore_ascii_case(s.trim()))
            .copied()
            .ok_or_else(|| DimseError::config(format!("Unsupported query key: {}", s)))
    }
}

/// Query descriptor for C-FIND operations. Built fresh per search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindQuery {
    /// Query level (PATIENT, STUDY, SERIES, IMAGE)
    pub query_level: QueryLevel,

    /// Information model of the find SOP class
    #[serde(default)]
    pub root: QueryRoot,

    /// Matching keys and their values (wildcards allowed)
    pub matching: BTreeMap<QueryKey, String>,

    /// Keys requested back as empty placeholders
    pub return_keys: BTreeSet<QueryKey>,

    #[serde(default)]
    pub priority: MovePriority,
}

impl FindQuery {
    /// Create an empty query at the given level
    pub fn new(query_level: QueryLevel) -> Self {
        Self {
            query_level,
            root: QueryRoot::Study,
            matching: BTreeMap::new(),
            return_keys: BTreeSet::new(),
            priority: MovePriority::Medium,
        }
    }

    /// Study list query: patient id prefix and referring physician as matching
    /// keys, with date, time, description, accession and UID returned.
    pub fn study(patient_id_prefix: &str, referring_physician: &str) -> Self {
        let mut patient_id = patient_id_prefix.to_string();
        if !patient_id.ends_with('*') {
            patient_id.push('*');
        }
        Self::new(QueryLevel::Study)
            .with_match(QueryKey::PatientId, patient_id)
            .with_match(QueryKey::ReferringPhysicianName, referring_physician)
            .with_return_keys([
                QueryKey::StudyDate,
                QueryKey::StudyTime,
                QueryKey::StudyDescription,
                QueryKey::StudyInstanceUid,
                QueryKey::AdmittingDiagnosesDescription,
                QueryKey::AccessionNumber,
            ])
    }

    /// Series list query on a free-text series description (wildcards allowed)
    pub fn series(series_description: &str) -> Self {
        Self::new(QueryLevel::Series)
            .with_match(QueryKey::SeriesDescription, series_description)
            .with_return_keys([
                QueryKey::PatientId,
                QueryKey::SeriesDate,
                QueryKey::StudyInstanceUid,
                QueryKey::SeriesInstanceUid,
            ])
    }

    /// Add a matching key
    pub fn with_match(mut self, key: QueryKey, value: impl Into<String>) -> Self {
        self.return_keys.remove(&key);
        self.matching.insert(key, value.into());
        self
    }

    /// Request a key back as an empty placeholder
    pub fn with_return_key(mut self, key: QueryKey) -> Self {
        if !self.matching.contains_key(&key) {
            self.return_keys.insert(key);
        }
        self
    }

    /// Request several keys back
    pub fn with_return_keys(mut self, keys: impl IntoIterator<Item = QueryKey>) -> Self {
        for key in keys {
            self = self.with_return_key(key);
        }
        self
    }

    /// Select the information model
    pub fn with_root(mut self, root: QueryRoot) -> Self {
        self.root = root;
        self
    }

    /// Build the identifier dataset sent with the C-FIND-RQ
    pub fn to_identifier(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from(self.query_level.to_string()),
        ));
        for key in &self.return_keys {
            obj.put(DataElement::new(key.tag(), key.vr(), PrimitiveValue::Empty));
        }
        for (key, value) in &self.matching {
            obj.put(DataElement::new(
                key.tag(),
                key.vr(),
                PrimitiveValue::from(value.as_str()),
            ));
        }
        obj
    }
}

/// Query parameters for C-MOVE operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveQuery {
    /// Query level (PATIENT, STUDY, SERIES, IMAGE)
    pub query_level: QueryLevel,

    #[serde(default)]
    pub root: QueryRoot,

    /// Identifying keys of the objects to move
    pub identifiers: BTreeMap<QueryKey, String>,

    /// Destination AE Title for the move operation
    pub destination_aet: String,

    /// Priority of the move operation
    pub priority: MovePriority,
}

impl MoveQuery {
    /// Create a new move query
    pub fn new(query_level: QueryLevel, destination_aet: impl Into<String>) -> Self {
        Self {
            query_level,
            root: QueryRoot::Study,
            identifiers: BTreeMap::new(),
            destination_aet: destination_aet.into(),
            priority: MovePriority::Medium,
        }
    }

    /// Retrieval descriptor for one target
    pub fn for_target(target: &RetrievalTarget, destination_aet: impl Into<String>) -> Self {
        let mut query = Self::new(target.level, destination_aet);
        if let Some(patient_id) = &target.patient_id {
            query = query.with_identifier(QueryKey::PatientId, patient_id.clone());
        }
        if let Some(study) = &target.study_instance_uid {
            query = query.with_identifier(QueryKey::StudyInstanceUid, study.clone());
        }
        if let Some(series) = &target.series_instance_uid {
            query = query.with_identifier(QueryKey::SeriesInstanceUid, series.clone());
        }
        query
    }

    /// Add an identifying key
    pub fn with_identifier(mut self, key: QueryKey, value: impl Into<String>) -> Self {
        self.identifiers.insert(key, value.into());
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: MovePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Select the information model
    pub fn with_root(mut self, root: QueryRoot) -> Self {
        self.root = root;
        self
    }

    /// Build the identifier dataset sent with the C-MOVE-RQ
    pub fn to_identifier(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from(self.query_level.to_string()),
        ));
        for (key, value) in &self.identifiers {
            obj.put(DataElement::new(
                key.tag(),
                key.vr(),
                PrimitiveValue::from(value.as_str()),
            ));
        }
        obj
    }
}

/// One row returned by a search.
///
/// Equality is by identifying UID: descriptive fields may differ between two
/// runs of the same query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRecord {
    pub level: QueryLevel,
    pub patient_id: String,
    pub patient_name: Option<String>,
    pub study_instance_uid: Option<String>,
    pub series_instance_uid: Option<String>,
    /// Series description at SERIES/IMAGE level, study description otherwise
    pub description: Option<String>,
    pub date: Option<String>,
    pub time: Option<String>,
    pub referring_physician: Option<String>,
    pub accession_number: Option<String>,
    /// Status of the reply that carried the record
    pub status: u16,
}

impl MatchRecord {
    /// Map a C-FIND reply identifier into a record
    pub fn from_identifier(level: QueryLevel, identifier: &InMemDicomObject, status: u16) -> Self {
        let (description, date, time) = match level {
            QueryLevel::Series | QueryLevel::Image => (
                text(identifier, tags::SERIES_DESCRIPTION),
                text(identifier, tags::SERIES_DATE).or_else(|| text(identifier, tags::STUDY_DATE)),
                text(identifier, tags::SERIES_TIME).or_else(|| text(identifier, tags::STUDY_TIME)),
            ),
            _ => (
                text(identifier, tags::STUDY_DESCRIPTION),
                text(identifier, tags::STUDY_DATE),
                text(identifier, tags::STUDY_TIME),
            ),
        };

        Self {
            level,
            patient_id: text(identifier, tags::PATIENT_ID).unwrap_or_default(),
            patient_name: text(identifier, tags::PATIENT_NAME),
            study_instance_uid: text(identifier, tags::STUDY_INSTANCE_UID),
            series_instance_uid: text(identifier, tags::SERIES_INSTANCE_UID),
            description,
            date,
            time,
            referring_physician: text(identifier, tags::REFERRING_PHYSICIAN_NAME),
            accession_number: text(identifier, tags::ACCESSION_NUMBER),
            status,
        }
    }

    /// Identity used for equality: the most specific UID available
    pub fn identity(&self) -> String {
        match (&self.series_instance_uid, &self.study_instance_uid) {
            (Some(series), _) => format!("series:{}", series),
            (None, Some(study)) => format!("study:{}", study),
            (None, None) => format!("patient:{}", self.patient_id),
        }
    }

    /// Whether any identifying field is in the given set
    pub fn matches_any(&self, identifiers: &std::collections::HashSet<String>) -> bool {
        identifiers.contains(&self.patient_id)
            || self
                .study_instance_uid
                .as_ref()
                .is_some_and(|uid| identifiers.contains(uid))
            || self
                .series_instance_uid
                .as_ref()
                .is_some_and(|uid| identifiers.contains(uid))
    }
}

impl PartialEq for MatchRecord {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for MatchRecord {}

impl std::hash::Hash for MatchRecord {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

/// A C-FIND reply the peer could not process. Kept so the ledger can list it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedReply {
    pub status: u16,
    /// Patient or study identifier carried by the reply, when present
    pub identifier: Option<String>,
    pub reason: String,
}

/// What to move: built from a match record, read-only afterwards
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalTarget {
    pub level: QueryLevel,
    pub patient_id: Option<String>,
    pub study_instance_uid: Option<String>,
    pub series_instance_uid: Option<String>,
    /// Human readable label for logs and reports
    pub label: String,
}

impl RetrievalTarget {
    /// Most specific UID of the target, falling back to the patient id
    pub fn key(&self) -> &str {
        self.series_instance_uid
            .as_deref()
            .or(self.study_instance_uid.as_deref())
            .or(self.patient_id.as_deref())
            .unwrap_or("")
    }
}

impl TryFrom<&MatchRecord> for RetrievalTarget {
    type Error = DimseError;

    fn try_from(record: &MatchRecord) -> Result<Self, Self::Error> {
        let level = match record.level {
            QueryLevel::Image => QueryLevel::Series,
            level => level,
        };
        let patient_id = Some(record.patient_id.clone()).filter(|id| !id.is_empty());

        let missing = |what: &str| {
            DimseError::config(format!(
                "{} match for '{}' carries no {}",
                level, record.patient_id, what
            ))
        };
        match level {
            QueryLevel::Patient if patient_id.is_none() => return Err(missing("PatientID")),
            QueryLevel::Study if record.study_instance_uid.is_none() => {
                return Err(missing("StudyInstanceUID"))
            }
            QueryLevel::Series
                if record.study_instance_uid.is_none() || record.series_instance_uid.is_none() =>
            {
                return Err(missing("StudyInstanceUID/SeriesInstanceUID"))
            }
            _ => {}
        }

        let label = match &record.description {
            Some(description) => format!("{} : {}", record.patient_id, description),
            None => record.patient_id.clone(),
        };

        Ok(Self {
            level,
            patient_id,
            study_instance_uid: record.study_instance_uid.clone(),
            series_instance_uid: if level == QueryLevel::Series {
                record.series_instance_uid.clone()
            } else {
                None
            },
            label,
        })
    }
}

/// Read a string attribute, trimmed of DICOM padding; empty values become None
pub fn text(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches(['\0', ' ']).trim().to_string())
        .filter(|s| !s.is_empty())
}

impl std::fmt::Display for QueryLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryLevel::Patient => write!(f, "PATIENT"),
            QueryLevel::Study => write!(f, "STUDY"),
            QueryLevel::Series => write!(f, "SERIES"),
            QueryLevel::Image => write!(f, "IMAGE"),
        }
    }
}

impl std::str::FromStr for QueryLevel {
    type Err = DimseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PATIENT" => Ok(QueryLevel::Patient),
            "STUDY" => Ok(QueryLevel::Study),
            "SERIES" => Ok(QueryLevel::Series),
            "IMAGE" => Ok(QueryLevel::Image),
            _ => Err(DimseError::config(format!("Invalid query level: {}", s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identifier(pairs: &[(Tag, VR, &str)]) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        for (tag, vr, value) in pairs {
            obj.put(DataElement::new(*tag, *vr, PrimitiveValue::from(*value)));
        }
        obj
    }

    #[test]
    fn test_study_query_builder() {
        let query = FindQuery::study("QC", "LAB^GROUP");

        assert_eq!(query.query_level, QueryLevel::Study);
        assert_eq!(query.matching.get(&QueryKey::PatientId), Some(&"QC*".to_string()));
        assert!(query.return_keys.contains(&QueryKey::StudyInstanceUid));
        assert!(!query.return_keys.contains(&QueryKey::PatientId));

        let obj = query.to_identifier();
        assert_eq!(text(&obj, tags::QUERY_RETRIEVE_LEVEL).as_deref(), Some("STUDY"));
        assert_eq!(text(&obj, tags::PATIENT_ID).as_deref(), Some("QC*"));
        assert!(obj.element(tags::STUDY_INSTANCE_UID).is_ok());
        assert_eq!(text(&obj, tags::STUDY_INSTANCE_UID), None);
    }

    #[test]
    fn test_matching_key_replaces_return_key() {
        let query = FindQuery::series("*Physiolog").with_match(QueryKey::PatientId, "S01");
        assert!(!query.return_keys.contains(&QueryKey::PatientId));
        assert_eq!(query.matching.len(), 2);
    }

    #[test]
    fn test_query_level_parsing() {
        assert_eq!("PATIENT".parse::<QueryLevel>().unwrap(), QueryLevel::Patient);
        assert_eq!("study".parse::<QueryLevel>().unwrap(), QueryLevel::Study);
        assert!("INVALID".parse::<QueryLevel>().is_err());
    }

    #[test]
    fn test_query_key_parsing() {
        assert_eq!("PatientID".parse::<QueryKey>().unwrap(), QueryKey::PatientId);
        assert_eq!(
            "seriesinstanceuid".parse::<QueryKey>().unwrap(),
            QueryKey::SeriesInstanceUid
        );
        assert!("PixelData".parse::<QueryKey>().is_err());
        assert_eq!(QueryKey::AccessionNumber.tag(), tags::ACCESSION_NUMBER);
    }

    #[test]
    fn test_match_record_equality_by_uid() {
        let a = MatchRecord::from_identifier(
            QueryLevel::Study,
            &identifier(&[
                (tags::PATIENT_ID, VR::LO, "QC001"),
                (tags::STUDY_INSTANCE_UID, VR::UI, "1.2.3"),
                (tags::STUDY_DESCRIPTION, VR::LO, "Brain"),
            ]),
            0xFF00,
        );
        let b = MatchRecord::from_identifier(
            QueryLevel::Study,
            &identifier(&[
                (tags::PATIENT_ID, VR::LO, "QC001"),
                (tags::STUDY_INSTANCE_UID, VR::UI, "1.2.3"),
                (tags::STUDY_DESCRIPTION, VR::LO, "Brain (edited)"),
            ]),
            0xFF00,
        );
        assert_eq!(a, b);
        assert_eq!(a.description.as_deref(), Some("Brain"));
    }

    #[test]
    fn test_retrieval_target_from_series_record() {
        let record = MatchRecord::from_identifier(
            QueryLevel::Series,
            &identifier(&[
                (tags::PATIENT_ID, VR::LO, "S01"),
                (tags::STUDY_INSTANCE_UID, VR::UI, "1.2.3"),
                (tags::SERIES_INSTANCE_UID, VR::UI, "1.2.3.4"),
                (tags::SERIES_DESCRIPTION, VR::LO, "fMRI_Physiolog"),
            ]),
            0xFF00,
        );
        let target = RetrievalTarget::try_from(&record).unwrap();
        assert_eq!(target.level, QueryLevel::Series);
        assert_eq!(target.key(), "1.2.3.4");
        assert_eq!(target.label, "S01 : fMRI_Physiolog");

        let query = MoveQuery::for_target(&target, "QRPULL");
        let obj = query.to_identifier();
        assert_eq!(text(&obj, tags::QUERY_RETRIEVE_LEVEL).as_deref(), Some("SERIES"));
        assert_eq!(text(&obj, tags::SERIES_INSTANCE_UID).as_deref(), Some("1.2.3.4"));
        assert_eq!(query.destination_aet, "QRPULL");
    }

    #[test]
    fn test_retrieval_target_requires_uids() {
        let record = MatchRecord::from_identifier(
            QueryLevel::Series,
            &identifier(&[(tags::PATIENT_ID, VR::LO, "S01")]),
            0xFF00,
        );
        assert!(RetrievalTarget::try_from(&record).is_err());
    }
}
