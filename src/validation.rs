//! Record validation against an explicit field schema.
//!
//! Write-side checks are strict and deterministic; read-side checks only
//! make sure a decrypted value is a record at all, so older schema versions
//! still load.

use std::fmt;

use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::models::PatientRecord;

pub const MAX_ID_LENGTH: usize = 128;
pub const MAX_NAME_LENGTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    /// Free text or a list of entries (symptom checklists arrive either way).
    StringOrArray,
    /// RFC 3339 timestamp or `YYYY-MM-DD` date string.
    Date,
}

impl FieldKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::StringOrArray => value.is_string() || value.is_array(),
            Self::Date => value.as_str().is_some_and(is_date_like),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::StringOrArray => "string or array",
            Self::Date => "date",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub name: &'static str,
    pub kind: FieldKind,
}

/// Known `patientInfo` fields. All optional; unknown fields pass unchecked.
pub const PATIENT_INFO_RULES: &[FieldRule] = &[
    FieldRule { name: "age", kind: FieldKind::Integer },
    FieldRule { name: "gender", kind: FieldKind::String },
    FieldRule { name: "dateOfBirth", kind: FieldKind::Date },
    FieldRule { name: "symptoms", kind: FieldKind::StringOrArray },
    FieldRule { name: "allergies", kind: FieldKind::StringOrArray },
    FieldRule { name: "medications", kind: FieldKind::StringOrArray },
    FieldRule { name: "phone", kind: FieldKind::String },
    FieldRule { name: "email", kind: FieldKind::String },
    FieldRule { name: "address", kind: FieldKind::String },
    FieldRule { name: "emergencyContact", kind: FieldKind::Object },
    FieldRule { name: "consent", kind: FieldKind::Boolean },
    FieldRule { name: "weight", kind: FieldKind::Number },
    FieldRule { name: "height", kind: FieldKind::Number },
    FieldRule { name: "notes", kind: FieldKind::String },
];

/// Known optional top-level fields outside the typed core.
pub const RECORD_RULES: &[FieldRule] = &[
    FieldRule { name: "status", kind: FieldKind::String },
    FieldRule { name: "language", kind: FieldKind::String },
    FieldRule { name: "tags", kind: FieldKind::Array },
    FieldRule { name: "visitDate", kind: FieldKind::Date },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Problem {
    Missing,
    Empty,
    TooLong(usize),
    InvalidCharacters,
    WrongKind(&'static str),
    /// Record id differs from the id it is being saved under.
    Mismatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIssue {
    pub field: String,
    pub problem: Problem,
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.problem {
            Problem::Missing => write!(f, "{} is required", self.field),
            Problem::Empty => write!(f, "{} must not be empty", self.field),
            Problem::TooLong(max) => write!(f, "{} exceeds {max} characters", self.field),
            Problem::InvalidCharacters => write!(f, "{} contains invalid characters", self.field),
            Problem::WrongKind(expected) => write!(f, "{} must be a {expected}", self.field),
            Problem::Mismatch => write!(f, "{} does not match the id being saved", self.field),
        }
    }
}

/// All problems found in one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub issues: Vec<FieldIssue>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .issues
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        f.write_str(&joined)
    }
}

impl std::error::Error for ValidationError {}

impl ValidationError {
    pub fn has_issue(&self, field: &str) -> bool {
        self.issues.iter().any(|i| i.field == field)
    }
}

/// Record ids: 1-128 chars of `[A-Za-z0-9_.:-]`.
pub fn is_valid_record_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LENGTH
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
}

fn is_date_like(s: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(s).is_ok()
        || chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

fn check_rules(
    fields: &Map<String, Value>,
    rules: &[FieldRule],
    path: &str,
    issues: &mut Vec<FieldIssue>,
) {
    for rule in rules {
        match fields.get(rule.name) {
            None | Some(Value::Null) => {}
            Some(value) if !rule.kind.matches(value) => issues.push(FieldIssue {
                field: format!("{path}{}", rule.name),
                problem: Problem::WrongKind(rule.kind.label()),
            }),
            Some(_) => {}
        }
    }
}

/// Strict check before a record is encrypted and persisted.
pub fn validate_for_write(record: &PatientRecord) -> Result<(), ValidationError> {
    let mut issues = Vec::new();

    if record.id.is_empty() {
        issues.push(FieldIssue { field: "id".into(), problem: Problem::Empty });
    } else if record.id.len() > MAX_ID_LENGTH {
        issues.push(FieldIssue { field: "id".into(), problem: Problem::TooLong(MAX_ID_LENGTH) });
    } else if !is_valid_record_id(&record.id) {
        issues.push(FieldIssue { field: "id".into(), problem: Problem::InvalidCharacters });
    }

    let name = record.name.trim();
    if name.is_empty() {
        issues.push(FieldIssue { field: "name".into(), problem: Problem::Empty });
    } else if name.chars().count() > MAX_NAME_LENGTH {
        issues.push(FieldIssue { field: "name".into(), problem: Problem::TooLong(MAX_NAME_LENGTH) });
    }

    if record.created_at.is_none() {
        issues.push(FieldIssue { field: "createdAt".into(), problem: Problem::Missing });
    }

    check_rules(&record.patient_info, PATIENT_INFO_RULES, "patientInfo.", &mut issues);
    check_rules(&record.extra, RECORD_RULES, "", &mut issues);

    if issues.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { issues })
    }
}

/// Loose check on a decrypted value read back for `id`.
///
/// Missing metadata is tolerated with a warning; anything that is not a
/// record-shaped object for this id is reported as corruption.
pub fn validate_for_read(value: Value, id: &str) -> Result<PatientRecord, StoreError> {
    let object = value
        .as_object()
        .ok_or_else(|| StoreError::corrupted(id, "stored value is not an object"))?;

    match object.get("id").and_then(Value::as_str) {
        Some(stored_id) if stored_id == id => {}
        Some(_) => return Err(StoreError::corrupted(id, "stored id does not match key")),
        None => return Err(StoreError::corrupted(id, "stored value has no id")),
    }

    if !object.contains_key("metadata") {
        tracing::warn!(record_id = %id, "Record has no metadata, treating as legacy schema");
    }

    serde_json::from_value(value).map_err(|e| StoreError::corrupted(id, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_record() -> PatientRecord {
        PatientRecord::new("abc123", "Jane Doe")
            .with_info("age", 34)
            .with_info("symptoms", json!(["cough", "fever"]))
    }

    #[test]
    fn accepts_valid_record() {
        assert!(validate_for_write(&valid_record()).is_ok());
    }

    #[test]
    fn id_charset() {
        assert!(is_valid_record_id("abc123"));
        assert!(is_valid_record_id("intake-2024.01:07_a"));
        assert!(!is_valid_record_id(""));
        assert!(!is_valid_record_id("has space"));
        assert!(!is_valid_record_id("slash/id"));
        assert!(!is_valid_record_id(&"a".repeat(MAX_ID_LENGTH + 1)));
    }

    #[test]
    fn collects_every_issue() {
        let mut record = valid_record();
        record.id = "bad id".into();
        record.name = "   ".into();
        record.created_at = None;
        let err = validate_for_write(&record).unwrap_err();
        assert_eq!(err.issues.len(), 3);
        assert!(err.has_issue("id"));
        assert!(err.has_issue("name"));
        assert!(err.has_issue("createdAt"));
    }

    #[test]
    fn optional_fields_must_have_expected_kind() {
        let record = valid_record()
            .with_info("age", "thirty")
            .with_info("consent", "yes");
        let err = validate_for_write(&record).unwrap_err();
        assert!(err.has_issue("patientInfo.age"));
        assert!(err.has_issue("patientInfo.consent"));
        assert!(err.to_string().contains("patientInfo.age must be a integer"));
    }

    #[test]
    fn null_and_unknown_fields_pass() {
        let record = valid_record()
            .with_info("gender", Value::Null)
            .with_info("favouriteColour", 7);
        assert!(validate_for_write(&record).is_ok());
    }

    #[test]
    fn date_fields_accept_dates_and_timestamps() {
        let ok = valid_record().with_info("dateOfBirth", "1990-05-17");
        assert!(validate_for_write(&ok).is_ok());
        let also_ok = valid_record().with_info("dateOfBirth", "1990-05-17T00:00:00Z");
        assert!(validate_for_write(&also_ok).is_ok());
        let bad = valid_record().with_info("dateOfBirth", "last spring");
        assert!(validate_for_write(&bad).is_err());
    }

    #[test]
    fn top_level_extras_are_checked() {
        let mut record = valid_record();
        record.extra.insert("tags".into(), json!("urgent"));
        let err = validate_for_write(&record).unwrap_err();
        assert!(err.has_issue("tags"));
    }

    #[test]
    fn validation_is_deterministic() {
        let mut record = valid_record();
        record.name.clear();
        assert_eq!(validate_for_write(&record), validate_for_write(&record));
    }

    #[test]
    fn read_tolerates_missing_metadata() {
        let value = json!({"id": "abc123", "name": "Jane Doe", "dateCreated": "2024-01-01T00:00:00Z"});
        let record = validate_for_read(value, "abc123").unwrap();
        assert_eq!(record.name, "Jane Doe");
        assert!(record.metadata.is_none());
    }

    #[test]
    fn read_rejects_non_objects_and_mismatched_ids() {
        let err = validate_for_read(json!([1, 2, 3]), "abc123").unwrap_err();
        assert_eq!(err.code(), "DATA_CORRUPTION");
        let err = validate_for_read(json!({"id": "other", "name": "x"}), "abc123").unwrap_err();
        assert_eq!(err.code(), "DATA_CORRUPTION");
        let err = validate_for_read(json!({"id": "abc123", "name": 5}), "abc123").unwrap_err();
        assert_eq!(err.code(), "DATA_CORRUPTION");
    }
}
