use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One intake form submission.
///
/// `patient_info` and `extra` are open-ended: the form decides which fields
/// exist, the validator only checks the kinds of the ones it knows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientRecord {
    pub id: String,
    pub name: String,
    #[serde(default, alias = "dateCreated", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub patient_info: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RecordMetadata>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    /// Write counter, bumped on every save.
    pub version: u32,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub last_accessed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub access_count: u64,
    pub schema_version: String,
}

impl PatientRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            created_at: Some(Utc::now()),
            updated_at: None,
            patient_info: Map::new(),
            metadata: None,
            extra: Map::new(),
        }
    }

    pub fn with_info(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.patient_info.insert(field.to_string(), value.into());
        self
    }

    pub fn access_count(&self) -> u64 {
        self.metadata.as_ref().map_or(0, |m| m.access_count)
    }

    /// Stamp the record for a write at `now`.
    ///
    /// `created_at` is kept from `existing` when there is one, so a record's
    /// creation time survives any number of overwrites.
    pub(crate) fn stamp_for_write(
        &mut self,
        existing: Option<&PatientRecord>,
        schema_version: &str,
        now: DateTime<Utc>,
    ) {
        if let Some(created) = existing.and_then(|e| e.created_at) {
            self.created_at = Some(created);
        }
        self.updated_at = Some(now);

        let previous = existing
            .and_then(|e| e.metadata.as_ref())
            .or(self.metadata.as_ref());
        let version = previous.map_or(0, |m| m.version) + 1;
        let last_accessed = previous.and_then(|m| m.last_accessed);
        let access_count = previous.map_or(0, |m| m.access_count);

        self.metadata = Some(RecordMetadata {
            version,
            last_modified: now,
            last_accessed,
            access_count,
            schema_version: schema_version.to_string(),
        });
    }

    /// Record a read: bump the access counter and timestamp.
    pub(crate) fn touch(&mut self, schema_version: &str, now: DateTime<Utc>) {
        let last_modified = self.updated_at.unwrap_or(now);
        let metadata = self.metadata.get_or_insert_with(|| RecordMetadata {
            version: 1,
            last_modified,
            last_accessed: None,
            access_count: 0,
            schema_version: schema_version.to_string(),
        });
        metadata.access_count += 1;
        metadata.last_accessed = Some(now);
    }

    /// Merge a partial update. Top-level scalars replace, `patientInfo` and
    /// unknown fields merge key by key. `id`, `createdAt` and `metadata` are
    /// not patchable.
    pub(crate) fn apply_patch(&mut self, patch: &Map<String, Value>) -> Result<(), serde_json::Error> {
        for (field, value) in patch {
            match field.as_str() {
                "id" | "createdAt" | "dateCreated" | "updatedAt" | "metadata" => {}
                "name" => self.name = serde_json::from_value(value.clone())?,
                "patientInfo" => {
                    let info: Map<String, Value> = serde_json::from_value(value.clone())?;
                    self.patient_info.extend(info);
                }
                _ => {
                    self.extra.insert(field.clone(), value.clone());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn jan_first() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn accepts_date_created_alias() {
        let record: PatientRecord = serde_json::from_value(json!({
            "id": "abc123",
            "name": "Jane Doe",
            "dateCreated": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(record.created_at, Some(jan_first()));
        assert!(record.patient_info.is_empty());
        assert!(record.metadata.is_none());
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let value = json!({
            "id": "abc123",
            "name": "Jane Doe",
            "createdAt": "2024-01-01T00:00:00Z",
            "patientInfo": {"age": 34},
            "formLanguage": "es"
        });
        let record: PatientRecord = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(record.extra.get("formLanguage"), Some(&json!("es")));
        assert_eq!(serde_json::to_value(&record).unwrap(), value);
    }

    #[test]
    fn stamping_preserves_creation_and_bumps_version() {
        let mut first = PatientRecord::new("abc123", "Jane Doe");
        first.created_at = Some(jan_first());
        let t1 = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        first.stamp_for_write(None, "1.0", t1);
        assert_eq!(first.metadata.as_ref().unwrap().version, 1);

        let mut second = PatientRecord::new("abc123", "Jane Q. Doe");
        let t2 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        second.stamp_for_write(Some(&first), "1.0", t2);
        assert_eq!(second.created_at, Some(jan_first()));
        assert_eq!(second.updated_at, Some(t2));
        assert_eq!(second.metadata.as_ref().unwrap().version, 2);
    }

    #[test]
    fn touch_counts_accesses() {
        let mut record = PatientRecord::new("abc123", "Jane Doe");
        record.touch("1.0", Utc::now());
        record.touch("1.0", Utc::now());
        assert_eq!(record.access_count(), 2);
        assert!(record.metadata.unwrap().last_accessed.is_some());
    }

    #[test]
    fn patch_merges_patient_info() {
        let mut record = PatientRecord::new("abc123", "Jane Doe").with_info("age", 34);
        let patch = json!({
            "id": "hijack",
            "name": "Jane Smith",
            "patientInfo": {"gender": "female"}
        });
        record.apply_patch(patch.as_object().unwrap()).unwrap();
        assert_eq!(record.id, "abc123");
        assert_eq!(record.name, "Jane Smith");
        assert_eq!(record.patient_info.get("age"), Some(&json!(34)));
        assert_eq!(record.patient_info.get("gender"), Some(&json!("female")));
    }

    #[test]
    fn patch_rejects_non_string_name() {
        let mut record = PatientRecord::new("abc123", "Jane Doe");
        let patch = json!({"name": 42});
        assert!(record.apply_patch(patch.as_object().unwrap()).is_err());
    }
}
