use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::AuditAction;

/// Append-only audit trail entry. Carries record ids, never record contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub action: AuditAction,
    pub timestamp: DateTime<Utc>,
    pub subject_id: Option<String>,
    pub detail: Option<String>,
}

impl AuditLogEntry {
    pub fn new(action: AuditAction, subject_id: Option<&str>, detail: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            timestamp: Utc::now(),
            subject_id: subject_id.map(str::to_string),
            detail,
        }
    }

    /// Backend key under `prefix`. Millisecond timestamps are zero-padded so
    /// lexical key order is chronological.
    pub fn storage_key(&self, prefix: &str) -> String {
        format!(
            "{prefix}{:015}_{}",
            self.timestamp.timestamp_millis().max(0),
            self.id.simple()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn storage_keys_sort_chronologically() {
        let mut early = AuditLogEntry::new(AuditAction::Save, Some("a"), None);
        early.timestamp = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut late = AuditLogEntry::new(AuditAction::Delete, Some("a"), None);
        late.timestamp = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert!(early.storage_key("audit_") < late.storage_key("audit_"));
        assert!(early.storage_key("audit_").starts_with("audit_"));
    }

    #[test]
    fn serializes_camel_case() {
        let entry = AuditLogEntry::new(AuditAction::Export, None, Some("3 records".into()));
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["action"], "export");
        assert!(value.get("subjectId").is_some());
    }
}
