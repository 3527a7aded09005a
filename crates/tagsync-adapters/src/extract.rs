//! Field Extractor: one directory record in, one [`NormalizedMember`] out.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tagsync_core::{FieldEntry, FieldValue, LabelEntry, MemberId, MemberRecord, NormalizedMember, TagId, UNASSIGNED_TAG};
use thiserror::Error;

/// Directory role label that grants administrator rights.
pub const ADMIN_SENTINEL: &str = "Account administrator (Full access)";

/// Which directory fields carry the values the access cache needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMapping {
    pub tag_id_field: String,
    pub label_field: String,
    pub admin_role_system_code: String,
    pub admin_sentinel: String,
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            tag_id_field: "Tag ID".to_string(),
            label_field: "Safety Training".to_string(),
            admin_role_system_code: "AdminRole".to_string(),
            admin_sentinel: ADMIN_SENTINEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionErrorKind {
    #[error("tag value {0:?} is not numeric")]
    MalformedTag(String),
    #[error("tag value {0} is not positive")]
    NonPositiveTag(i64),
    #[error("tag value {0} exceeds the 32-bit tag range")]
    TagOutOfRange(String),
    #[error("expected {expected}, found {found}")]
    UnexpectedShape {
        expected: &'static str,
        found: &'static str,
    },
    #[error("entry {index} has no label")]
    MissingLabel { index: usize },
    #[error("member id must be positive")]
    InvalidMemberId,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("member {member_id}, field {field:?}: {kind}")]
pub struct ExtractionError {
    pub member_id: MemberId,
    pub field: String,
    pub kind: ExtractionErrorKind,
}

#[derive(Debug, Clone, Default)]
pub struct FieldExtractor {
    mapping: FieldMapping,
}

impl FieldExtractor {
    pub fn new(mapping: FieldMapping) -> Self {
        Self { mapping }
    }

    pub fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }

    pub fn extract(&self, record: &MemberRecord) -> Result<NormalizedMember, ExtractionError> {
        let member_id = record.id;
        if member_id <= 0 {
            return Err(ExtractionError {
                member_id,
                field: "Id".to_string(),
                kind: ExtractionErrorKind::InvalidMemberId,
            });
        }

        let fail = |field: &str, kind| ExtractionError {
            member_id,
            field: field.to_string(),
            kind,
        };

        let tag_id = match record.field(&self.mapping.tag_id_field) {
            Some(entry) => parse_tag(entry).map_err(|k| fail(&entry.field_name, k))?,
            None => UNASSIGNED_TAG,
        };

        let labels = match record.field(&self.mapping.label_field) {
            Some(entry) => parse_labels(entry).map_err(|k| fail(&entry.field_name, k))?,
            None => Vec::new(),
        };

        let is_admin = match record.field_by_system_code(&self.mapping.admin_role_system_code) {
            Some(entry) => {
                let roles = parse_labels(entry).map_err(|k| fail(&self.mapping.admin_role_system_code, k))?;
                roles.iter().any(|role| role == &self.mapping.admin_sentinel)
            }
            None => false,
        };

        Ok(NormalizedMember {
            external_id: member_id,
            is_admin,
            tag_id,
            membership_level: record.membership_level.as_ref().map_or(0, |level| level.id),
            labels,
        })
    }
}

fn parse_tag(entry: &FieldEntry) -> Result<TagId, ExtractionErrorKind> {
    match &entry.value {
        None => Ok(UNASSIGNED_TAG),
        Some(FieldValue::Text(raw)) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(UNASSIGNED_TAG);
            }
            let value: i64 = trimmed.parse().map_err(|_| {
                if trimmed.bytes().all(|b| b.is_ascii_digit()) {
                    ExtractionErrorKind::TagOutOfRange(trimmed.to_string())
                } else {
                    ExtractionErrorKind::MalformedTag(raw.clone())
                }
            })?;
            tag_from_integer(value)
        }
        Some(FieldValue::Number(number)) => match number.as_i64() {
            Some(value) => tag_from_integer(value),
            None if number.as_u64().is_some() => Err(ExtractionErrorKind::TagOutOfRange(number.to_string())),
            None => Err(ExtractionErrorKind::MalformedTag(number.to_string())),
        },
        Some(other) => Err(ExtractionErrorKind::UnexpectedShape {
            expected: "numeric text",
            found: other.shape(),
        }),
    }
}

fn tag_from_integer(value: i64) -> Result<TagId, ExtractionErrorKind> {
    if value <= 0 {
        return Err(ExtractionErrorKind::NonPositiveTag(value));
    }
    TagId::try_from(value).map_err(|_| ExtractionErrorKind::TagOutOfRange(value.to_string()))
}

fn parse_labels(entry: &FieldEntry) -> Result<Vec<String>, ExtractionErrorKind> {
    let entries: &[LabelEntry] = match &entry.value {
        None => return Ok(Vec::new()),
        Some(FieldValue::Text(raw)) if raw.trim().is_empty() => return Ok(Vec::new()),
        Some(FieldValue::Entries(entries)) => entries,
        Some(FieldValue::Entry(single)) => std::slice::from_ref(single),
        Some(other) => {
            return Err(ExtractionErrorKind::UnexpectedShape {
                expected: "list of label entries",
                found: other.shape(),
            })
        }
    };

    let mut seen = BTreeSet::new();
    let mut labels = Vec::with_capacity(entries.len());
    for (index, item) in entries.iter().enumerate() {
        let label = item
            .label
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or(ExtractionErrorKind::MissingLabel { index })?;
        if seen.insert(label) {
            labels.push(label.to_string());
        }
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn record(id: i64, fields: Value) -> MemberRecord {
        serde_json::from_value(json!({
            "Id": id,
            "Status": "Active",
            "MembershipLevel": {"Id": 2, "Name": "Regular"},
            "FieldValues": fields
        }))
        .expect("record json")
    }

    fn extract(fields: Value) -> Result<NormalizedMember, ExtractionError> {
        FieldExtractor::default().extract(&record(42, fields))
    }

    #[test]
    fn extracts_tag_labels_level_and_admin_flag() {
        let member = extract(json!([
            {"FieldName": "Tag ID", "Value": "1001"},
            {"FieldName": "Safety Training", "Value": [{"Id": 1, "Label": "CNC"}, {"Id": 2, "Label": "Laser"}, {"Id": 1, "Label": "CNC"}]},
            {"FieldName": "Administrator role", "SystemCode": "AdminRole", "Value": [{"Id": 9, "Label": ADMIN_SENTINEL}]}
        ]))
        .unwrap();

        assert_eq!(member.external_id, 42);
        assert_eq!(member.tag_id, 1001);
        assert_eq!(member.labels, vec!["CNC", "Laser"]);
        assert_eq!(member.membership_level, 2);
        assert!(member.is_admin);
    }

    #[test]
    fn absent_or_empty_tag_means_awaiting_onboarding() {
        assert_eq!(extract(json!([])).unwrap().tag_id, 0);
        assert_eq!(extract(json!([{"FieldName": "Tag ID", "Value": ""}])).unwrap().tag_id, 0);
        assert_eq!(extract(json!([{"FieldName": "Tag ID", "Value": null}])).unwrap().tag_id, 0);
        assert!(extract(json!([])).unwrap().labels.is_empty());
    }

    #[test]
    fn numeric_json_tags_are_accepted() {
        assert_eq!(extract(json!([{"FieldName": "Tag ID", "Value": 4_000_000_000u64}])).unwrap().tag_id, 4_000_000_000);
    }

    #[test]
    fn malformed_tags_name_member_and_field() {
        let err = extract(json!([{"FieldName": "Tag ID", "Value": "12ab"}])).unwrap_err();
        assert_eq!(err.member_id, 42);
        assert_eq!(err.field, "Tag ID");
        assert_eq!(err.kind, ExtractionErrorKind::MalformedTag("12ab".to_string()));

        let err = extract(json!([{"FieldName": "Tag ID", "Value": "-5"}])).unwrap_err();
        assert_eq!(err.kind, ExtractionErrorKind::NonPositiveTag(-5));

        let err = extract(json!([{"FieldName": "Tag ID", "Value": "0"}])).unwrap_err();
        assert_eq!(err.kind, ExtractionErrorKind::NonPositiveTag(0));

        let err = extract(json!([{"FieldName": "Tag ID", "Value": "4294967296"}])).unwrap_err();
        assert_eq!(err.kind, ExtractionErrorKind::TagOutOfRange("4294967296".to_string()));

        let err = extract(json!([{"FieldName": "Tag ID", "Value": [{"Label": "x"}]}])).unwrap_err();
        assert!(matches!(err.kind, ExtractionErrorKind::UnexpectedShape { .. }));
    }

    #[test]
    fn label_entries_without_labels_are_rejected() {
        let err = extract(json!([
            {"FieldName": "Safety Training", "Value": [{"Id": 1, "Label": "CNC"}, {"Id": 2}]}
        ]))
        .unwrap_err();
        assert_eq!(err.field, "Safety Training");
        assert_eq!(err.kind, ExtractionErrorKind::MissingLabel { index: 1 });
    }

    #[test]
    fn non_admin_roles_do_not_grant_admin() {
        let member = extract(json!([
            {"FieldName": "Administrator role", "SystemCode": "AdminRole", "Value": [{"Id": 3, "Label": "Event manager"}]}
        ]))
        .unwrap();
        assert!(!member.is_admin);
    }

    #[test]
    fn field_names_follow_the_mapping() {
        let extractor = FieldExtractor::new(FieldMapping {
            tag_id_field: "RFID".to_string(),
            label_field: "Training".to_string(),
            ..FieldMapping::default()
        });
        let member = extractor
            .extract(&record(
                7,
                json!([
                    {"FieldName": "Tag ID", "Value": "999"},
                    {"FieldName": "RFID", "Value": "555"},
                    {"FieldName": "Training", "Value": {"Id": 1, "Label": "Lathe"}}
                ]),
            ))
            .unwrap();
        assert_eq!(member.tag_id, 555);
        assert_eq!(member.labels, vec!["Lathe"]);
    }

    #[test]
    fn non_positive_member_ids_are_rejected() {
        let err = FieldExtractor::default().extract(&record(0, json!([]))).unwrap_err();
        assert_eq!(err.kind, ExtractionErrorKind::InvalidMemberId);
    }
}
