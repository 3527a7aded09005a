//! Core domain model for the directory -> access cache sync pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "tagsync-core";

pub type MemberId = i64;

/// RFID credential identifier as read by door and machine controllers.
pub type TagId = u32;

/// Tag value meaning "no credential issued yet".
pub const UNASSIGNED_TAG: TagId = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRecord {
    #[serde(rename = "Id")]
    pub id: MemberId,
    #[serde(rename = "Status", default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(rename = "MembershipLevel", default, skip_serializing_if = "Option::is_none")]
    pub membership_level: Option<MembershipLevelRef>,
    #[serde(rename = "FieldValues", default)]
    pub field_values: Vec<FieldEntry>,
}

impl MemberRecord {
    pub fn field(&self, field_name: &str) -> Option<&FieldEntry> {
        self.field_values.iter().find(|f| f.field_name == field_name)
    }

    pub fn field_by_system_code(&self, system_code: &str) -> Option<&FieldEntry> {
        self.field_values
            .iter()
            .find(|f| f.system_code.as_deref() == Some(system_code))
    }

    pub fn is_lapsed(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|s| s.trim().eq_ignore_ascii_case("lapsed"))
    }

    /// Only an explicit `Active` status backs a credential; pending or missing does not.
    pub fn is_active(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|s| s.trim().eq_ignore_ascii_case("active"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipLevelRef {
    #[serde(rename = "Id")]
    pub id: i64,
    #[serde(rename = "Name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEntry {
    #[serde(rename = "FieldName")]
    pub field_name: String,
    #[serde(rename = "SystemCode", default, skip_serializing_if = "Option::is_none")]
    pub system_code: Option<String>,
    /// `None` when the directory sends `null` or omits the value.
    #[serde(rename = "Value", default)]
    pub value: Option<FieldValue>,
}

/// The value shapes the directory uses for custom fields.
///
/// Variant order matters: decoding tries each shape top to bottom and anything
/// unrecognised lands in [`FieldValue::Other`] so extraction can report it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Flag(bool),
    Number(serde_json::Number),
    Entries(Vec<LabelEntry>),
    Entry(LabelEntry),
    Other(JsonValue),
}

impl FieldValue {
    pub fn shape(&self) -> &'static str {
        match self {
            FieldValue::Text(_) => "text",
            FieldValue::Flag(_) => "boolean",
            FieldValue::Number(_) => "number",
            FieldValue::Entries(_) => "list of label entries",
            FieldValue::Entry(_) => "label entry",
            FieldValue::Other(_) => "unrecognised value",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEntry {
    #[serde(rename = "Id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(rename = "Label", default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Directory record reduced to what the access cache needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedMember {
    pub external_id: MemberId,
    pub is_admin: bool,
    pub tag_id: TagId,
    pub membership_level: i64,
    pub labels: Vec<String>,
}

impl NormalizedMember {
    pub fn new(external_id: MemberId, tag_id: TagId) -> Self {
        Self {
            external_id,
            is_admin: false,
            tag_id,
            membership_level: 0,
            labels: Vec::new(),
        }
    }

    /// Identity-only member, used when an event removes someone without a record.
    pub fn unassigned(external_id: MemberId) -> Self {
        Self::new(external_id, UNASSIGNED_TAG)
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_membership_level(mut self, level: i64) -> Self {
        self.membership_level = level;
        self
    }

    pub fn has_tag(&self) -> bool {
        self.tag_id != UNASSIGNED_TAG
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    Active,
    Lapsed,
}

/// Membership status codes carried by membership webhooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipStatus {
    NoOp,
    Active,
    Lapsed,
    PendingRenewal,
    PendingNew,
    PendingUpgrade,
    Other(String),
}

impl MembershipStatus {
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "0" => Self::NoOp,
            "1" => Self::Active,
            "2" => Self::Lapsed,
            "3" => Self::PendingRenewal,
            "20" => Self::PendingNew,
            "30" => Self::PendingUpgrade,
            other => Self::Other(other.to_string()),
        }
    }

    /// Only active and lapsed statuses change the access cache.
    pub fn as_member_status(&self) -> Option<MemberStatus> {
        match self {
            Self::Active => Some(MemberStatus::Active),
            Self::Lapsed => Some(MemberStatus::Lapsed),
            _ => None,
        }
    }
}

impl fmt::Display for MembershipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoOp => f.write_str("no-op"),
            Self::Active => f.write_str("active"),
            Self::Lapsed => f.write_str("lapsed"),
            Self::PendingRenewal => f.write_str("pending-renewal"),
            Self::PendingNew => f.write_str("pending-new"),
            Self::PendingUpgrade => f.write_str("pending-upgrade"),
            Self::Other(code) => write!(f, "unknown({code})"),
        }
    }
}

/// Incremental notification pushed by the directory, decoded at the HTTP boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectoryEvent {
    ProfileChanged {
        member_id: MemberId,
        profile_changed: bool,
    },
    MembershipStatusChanged {
        member_id: MemberId,
        status: MembershipStatus,
    },
}

impl DirectoryEvent {
    pub fn member_id(&self) -> MemberId {
        match self {
            Self::ProfileChanged { member_id, .. } => *member_id,
            Self::MembershipStatusChanged { member_id, .. } => *member_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProfileChanged { .. } => "profile_changed",
            Self::MembershipStatusChanged { .. } => "membership_status_changed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("malformed webhook payload: {0}")]
    Malformed(String),
    #[error("webhook payload has no MessageType")]
    MissingMessageType,
    #[error("unknown webhook message type {0:?}")]
    UnknownMessageType(String),
    #[error("invalid parameters for {message_type}: {reason}")]
    InvalidParameters {
        message_type: String,
        reason: String,
    },
    #[error("event has no member identifier")]
    MissingMemberId,
    #[error("invalid member identifier {0:?}")]
    InvalidMemberId(String),
    #[error("event is missing required field {0}")]
    MissingField(&'static str),
}

/// Raw webhook body: `{ AccountId, MessageType, Parameters }`.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(rename = "AccountId", default)]
    pub account_id: Option<JsonValue>,
    #[serde(rename = "MessageType", default)]
    pub message_type: Option<String>,
    #[serde(rename = "Parameters", default)]
    pub parameters: JsonValue,
}

/// Scalars the directory sends as either strings or JSON primitives.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum LooseScalar {
    Text(String),
    Integer(i64),
    Flag(bool),
}

#[derive(Debug, Deserialize)]
struct ContactParameters {
    #[serde(rename = "Contact.Id", default)]
    contact_id: Option<LooseScalar>,
    #[serde(rename = "ProfileChanged", default)]
    profile_changed: Option<LooseScalar>,
}

#[derive(Debug, Deserialize)]
struct MembershipParameters {
    #[serde(rename = "Contact.Id", default)]
    contact_id: Option<LooseScalar>,
    #[serde(rename = "Membership.Status", default)]
    membership_status: Option<LooseScalar>,
}

impl TryFrom<WebhookEnvelope> for DirectoryEvent {
    type Error = ValidationError;

    fn try_from(envelope: WebhookEnvelope) -> Result<Self, Self::Error> {
        let message_type = envelope
            .message_type
            .filter(|t| !t.trim().is_empty())
            .ok_or(ValidationError::MissingMessageType)?;

        match message_type.as_str() {
            "ContactModified" => {
                let params: ContactParameters = decode_parameters(&message_type, envelope.parameters)?;
                Ok(DirectoryEvent::ProfileChanged {
                    member_id: parse_member_id(params.contact_id)?,
                    profile_changed: params.profile_changed.as_ref().is_some_and(scalar_is_true),
                })
            }
            "Membership" => {
                let params: MembershipParameters = decode_parameters(&message_type, envelope.parameters)?;
                let member_id = parse_member_id(params.contact_id)?;
                let status = match params.membership_status {
                    Some(LooseScalar::Text(code)) => MembershipStatus::from_code(&code),
                    Some(LooseScalar::Integer(code)) => MembershipStatus::from_code(&code.to_string()),
                    Some(LooseScalar::Flag(_)) => {
                        return Err(ValidationError::InvalidParameters {
                            message_type,
                            reason: "Membership.Status is a boolean".to_string(),
                        })
                    }
                    None => return Err(ValidationError::MissingField("Membership.Status")),
                };
                Ok(DirectoryEvent::MembershipStatusChanged { member_id, status })
            }
            _ => Err(ValidationError::UnknownMessageType(message_type)),
        }
    }
}

pub fn decode_event(body: &[u8]) -> Result<DirectoryEvent, ValidationError> {
    let envelope: WebhookEnvelope =
        serde_json::from_slice(body).map_err(|e| ValidationError::Malformed(e.to_string()))?;
    DirectoryEvent::try_from(envelope)
}

fn decode_parameters<T: serde::de::DeserializeOwned>(
    message_type: &str,
    parameters: JsonValue,
) -> Result<T, ValidationError> {
    if !parameters.is_object() {
        return Err(ValidationError::InvalidParameters {
            message_type: message_type.to_string(),
            reason: "Parameters must be an object".to_string(),
        });
    }
    serde_json::from_value(parameters).map_err(|e| ValidationError::InvalidParameters {
        message_type: message_type.to_string(),
        reason: e.to_string(),
    })
}

fn parse_member_id(raw: Option<LooseScalar>) -> Result<MemberId, ValidationError> {
    let id = match raw {
        None => return Err(ValidationError::MissingMemberId),
        Some(LooseScalar::Text(text)) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Err(ValidationError::MissingMemberId);
            }
            trimmed
                .parse::<MemberId>()
                .map_err(|_| ValidationError::InvalidMemberId(text.clone()))?
        }
        Some(LooseScalar::Integer(id)) => id,
        Some(LooseScalar::Flag(flag)) => return Err(ValidationError::InvalidMemberId(flag.to_string())),
    };
    if id <= 0 {
        return Err(ValidationError::InvalidMemberId(id.to_string()));
    }
    Ok(id)
}

fn scalar_is_true(value: &LooseScalar) -> bool {
    match value {
        LooseScalar::Text(text) => text.trim().eq_ignore_ascii_case("true"),
        LooseScalar::Integer(n) => *n != 0,
        LooseScalar::Flag(flag) => *flag,
    }
}
