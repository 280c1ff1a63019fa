//! Wire types exchanged with field devices and the online desk.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use rollcall_common::{
    CheckInId, DeviceUuid, ErrorKind, EventId, FallbackId, FingerprintTemplate, RegistrationId,
    SessionId, UserId,
};

/// One upload from a field device.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncRequest {
    /// Reporting device. Missing or blank fails the whole request.
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub new_registrations: Vec<BatchEntry<NewRegistration>>,
    #[serde(default)]
    pub check_ins: Vec<BatchEntry<CheckInRecord>>,
}

/// One record of a batch. Each record is parsed on its own so a
/// malformed entry is rejected without failing its neighbours.
#[derive(Debug, Clone)]
pub enum BatchEntry<T> {
    Parsed(T),
    Malformed {
        /// The entry's `local_id`, when one could be read.
        local_id: Option<String>,
        reason: String,
    },
}

impl<T> BatchEntry<T> {
    pub fn parsed(&self) -> Option<&T> {
        match self {
            BatchEntry::Parsed(record) => Some(record),
            BatchEntry::Malformed { .. } => None,
        }
    }
}

impl<T> From<T> for BatchEntry<T> {
    fn from(record: T) -> Self {
        BatchEntry::Parsed(record)
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for BatchEntry<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let local_id = value
            .get("local_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(match serde_json::from_value(value) {
            Ok(record) => BatchEntry::Parsed(record),
            Err(e) => BatchEntry::Malformed {
                local_id,
                reason: format!("malformed record: {e}"),
            },
        })
    }
}

/// An attendee captured by a device or entered at the online desk.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewRegistration {
    /// Device-local id; required in a sync batch.
    #[serde(default)]
    pub local_id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub external_auth_id: Option<String>,
    /// Fallback id the device already knows for this attendee.
    #[serde(default)]
    pub fallback_id: Option<String>,
    #[serde(default)]
    pub event_id: Option<EventId>,
    #[serde(default)]
    pub fingerprint_template_1: Option<FingerprintTemplate>,
    #[serde(default)]
    pub fingerprint_template_2: Option<FingerprintTemplate>,
}

/// How a check-in names its attendee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRef {
    /// Server-assigned user id.
    ServerId(UserId),
    /// Durable fallback id.
    FallbackId(FallbackId),
    /// Local id of a registration in the same batch.
    LocalId(String),
}

/// A check-in captured offline.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckInRecord {
    #[serde(default)]
    pub local_id: Option<String>,
    pub user_ref: UserRef,
    pub session_id: SessionId,
    pub event_id: EventId,
    /// When the device recorded the check-in.
    pub client_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub method: Option<String>,
}

/// A check-in recorded at the online desk.
#[derive(Debug, Clone, Deserialize)]
pub struct OnlineCheckIn {
    pub user_ref: UserRef,
    pub session_id: SessionId,
    pub event_id: EventId,
    #[serde(default)]
    pub method: Option<String>,
}

/// Outcome of one submitted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordStatus {
    Created,
    AlreadyExisted,
    Rejected { kind: ErrorKind, reason: String },
}

impl RecordStatus {
    /// Status for a record that was resolved without error.
    pub fn resolved(created: bool) -> Self {
        if created {
            RecordStatus::Created
        } else {
            RecordStatus::AlreadyExisted
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, RecordStatus::Rejected { .. })
    }
}

/// Result for one registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResult {
    pub local_id: Option<String>,
    #[serde(flatten)]
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_id: Option<FallbackId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_id: Option<RegistrationId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Result for one check-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInResult {
    pub local_id: Option<String>,
    #[serde(flatten)]
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_in_id: Option<CheckInId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl RegistrationResult {
    pub(crate) fn rejected(local_id: Option<String>, kind: ErrorKind, reason: String) -> Self {
        Self {
            local_id,
            status: RecordStatus::Rejected { kind, reason },
            user_id: None,
            fallback_id: None,
            registration_id: None,
            warnings: Vec::new(),
        }
    }
}

impl CheckInResult {
    pub(crate) fn rejected(local_id: Option<String>, kind: ErrorKind, reason: String) -> Self {
        Self {
            local_id,
            status: RecordStatus::Rejected { kind, reason },
            check_in_id: None,
            user_id: None,
            warnings: Vec::new(),
        }
    }
}

/// Reply to a [`SyncRequest`], one entry per submitted record in
/// submission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub device_id: DeviceUuid,
    pub last_sync_time: DateTime<Utc>,
    pub registrations: Vec<RegistrationResult>,
    pub check_ins: Vec<CheckInResult>,
}
