//! Entity model shared by the store, the reconciler and the notifiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use zeroize::Zeroize;

use crate::types::{
    CheckInId, DeviceRowId, DeviceUuid, EventId, FallbackId, RegistrationId, SessionId, UserId,
};

/// How a sensitive field is held at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldEncoding {
    /// Base64 of `nonce || ciphertext || tag`.
    Encrypted,
    /// Stored in the clear because no cipher was available.
    Plaintext,
}

impl FieldEncoding {
    /// Stable name used in store columns.
    pub fn as_str(self) -> &'static str {
        match self {
            FieldEncoding::Encrypted => "encrypted",
            FieldEncoding::Plaintext => "plaintext",
        }
    }

    /// Parse the stable column name.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "encrypted" => Ok(FieldEncoding::Encrypted),
            "plaintext" => Ok(FieldEncoding::Plaintext),
            other => Err(crate::Error::Storage(format!(
                "Unknown field encoding: {other}"
            ))),
        }
    }
}

/// A value that can live inside an [`EncryptedField`].
pub trait FieldValue: Sized {
    /// Encode the value to plaintext bytes.
    fn to_plaintext(&self) -> Vec<u8>;

    /// Decode the value from plaintext bytes.
    fn from_plaintext(bytes: Vec<u8>) -> crate::Result<Self>;
}

/// At-rest representation of a sensitive value of type `T`.
///
/// The field never exposes `T` directly: encoding and decoding go through
/// the field cipher at the data-access boundary. The encoding flag makes a
/// plaintext fallback visible to every reader of the row.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedField<T> {
    encoding: FieldEncoding,
    stored: String,
    #[serde(skip)]
    _value: PhantomData<fn() -> T>,
}

impl<T: FieldValue> EncryptedField<T> {
    /// Rebuild a field from its stored columns.
    pub fn from_stored(encoding: FieldEncoding, stored: impl Into<String>) -> Self {
        Self {
            encoding,
            stored: stored.into(),
            _value: PhantomData,
        }
    }

    /// How the value is held.
    pub fn encoding(&self) -> FieldEncoding {
        self.encoding
    }

    /// Whether the value is stored without encryption.
    pub fn is_plaintext(&self) -> bool {
        self.encoding == FieldEncoding::Plaintext
    }

    /// The stored text, exactly as persisted.
    pub fn stored(&self) -> &str {
        &self.stored
    }
}

impl<T> fmt::Debug for EncryptedField<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EncryptedField({:?}, [REDACTED; {} chars])",
            self.encoding,
            self.stored.len()
        )
    }
}

/// Opaque biometric template as produced by a capture SDK.
///
/// Zeroized on drop and redacted in debug output.
#[derive(Clone, PartialEq, Eq, Zeroize, Deserialize)]
#[zeroize(drop)]
#[serde(transparent)]
pub struct FingerprintTemplate(String);

impl FingerprintTemplate {
    /// Wrap a template string.
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    /// Get the template text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the template is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for FingerprintTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FingerprintTemplate([REDACTED; {} chars])", self.0.len())
    }
}

impl FieldValue for FingerprintTemplate {
    fn to_plaintext(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }

    fn from_plaintext(bytes: Vec<u8>) -> crate::Result<Self> {
        String::from_utf8(bytes)
            .map(Self)
            .map_err(|_| crate::Error::Crypto("Template is not valid UTF-8".to_string()))
    }
}

/// Stored biometric template column.
pub type StoredTemplate = EncryptedField<FingerprintTemplate>;

/// An attendee.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: UserId,
    pub external_auth_id: Option<String>,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub fallback_id: FallbackId,
    pub fingerprint_template_1: Option<StoredTemplate>,
    pub fingerprint_template_2: Option<StoredTemplate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Values for a user row that does not exist yet.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub external_auth_id: Option<String>,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub fallback_id: FallbackId,
    pub fingerprint_template_1: Option<StoredTemplate>,
    pub fingerprint_template_2: Option<StoredTemplate>,
}

/// Contact and template fields that may be filled in on an existing user.
///
/// The fallback id is deliberately absent: it is never rewritten.
#[derive(Debug, Clone, Default)]
pub struct UserPatch {
    pub phone: Option<String>,
    pub email: Option<String>,
    pub fingerprint_template_1: Option<StoredTemplate>,
    pub fingerprint_template_2: Option<StoredTemplate>,
}

impl UserPatch {
    /// Whether the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.phone.is_none()
            && self.email.is_none()
            && self.fingerprint_template_1.is_none()
            && self.fingerprint_template_2.is_none()
    }
}

/// A conference or occasion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub name: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

/// Values for a new event.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub name: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

/// A sub-slot of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub event_id: EventId,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Values for a new session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub event_id: EventId,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// An attendee signed up for an event. Unique per (user, event).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub id: RegistrationId,
    pub user_id: UserId,
    pub event_id: EventId,
    pub registration_date: DateTime<Utc>,
}

/// Attendance at a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckIn {
    pub id: CheckInId,
    pub user_id: UserId,
    pub session_id: SessionId,
    pub event_id: EventId,
    pub check_in_time: DateTime<Utc>,
    pub device_id: Option<DeviceUuid>,
    pub local_id: Option<String>,
    pub is_synced: bool,
    pub created_at_local: Option<DateTime<Utc>>,
    pub method: Option<String>,
}

/// Values for a new check-in.
#[derive(Debug, Clone)]
pub struct NewCheckIn {
    pub user_id: UserId,
    pub session_id: SessionId,
    pub event_id: EventId,
    pub device_id: Option<DeviceUuid>,
    pub local_id: Option<String>,
    pub is_synced: bool,
    pub created_at_local: Option<DateTime<Utc>>,
    pub method: Option<String>,
}

/// Fields identifying a retried upload of the same check-in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckInKey {
    pub user_id: UserId,
    pub session_id: SessionId,
    pub device_id: Option<DeviceUuid>,
    pub local_id: Option<String>,
    pub created_at_local: Option<DateTime<Utc>>,
}

impl NewCheckIn {
    /// The dedupe key this check-in would occupy.
    pub fn key(&self) -> CheckInKey {
        CheckInKey {
            user_id: self.user_id,
            session_id: self.session_id,
            device_id: self.device_id.clone(),
            local_id: self.local_id.clone(),
            created_at_local: self.created_at_local,
        }
    }
}

impl CheckIn {
    /// The dedupe key of this check-in.
    pub fn key(&self) -> CheckInKey {
        CheckInKey {
            user_id: self.user_id,
            session_id: self.session_id,
            device_id: self.device_id.clone(),
            local_id: self.local_id.clone(),
            created_at_local: self.created_at_local,
        }
    }
}

/// A field device doing offline capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineDevice {
    pub id: DeviceRowId,
    pub device_uuid: DeviceUuid,
    pub name: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub last_sync_time: Option<DateTime<Utc>>,
}

/// Row counts per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCounts {
    pub users: u64,
    pub events: u64,
    pub sessions: u64,
    pub registrations: u64,
    pub check_ins: u64,
    pub offline_devices: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_debug_is_redacted() {
        let template = FingerprintTemplate::new("minutiae-secret");
        let debug = format!("{:?}", template);
        assert!(!debug.contains("minutiae-secret"));
    }

    #[test]
    fn test_field_debug_is_redacted() {
        let field = StoredTemplate::from_stored(FieldEncoding::Plaintext, "minutiae-secret");
        assert!(field.is_plaintext());
        assert!(!format!("{:?}", field).contains("minutiae-secret"));
    }

    #[test]
    fn test_field_encoding_names() {
        for encoding in [FieldEncoding::Encrypted, FieldEncoding::Plaintext] {
            assert_eq!(FieldEncoding::parse(encoding.as_str()).unwrap(), encoding);
        }
        assert!(FieldEncoding::parse("rot13").is_err());
    }

    #[test]
    fn test_user_patch_empty() {
        assert!(UserPatch::default().is_empty());
        let patch = UserPatch {
            email: Some("a@b.c".to_string()),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }
}
