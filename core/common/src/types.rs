//! Identifier and value types used throughout Rollcall.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Maximum length of an attendee name.
pub const MAX_NAME_LEN: usize = 100;
/// Maximum length of a phone number.
pub const MAX_PHONE_LEN: usize = 20;
/// Maximum length of an email address.
pub const MAX_EMAIL_LEN: usize = 120;
/// Maximum length of an external auth provider id.
pub const MAX_EXTERNAL_AUTH_ID_LEN: usize = 128;
/// Maximum length of a device identifier.
pub const MAX_DEVICE_ID_LEN: usize = 100;
/// Maximum length of a device-local record id.
pub const MAX_LOCAL_ID_LEN: usize = 100;
/// Maximum length of a check-in method tag.
pub const MAX_METHOD_LEN: usize = 50;
/// Maximum length of an event or session name.
pub const MAX_TITLE_LEN: usize = 150;

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Get the raw row id.
            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

row_id!(
    /// Server-assigned user id.
    UserId
);
row_id!(
    /// Event id.
    EventId
);
row_id!(
    /// Session id.
    SessionId
);
row_id!(
    /// Registration id.
    RegistrationId
);
row_id!(
    /// Check-in id.
    CheckInId
);
row_id!(
    /// Row id of an offline device.
    DeviceRowId
);

/// Durable cross-device identity anchor for a user.
///
/// Generated once when the user row is created and never rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FallbackId(Uuid);

impl FallbackId {
    /// Generate a fresh random fallback id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for FallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FallbackId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| crate::Error::Validation(format!("Invalid fallback id {s:?}: {e}")))
    }
}

/// Identifier a field device reports for itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceUuid(String);

impl DeviceUuid {
    /// Create a device identifier.
    ///
    /// # Errors
    /// - Returns error if the id is blank or longer than [`MAX_DEVICE_ID_LEN`]
    pub fn new(id: impl AsRef<str>) -> crate::Result<Self> {
        let id = id.as_ref().trim();
        if id.is_empty() {
            return Err(crate::Error::Validation(
                "device_id cannot be empty".to_string(),
            ));
        }
        if id.chars().count() > MAX_DEVICE_ID_LEN {
            return Err(crate::Error::Validation(format!(
                "device_id exceeds {MAX_DEVICE_ID_LEN} characters"
            )));
        }
        Ok(Self(id.to_string()))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical form of a phone number used for lookups and storage.
///
/// Surrounding whitespace is dropped, as are inner spaces and dashes.
/// A blank input normalizes to `None`.
pub fn normalize_phone(phone: &str) -> Option<String> {
    let phone: String = phone
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();
    if phone.is_empty() {
        None
    } else {
        Some(phone)
    }
}

/// Canonical form of an email address used for lookups and storage.
pub fn normalize_email(email: &str) -> Option<String> {
    let email = email.trim().to_lowercase();
    if email.is_empty() {
        None
    } else {
        Some(email)
    }
}

/// Check that a required text field is present and within bounds.
pub fn require_text(field: &str, value: &str, max_len: usize) -> crate::Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(crate::Error::Validation(format!("{field} is required")));
    }
    check_len(field, value, max_len)?;
    Ok(value.to_string())
}

/// Check that a text field does not exceed `max_len` characters.
pub fn check_len(field: &str, value: &str, max_len: usize) -> crate::Result<()> {
    if value.chars().count() > max_len {
        return Err(crate::Error::Validation(format!(
            "{field} exceeds {max_len} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_device_uuid_trims() {
        let id = DeviceUuid::new("  tablet-7 ").unwrap();
        assert_eq!(id.as_str(), "tablet-7");
    }

    #[test]
    fn test_device_uuid_blank_fails() {
        assert!(DeviceUuid::new("   ").is_err());
        assert!(DeviceUuid::new("x".repeat(MAX_DEVICE_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_fallback_id_parse() {
        let id = FallbackId::generate();
        let parsed: FallbackId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<FallbackId>().is_err());
    }

    #[test]
    fn test_normalize_phone() {
        assert_eq!(
            normalize_phone(" +254 700-000 001 ").as_deref(),
            Some("+254700000001")
        );
        assert_eq!(normalize_phone("  "), None);
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(
            normalize_email(" Ada@Example.COM ").as_deref(),
            Some("ada@example.com")
        );
        assert_eq!(normalize_email(""), None);
    }

    #[test]
    fn test_require_text() {
        assert_eq!(require_text("name", " Ada ", 10).unwrap(), "Ada");
        assert!(require_text("name", "", 10).is_err());
        assert!(require_text("name", "abcdefghijk", 10).is_err());
    }

    proptest! {
        #[test]
        fn normalize_phone_is_idempotent(raw in "[ +0-9-]{0,24}") {
            if let Some(once) = normalize_phone(&raw) {
                prop_assert_eq!(normalize_phone(&once), Some(once.clone()));
            }
        }

        #[test]
        fn normalize_email_is_idempotent(raw in "[ a-zA-Z0-9@.]{0,40}") {
            if let Some(once) = normalize_email(&raw) {
                prop_assert_eq!(normalize_email(&once), Some(once.clone()));
            }
        }
    }
}
