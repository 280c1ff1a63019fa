//! Common utilities and types shared across Rollcall crates.
//!
//! This crate provides the error type, identifier newtypes and the entity
//! model that the store, the reconciler and the notifiers agree on.

pub mod error;
pub mod model;
pub mod types;

pub use error::{Error, ErrorKind, Result};
pub use model::{
    CheckIn, CheckInKey, EncryptedField, Event, FieldEncoding, FieldValue, FingerprintTemplate,
    NewCheckIn, NewEvent, NewSession, NewUser, OfflineDevice, Registration, Session,
    StoredTemplate, TableCounts, User, UserPatch,
};
pub use types::{
    CheckInId, DeviceRowId, DeviceUuid, EventId, FallbackId, RegistrationId, SessionId, UserId,
};
