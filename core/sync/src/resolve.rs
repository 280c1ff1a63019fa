//! Per-record resolution shared by the reconciler and the online desk.
//!
//! Each record is validated once, then resolved and written inside a
//! single store transaction. A transaction that loses a unique-constraint
//! race is re-run from scratch, so the second pass sees the winner's row
//! and reports it as already existing.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use rollcall_common::types::{
    check_len, normalize_email, normalize_phone, require_text, MAX_EMAIL_LEN,
    MAX_EXTERNAL_AUTH_ID_LEN, MAX_LOCAL_ID_LEN, MAX_METHOD_LEN, MAX_NAME_LEN, MAX_PHONE_LEN,
};
use rollcall_common::{
    CheckIn, DeviceUuid, Error, Event, EventId, FallbackId, FingerprintTemplate, NewCheckIn,
    NewUser, Registration, Result, Session, SessionId, StoredTemplate, User, UserId, UserPatch,
};
use rollcall_crypto::FieldCipher;
use rollcall_notify::CheckInNotice;
use rollcall_storage::{with_transaction, Store, Transaction};

use crate::protocol::{CheckInResult, NewRegistration, RecordStatus, RegistrationResult};
use crate::reconciler::ReconcileConfig;

/// Warning attached to a registration whose templates were stored
/// without encryption.
pub const PLAINTEXT_TEMPLATE_WARNING: &str = "template_stored_unencrypted";

/// A user reference that can be looked up in the store.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Subject {
    Id(UserId),
    Fallback(FallbackId),
}

/// A registration that passed validation. Templates are sealed only
/// once it is known they will be stored.
#[derive(Debug)]
struct PreparedRegistration {
    name: String,
    phone: Option<String>,
    email: Option<String>,
    external_auth_id: Option<String>,
    fallback_id: Option<FallbackId>,
    event_id: Option<EventId>,
    template_1: Option<FingerprintTemplate>,
    template_2: Option<FingerprintTemplate>,
}

/// A check-in that passed validation.
#[derive(Debug, Clone)]
pub(crate) struct PreparedCheckIn {
    pub subject: Subject,
    pub session_id: SessionId,
    pub event_id: EventId,
    pub device_id: Option<DeviceUuid>,
    pub local_id: Option<String>,
    pub created_at_local: Option<DateTime<Utc>>,
    pub method: Option<String>,
    pub is_synced: bool,
}

/// What happened to a registration.
#[derive(Debug)]
pub(crate) struct RegistrationOutcome {
    pub user: User,
    pub registration: Option<Registration>,
    pub created: bool,
    pub warnings: Vec<String>,
}

impl RegistrationOutcome {
    pub fn into_result(self, local_id: Option<String>) -> RegistrationResult {
        RegistrationResult {
            local_id,
            status: RecordStatus::resolved(self.created),
            user_id: Some(self.user.id),
            fallback_id: Some(self.user.fallback_id),
            registration_id: self.registration.map(|r| r.id),
            warnings: self.warnings,
        }
    }
}

/// What happened to a check-in. `notice` is set only for new rows.
#[derive(Debug)]
pub(crate) struct CheckInOutcome {
    pub check_in: CheckIn,
    pub created: bool,
    pub notice: Option<CheckInNotice>,
}

impl CheckInOutcome {
    pub fn to_result(&self, local_id: Option<String>) -> CheckInResult {
        CheckInResult {
            local_id,
            status: RecordStatus::resolved(self.created),
            check_in_id: Some(self.check_in.id),
            user_id: Some(self.check_in.user_id),
            warnings: Vec::new(),
        }
    }
}

/// Resolves single records against the store.
pub(crate) struct Resolver {
    store: Arc<dyn Store>,
    cipher: Arc<FieldCipher>,
    config: ReconcileConfig,
}

impl Resolver {
    pub fn new(store: Arc<dyn Store>, cipher: Arc<FieldCipher>, config: ReconcileConfig) -> Self {
        Self {
            store,
            cipher,
            config,
        }
    }

    /// Validate and resolve one registration.
    pub fn register(&self, registration: &NewRegistration) -> Result<RegistrationOutcome> {
        let prepared = self.prepare_registration(registration)?;
        self.retrying(|tx| self.resolve_registration(tx, &prepared))
    }

    /// Resolve one validated check-in.
    pub fn check_in(&self, check_in: &PreparedCheckIn) -> Result<CheckInOutcome> {
        self.retrying(|tx| resolve_check_in(tx, check_in))
    }

    /// Run `op` in a transaction, re-running it when it loses a
    /// unique-constraint race.
    pub fn retrying<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(&mut dyn Transaction) -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            match with_transaction(&*self.store, &mut op) {
                Err(e) if e.is_conflict() && attempt < self.config.max_conflict_retries => {
                    attempt += 1;
                    debug!("Conflict on attempt {}, re-resolving: {}", attempt, e);
                }
                other => return other,
            }
        }
    }

    fn prepare_registration(
        &self,
        registration: &NewRegistration,
    ) -> Result<PreparedRegistration> {
        let name = require_text("name", &registration.name, MAX_NAME_LEN)?;

        let phone = registration.phone.as_deref().and_then(normalize_phone);
        if let Some(phone) = &phone {
            check_len("phone", phone, MAX_PHONE_LEN)?;
        }

        let email = registration.email.as_deref().and_then(normalize_email);
        if let Some(email) = &email {
            check_len("email", email, MAX_EMAIL_LEN)?;
            if !email.contains('@') {
                return Err(Error::Validation(format!("email {email:?} is not an address")));
            }
        }

        let external_auth_id = optional_text(registration.external_auth_id.as_deref());
        if let Some(id) = &external_auth_id {
            check_len("external_auth_id", id, MAX_EXTERNAL_AUTH_ID_LEN)?;
        }

        let fallback_id = optional_text(registration.fallback_id.as_deref())
            .map(|id| id.parse::<FallbackId>())
            .transpose()?;

        let template = |t: &Option<FingerprintTemplate>| t.clone().filter(|t| !t.is_empty());

        Ok(PreparedRegistration {
            name,
            phone,
            email,
            external_auth_id,
            fallback_id,
            event_id: registration.event_id,
            template_1: template(&registration.fingerprint_template_1),
            template_2: template(&registration.fingerprint_template_2),
        })
    }

    fn seal_template(
        &self,
        template: Option<&FingerprintTemplate>,
        warnings: &mut Vec<String>,
    ) -> Result<Option<StoredTemplate>> {
        let Some(template) = template else {
            return Ok(None);
        };
        if !self.config.allow_plaintext_templates {
            return self.cipher.seal(template).map(Some);
        }
        let field = self.cipher.seal_or_plaintext(template)?;
        if field.is_plaintext() && !warnings.iter().any(|w| w == PLAINTEXT_TEMPLATE_WARNING) {
            warnings.push(PLAINTEXT_TEMPLATE_WARNING.to_string());
        }
        Ok(Some(field))
    }

    /// Fields the server lacks and no other user holds. Templates are
    /// sealed only for the slots the user is missing.
    fn merge_patch(
        &self,
        tx: &dyn Transaction,
        user: &User,
        prepared: &PreparedRegistration,
        warnings: &mut Vec<String>,
    ) -> Result<UserPatch> {
        let mut patch = UserPatch::default();
        if user.phone.is_none() {
            if let Some(phone) = &prepared.phone {
                if tx.user_by_phone(phone)?.is_none() {
                    patch.phone = Some(phone.clone());
                }
            }
        }
        if user.email.is_none() {
            if let Some(email) = &prepared.email {
                if tx.user_by_email(email)?.is_none() {
                    patch.email = Some(email.clone());
                }
            }
        }
        if user.fingerprint_template_1.is_none() {
            patch.fingerprint_template_1 =
                self.seal_template(prepared.template_1.as_ref(), warnings)?;
        }
        if user.fingerprint_template_2.is_none() {
            patch.fingerprint_template_2 =
                self.seal_template(prepared.template_2.as_ref(), warnings)?;
        }
        Ok(patch)
    }

    fn resolve_registration(
        &self,
        tx: &mut dyn Transaction,
        prepared: &PreparedRegistration,
    ) -> Result<RegistrationOutcome> {
        let mut warnings = Vec::new();
        let (user, created) = match find_existing(tx, prepared)? {
            Some(user) => {
                let patch = self.merge_patch(tx, &user, prepared, &mut warnings)?;
                let user = if patch.is_empty() {
                    user
                } else {
                    debug!("Merging submitted contact fields into user {}", user.id);
                    tx.update_user(user.id, patch)?
                };
                (user, false)
            }
            None => {
                let user = tx.insert_user(NewUser {
                    external_auth_id: prepared.external_auth_id.clone(),
                    name: prepared.name.clone(),
                    phone: prepared.phone.clone(),
                    email: prepared.email.clone(),
                    fallback_id: FallbackId::generate(),
                    fingerprint_template_1: self
                        .seal_template(prepared.template_1.as_ref(), &mut warnings)?,
                    fingerprint_template_2: self
                        .seal_template(prepared.template_2.as_ref(), &mut warnings)?,
                })?;
                debug!("Created user {}", user.id);
                (user, true)
            }
        };

        let registration = match prepared.event_id {
            Some(event_id) => Some(ensure_registration(tx, user.id, event_id)?),
            None => None,
        };

        Ok(RegistrationOutcome {
            user,
            registration,
            created,
            warnings,
        })
    }
}

fn optional_text(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

/// Validate an optional device-local id.
pub(crate) fn check_local_id(local_id: Option<&str>) -> Result<Option<String>> {
    let local_id = optional_text(local_id);
    if let Some(id) = &local_id {
        check_len("local_id", id, MAX_LOCAL_ID_LEN)?;
    }
    Ok(local_id)
}

/// Validate an optional check-in method tag.
pub(crate) fn check_method(method: Option<&str>) -> Result<Option<String>> {
    let method = optional_text(method);
    if let Some(m) = &method {
        check_len("method", m, MAX_METHOD_LEN)?;
    }
    Ok(method)
}

fn find_existing(tx: &dyn Transaction, prepared: &PreparedRegistration) -> Result<Option<User>> {
    if let Some(phone) = &prepared.phone {
        if let Some(user) = tx.user_by_phone(phone)? {
            return Ok(Some(user));
        }
    }
    if let Some(email) = &prepared.email {
        if let Some(user) = tx.user_by_email(email)? {
            return Ok(Some(user));
        }
    }
    if let Some(fallback_id) = prepared.fallback_id {
        return tx.user_by_fallback_id(fallback_id);
    }
    Ok(None)
}

fn ensure_registration(
    tx: &mut dyn Transaction,
    user_id: UserId,
    event_id: EventId,
) -> Result<Registration> {
    if tx.event(event_id)?.is_none() {
        return Err(Error::NotFound(format!("event {event_id}")));
    }
    match tx.registration(user_id, event_id)? {
        Some(registration) => Ok(registration),
        None => tx.insert_registration(user_id, event_id),
    }
}

fn load_user(tx: &dyn Transaction, subject: Subject) -> Result<User> {
    match subject {
        Subject::Id(id) => tx
            .user(id)?
            .ok_or_else(|| Error::NotFound(format!("user {id}"))),
        Subject::Fallback(fallback_id) => tx
            .user_by_fallback_id(fallback_id)?
            .ok_or_else(|| Error::NotFound(format!("user with fallback id {fallback_id}"))),
    }
}

fn load_session(
    tx: &dyn Transaction,
    session_id: SessionId,
    event_id: EventId,
) -> Result<(Session, Event)> {
    let session = tx
        .session(session_id)?
        .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
    let event = tx
        .event(event_id)?
        .ok_or_else(|| Error::NotFound(format!("event {event_id}")))?;
    if session.event_id != event.id {
        return Err(Error::Validation(format!(
            "session {} does not belong to event {}",
            session.id, event.id
        )));
    }
    Ok((session, event))
}

fn resolve_check_in(
    tx: &mut dyn Transaction,
    prepared: &PreparedCheckIn,
) -> Result<CheckInOutcome> {
    let user = load_user(tx, prepared.subject)?;
    let (session, event) = load_session(tx, prepared.session_id, prepared.event_id)?;

    let new = NewCheckIn {
        user_id: user.id,
        session_id: session.id,
        event_id: event.id,
        device_id: prepared.device_id.clone(),
        local_id: prepared.local_id.clone(),
        is_synced: prepared.is_synced,
        created_at_local: prepared.created_at_local,
        method: prepared.method.clone(),
    };

    let key = new.key();
    let dedupe =
        key.device_id.is_some() && key.local_id.is_some() && key.created_at_local.is_some();
    if dedupe {
        if let Some(existing) = tx.check_in_by_key(&key)? {
            return Ok(CheckInOutcome {
                check_in: existing,
                created: false,
                notice: None,
            });
        }
    }

    let check_in = tx.insert_check_in(new)?;
    let notice = CheckInNotice::new(user, session, event, &check_in);
    Ok(CheckInOutcome {
        check_in,
        created: true,
        notice: Some(notice),
    })
}
