//! Online desk: registration and check-in for connected clients.

use std::sync::Arc;
use tracing::info;

use rollcall_common::{Error, Result};
use rollcall_crypto::FieldCipher;
use rollcall_notify::CheckInNotifier;
use rollcall_storage::Store;

use crate::protocol::{CheckInResult, NewRegistration, OnlineCheckIn, RegistrationResult, UserRef};
use crate::reconciler::{dispatch_notices, ReconcileConfig};
use crate::resolve::{check_method, PreparedCheckIn, Resolver, Subject};

/// Handles single registrations and check-ins as they happen.
///
/// Resolution matches the reconciler's, but errors are returned to the
/// caller and check-ins are recorded as online (`is_synced = false`, no
/// device).
pub struct OnlineDesk {
    resolver: Resolver,
    notifier: Arc<dyn CheckInNotifier>,
}

impl OnlineDesk {
    /// Create a desk over its collaborators.
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn CheckInNotifier>,
        cipher: Arc<FieldCipher>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            resolver: Resolver::new(store, cipher, config),
            notifier,
        }
    }

    /// Register an attendee, or find the one they already are.
    ///
    /// # Errors
    /// - `Validation` for malformed fields
    /// - `NotFound` if `event_id` names no event
    /// - `CryptoUnavailable` if templates cannot be sealed and plaintext
    ///   storage is disabled
    pub async fn register(&self, registration: NewRegistration) -> Result<RegistrationResult> {
        let outcome = self.resolver.register(&registration)?;
        info!(
            "Online registration for user {} ({})",
            outcome.user.id,
            if outcome.created { "new" } else { "existing" }
        );
        Ok(outcome.into_result(registration.local_id))
    }

    /// Record a check-in and notify the attendee.
    ///
    /// # Errors
    /// - `Validation` for a batch-local user reference or a session that
    ///   does not belong to the event
    /// - `NotFound` if the user, session or event does not exist
    pub async fn check_in(&self, check_in: OnlineCheckIn) -> Result<CheckInResult> {
        let subject = match check_in.user_ref {
            UserRef::ServerId(id) => Subject::Id(id),
            UserRef::FallbackId(fallback_id) => Subject::Fallback(fallback_id),
            UserRef::LocalId(_) => {
                return Err(Error::Validation(
                    "local_id user references are only valid inside a sync batch".to_string(),
                ))
            }
        };
        let prepared = PreparedCheckIn {
            subject,
            session_id: check_in.session_id,
            event_id: check_in.event_id,
            device_id: None,
            local_id: None,
            created_at_local: None,
            method: check_method(check_in.method.as_deref())?,
            is_synced: false,
        };

        let mut outcome = self.resolver.check_in(&prepared)?;
        info!(
            "Online check-in {} for user {} at session {}",
            outcome.check_in.id, outcome.check_in.user_id, outcome.check_in.session_id
        );

        // Detached.
        drop(dispatch_notices(
            &self.notifier,
            outcome.notice.take().into_iter().collect(),
        ));
        Ok(outcome.to_result(None))
    }
}
