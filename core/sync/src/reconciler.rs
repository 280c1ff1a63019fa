//! Offline sync reconciler.
//!
//! Merges a batch recorded by a disconnected field device into the central
//! store. Registrations are resolved first, in batch order, so check-ins
//! in the same batch can name their attendee by the registration's local
//! id. Every record commits or fails on its own; a failing record is
//! reported as rejected and the rest of the batch carries on. Check-in
//! confirmations are sent in the background once the batch is resolved.

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rollcall_common::types::{check_len, MAX_NAME_LEN};
use rollcall_common::{DeviceUuid, Error, ErrorKind, FallbackId, Result, UserId};
use rollcall_crypto::FieldCipher;
use rollcall_notify::{CheckInNotice, CheckInNotifier};
use rollcall_storage::Store;

use crate::protocol::{
    BatchEntry, CheckInRecord, CheckInResult, NewRegistration, RegistrationResult, SyncRequest,
    SyncResponse, UserRef,
};
use crate::resolve::{check_local_id, check_method, PreparedCheckIn, Resolver, Subject};

/// Reconciler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// How many times a record that lost a unique-constraint race is
    /// re-resolved before it is rejected.
    pub max_conflict_retries: u32,
    /// Store templates flagged as plaintext when no key is configured.
    /// When false such registrations are rejected instead.
    pub allow_plaintext_templates: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
            allow_plaintext_templates: true,
        }
    }
}

/// Reconciles device uploads against the store.
pub struct Reconciler {
    resolver: Resolver,
    notifier: Arc<dyn CheckInNotifier>,
    /// Notification deliveries that may still be running.
    deliveries: Mutex<Vec<JoinHandle<()>>>,
}

impl Reconciler {
    /// Create a reconciler over its collaborators.
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn CheckInNotifier>,
        cipher: Arc<FieldCipher>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            resolver: Resolver::new(store, cipher, config),
            notifier,
            deliveries: Mutex::new(Vec::new()),
        }
    }

    /// Wait for every notification delivery started so far.
    ///
    /// A short-lived process calls this before exiting; the server never
    /// needs to.
    pub async fn finish_notifications(&self) {
        let pending = match self.deliveries.lock() {
            Ok(mut deliveries) => std::mem::take(&mut *deliveries),
            Err(_) => return,
        };
        for delivery in pending {
            if let Err(e) = delivery.await {
                warn!("Notification delivery task failed: {}", e);
            }
        }
    }

    /// Reconcile one upload.
    ///
    /// # Errors
    /// - `Validation` if `device_id` is missing or blank
    /// - Store errors while registering the device or recording the sync
    ///
    /// Failures of individual records never surface here; they are
    /// reported per record in the response.
    pub async fn reconcile(&self, request: SyncRequest) -> Result<SyncResponse> {
        let device = DeviceUuid::new(request.device_id.as_deref().unwrap_or_default())?;
        let device_name = request
            .device_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty());
        if let Some(name) = device_name {
            check_len("device_name", name, MAX_NAME_LEN)?;
        }

        self.resolver
            .retrying(|tx| tx.touch_device(&device, device_name, Utc::now()))?;
        info!(
            "Sync from device {}: {} registrations, {} check-ins",
            device,
            request.new_registrations.len(),
            request.check_ins.len()
        );

        let mut batch = Batch::default();
        let registrations = request
            .new_registrations
            .iter()
            .map(|registration| self.registration(&mut batch, registration))
            .collect::<Vec<_>>();

        let mut notices = Vec::new();
        let check_ins = request
            .check_ins
            .iter()
            .map(|record| self.check_in(&mut batch, &device, record, &mut notices))
            .collect::<Vec<_>>();

        let last_sync_time = Utc::now();
        self.resolver
            .retrying(|tx| tx.mark_device_synced(&device, last_sync_time))?;

        if let Some(delivery) = dispatch_notices(&self.notifier, notices) {
            if let Ok(mut deliveries) = self.deliveries.lock() {
                deliveries.retain(|d| !d.is_finished());
                deliveries.push(delivery);
            }
        }

        let rejected = registrations.iter().filter(|r| r.status.is_rejected()).count()
            + check_ins.iter().filter(|c| c.status.is_rejected()).count();
        info!(
            "Sync from device {} complete: {} records, {} rejected",
            device,
            registrations.len() + check_ins.len(),
            rejected
        );

        Ok(SyncResponse {
            device_id: device,
            last_sync_time,
            registrations,
            check_ins,
        })
    }

    fn registration(
        &self,
        batch: &mut Batch,
        entry: &BatchEntry<NewRegistration>,
    ) -> RegistrationResult {
        let registration = match entry {
            BatchEntry::Parsed(registration) => registration,
            BatchEntry::Malformed { local_id, reason } => {
                warn!("Rejected registration {:?}: {}", local_id, reason);
                return RegistrationResult::rejected(
                    local_id.clone(),
                    ErrorKind::Validation,
                    reason.clone(),
                );
            }
        };
        let local_id = registration.local_id.clone();
        let outcome = batch
            .claim_registration(registration.local_id.as_deref())
            .and_then(|local_id| {
                let outcome = self.resolver.register(registration)?;
                batch
                    .local_users
                    .insert(local_id, (outcome.user.id, outcome.user.fallback_id));
                Ok(outcome)
            });

        match outcome {
            Ok(outcome) => outcome.into_result(local_id),
            Err(e) => {
                warn!("Rejected registration {:?}: {}", local_id, e);
                RegistrationResult::rejected(local_id, e.kind(), e.to_string())
            }
        }
    }

    fn check_in(
        &self,
        batch: &mut Batch,
        device: &DeviceUuid,
        entry: &BatchEntry<CheckInRecord>,
        notices: &mut Vec<CheckInNotice>,
    ) -> CheckInResult {
        let record = match entry {
            BatchEntry::Parsed(record) => record,
            BatchEntry::Malformed { local_id, reason } => {
                warn!("Rejected check-in {:?}: {}", local_id, reason);
                return CheckInResult::rejected(
                    local_id.clone(),
                    ErrorKind::Validation,
                    reason.clone(),
                );
            }
        };
        let local_id = record.local_id.clone();
        let outcome = batch
            .claim_check_in(record.local_id.as_deref())
            .and_then(|local_id| {
                let prepared = PreparedCheckIn {
                    subject: batch.subject(&record.user_ref)?,
                    session_id: record.session_id,
                    event_id: record.event_id,
                    device_id: Some(device.clone()),
                    local_id: Some(local_id),
                    created_at_local: Some(record.client_timestamp),
                    method: check_method(record.method.as_deref())?,
                    is_synced: true,
                };
                self.resolver.check_in(&prepared)
            });

        match outcome {
            Ok(mut outcome) => {
                if let Some(notice) = outcome.notice.take() {
                    notices.push(notice);
                }
                outcome.to_result(local_id)
            }
            Err(e) => {
                warn!("Rejected check-in {:?}: {}", local_id, e);
                CheckInResult::rejected(local_id, e.kind(), e.to_string())
            }
        }
    }
}

/// Send check-in confirmations in the background.
///
/// Delivery never delays the caller; failures are logged and dropped.
pub(crate) fn dispatch_notices(
    notifier: &Arc<dyn CheckInNotifier>,
    notices: Vec<CheckInNotice>,
) -> Option<JoinHandle<()>> {
    if notices.is_empty() {
        return None;
    }
    debug!("Dispatching {} check-in notifications", notices.len());
    let notifier = Arc::clone(notifier);
    Some(tokio::spawn(async move {
        let results = join_all(
            notices
                .iter()
                .map(|notice| notifier.notify_checkin(notice)),
        )
        .await;
        for (notice, result) in notices.iter().zip(results) {
            if let Err(e) = result {
                warn!(
                    "Check-in notification for user {} failed: {}",
                    notice.user.id, e
                );
            }
        }
    }))
}

/// Per-call bookkeeping for local ids.
#[derive(Default)]
struct Batch {
    registration_ids: HashSet<String>,
    check_in_ids: HashSet<String>,
    local_users: HashMap<String, (UserId, FallbackId)>,
}

impl Batch {
    fn claim_registration(&mut self, local_id: Option<&str>) -> Result<String> {
        claim(&mut self.registration_ids, local_id, "registration")
    }

    fn claim_check_in(&mut self, local_id: Option<&str>) -> Result<String> {
        claim(&mut self.check_in_ids, local_id, "check-in")
    }

    fn subject(&self, user_ref: &UserRef) -> Result<Subject> {
        match user_ref {
            UserRef::ServerId(id) => Ok(Subject::Id(*id)),
            UserRef::FallbackId(fallback_id) => Ok(Subject::Fallback(*fallback_id)),
            UserRef::LocalId(local_id) => self
                .local_users
                .get(local_id.trim())
                .map(|(id, _)| Subject::Id(*id))
                .ok_or_else(|| {
                    Error::NotFound(format!(
                        "no registration with local id {local_id:?} resolved in this batch"
                    ))
                }),
        }
    }
}

fn claim(seen: &mut HashSet<String>, local_id: Option<&str>, what: &str) -> Result<String> {
    let local_id = check_local_id(local_id)?
        .ok_or_else(|| Error::Validation(format!("{what} local_id is required")))?;
    if !seen.insert(local_id.clone()) {
        return Err(Error::Validation(format!(
            "duplicate {what} local_id {local_id:?} in batch"
        )));
    }
    Ok(local_id)
}
