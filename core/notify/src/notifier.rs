//! Notifier trait and the check-in notice it delivers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use rollcall_common::{CheckIn, Event, Result, Session, User};

/// Everything a channel needs to confirm one check-in.
#[derive(Debug, Clone)]
pub struct CheckInNotice {
    pub user: User,
    pub session: Session,
    pub event: Event,
    pub check_in_time: DateTime<Utc>,
}

impl CheckInNotice {
    /// Build a notice for a stored check-in.
    pub fn new(user: User, session: Session, event: Event, check_in: &CheckIn) -> Self {
        Self {
            user,
            session,
            event,
            check_in_time: check_in.check_in_time,
        }
    }
}

/// Sends check-in confirmations.
///
/// Delivery is best-effort: callers log a returned error and move on.
#[async_trait]
pub trait CheckInNotifier: Send + Sync {
    /// Notify the attendee of a new check-in.
    async fn notify_checkin(&self, notice: &CheckInNotice) -> Result<()>;
}

/// Notifier that sends nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl CheckInNotifier for NoopNotifier {
    async fn notify_checkin(&self, _notice: &CheckInNotice) -> Result<()> {
        Ok(())
    }
}
