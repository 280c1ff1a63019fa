//! Store and transaction trait definitions.

use chrono::{DateTime, Utc};

use rollcall_common::{
    CheckIn, CheckInKey, DeviceUuid, Event, EventId, FallbackId, NewCheckIn, NewEvent,
    NewSession, NewUser, OfflineDevice, Registration, Result, Session, SessionId, TableCounts,
    User, UserId, UserPatch,
};

/// Relational store holding the six check-in entities.
///
/// Every read and write goes through a [`Transaction`]. Implementations
/// enforce unique constraints on phone, email, fallback id, external auth
/// id, device uuid, (user, event) registrations and the offline check-in
/// upload key; a violation surfaces as `Error::Conflict`.
pub trait Store: Send + Sync {
    /// Get the backend name (e.g., "sqlite", "memory").
    fn name(&self) -> &str;

    /// Start a transaction.
    ///
    /// # Postconditions
    /// - Writes become visible to other transactions only after
    ///   [`Transaction::commit`] succeeds
    /// - Dropping the transaction without committing discards its writes
    fn begin(&self) -> Result<Box<dyn Transaction + '_>>;

    /// Check that the store is reachable without taking a write lock.
    fn ping(&self) -> Result<()>;
}

/// A unit of all-or-nothing work against a [`Store`].
pub trait Transaction {
    /// Get a user by id.
    fn user(&self, id: UserId) -> Result<Option<User>>;

    /// Get a user by normalized phone number.
    fn user_by_phone(&self, phone: &str) -> Result<Option<User>>;

    /// Get a user by normalized email address.
    fn user_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Get a user by fallback id.
    fn user_by_fallback_id(&self, fallback_id: FallbackId) -> Result<Option<User>>;

    /// Insert a user.
    ///
    /// # Errors
    /// - `Conflict` if phone, email, fallback id or external auth id is taken
    fn insert_user(&mut self, user: NewUser) -> Result<User>;

    /// Fill in contact or template fields of an existing user.
    ///
    /// Fields that are `None` in the patch are left untouched. The fallback
    /// id is never written.
    ///
    /// # Errors
    /// - `NotFound` if the user does not exist
    /// - `Conflict` if a patched phone or email is taken
    fn update_user(&mut self, id: UserId, patch: UserPatch) -> Result<User>;

    /// Get an event by id.
    fn event(&self, id: EventId) -> Result<Option<Event>>;

    /// List all events.
    fn events(&self) -> Result<Vec<Event>>;

    /// Insert an event.
    fn insert_event(&mut self, event: NewEvent) -> Result<Event>;

    /// Get a session by id.
    fn session(&self, id: SessionId) -> Result<Option<Session>>;

    /// List the sessions of an event.
    fn sessions_for_event(&self, event_id: EventId) -> Result<Vec<Session>>;

    /// Insert a session.
    ///
    /// # Errors
    /// - `NotFound` if the event does not exist
    fn insert_session(&mut self, session: NewSession) -> Result<Session>;

    /// Get the registration of a user for an event.
    fn registration(&self, user_id: UserId, event_id: EventId) -> Result<Option<Registration>>;

    /// Insert a registration.
    ///
    /// # Errors
    /// - `Conflict` if the (user, event) pair is already registered
    fn insert_registration(&mut self, user_id: UserId, event_id: EventId)
        -> Result<Registration>;

    /// Find a check-in by its upload key.
    fn check_in_by_key(&self, key: &CheckInKey) -> Result<Option<CheckIn>>;

    /// List the check-ins recorded for a session.
    fn check_ins_for_session(&self, session_id: SessionId) -> Result<Vec<CheckIn>>;

    /// Insert a check-in.
    ///
    /// # Errors
    /// - `Conflict` if an offline check-in with the same upload key exists
    fn insert_check_in(&mut self, check_in: NewCheckIn) -> Result<CheckIn>;

    /// Get a device by its uuid.
    fn device(&self, device_uuid: &DeviceUuid) -> Result<Option<OfflineDevice>>;

    /// Register a device on first contact, or refresh its last-seen time.
    ///
    /// A `name` of `None` keeps the stored name.
    fn touch_device(
        &mut self,
        device_uuid: &DeviceUuid,
        name: Option<&str>,
        seen_at: DateTime<Utc>,
    ) -> Result<OfflineDevice>;

    /// Record a completed sync for a device.
    ///
    /// # Errors
    /// - `NotFound` if the device was never touched
    fn mark_device_synced(
        &mut self,
        device_uuid: &DeviceUuid,
        synced_at: DateTime<Utc>,
    ) -> Result<OfflineDevice>;

    /// Count rows per table.
    fn counts(&self) -> Result<TableCounts>;

    /// Make every write of this transaction durable.
    ///
    /// # Errors
    /// - `Conflict` if a concurrent commit claimed a unique value first
    fn commit(self: Box<Self>) -> Result<()>;
}

/// Run `op` inside a transaction and commit it.
///
/// The transaction is rolled back if `op` or the commit fails.
pub fn with_transaction<T, F>(store: &dyn Store, op: F) -> Result<T>
where
    F: FnOnce(&mut dyn Transaction) -> Result<T>,
{
    let mut tx = store.begin()?;
    let value = op(&mut *tx)?;
    tx.commit()?;
    Ok(value)
}
