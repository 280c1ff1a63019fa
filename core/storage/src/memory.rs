//! In-memory store for testing and development.
//!
//! Transactions are optimistic: each one works on a private copy of the
//! tables and re-validates its writes against the live tables at commit,
//! so two transactions racing for the same unique value, or updating the
//! same row, end with exactly one winner and one `Error::Conflict`.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use rollcall_common::{
    CheckIn, CheckInId, CheckInKey, DeviceRowId, DeviceUuid, Error, Event, EventId, FallbackId,
    NewCheckIn, NewEvent, NewSession, NewUser, OfflineDevice, Registration, RegistrationId,
    Result, Session, SessionId, TableCounts, User, UserId, UserPatch,
};

use crate::store::{Store, Transaction};

#[derive(Debug, Clone, Default)]
struct Tables {
    users: BTreeMap<UserId, User>,
    events: BTreeMap<EventId, Event>,
    sessions: BTreeMap<SessionId, Session>,
    registrations: BTreeMap<RegistrationId, Registration>,
    check_ins: BTreeMap<CheckInId, CheckIn>,
    devices: BTreeMap<DeviceRowId, OfflineDevice>,
}

/// A row written by a transaction, keyed by its own id.
#[derive(Debug, Clone)]
enum Write {
    User(User),
    Event(Event),
    Session(Session),
    Registration(Registration),
    CheckIn(CheckIn),
    Device(OfflineDevice),
}

fn same<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a == b)
}

impl Write {
    fn label(&self) -> String {
        match self {
            Write::User(row) => format!("user {}", row.id),
            Write::Event(row) => format!("event {}", row.id),
            Write::Session(row) => format!("session {}", row.id),
            Write::Registration(row) => format!("registration {}", row.id),
            Write::CheckIn(row) => format!("check-in {}", row.id),
            Write::Device(row) => format!("device {}", row.device_uuid),
        }
    }
}

impl Tables {
    /// Whether the row a write targets is the same here and in `other`.
    fn same_row(&self, other: &Tables, write: &Write) -> bool {
        match write {
            Write::User(row) => self.users.get(&row.id) == other.users.get(&row.id),
            Write::Event(row) => self.events.get(&row.id) == other.events.get(&row.id),
            Write::Session(row) => self.sessions.get(&row.id) == other.sessions.get(&row.id),
            Write::Registration(row) => {
                self.registrations.get(&row.id) == other.registrations.get(&row.id)
            }
            Write::CheckIn(row) => self.check_ins.get(&row.id) == other.check_ins.get(&row.id),
            Write::Device(row) => self.devices.get(&row.id) == other.devices.get(&row.id),
        }
    }

    /// Check a row against the unique constraints of its table.
    fn check(&self, write: &Write) -> Result<()> {
        match write {
            Write::User(user) => {
                for other in self.users.values().filter(|u| u.id != user.id) {
                    if same(&other.phone, &user.phone) {
                        return Err(Error::Conflict("phone already registered".to_string()));
                    }
                    if same(&other.email, &user.email) {
                        return Err(Error::Conflict("email already registered".to_string()));
                    }
                    if same(&other.external_auth_id, &user.external_auth_id) {
                        return Err(Error::Conflict(
                            "external auth id already registered".to_string(),
                        ));
                    }
                    if other.fallback_id == user.fallback_id {
                        return Err(Error::Conflict("fallback id already in use".to_string()));
                    }
                }
                Ok(())
            }
            Write::Registration(reg) => {
                let taken = self.registrations.values().any(|r| {
                    r.id != reg.id && r.user_id == reg.user_id && r.event_id == reg.event_id
                });
                if taken {
                    return Err(Error::Conflict(format!(
                        "user {} already registered for event {}",
                        reg.user_id, reg.event_id
                    )));
                }
                Ok(())
            }
            Write::CheckIn(check_in) => {
                let key = check_in.key();
                let enforced = key.device_id.is_some()
                    && key.local_id.is_some()
                    && key.created_at_local.is_some();
                if enforced
                    && self
                        .check_ins
                        .values()
                        .any(|c| c.id != check_in.id && c.key() == key)
                {
                    return Err(Error::Conflict("check-in already uploaded".to_string()));
                }
                Ok(())
            }
            Write::Device(device) => {
                let taken = self
                    .devices
                    .values()
                    .any(|d| d.id != device.id && d.device_uuid == device.device_uuid);
                if taken {
                    return Err(Error::Conflict(format!(
                        "device {} already registered",
                        device.device_uuid
                    )));
                }
                Ok(())
            }
            Write::Event(_) | Write::Session(_) => Ok(()),
        }
    }

    fn apply(&mut self, write: Write) {
        match write {
            Write::User(row) => {
                self.users.insert(row.id, row);
            }
            Write::Event(row) => {
                self.events.insert(row.id, row);
            }
            Write::Session(row) => {
                self.sessions.insert(row.id, row);
            }
            Write::Registration(row) => {
                self.registrations.insert(row.id, row);
            }
            Write::CheckIn(row) => {
                self.check_ins.insert(row.id, row);
            }
            Write::Device(row) => {
                self.devices.insert(row.id, row);
            }
        }
    }
}

/// In-memory store.
///
/// Useful for tests and development. All data is lost on drop; clones
/// share the same tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    next_id: Arc<AtomicI64>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Store for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn begin(&self) -> Result<Box<dyn Transaction + '_>> {
        let base = self.lock()?.clone();
        Ok(Box::new(MemoryTransaction {
            store: self,
            work: base.clone(),
            base,
            writes: Vec::new(),
        }))
    }

    fn ping(&self) -> Result<()> {
        self.lock().map(|_| ())
    }
}

struct MemoryTransaction<'a> {
    store: &'a MemoryStore,
    /// Tables as they were when the transaction began.
    base: Tables,
    work: Tables,
    writes: Vec<Write>,
}

impl MemoryTransaction<'_> {
    fn write(&mut self, write: Write) -> Result<()> {
        self.work.check(&write)?;
        self.work.apply(write.clone());
        self.writes.push(write);
        Ok(())
    }

    fn device_mut(&self, device_uuid: &DeviceUuid) -> Option<OfflineDevice> {
        self.work
            .devices
            .values()
            .find(|d| &d.device_uuid == device_uuid)
            .cloned()
    }
}

impl Transaction for MemoryTransaction<'_> {
    fn user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.work.users.get(&id).cloned())
    }

    fn user_by_phone(&self, phone: &str) -> Result<Option<User>> {
        Ok(self
            .work
            .users
            .values()
            .find(|u| u.phone.as_deref() == Some(phone))
            .cloned())
    }

    fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self
            .work
            .users
            .values()
            .find(|u| u.email.as_deref() == Some(email))
            .cloned())
    }

    fn user_by_fallback_id(&self, fallback_id: FallbackId) -> Result<Option<User>> {
        Ok(self
            .work
            .users
            .values()
            .find(|u| u.fallback_id == fallback_id)
            .cloned())
    }

    fn insert_user(&mut self, user: NewUser) -> Result<User> {
        let now = Utc::now();
        let row = User {
            id: UserId(self.store.next_id()),
            external_auth_id: user.external_auth_id,
            name: user.name,
            phone: user.phone,
            email: user.email,
            fallback_id: user.fallback_id,
            fingerprint_template_1: user.fingerprint_template_1,
            fingerprint_template_2: user.fingerprint_template_2,
            created_at: now,
            updated_at: now,
        };
        self.write(Write::User(row.clone()))?;
        Ok(row)
    }

    fn update_user(&mut self, id: UserId, patch: UserPatch) -> Result<User> {
        let mut row = self
            .work
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("user {id}")))?;
        if let Some(phone) = patch.phone {
            row.phone = Some(phone);
        }
        if let Some(email) = patch.email {
            row.email = Some(email);
        }
        if let Some(template) = patch.fingerprint_template_1 {
            row.fingerprint_template_1 = Some(template);
        }
        if let Some(template) = patch.fingerprint_template_2 {
            row.fingerprint_template_2 = Some(template);
        }
        row.updated_at = Utc::now();
        self.write(Write::User(row.clone()))?;
        Ok(row)
    }

    fn event(&self, id: EventId) -> Result<Option<Event>> {
        Ok(self.work.events.get(&id).cloned())
    }

    fn events(&self) -> Result<Vec<Event>> {
        Ok(self.work.events.values().cloned().collect())
    }

    fn insert_event(&mut self, event: NewEvent) -> Result<Event> {
        let row = Event {
            id: EventId(self.store.next_id()),
            name: event.name,
            start_date: event.start_date,
            end_date: event.end_date,
        };
        self.write(Write::Event(row.clone()))?;
        Ok(row)
    }

    fn session(&self, id: SessionId) -> Result<Option<Session>> {
        Ok(self.work.sessions.get(&id).cloned())
    }

    fn sessions_for_event(&self, event_id: EventId) -> Result<Vec<Session>> {
        Ok(self
            .work
            .sessions
            .values()
            .filter(|s| s.event_id == event_id)
            .cloned()
            .collect())
    }

    fn insert_session(&mut self, session: NewSession) -> Result<Session> {
        if !self.work.events.contains_key(&session.event_id) {
            return Err(Error::NotFound(format!("event {}", session.event_id)));
        }
        let row = Session {
            id: SessionId(self.store.next_id()),
            event_id: session.event_id,
            name: session.name,
            start_time: session.start_time,
            end_time: session.end_time,
        };
        self.write(Write::Session(row.clone()))?;
        Ok(row)
    }

    fn registration(&self, user_id: UserId, event_id: EventId) -> Result<Option<Registration>> {
        Ok(self
            .work
            .registrations
            .values()
            .find(|r| r.user_id == user_id && r.event_id == event_id)
            .cloned())
    }

    fn insert_registration(
        &mut self,
        user_id: UserId,
        event_id: EventId,
    ) -> Result<Registration> {
        if !self.work.users.contains_key(&user_id) {
            return Err(Error::NotFound(format!("user {user_id}")));
        }
        if !self.work.events.contains_key(&event_id) {
            return Err(Error::NotFound(format!("event {event_id}")));
        }
        let row = Registration {
            id: RegistrationId(self.store.next_id()),
            user_id,
            event_id,
            registration_date: Utc::now(),
        };
        self.write(Write::Registration(row.clone()))?;
        Ok(row)
    }

    fn check_in_by_key(&self, key: &CheckInKey) -> Result<Option<CheckIn>> {
        Ok(self
            .work
            .check_ins
            .values()
            .find(|c| &c.key() == key)
            .cloned())
    }

    fn check_ins_for_session(&self, session_id: SessionId) -> Result<Vec<CheckIn>> {
        Ok(self
            .work
            .check_ins
            .values()
            .filter(|c| c.session_id == session_id)
            .cloned()
            .collect())
    }

    fn insert_check_in(&mut self, check_in: NewCheckIn) -> Result<CheckIn> {
        if !self.work.users.contains_key(&check_in.user_id) {
            return Err(Error::NotFound(format!("user {}", check_in.user_id)));
        }
        if !self.work.sessions.contains_key(&check_in.session_id) {
            return Err(Error::NotFound(format!("session {}", check_in.session_id)));
        }
        let row = CheckIn {
            id: CheckInId(self.store.next_id()),
            user_id: check_in.user_id,
            session_id: check_in.session_id,
            event_id: check_in.event_id,
            check_in_time: Utc::now(),
            device_id: check_in.device_id,
            local_id: check_in.local_id,
            is_synced: check_in.is_synced,
            created_at_local: check_in.created_at_local,
            method: check_in.method,
        };
        self.write(Write::CheckIn(row.clone()))?;
        Ok(row)
    }

    fn device(&self, device_uuid: &DeviceUuid) -> Result<Option<OfflineDevice>> {
        Ok(self.device_mut(device_uuid))
    }

    fn touch_device(
        &mut self,
        device_uuid: &DeviceUuid,
        name: Option<&str>,
        seen_at: DateTime<Utc>,
    ) -> Result<OfflineDevice> {
        let row = match self.device_mut(device_uuid) {
            Some(mut device) => {
                if let Some(name) = name {
                    device.name = Some(name.to_string());
                }
                device.last_seen = seen_at;
                device
            }
            None => {
                debug!("Registering new device {}", device_uuid);
                OfflineDevice {
                    id: DeviceRowId(self.store.next_id()),
                    device_uuid: device_uuid.clone(),
                    name: name.map(str::to_string),
                    last_seen: seen_at,
                    last_sync_time: None,
                }
            }
        };
        self.write(Write::Device(row.clone()))?;
        Ok(row)
    }

    fn mark_device_synced(
        &mut self,
        device_uuid: &DeviceUuid,
        synced_at: DateTime<Utc>,
    ) -> Result<OfflineDevice> {
        let mut row = self
            .device_mut(device_uuid)
            .ok_or_else(|| Error::NotFound(format!("device {device_uuid}")))?;
        row.last_sync_time = Some(synced_at);
        self.write(Write::Device(row.clone()))?;
        Ok(row)
    }

    fn counts(&self) -> Result<TableCounts> {
        Ok(TableCounts {
            users: self.work.users.len() as u64,
            events: self.work.events.len() as u64,
            sessions: self.work.sessions.len() as u64,
            registrations: self.work.registrations.len() as u64,
            check_ins: self.work.check_ins.len() as u64,
            offline_devices: self.work.devices.len() as u64,
        })
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let mut live = self.store.lock()?;
        let mut next = live.clone();
        for write in self.writes {
            if !live.same_row(&self.base, &write) {
                return Err(Error::Conflict(format!(
                    "{} was changed by a concurrent transaction",
                    write.label()
                )));
            }
            next.check(&write)?;
            next.apply(write);
        }
        *live = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::with_transaction;
    use chrono::Duration;

    fn new_user(name: &str, phone: Option<&str>) -> NewUser {
        NewUser {
            external_auth_id: None,
            name: name.to_string(),
            phone: phone.map(str::to_string),
            email: None,
            fallback_id: FallbackId::generate(),
            fingerprint_template_1: None,
            fingerprint_template_2: None,
        }
    }

    fn seed_event(store: &MemoryStore) -> (Event, Session) {
        with_transaction(store, |tx| {
            let now = Utc::now();
            let event = tx.insert_event(NewEvent {
                name: "Summit".to_string(),
                start_date: now,
                end_date: now + Duration::hours(8),
            })?;
            let session = tx.insert_session(NewSession {
                event_id: event.id,
                name: "Keynote".to_string(),
                start_time: now,
                end_time: now + Duration::hours(1),
            })?;
            Ok((event, session))
        })
        .unwrap()
    }

    #[test]
    fn test_insert_and_lookup_user() {
        let store = MemoryStore::new();
        let user = with_transaction(&store, |tx| {
            tx.insert_user(new_user("Ada", Some("+254700000001")))
        })
        .unwrap();

        let tx = store.begin().unwrap();
        let found = tx.user_by_phone("+254700000001").unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert_eq!(
            tx.user_by_fallback_id(user.fallback_id).unwrap().unwrap().id,
            user.id
        );
    }

    #[test]
    fn test_uncommitted_writes_are_discarded() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().unwrap();
            tx.insert_user(new_user("Ada", Some("+1"))).unwrap();
        }
        let tx = store.begin().unwrap();
        assert_eq!(tx.counts().unwrap().users, 0);
    }

    #[test]
    fn test_duplicate_phone_in_same_transaction() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        tx.insert_user(new_user("Ada", Some("+1"))).unwrap();
        let err = tx.insert_user(new_user("Bob", Some("+1"))).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_racing_commits_have_one_winner() {
        let store = MemoryStore::new();
        let mut first = store.begin().unwrap();
        let mut second = store.begin().unwrap();

        first.insert_user(new_user("Ada", Some("+1"))).unwrap();
        second.insert_user(new_user("Ada again", Some("+1"))).unwrap();

        first.commit().unwrap();
        let err = second.commit().unwrap_err();
        assert!(err.is_conflict());

        let tx = store.begin().unwrap();
        assert_eq!(tx.counts().unwrap().users, 1);
    }

    #[test]
    fn test_registration_unique_per_user_event() {
        let store = MemoryStore::new();
        let (event, _) = seed_event(&store);
        let user = with_transaction(&store, |tx| tx.insert_user(new_user("Ada", None))).unwrap();

        with_transaction(&store, |tx| tx.insert_registration(user.id, event.id)).unwrap();
        let err = with_transaction(&store, |tx| tx.insert_registration(user.id, event.id))
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_update_user_keeps_fallback_id() {
        let store = MemoryStore::new();
        let user = with_transaction(&store, |tx| tx.insert_user(new_user("Ada", None))).unwrap();
        let updated = with_transaction(&store, |tx| {
            tx.update_user(
                user.id,
                UserPatch {
                    email: Some("ada@example.com".to_string()),
                    ..Default::default()
                },
            )
        })
        .unwrap();
        assert_eq!(updated.fallback_id, user.fallback_id);
        assert_eq!(updated.email.as_deref(), Some("ada@example.com"));
    }

    #[test]
    fn test_overlapping_updates_do_not_lose_writes() {
        let store = MemoryStore::new();
        let user = with_transaction(&store, |tx| tx.insert_user(new_user("Ada", None))).unwrap();

        let mut first = store.begin().unwrap();
        let mut second = store.begin().unwrap();
        first
            .update_user(
                user.id,
                UserPatch {
                    email: Some("ada@example.com".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        second
            .update_user(
                user.id,
                UserPatch {
                    phone: Some("+1".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        first.commit().unwrap();
        let err = second.commit().unwrap_err();
        assert!(err.is_conflict());

        let tx = store.begin().unwrap();
        let stored = tx.user(user.id).unwrap().unwrap();
        assert_eq!(stored.email.as_deref(), Some("ada@example.com"));
        assert!(stored.phone.is_none());
    }

    #[test]
    fn test_ping_while_transaction_open() {
        let store = MemoryStore::new();
        let _tx = store.begin().unwrap();
        store.ping().unwrap();
    }

    #[test]
    fn test_check_in_upload_key() {
        let store = MemoryStore::new();
        let (event, session) = seed_event(&store);
        let user = with_transaction(&store, |tx| tx.insert_user(new_user("Ada", None))).unwrap();
        let device = DeviceUuid::new("tablet-1").unwrap();
        let check_in = NewCheckIn {
            user_id: user.id,
            session_id: session.id,
            event_id: event.id,
            device_id: Some(device),
            local_id: Some("c-1".to_string()),
            is_synced: true,
            created_at_local: Some(Utc::now()),
            method: Some("qr".to_string()),
        };

        let stored =
            with_transaction(&store, |tx| tx.insert_check_in(check_in.clone())).unwrap();
        let tx = store.begin().unwrap();
        assert_eq!(tx.check_in_by_key(&check_in.key()).unwrap(), Some(stored));
        drop(tx);

        let err =
            with_transaction(&store, |tx| tx.insert_check_in(check_in.clone())).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_online_check_ins_are_not_deduplicated() {
        let store = MemoryStore::new();
        let (event, session) = seed_event(&store);
        let user = with_transaction(&store, |tx| tx.insert_user(new_user("Ada", None))).unwrap();
        let check_in = NewCheckIn {
            user_id: user.id,
            session_id: session.id,
            event_id: event.id,
            device_id: None,
            local_id: None,
            is_synced: false,
            created_at_local: None,
            method: None,
        };

        with_transaction(&store, |tx| tx.insert_check_in(check_in.clone())).unwrap();
        with_transaction(&store, |tx| tx.insert_check_in(check_in.clone())).unwrap();

        let tx = store.begin().unwrap();
        assert_eq!(tx.check_ins_for_session(session.id).unwrap().len(), 2);
    }

    #[test]
    fn test_touch_and_sync_device() {
        let store = MemoryStore::new();
        let device = DeviceUuid::new("tablet-9").unwrap();
        let first_seen = Utc::now();

        let created = with_transaction(&store, |tx| {
            tx.touch_device(&device, Some("Gate A"), first_seen)
        })
        .unwrap();
        assert!(created.last_sync_time.is_none());

        let touched = with_transaction(&store, |tx| {
            tx.touch_device(&device, None, first_seen + Duration::minutes(5))
        })
        .unwrap();
        assert_eq!(touched.id, created.id);
        assert_eq!(touched.name.as_deref(), Some("Gate A"));

        let synced = with_transaction(&store, |tx| tx.mark_device_synced(&device, Utc::now()))
            .unwrap();
        assert!(synced.last_sync_time.is_some());

        let tx = store.begin().unwrap();
        assert_eq!(tx.counts().unwrap().offline_devices, 1);
    }

    #[test]
    fn test_session_requires_event() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let err = with_transaction(&store, |tx| {
            tx.insert_session(NewSession {
                event_id: EventId(404),
                name: "Ghost".to_string(),
                start_time: now,
                end_time: now,
            })
        })
        .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
