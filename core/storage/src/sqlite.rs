//! SQLite-backed store.
//!
//! A single connection is shared behind a mutex; a transaction holds the
//! connection for its whole lifetime and is opened with `BEGIN IMMEDIATE`
//! so writers never upgrade from a read lock mid-transaction.

use chrono::{DateTime, Utc};
use rusqlite::{ffi, params, Connection, ErrorCode, Row, ToSql};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use rollcall_common::{
    CheckIn, CheckInId, CheckInKey, DeviceRowId, DeviceUuid, Error, Event, EventId, FallbackId,
    FieldEncoding, NewCheckIn, NewEvent, NewSession, NewUser, OfflineDevice, Registration,
    RegistrationId, Result, Session, SessionId, StoredTemplate, TableCounts, User, UserId,
    UserPatch,
};

use crate::store::{Store, Transaction};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        external_auth_id TEXT UNIQUE,
        name TEXT NOT NULL,
        phone TEXT UNIQUE,
        email TEXT UNIQUE,
        fallback_id TEXT NOT NULL UNIQUE,
        fingerprint_template_1 TEXT,
        fingerprint_template_1_encoding TEXT,
        fingerprint_template_2 TEXT,
        fingerprint_template_2_encoding TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TRIGGER IF NOT EXISTS users_fallback_id_immutable
    BEFORE UPDATE OF fallback_id ON users
    WHEN NEW.fallback_id IS NOT OLD.fallback_id
    BEGIN
        SELECT RAISE(ABORT, 'fallback_id is immutable');
    END;

    CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        start_date TEXT NOT NULL,
        end_date TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id INTEGER NOT NULL REFERENCES events(id),
        name TEXT NOT NULL,
        start_time TEXT NOT NULL,
        end_time TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS registrations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id),
        event_id INTEGER NOT NULL REFERENCES events(id),
        registration_date TEXT NOT NULL,
        UNIQUE (user_id, event_id)
    );

    CREATE TABLE IF NOT EXISTS check_ins (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id),
        session_id INTEGER NOT NULL REFERENCES sessions(id),
        event_id INTEGER NOT NULL REFERENCES events(id),
        check_in_time TEXT NOT NULL,
        device_id TEXT,
        local_id TEXT,
        is_synced INTEGER NOT NULL DEFAULT 0,
        created_at_local TEXT,
        method TEXT
    );

    CREATE UNIQUE INDEX IF NOT EXISTS uq_check_in_upload
        ON check_ins (user_id, session_id, device_id, local_id, created_at_local);
    CREATE INDEX IF NOT EXISTS idx_check_ins_session ON check_ins (session_id);

    CREATE TABLE IF NOT EXISTS offline_devices (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_uuid TEXT NOT NULL UNIQUE,
        name TEXT,
        last_seen TEXT NOT NULL,
        last_sync_time TEXT
    );
"#;

const USER_COLUMNS: &str = "id, external_auth_id, name, phone, email, fallback_id, \
     fingerprint_template_1, fingerprint_template_1_encoding, \
     fingerprint_template_2, fingerprint_template_2_encoding, created_at, updated_at";

const CHECK_IN_COLUMNS: &str = "id, user_id, session_id, event_id, check_in_time, device_id, \
     local_id, is_synced, created_at_local, method";

/// Map a SQLite error onto the store error kinds.
fn sql_err(err: rusqlite::Error) -> Error {
    if let rusqlite::Error::SqliteFailure(failure, message) = &err {
        if failure.code == ErrorCode::ConstraintViolation {
            let detail = message.clone().unwrap_or_else(|| err.to_string());
            return match failure.extended_code {
                ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                    Error::Conflict(detail)
                }
                ffi::SQLITE_CONSTRAINT_FOREIGNKEY => Error::NotFound(detail),
                _ => Error::Validation(detail),
            };
        }
    }
    Error::Storage(err.to_string())
}

fn optional<T>(result: rusqlite::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(sql_err(e)),
    }
}

fn template_columns(field: &Option<StoredTemplate>) -> (Option<&str>, Option<&'static str>) {
    match field {
        Some(field) => (Some(field.stored()), Some(field.encoding().as_str())),
        None => (None, None),
    }
}

fn template_from_columns(
    stored: Option<String>,
    encoding: Option<String>,
) -> Result<Option<StoredTemplate>> {
    match stored {
        None => Ok(None),
        Some(stored) => {
            let encoding = match encoding {
                Some(encoding) => FieldEncoding::parse(&encoding)?,
                None => FieldEncoding::Encrypted,
            };
            Ok(Some(StoredTemplate::from_stored(encoding, stored)))
        }
    }
}

struct UserRow {
    id: i64,
    external_auth_id: Option<String>,
    name: String,
    phone: Option<String>,
    email: Option<String>,
    fallback_id: String,
    template_1: Option<String>,
    template_1_encoding: Option<String>,
    template_2: Option<String>,
    template_2_encoding: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl UserRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            external_auth_id: row.get(1)?,
            name: row.get(2)?,
            phone: row.get(3)?,
            email: row.get(4)?,
            fallback_id: row.get(5)?,
            template_1: row.get(6)?,
            template_1_encoding: row.get(7)?,
            template_2: row.get(8)?,
            template_2_encoding: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_user(self) -> Result<User> {
        let fallback_id = Uuid::parse_str(&self.fallback_id)
            .map(FallbackId::from_uuid)
            .map_err(|e| Error::Storage(format!("Corrupt fallback id for user {}: {e}", self.id)))?;
        Ok(User {
            id: UserId(self.id),
            external_auth_id: self.external_auth_id,
            name: self.name,
            phone: self.phone,
            email: self.email,
            fallback_id,
            fingerprint_template_1: template_from_columns(
                self.template_1,
                self.template_1_encoding,
            )?,
            fingerprint_template_2: template_from_columns(
                self.template_2,
                self.template_2_encoding,
            )?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct CheckInRow {
    id: i64,
    user_id: i64,
    session_id: i64,
    event_id: i64,
    check_in_time: DateTime<Utc>,
    device_id: Option<String>,
    local_id: Option<String>,
    is_synced: bool,
    created_at_local: Option<DateTime<Utc>>,
    method: Option<String>,
}

impl CheckInRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            session_id: row.get(2)?,
            event_id: row.get(3)?,
            check_in_time: row.get(4)?,
            device_id: row.get(5)?,
            local_id: row.get(6)?,
            is_synced: row.get::<_, i32>(7)? != 0,
            created_at_local: row.get(8)?,
            method: row.get(9)?,
        })
    }

    fn into_check_in(self) -> Result<CheckIn> {
        Ok(CheckIn {
            id: CheckInId(self.id),
            user_id: UserId(self.user_id),
            session_id: SessionId(self.session_id),
            event_id: EventId(self.event_id),
            check_in_time: self.check_in_time,
            device_id: self.device_id.map(DeviceUuid::new).transpose()?,
            local_id: self.local_id,
            is_synced: self.is_synced,
            created_at_local: self.created_at_local,
            method: self.method,
        })
    }
}

struct DeviceRow {
    id: i64,
    device_uuid: String,
    name: Option<String>,
    last_seen: DateTime<Utc>,
    last_sync_time: Option<DateTime<Utc>>,
}

impl DeviceRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            device_uuid: row.get(1)?,
            name: row.get(2)?,
            last_seen: row.get(3)?,
            last_sync_time: row.get(4)?,
        })
    }

    fn into_device(self) -> Result<OfflineDevice> {
        Ok(OfflineDevice {
            id: DeviceRowId(self.id),
            device_uuid: DeviceUuid::new(self.device_uuid)?,
            name: self.name,
            last_seen: self.last_seen,
            last_sync_time: self.last_sync_time,
        })
    }
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: EventId(row.get(0)?),
        name: row.get(1)?,
        start_date: row.get(2)?,
        end_date: row.get(3)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: SessionId(row.get(0)?),
        event_id: EventId(row.get(1)?),
        name: row.get(2)?,
        start_time: row.get(3)?,
        end_time: row.get(4)?,
    })
}

fn registration_from_row(row: &Row<'_>) -> rusqlite::Result<Registration> {
    Ok(Registration {
        id: RegistrationId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        event_id: EventId(row.get(2)?),
        registration_date: row.get(3)?,
    })
}

/// Store backed by a SQLite database file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database and apply the schema.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        let conn = Connection::open(db_path).map_err(sql_err)?;
        let store = Self::with_connection(conn)?;
        info!("SQLite store opened at {}", db_path.display());
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(sql_err)?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5)).map_err(sql_err)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(sql_err)?;
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl Store for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn begin(&self) -> Result<Box<dyn Transaction + '_>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| Error::Storage("sqlite connection lock poisoned".to_string()))?;
        conn.execute_batch("BEGIN IMMEDIATE").map_err(sql_err)?;
        Ok(Box::new(SqliteTransaction {
            conn,
            finished: false,
        }))
    }

    fn ping(&self) -> Result<()> {
        match self.conn.try_lock() {
            Ok(conn) => conn
                .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map(|_| ())
                .map_err(sql_err),
            // Held by a running transaction.
            Err(TryLockError::WouldBlock) => Ok(()),
            Err(TryLockError::Poisoned(_)) => Err(Error::Storage(
                "sqlite connection lock poisoned".to_string(),
            )),
        }
    }
}

struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl SqliteTransaction<'_> {
    fn query_user(&self, clause: &str, param: &dyn ToSql) -> Result<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {clause}");
        let row = optional(self.conn.query_row(&sql, [param], UserRow::from_row))?;
        row.map(UserRow::into_user).transpose()
    }

    fn require_user(&self, id: UserId) -> Result<User> {
        self.user(id)?
            .ok_or_else(|| Error::NotFound(format!("user {id}")))
    }

    fn require_device(&self, device_uuid: &DeviceUuid) -> Result<OfflineDevice> {
        self.device(device_uuid)?
            .ok_or_else(|| Error::NotFound(format!("device {device_uuid}")))
    }

    fn last_id(&self) -> i64 {
        self.conn.last_insert_rowid()
    }
}

impl Transaction for SqliteTransaction<'_> {
    fn user(&self, id: UserId) -> Result<Option<User>> {
        self.query_user("id = ?1", &id.get())
    }

    fn user_by_phone(&self, phone: &str) -> Result<Option<User>> {
        self.query_user("phone = ?1", &phone)
    }

    fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.query_user("email = ?1", &email)
    }

    fn user_by_fallback_id(&self, fallback_id: FallbackId) -> Result<Option<User>> {
        self.query_user("fallback_id = ?1", &fallback_id.to_string())
    }

    fn insert_user(&mut self, user: NewUser) -> Result<User> {
        let now = Utc::now();
        let (t1, e1) = template_columns(&user.fingerprint_template_1);
        let (t2, e2) = template_columns(&user.fingerprint_template_2);
        self.conn
            .execute(
                &format!(
                    "INSERT INTO users ({USER_COLUMNS}) \
                     VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)"
                ),
                params![
                    user.external_auth_id,
                    user.name,
                    user.phone,
                    user.email,
                    user.fallback_id.to_string(),
                    t1,
                    e1,
                    t2,
                    e2,
                    now,
                ],
            )
            .map_err(sql_err)?;
        let id = UserId(self.last_id());
        debug!("Inserted user {}", id);
        self.require_user(id)
    }

    fn update_user(&mut self, id: UserId, patch: UserPatch) -> Result<User> {
        let mut user = self.require_user(id)?;
        if let Some(phone) = patch.phone {
            user.phone = Some(phone);
        }
        if let Some(email) = patch.email {
            user.email = Some(email);
        }
        if let Some(template) = patch.fingerprint_template_1 {
            user.fingerprint_template_1 = Some(template);
        }
        if let Some(template) = patch.fingerprint_template_2 {
            user.fingerprint_template_2 = Some(template);
        }
        let (t1, e1) = template_columns(&user.fingerprint_template_1);
        let (t2, e2) = template_columns(&user.fingerprint_template_2);
        self.conn
            .execute(
                "UPDATE users SET phone = ?2, email = ?3, \
                 fingerprint_template_1 = ?4, fingerprint_template_1_encoding = ?5, \
                 fingerprint_template_2 = ?6, fingerprint_template_2_encoding = ?7, \
                 updated_at = ?8 WHERE id = ?1",
                params![id.get(), user.phone, user.email, t1, e1, t2, e2, Utc::now()],
            )
            .map_err(sql_err)?;
        self.require_user(id)
    }

    fn event(&self, id: EventId) -> Result<Option<Event>> {
        optional(self.conn.query_row(
            "SELECT id, name, start_date, end_date FROM events WHERE id = ?1",
            [id.get()],
            event_from_row,
        ))
    }

    fn events(&self) -> Result<Vec<Event>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, start_date, end_date FROM events ORDER BY start_date, id")
            .map_err(sql_err)?;
        let rows = stmt.query_map([], event_from_row).map_err(sql_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
    }

    fn insert_event(&mut self, event: NewEvent) -> Result<Event> {
        self.conn
            .execute(
                "INSERT INTO events (name, start_date, end_date) VALUES (?1, ?2, ?3)",
                params![event.name, event.start_date, event.end_date],
            )
            .map_err(sql_err)?;
        Ok(Event {
            id: EventId(self.last_id()),
            name: event.name,
            start_date: event.start_date,
            end_date: event.end_date,
        })
    }

    fn session(&self, id: SessionId) -> Result<Option<Session>> {
        optional(self.conn.query_row(
            "SELECT id, event_id, name, start_time, end_time FROM sessions WHERE id = ?1",
            [id.get()],
            session_from_row,
        ))
    }

    fn sessions_for_event(&self, event_id: EventId) -> Result<Vec<Session>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, event_id, name, start_time, end_time FROM sessions \
                 WHERE event_id = ?1 ORDER BY start_time, id",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([event_id.get()], session_from_row)
            .map_err(sql_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
    }

    fn insert_session(&mut self, session: NewSession) -> Result<Session> {
        self.conn
            .execute(
                "INSERT INTO sessions (event_id, name, start_time, end_time) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    session.event_id.get(),
                    session.name,
                    session.start_time,
                    session.end_time
                ],
            )
            .map_err(|e| match sql_err(e) {
                Error::NotFound(_) => Error::NotFound(format!("event {}", session.event_id)),
                other => other,
            })?;
        Ok(Session {
            id: SessionId(self.last_id()),
            event_id: session.event_id,
            name: session.name,
            start_time: session.start_time,
            end_time: session.end_time,
        })
    }

    fn registration(&self, user_id: UserId, event_id: EventId) -> Result<Option<Registration>> {
        optional(self.conn.query_row(
            "SELECT id, user_id, event_id, registration_date FROM registrations \
             WHERE user_id = ?1 AND event_id = ?2",
            [user_id.get(), event_id.get()],
            registration_from_row,
        ))
    }

    fn insert_registration(
        &mut self,
        user_id: UserId,
        event_id: EventId,
    ) -> Result<Registration> {
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO registrations (user_id, event_id, registration_date) \
                 VALUES (?1, ?2, ?3)",
                params![user_id.get(), event_id.get(), now],
            )
            .map_err(sql_err)?;
        Ok(Registration {
            id: RegistrationId(self.last_id()),
            user_id,
            event_id,
            registration_date: now,
        })
    }

    fn check_in_by_key(&self, key: &CheckInKey) -> Result<Option<CheckIn>> {
        let sql = format!(
            "SELECT {CHECK_IN_COLUMNS} FROM check_ins \
             WHERE user_id = ?1 AND session_id = ?2 AND device_id IS ?3 \
             AND local_id IS ?4 AND created_at_local IS ?5 \
             ORDER BY id LIMIT 1"
        );
        let row = optional(self.conn.query_row(
            &sql,
            params![
                key.user_id.get(),
                key.session_id.get(),
                key.device_id.as_ref().map(DeviceUuid::as_str),
                key.local_id,
                key.created_at_local,
            ],
            CheckInRow::from_row,
        ))?;
        row.map(CheckInRow::into_check_in).transpose()
    }

    fn check_ins_for_session(&self, session_id: SessionId) -> Result<Vec<CheckIn>> {
        let sql = format!(
            "SELECT {CHECK_IN_COLUMNS} FROM check_ins WHERE session_id = ?1 ORDER BY id"
        );
        let mut stmt = self.conn.prepare(&sql).map_err(sql_err)?;
        let rows = stmt
            .query_map([session_id.get()], CheckInRow::from_row)
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        rows.into_iter().map(CheckInRow::into_check_in).collect()
    }

    fn insert_check_in(&mut self, check_in: NewCheckIn) -> Result<CheckIn> {
        let now = Utc::now();
        self.conn
            .execute(
                &format!(
                    "INSERT INTO check_ins ({CHECK_IN_COLUMNS}) \
                     VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    check_in.user_id.get(),
                    check_in.session_id.get(),
                    check_in.event_id.get(),
                    now,
                    check_in.device_id.as_ref().map(DeviceUuid::as_str),
                    check_in.local_id,
                    check_in.is_synced as i32,
                    check_in.created_at_local,
                    check_in.method,
                ],
            )
            .map_err(sql_err)?;
        Ok(CheckIn {
            id: CheckInId(self.last_id()),
            user_id: check_in.user_id,
            session_id: check_in.session_id,
            event_id: check_in.event_id,
            check_in_time: now,
            device_id: check_in.device_id,
            local_id: check_in.local_id,
            is_synced: check_in.is_synced,
            created_at_local: check_in.created_at_local,
            method: check_in.method,
        })
    }

    fn device(&self, device_uuid: &DeviceUuid) -> Result<Option<OfflineDevice>> {
        let row = optional(self.conn.query_row(
            "SELECT id, device_uuid, name, last_seen, last_sync_time FROM offline_devices \
             WHERE device_uuid = ?1",
            [device_uuid.as_str()],
            DeviceRow::from_row,
        ))?;
        row.map(DeviceRow::into_device).transpose()
    }

    fn touch_device(
        &mut self,
        device_uuid: &DeviceUuid,
        name: Option<&str>,
        seen_at: DateTime<Utc>,
    ) -> Result<OfflineDevice> {
        let updated = self
            .conn
            .execute(
                "UPDATE offline_devices SET name = COALESCE(?2, name), last_seen = ?3 \
                 WHERE device_uuid = ?1",
                params![device_uuid.as_str(), name, seen_at],
            )
            .map_err(sql_err)?;
        if updated == 0 {
            debug!("Registering new device {}", device_uuid);
            self.conn
                .execute(
                    "INSERT INTO offline_devices (device_uuid, name, last_seen) \
                     VALUES (?1, ?2, ?3)",
                    params![device_uuid.as_str(), name, seen_at],
                )
                .map_err(sql_err)?;
        }
        self.require_device(device_uuid)
    }

    fn mark_device_synced(
        &mut self,
        device_uuid: &DeviceUuid,
        synced_at: DateTime<Utc>,
    ) -> Result<OfflineDevice> {
        let updated = self
            .conn
            .execute(
                "UPDATE offline_devices SET last_sync_time = ?2 WHERE device_uuid = ?1",
                params![device_uuid.as_str(), synced_at],
            )
            .map_err(sql_err)?;
        if updated == 0 {
            return Err(Error::NotFound(format!("device {device_uuid}")));
        }
        self.require_device(device_uuid)
    }

    fn counts(&self) -> Result<TableCounts> {
        self.conn
            .query_row(
                "SELECT (SELECT COUNT(*) FROM users), (SELECT COUNT(*) FROM events), \
                 (SELECT COUNT(*) FROM sessions), (SELECT COUNT(*) FROM registrations), \
                 (SELECT COUNT(*) FROM check_ins), (SELECT COUNT(*) FROM offline_devices)",
                [],
                |row| {
                    Ok(TableCounts {
                        users: row.get::<_, i64>(0)? as u64,
                        events: row.get::<_, i64>(1)? as u64,
                        sessions: row.get::<_, i64>(2)? as u64,
                        registrations: row.get::<_, i64>(3)? as u64,
                        check_ins: row.get::<_, i64>(4)? as u64,
                        offline_devices: row.get::<_, i64>(5)? as u64,
                    })
                },
            )
            .map_err(sql_err)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.conn.execute_batch("COMMIT").map_err(sql_err)?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!("Failed to roll back transaction: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::with_transaction;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    fn new_user(name: &str, phone: Option<&str>, email: Option<&str>) -> NewUser {
        NewUser {
            external_auth_id: None,
            name: name.to_string(),
            phone: phone.map(str::to_string),
            email: email.map(str::to_string),
            fallback_id: FallbackId::generate(),
            fingerprint_template_1: None,
            fingerprint_template_2: None,
        }
    }

    fn seed_event(store: &SqliteStore) -> (Event, Session) {
        with_transaction(store, |tx| {
            let now = Utc::now();
            let event = tx.insert_event(NewEvent {
                name: "Summit".to_string(),
                start_date: now,
                end_date: now + ChronoDuration::hours(8),
            })?;
            let session = tx.insert_session(NewSession {
                event_id: event.id,
                name: "Keynote".to_string(),
                start_time: now,
                end_time: now + ChronoDuration::hours(1),
            })?;
            Ok((event, session))
        })
        .unwrap()
    }

    #[test]
    fn test_open_file_and_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("rollcall.db");

        let store = SqliteStore::open(&path).unwrap();
        let user = with_transaction(&store, |tx| {
            tx.insert_user(new_user("Ada", Some("+1"), Some("ada@example.com")))
        })
        .unwrap();
        drop(store);

        let reopened = SqliteStore::open(&path).unwrap();
        let tx = reopened.begin().unwrap();
        let found = tx.user_by_email("ada@example.com").unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert_eq!(found.fallback_id, user.fallback_id);
    }

    #[test]
    fn test_ping_does_not_wait_for_writers() {
        let store = SqliteStore::in_memory().unwrap();
        store.ping().unwrap();

        let tx = store.begin().unwrap();
        store.ping().unwrap();
        drop(tx);
        store.ping().unwrap();
    }

    #[test]
    fn test_templates_keep_encoding() {
        let store = SqliteStore::in_memory().unwrap();
        let mut user = new_user("Ada", None, None);
        user.fingerprint_template_1 = Some(StoredTemplate::from_stored(
            FieldEncoding::Encrypted,
            "c2VhbGVk",
        ));
        user.fingerprint_template_2 = Some(StoredTemplate::from_stored(
            FieldEncoding::Plaintext,
            "raw-template",
        ));

        let stored = with_transaction(&store, |tx| tx.insert_user(user)).unwrap();
        let t1 = stored.fingerprint_template_1.unwrap();
        let t2 = stored.fingerprint_template_2.unwrap();
        assert_eq!(t1.encoding(), FieldEncoding::Encrypted);
        assert_eq!(t1.stored(), "c2VhbGVk");
        assert!(t2.is_plaintext());
    }

    #[test]
    fn test_unique_phone_is_conflict() {
        let store = SqliteStore::in_memory().unwrap();
        with_transaction(&store, |tx| tx.insert_user(new_user("Ada", Some("+1"), None))).unwrap();
        let err = with_transaction(&store, |tx| tx.insert_user(new_user("Bob", Some("+1"), None)))
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let store = SqliteStore::in_memory().unwrap();
        let result: Result<()> = with_transaction(&store, |tx| {
            tx.insert_user(new_user("Ada", Some("+1"), None))?;
            tx.insert_user(new_user("Bob", Some("+1"), None))?;
            Ok(())
        });
        assert!(result.is_err());

        let tx = store.begin().unwrap();
        assert_eq!(tx.counts().unwrap().users, 0);
    }

    #[test]
    fn test_fallback_id_cannot_be_rewritten() {
        let store = SqliteStore::in_memory().unwrap();
        let user =
            with_transaction(&store, |tx| tx.insert_user(new_user("Ada", None, None))).unwrap();
        let conn = store.conn.lock().unwrap();
        let result = conn.execute(
            "UPDATE users SET fallback_id = ?1 WHERE id = ?2",
            params![FallbackId::generate().to_string(), user.id.get()],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_session_requires_event() {
        let store = SqliteStore::in_memory().unwrap();
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

    #[test]
    fn test_check_in_upload_key() {
        let store = SqliteStore::in_memory().unwrap();
        let (event, session) = seed_event(&store);
        let user =
            with_transaction(&store, |tx| tx.insert_user(new_user("Ada", None, None))).unwrap();
        let check_in = NewCheckIn {
            user_id: user.id,
            session_id: session.id,
            event_id: event.id,
            device_id: Some(DeviceUuid::new("tablet-1").unwrap()),
            local_id: Some("c-1".to_string()),
            is_synced: true,
            created_at_local: Some(Utc::now()),
            method: Some("fingerprint".to_string()),
        };

        let stored =
            with_transaction(&store, |tx| tx.insert_check_in(check_in.clone())).unwrap();
        {
            let tx = store.begin().unwrap();
            let found = tx.check_in_by_key(&check_in.key()).unwrap().unwrap();
            assert_eq!(found.id, stored.id);
            assert!(found.is_synced);
        }

        let err =
            with_transaction(&store, |tx| tx.insert_check_in(check_in.clone())).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_online_check_ins_are_not_deduplicated() {
        let store = SqliteStore::in_memory().unwrap();
        let (event, session) = seed_event(&store);
        let user =
            with_transaction(&store, |tx| tx.insert_user(new_user("Ada", None, None))).unwrap();
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
    fn test_registration_unique() {
        let store = SqliteStore::in_memory().unwrap();
        let (event, _) = seed_event(&store);
        let user =
            with_transaction(&store, |tx| tx.insert_user(new_user("Ada", None, None))).unwrap();

        with_transaction(&store, |tx| tx.insert_registration(user.id, event.id)).unwrap();
        let err = with_transaction(&store, |tx| tx.insert_registration(user.id, event.id))
            .unwrap_err();
        assert!(err.is_conflict());

        let tx = store.begin().unwrap();
        assert!(tx.registration(user.id, event.id).unwrap().is_some());
    }

    #[test]
    fn test_device_lifecycle() {
        let store = SqliteStore::in_memory().unwrap();
        let device = DeviceUuid::new("tablet-9").unwrap();
        let seen = Utc::now();

        let created =
            with_transaction(&store, |tx| tx.touch_device(&device, Some("Gate A"), seen)).unwrap();
        assert!(created.last_sync_time.is_none());

        let touched = with_transaction(&store, |tx| tx.touch_device(&device, None, seen)).unwrap();
        assert_eq!(touched.id, created.id);
        assert_eq!(touched.name.as_deref(), Some("Gate A"));

        let synced =
            with_transaction(&store, |tx| tx.mark_device_synced(&device, Utc::now())).unwrap();
        assert!(synced.last_sync_time.is_some());

        let unknown = DeviceUuid::new("ghost").unwrap();
        let err = with_transaction(&store, |tx| tx.mark_device_synced(&unknown, Utc::now()))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
