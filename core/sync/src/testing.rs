//! Test doubles shared by the reconciler and online desk tests.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use rollcall_common::{Error, Event, NewEvent, NewSession, Result, Session};
use rollcall_crypto::{FieldCipher, FieldKey, Unavailable};
use rollcall_notify::{CheckInNotice, CheckInNotifier};
use rollcall_storage::{with_transaction, MemoryStore, Store, Transaction};

use crate::{OnlineDesk, ReconcileConfig, Reconciler};

/// Notifier that records every notice it is handed.
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    notices: Mutex<Vec<CheckInNotice>>,
    fail: bool,
    stall: Option<StdDuration>,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Records the notice, then hangs for a long time before answering.
    pub fn stalled() -> Self {
        Self {
            stall: Some(StdDuration::from_secs(30)),
            ..Self::default()
        }
    }

    pub fn notices(&self) -> Vec<CheckInNotice> {
        self.notices.lock().unwrap().clone()
    }

    /// Wait until at least `count` notices arrived from background delivery.
    pub async fn wait_for(&self, count: usize) -> Vec<CheckInNotice> {
        for _ in 0..200 {
            let notices = self.notices();
            if notices.len() >= count {
                return notices;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        self.notices()
    }
}

#[async_trait]
impl CheckInNotifier for RecordingNotifier {
    async fn notify_checkin(&self, notice: &CheckInNotice) -> Result<()> {
        self.notices.lock().unwrap().push(notice.clone());
        if let Some(stall) = self.stall {
            tokio::time::sleep(stall).await;
        }
        if self.fail {
            Err(Error::Network("gateway unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

type Race = Box<dyn FnOnce(&MemoryStore) + Send>;

/// Store that lets a competing writer commit right after the n-th
/// transaction takes its snapshot.
pub(crate) struct RacingStore {
    inner: MemoryStore,
    begins: AtomicUsize,
    fire_on: usize,
    race: Mutex<Option<Race>>,
}

impl RacingStore {
    pub fn new(
        inner: MemoryStore,
        fire_on: usize,
        race: impl FnOnce(&MemoryStore) + Send + 'static,
    ) -> Self {
        Self {
            inner,
            begins: AtomicUsize::new(0),
            fire_on,
            race: Mutex::new(Some(Box::new(race))),
        }
    }
}

impl Store for RacingStore {
    fn name(&self) -> &str {
        "racing-memory"
    }

    fn begin(&self) -> Result<Box<dyn Transaction + '_>> {
        let tx = self.inner.begin()?;
        let n = self.begins.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fire_on {
            if let Some(race) = self.race.lock().unwrap().take() {
                race(&self.inner);
            }
        }
        Ok(tx)
    }

    fn ping(&self) -> Result<()> {
        self.inner.ping()
    }
}

/// A store seeded with one event holding one session, plus a second
/// event with its own session.
pub(crate) struct Fixture {
    pub store: MemoryStore,
    pub notifier: Arc<RecordingNotifier>,
    pub event: Event,
    pub session: Session,
    pub other_session: Session,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_notifier(RecordingNotifier::default())
    }

    pub fn with_notifier(notifier: RecordingNotifier) -> Self {
        let store = MemoryStore::new();
        let (event, session, other_session) = with_transaction(&store, |tx| {
            let now = Utc::now();
            let event = tx.insert_event(NewEvent {
                name: "DevFest Nairobi".to_string(),
                start_date: now,
                end_date: now + Duration::hours(10),
            })?;
            let session = tx.insert_session(NewSession {
                event_id: event.id,
                name: "Keynote".to_string(),
                start_time: now,
                end_time: now + Duration::hours(1),
            })?;
            let other = tx.insert_event(NewEvent {
                name: "Meetup".to_string(),
                start_date: now,
                end_date: now + Duration::hours(2),
            })?;
            let other_session = tx.insert_session(NewSession {
                event_id: other.id,
                name: "Lightning talks".to_string(),
                start_time: now,
                end_time: now + Duration::hours(1),
            })?;
            Ok((event, session, other_session))
        })
        .unwrap();

        Self {
            store,
            notifier: Arc::new(notifier),
            event,
            session,
            other_session,
        }
    }

    pub fn reconciler(&self) -> Reconciler {
        self.reconciler_with(keyed_cipher(), ReconcileConfig::default())
    }

    pub fn reconciler_with(&self, cipher: FieldCipher, config: ReconcileConfig) -> Reconciler {
        self.reconciler_over(Arc::new(self.store.clone()), cipher, config)
    }

    pub fn reconciler_over(
        &self,
        store: Arc<dyn Store>,
        cipher: FieldCipher,
        config: ReconcileConfig,
    ) -> Reconciler {
        Reconciler::new(store, self.notifier.clone(), Arc::new(cipher), config)
    }

    pub fn desk(&self) -> OnlineDesk {
        OnlineDesk::new(
            Arc::new(self.store.clone()),
            self.notifier.clone(),
            Arc::new(keyed_cipher()),
            ReconcileConfig::default(),
        )
    }

    /// Open a read transaction on the fixture store.
    pub fn read(&self) -> Box<dyn Transaction + '_> {
        self.store.begin().unwrap()
    }
}

pub(crate) fn keyed_cipher() -> FieldCipher {
    FieldCipher::new(FieldKey::generate())
}

pub(crate) fn keyless_cipher() -> FieldCipher {
    FieldCipher::unavailable(Unavailable::MissingKey)
}
