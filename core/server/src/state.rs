use std::sync::Arc;
use tracing::info;

use rollcall_common::Result;
use rollcall_crypto::FieldCipher;
use rollcall_notify::{CheckInNotifier, NotificationService};
use rollcall_storage::Store;
use rollcall_sync::{OnlineDesk, ReconcileConfig, Reconciler};

use super::config::ServerConfig;

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub cipher: Arc<FieldCipher>,
    pub reconciler: Reconciler,
    pub desk: OnlineDesk,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn CheckInNotifier>,
        cipher: Arc<FieldCipher>,
        config: ReconcileConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            reconciler: Reconciler::new(
                store.clone(),
                notifier.clone(),
                cipher.clone(),
                config.clone(),
            ),
            desk: OnlineDesk::new(store.clone(), notifier, cipher.clone(), config),
            store,
            cipher,
        })
    }

    /// Wire up the SQLite store, cipher and notification channels.
    pub fn from_config(config: &ServerConfig) -> Result<Arc<Self>> {
        let store = Arc::new(config.database.open()?);
        let cipher = Arc::new(config.cipher.cipher());
        let notifier = Arc::new(NotificationService::new(config.notify.notify_config())?);

        info!(
            "State initialized (store: {}, encryption: {})",
            store.name(),
            cipher.is_available()
        );
        Ok(Self::new(
            store,
            notifier,
            cipher,
            config.reconcile.reconcile_config(),
        ))
    }
}
