//! Runtime configuration, read from flags with environment fallbacks.

use clap::Args;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

use rollcall_common::Result;
use rollcall_crypto::FieldCipher;
use rollcall_notify::NotifyConfig;
use rollcall_storage::SqliteStore;
use rollcall_sync::ReconcileConfig;

/// Where the SQLite database lives.
#[derive(Debug, Clone, Args)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[arg(long, env = "DATABASE_PATH", default_value = "rollcall.db")]
    pub database_path: PathBuf,
}

impl DatabaseConfig {
    /// Open (creating if needed) the configured database.
    pub fn open(&self) -> Result<SqliteStore> {
        info!("Opening database at {}", self.database_path.display());
        SqliteStore::open(&self.database_path)
    }
}

/// Field encryption key.
#[derive(Clone, Args)]
pub struct CipherConfig {
    /// Base64-encoded 32-byte key sealing fingerprint templates.
    #[arg(long, env = "ENCRYPTION_KEY", hide_env_values = true)]
    pub encryption_key: Option<String>,
}

impl CipherConfig {
    /// Build the cipher. A missing or bad key yields an unavailable cipher.
    pub fn cipher(&self) -> FieldCipher {
        FieldCipher::from_config(self.encryption_key.as_deref())
    }
}

impl std::fmt::Debug for CipherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherConfig")
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Notification channel credentials. A channel with missing credentials
/// is disabled.
#[derive(Clone, Default, Args)]
pub struct NotifyArgs {
    /// Africa's Talking account username ("sandbox" for the sandbox).
    #[arg(long, env = "AFRICASTALKING_USERNAME")]
    pub africastalking_username: Option<String>,

    /// Africa's Talking API key.
    #[arg(long, env = "AFRICASTALKING_API_KEY", hide_env_values = true)]
    pub africastalking_api_key: Option<String>,

    /// Resend API key.
    #[arg(long, env = "RESEND_API_KEY", hide_env_values = true)]
    pub resend_api_key: Option<String>,

    /// Sender address for confirmation emails.
    #[arg(long, env = "DEFAULT_FROM_EMAIL")]
    pub default_from_email: Option<String>,
}

impl NotifyArgs {
    pub fn notify_config(&self) -> NotifyConfig {
        NotifyConfig::from_credentials(
            self.africastalking_username.clone(),
            self.africastalking_api_key.clone(),
            self.resend_api_key.clone(),
            self.default_from_email.clone(),
        )
    }
}

impl std::fmt::Debug for NotifyArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyArgs")
            .field("africastalking_username", &self.africastalking_username)
            .field("default_from_email", &self.default_from_email)
            .finish_non_exhaustive()
    }
}

/// Reconciliation tuning.
#[derive(Debug, Clone, Args)]
pub struct ReconcileArgs {
    /// Re-resolution attempts for a record that lost a uniqueness race.
    #[arg(long, env = "MAX_CONFLICT_RETRIES", default_value_t = 3)]
    pub max_conflict_retries: u32,

    /// Reject template uploads instead of storing them as plaintext when
    /// no encryption key is configured.
    #[arg(long, env = "REQUIRE_ENCRYPTION")]
    pub require_encryption: bool,
}

impl ReconcileArgs {
    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            max_conflict_retries: self.max_conflict_retries,
            allow_plaintext_templates: !self.require_encryption,
        }
    }
}

impl Default for ReconcileArgs {
    fn default() -> Self {
        let defaults = ReconcileConfig::default();
        Self {
            max_conflict_retries: defaults.max_conflict_retries,
            require_encryption: !defaults.allow_plaintext_templates,
        }
    }
}

/// Everything `serve` needs.
#[derive(Debug, Clone, Args)]
pub struct ServerConfig {
    /// Address to listen on.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8000")]
    pub bind_addr: SocketAddr,

    #[command(flatten)]
    pub database: DatabaseConfig,

    #[command(flatten)]
    pub cipher: CipherConfig,

    #[command(flatten)]
    pub notify: NotifyArgs,

    #[command(flatten)]
    pub reconcile: ReconcileArgs,
}
