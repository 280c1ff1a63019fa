//! Rollcall CLI - Command line interface for the check-in service.
//!
//! This tool runs the HTTP server and covers the administrative side of
//! an event: creating the database, events and sessions, reconciling a
//! device batch by hand, and inspecting what is stored.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use rollcall_common::types::{require_text, MAX_TITLE_LEN};
use rollcall_common::{EventId, NewEvent, NewSession};
use rollcall_crypto::FieldKey;
use rollcall_notify::NotificationService;
use rollcall_server::{CipherConfig, DatabaseConfig, NotifyArgs, ReconcileArgs, ServerConfig};
use rollcall_storage::{with_transaction, Store};
use rollcall_sync::{Reconciler, SyncRequest};

#[derive(Parser)]
#[command(name = "rollcall")]
#[command(about = "Rollcall - Event registration and check-in")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server.
    Serve {
        #[command(flatten)]
        config: ServerConfig,
    },

    /// Create the database schema.
    InitDb {
        #[command(flatten)]
        database: DatabaseConfig,
    },

    /// Create an event.
    CreateEvent {
        #[command(flatten)]
        database: DatabaseConfig,

        /// Event name.
        #[arg(short, long)]
        name: String,

        /// Start date (RFC 3339).
        #[arg(long)]
        start: DateTime<Utc>,

        /// End date (RFC 3339).
        #[arg(long)]
        end: DateTime<Utc>,
    },

    /// Create a session within an event.
    CreateSession {
        #[command(flatten)]
        database: DatabaseConfig,

        /// Event the session belongs to.
        #[arg(short, long)]
        event_id: i64,

        /// Session name.
        #[arg(short, long)]
        name: String,

        /// Start time (RFC 3339).
        #[arg(long)]
        start: DateTime<Utc>,

        /// End time (RFC 3339).
        #[arg(long)]
        end: DateTime<Utc>,
    },

    /// Reconcile a device batch file and print the per-record results.
    Sync {
        /// JSON sync request, as a device would upload it.
        #[arg(short, long)]
        file: PathBuf,

        #[command(flatten)]
        database: DatabaseConfig,

        #[command(flatten)]
        cipher: CipherConfig,

        #[command(flatten)]
        notify: NotifyArgs,

        #[command(flatten)]
        reconcile: ReconcileArgs,
    },

    /// Show row counts and the configured events.
    Inspect {
        #[command(flatten)]
        database: DatabaseConfig,
    },

    /// Print a fresh base64 encryption key.
    GenKey,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Serve { config } => rollcall_server::serve(config)
            .await
            .context("Server failed"),

        Commands::InitDb { database } => cmd_init_db(&database),

        Commands::CreateEvent {
            database,
            name,
            start,
            end,
        } => cmd_create_event(&database, &name, start, end),

        Commands::CreateSession {
            database,
            event_id,
            name,
            start,
            end,
        } => cmd_create_session(&database, EventId(event_id), &name, start, end),

        Commands::Sync {
            file,
            database,
            cipher,
            notify,
            reconcile,
        } => cmd_sync(&file, &database, &cipher, &notify, &reconcile).await,

        Commands::Inspect { database } => cmd_inspect(&database),

        Commands::GenKey => cmd_gen_key(),
    }
}

/// Create the database schema.
fn cmd_init_db(database: &DatabaseConfig) -> Result<()> {
    database.open().context("Failed to initialize database")?;

    println!(
        "Database initialized: {}",
        database.database_path.display()
    );

    Ok(())
}

fn check_range(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
    if end < start {
        bail!("End ({}) is before start ({})", end, start);
    }
    Ok(())
}

/// Create an event.
fn cmd_create_event(
    database: &DatabaseConfig,
    name: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<()> {
    let name = require_text("name", name, MAX_TITLE_LEN)?;
    check_range(start, end)?;
    info!("Creating event: {}", name);

    let store = database.open().context("Failed to open database")?;
    let event = with_transaction(&store, |tx| {
        tx.insert_event(NewEvent {
            name,
            start_date: start,
            end_date: end,
        })
    })
    .context("Failed to create event")?;

    println!("Event created: {} (id {})", event.name, event.id);

    Ok(())
}

/// Create a session within an event.
fn cmd_create_session(
    database: &DatabaseConfig,
    event_id: EventId,
    name: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<()> {
    let name = require_text("name", name, MAX_TITLE_LEN)?;
    check_range(start, end)?;
    info!("Creating session {} for event {}", name, event_id);

    let store = database.open().context("Failed to open database")?;
    let session = with_transaction(&store, |tx| {
        tx.insert_session(NewSession {
            event_id,
            name,
            start_time: start,
            end_time: end,
        })
    })
    .context("Failed to create session")?;

    println!(
        "Session created: {} (id {}, event {})",
        session.name, session.id, session.event_id
    );

    Ok(())
}

/// Reconcile a batch file directly against the database.
async fn cmd_sync(
    file: &Path,
    database: &DatabaseConfig,
    cipher: &CipherConfig,
    notify: &NotifyArgs,
    reconcile: &ReconcileArgs,
) -> Result<()> {
    info!("Reconciling batch file {}", file.display());

    let content = tokio::fs::read(file)
        .await
        .context("Failed to read batch file")?;
    let request: SyncRequest =
        serde_json::from_slice(&content).context("Batch file is not a valid sync request")?;

    let store = Arc::new(database.open().context("Failed to open database")?);
    let notifier = Arc::new(
        NotificationService::new(notify.notify_config())
            .context("Failed to set up notifications")?,
    );
    let reconciler = Reconciler::new(
        store,
        notifier,
        Arc::new(cipher.cipher()),
        reconcile.reconcile_config(),
    );

    let response = reconciler
        .reconcile(request)
        .await
        .context("Sync failed")?;
    reconciler.finish_notifications().await;

    println!("{}", serde_json::to_string_pretty(&response)?);

    Ok(())
}

/// Show row counts and the configured events.
fn cmd_inspect(database: &DatabaseConfig) -> Result<()> {
    let store = database.open().context("Failed to open database")?;
    let tx = store.begin()?;
    let counts = tx.counts()?;

    println!("Database: {}", database.database_path.display());
    println!("  Users: {}", counts.users);
    println!("  Events: {}", counts.events);
    println!("  Sessions: {}", counts.sessions);
    println!("  Registrations: {}", counts.registrations);
    println!("  Check-ins: {}", counts.check_ins);
    println!("  Offline devices: {}", counts.offline_devices);

    for event in tx.events()? {
        println!(
            "Event {}: {} ({} - {})",
            event.id, event.name, event.start_date, event.end_date
        );
        for session in tx.sessions_for_event(event.id)? {
            let check_ins = tx.check_ins_for_session(session.id)?;
            println!(
                "  Session {}: {} ({} check-ins)",
                session.id,
                session.name,
                check_ins.len()
            );
        }
    }

    Ok(())
}

/// Print a fresh base64 encryption key.
fn cmd_gen_key() -> Result<()> {
    let key = FieldKey::generate();
    println!("{}", key.to_base64());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_create_session() {
        let cli = Cli::try_parse_from([
            "rollcall",
            "create-session",
            "--database-path",
            "events.db",
            "--event-id",
            "3",
            "--name",
            "Keynote",
            "--start",
            "2025-03-14T09:00:00Z",
            "--end",
            "2025-03-14T10:00:00Z",
        ])
        .unwrap();

        match cli.command {
            Commands::CreateSession {
                event_id, name, ..
            } => {
                assert_eq!(event_id, 3);
                assert_eq!(name, "Keynote");
            }
            _ => panic!("expected create-session"),
        }
    }

    #[test]
    fn test_end_before_start_rejected() {
        let start = "2025-03-14T10:00:00Z".parse().unwrap();
        let end = "2025-03-14T09:00:00Z".parse().unwrap();
        assert!(check_range(start, end).is_err());
    }
}
