//! Startup helpers: database pool + migrations, the notifier chosen by
//! configuration and the invitation expiry worker.

use std::{path::Path, sync::Arc, time::Duration};

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::services::invitations::InvitationService;
use crate::services::notifier::{InvitationNotifier, LogNotifier, WebhookNotifier};

/// Strip userinfo and query parameters from a database URL before logging.
pub fn redact_db_url(db_url: &str) -> String {
    if let Ok(url) = url::Url::parse(db_url) {
        let host = url.host_str().unwrap_or("");
        let port = url.port().map(|p| format!(":{p}")).unwrap_or_default();
        format!("{}://{}{}{}", url.scheme(), host, port, url.path())
    } else if let Some(at) = db_url.find('@') {
        format!("(redacted){}", &db_url[at + 1..])
    } else {
        "(redacted)".to_string()
    }
}

/// Open the SQLite pool (creating the file and its directory if needed) and
/// apply migrations.
pub async fn init_db(config: &Config) -> Result<sqlx::SqlitePool> {
    let db_url = &config.database.url;
    tracing::info!("Connecting to database: {}", redact_db_url(db_url));

    let db_path = db_url.strip_prefix("sqlite://").unwrap_or(db_url);
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                )
            })?;
        }
    }

    let connect_options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect_with(connect_options)
        .await?;

    tracing::info!("Running database migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Webhook notifier when a URL is configured, log-only otherwise.
pub fn build_notifier(config: &Config) -> Result<Arc<dyn InvitationNotifier>> {
    match &config.notifier.webhook_url {
        Some(url) => {
            let timeout = Duration::from_secs(config.notifier.timeout_secs);
            let notifier = WebhookNotifier::new(url, timeout)?;
            tracing::info!("Invitation notices go to webhook {}", redact_db_url(url));
            Ok(Arc::new(notifier))
        }
        None => {
            tracing::info!("No notifier webhook configured; invitation notices are only logged");
            Ok(Arc::new(LogNotifier))
        }
    }
}

/// Periodically flip overdue pending invitations to `expired`. Exits on the
/// shutdown broadcast.
pub fn spawn_expiry_worker(
    invitations: InvitationService,
    shutdown: tokio::sync::broadcast::Sender<()>,
    every: Duration,
) -> JoinHandle<()> {
    let mut shutdown_rx = shutdown.subscribe();
    tokio::spawn(async move {
        loop {
            if let Err(e) = invitations.expire_overdue().await {
                tracing::warn!("Invitation expiry sweep failed: {:?}", e);
            }

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Invitation expiry worker shutting down");
                    break;
                }
                _ = tokio::time::sleep(every) => {}
            }
        }
    })
}
