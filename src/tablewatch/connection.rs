//! Database connection ownership and credential rotation
//!
//! The scan loop borrows the pool through [`DbConn::pool`]; rotation swaps
//! the pool pointer only after the replacement has been opened and
//! verified, so in-flight scans finish on the old pool.

use std::sync::Arc;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info};

use crate::config::DatabaseSettings;
use crate::error::Result;
use crate::tablewatch::credentials::ResolvedCredentials;

/// Quiet window after a filesystem event before credentials are re-read.
const ROTATION_DEBOUNCE: Duration = Duration::from_secs(1);

const MAX_CONNECTIONS: u32 = 5;

/// Owner of the PostgreSQL pool used by the scan loop.
pub struct DbConn {
    settings: DatabaseSettings,
    pool: RwLock<PgPool>,
}

impl DbConn {
    /// Open and verify the initial connection pool.
    pub async fn open(settings: DatabaseSettings) -> Result<Arc<Self>> {
        let credentials = settings.credentials.resolve()?;
        let pool = connect_and_verify(&settings, &credentials).await?;

        Ok(Arc::new(Self {
            settings,
            pool: RwLock::new(pool),
        }))
    }

    /// A handle to the current pool. Cheap to clone and safe to hold across
    /// a rotation; queries on a swapped-out pool drain before it closes.
    pub async fn pool(&self) -> PgPool {
        self.pool.read().await.clone()
    }

    async fn rotate(&self, credentials: &ResolvedCredentials) -> Result<()> {
        let new_pool = connect_and_verify(&self.settings, credentials).await?;

        let old_pool = {
            let mut guard = self.pool.write().await;
            std::mem::replace(&mut *guard, new_pool)
        };
        old_pool.close().await;

        Ok(())
    }

    /// Watch the credential-file directories and rotate the pool when the
    /// resolved credentials actually change. Returns immediately when no
    /// credential files are configured; otherwise runs until shutdown.
    pub async fn watch_credentials(self: Arc<Self>) {
        let dirs = self.settings.credentials.watch_dirs();
        if dirs.is_empty() {
            return;
        }

        let (event_tx, mut event_rx) = mpsc::channel::<notify::Result<notify::Event>>(16);
        let mut watcher = match notify::recommended_watcher(move |event| {
            let _ = event_tx.blocking_send(event);
        }) {
            Ok(watcher) => watcher,
            Err(e) => {
                error!(error = %e, "failed to initialize credential watcher");
                return;
            }
        };

        for dir in &dirs {
            if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
                error!(dir = %dir.display(), error = %e, "unable to watch credential directory");
                return;
            }
        }

        debug!(?dirs, "watching for database credential changes");

        let mut current = match self.settings.credentials.resolve() {
            Ok(resolved) => resolved,
            Err(e) => {
                error!(error = %e, "failed to read initial credentials");
                return;
            }
        };

        // Debounce: filesystem events only arm the reload deadline; the
        // actual re-read happens after a quiet window.
        let mut reload_at: Option<tokio::time::Instant> = None;

        loop {
            let deadline = reload_at;
            let reload_deadline = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                event = event_rx.recv() => match event {
                    Some(Ok(event)) => {
                        debug!(paths = ?event.paths, kind = ?event.kind, "credential directory event");
                        reload_at = Some(tokio::time::Instant::now() + ROTATION_DEBOUNCE);
                    }
                    Some(Err(e)) => error!(error = %e, "credential watcher error"),
                    None => return,
                },
                _ = reload_deadline => {
                    reload_at = None;
                    match self.settings.credentials.resolve() {
                        Ok(resolved) if resolved != current => {
                            info!("database credentials changed, reloading connection");
                            match self.rotate(&resolved).await {
                                Ok(()) => {
                                    info!("database credentials reloaded");
                                    current = resolved;
                                }
                                Err(e) => {
                                    error!(error = %e, "error rotating database connection, keeping old pool");
                                }
                            }
                        }
                        Ok(_) => debug!("credential files touched but contents unchanged"),
                        Err(e) => error!(error = %e, "failed to re-read credentials during rotation"),
                    }
                }
            }
        }
    }
}

fn connect_options(
    settings: &DatabaseSettings,
    credentials: &ResolvedCredentials,
) -> PgConnectOptions {
    let mut options = PgConnectOptions::new()
        .host(&settings.host)
        .port(settings.port);

    if !settings.name.is_empty() {
        options = options.database(&settings.name);
    }

    if let Some(username) = &credentials.username {
        options = options.username(username);
    }

    if let Some(password) = &credentials.password {
        options = options.password(password);
    }

    options
}

async fn connect_and_verify(
    settings: &DatabaseSettings,
    credentials: &ResolvedCredentials,
) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(connect_options(settings, credentials))
        .await?;

    sqlx::query("SELECT 1").execute(&pool).await?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tablewatch::credentials::DbCredentials;

    fn settings() -> DatabaseSettings {
        DatabaseSettings {
            driver: "postgres".to_string(),
            host: "db.internal".to_string(),
            port: 5433,
            name: "tenants".to_string(),
            credentials: DbCredentials::default(),
        }
    }

    #[test]
    fn connect_options_carry_target_and_credentials() {
        let options = connect_options(
            &settings(),
            &ResolvedCredentials {
                username: Some("scaler".to_string()),
                password: Some("s3cret".to_string()),
            },
        );

        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 5433);
        assert_eq!(options.get_database(), Some("tenants"));
        assert_eq!(options.get_username(), "scaler");
    }

    #[test]
    fn connect_options_omit_absent_credentials() {
        let options = connect_options(
            &settings(),
            &ResolvedCredentials {
                username: None,
                password: None,
            },
        );

        // sqlx falls back to the process user when none is given.
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_database(), Some("tenants"));
    }
}
