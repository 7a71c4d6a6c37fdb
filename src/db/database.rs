//! Connection handle with health checks and self-healing reconnection.
//!
//! `Database` owns exactly one live `PgPool` at a time. Readers clone the
//! pool under a short read lock and never hold the lock across I/O, so a
//! reconnect can swap in a fresh pool while in-flight work finishes against
//! the stale one.

use crate::config::Config;
use crate::db::backup::{Backuper, PgDump, PgRestore, Restorer};
use crate::db::migrate::Migrator;
use crate::db::retry::{self, cancellable, RetryPolicy};
use crate::db::schema::IntrospectionService;
use crate::error::{DbError, DbResult, ErrorCode};
use serde::Serialize;
use sqlx::{Connection, PgPool};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Snapshot of pool usage.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    /// Connections currently open, idle or in use.
    pub size: u32,
    /// Connections sitting idle in the pool.
    pub idle: usize,
    /// Configured upper bound.
    pub max_open: u32,
}

impl PoolStats {
    pub fn in_use(&self) -> u32 {
        self.size
            .saturating_sub(u32::try_from(self.idle).unwrap_or(u32::MAX))
    }
}

/// Resilient handle to one PostgreSQL database.
pub struct Database {
    pool: RwLock<PgPool>,
    config: Config,
    backuper: Arc<dyn Backuper>,
    restorer: Arc<dyn Restorer>,
}

impl Database {
    /// Open a pool for `config` and return the handle.
    pub async fn connect(config: Config) -> DbResult<Self> {
        config.validate()?;

        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            ssl_mode = %config.ssl_mode,
            "Connecting to database"
        );

        let pool = open_pool(&config).await?;

        info!(
            host = %config.host,
            database = %config.database,
            max_open_conns = config.max_open_conns,
            "Connected successfully"
        );

        Ok(Self {
            pool: RwLock::new(pool),
            config,
            backuper: Arc::new(PgDump),
            restorer: Arc::new(PgRestore),
        })
    }

    /// Build the configuration from the environment and connect.
    pub async fn from_env() -> DbResult<Self> {
        Self::connect(Config::from_env()?).await
    }

    /// Replace the backup adapter.
    pub fn with_backuper(mut self, backuper: Arc<dyn Backuper>) -> Self {
        self.backuper = backuper;
        self
    }

    /// Replace the restore adapter.
    pub fn with_restorer(mut self, restorer: Arc<dyn Restorer>) -> Self {
        self.restorer = restorer;
        self
    }

    /// Close every connection of the active pool.
    pub async fn close(&self) {
        let pool = self.pool().await;
        pool.close().await;
        info!(database = %self.config.database, "Database connection closed");
    }

    /// The active pool. Re-read after a validation boundary; do not cache.
    pub async fn pool(&self) -> PgPool {
        self.pool.read().await.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.config.retry_policy()
    }

    /// Ping with retry.
    pub async fn ping(&self, cancel: &CancellationToken) -> DbResult<()> {
        retry::with_retry(cancel, &self.retry_policy(), "ping", || {
            self.ping_no_retry(cancel)
        })
        .await
    }

    /// Single ping, no retry.
    pub async fn ping_no_retry(&self, cancel: &CancellationToken) -> DbResult<()> {
        let pool = self.pool().await;
        cancellable(cancel, "ping", async move {
            raw_ping(&pool).await.map_err(|e| {
                check_failure(e, ErrorCode::ConnectionFailed, "ping", "database ping failed")
            })
        })
        .await
    }

    /// Ping plus a `SELECT 1` round trip, retried as one unit.
    pub async fn health_check(&self, cancel: &CancellationToken) -> DbResult<()> {
        retry::with_retry(cancel, &self.retry_policy(), "health_check", || {
            self.health_check_no_retry(cancel)
        })
        .await
    }

    /// One health check attempt.
    pub async fn health_check_no_retry(&self, cancel: &CancellationToken) -> DbResult<()> {
        self.ping_no_retry(cancel).await.map_err(|e| {
            DbError::wrap(e, ErrorCode::ConnectionFailed, "health_check", "")
        })?;

        let pool = self.pool().await;
        cancellable(cancel, "health_check", async move {
            sqlx::query_scalar::<_, i32>("SELECT 1")
                .fetch_one(&pool)
                .await
                .map(|_| ())
                .map_err(|e| {
                    check_failure(
                        e,
                        ErrorCode::QueryFailed,
                        "health_check",
                        "health check query failed",
                    )
                })
        })
        .await
    }

    /// Ping, and on failure reconnect once and ping again.
    ///
    /// This makes at most one reconnection attempt per call. Callers that
    /// want repeated healing call it again from their own retry loop.
    pub async fn validate_connection(&self, cancel: &CancellationToken) -> DbResult<()> {
        let err = match self.ping_no_retry(cancel).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        // A fresh pool cannot fix rejected credentials or a cancelled call.
        if !err.is_retriable() {
            return Err(err);
        }

        warn!(
            database = %self.config.database,
            error = %err,
            "Connection validation failed, attempting to reconnect"
        );

        if let Err(e) = self.reconnect(cancel).await {
            error!(
                host = %self.config.host,
                database = %self.config.database,
                error = %e,
                "Failed to reconnect to database"
            );
            return Err(DbError::wrap(
                e,
                ErrorCode::ConnectionFailed,
                "validate_connection",
                "failed to reconnect to database",
            ));
        }

        if let Err(e) = self.ping_no_retry(cancel).await {
            error!(
                database = %self.config.database,
                error = %e,
                "Connection still failing after reconnect"
            );
            return Err(DbError::wrap(
                e,
                ErrorCode::ConnectionFailed,
                "validate_connection",
                "connection validation failed after reconnect",
            ));
        }

        info!(database = %self.config.database, "Successfully reconnected to database");
        Ok(())
    }

    /// Open a fresh pool with the same configuration and install it.
    ///
    /// The stale pool is closed in the background once its checked-out
    /// connections come back.
    pub async fn reconnect(&self, cancel: &CancellationToken) -> DbResult<()> {
        let fresh = cancellable(cancel, "reconnect", open_pool(&self.config)).await?;

        let stale = {
            let mut guard = self.pool.write().await;
            std::mem::replace(&mut *guard, fresh)
        };

        debug!(database = %self.config.database, "Installed new connection pool");
        tokio::spawn(async move { stale.close().await });
        Ok(())
    }

    /// Validate the connection, then run `op` through the retry engine.
    ///
    /// `op` receives the pool that is active at the start of each attempt.
    pub async fn with_validation<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        op: F,
    ) -> DbResult<T>
    where
        F: Fn(PgPool) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        self.validate_connection(cancel).await.map_err(|e| {
            DbError::wrap(
                e,
                ErrorCode::ConnectionFailed,
                operation,
                "connection validation failed",
            )
        })?;

        let op = &op;
        retry::with_retry(cancel, &self.retry_policy(), operation, move || async move {
            let pool = self.pool().await;
            op(pool).await
        })
        .await
    }

    /// Run `op` through the retry engine with this handle's policy.
    pub async fn with_retry<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        op: F,
    ) -> DbResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        retry::with_retry(cancel, &self.retry_policy(), operation, op).await
    }

    pub async fn pool_stats(&self) -> PoolStats {
        let pool = self.pool().await;
        PoolStats {
            size: pool.size(),
            idle: pool.num_idle(),
            max_open: self.config.max_open_conns,
        }
    }

    /// Server version as reported by `SHOW server_version`.
    pub async fn server_version(&self, cancel: &CancellationToken) -> DbResult<String> {
        self.with_validation(cancel, "server_version", |pool| async move {
            sqlx::query_scalar::<_, String>("SHOW server_version")
                .fetch_one(&pool)
                .await
                .map_err(|e| {
                    DbError::new(ErrorCode::QueryFailed, "failed to read server version")
                        .with_operation("server_version")
                        .with_source(e)
                })
        })
        .await
    }

    /// Schema introspection bound to this handle.
    pub fn introspection(&self) -> IntrospectionService<'_> {
        IntrospectionService::new(self)
    }

    /// Migration runner over the configured migrations directory.
    pub fn migrator(&self) -> Migrator<'_> {
        Migrator::new(self, self.config.migrations_dir.clone())
    }

    /// Dump the database into a timestamped file under the backups directory.
    pub async fn backup(&self, cancel: &CancellationToken) -> DbResult<PathBuf> {
        let dir = &self.config.backups_dir;
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            DbError::backup("failed to create backups directory")
                .with_operation("backup")
                .with_context("backups_dir", dir.display().to_string())
                .with_source(e)
        })?;

        let path = dir.join(crate::db::backup::backup_file_name(
            &self.config.database,
            chrono::Local::now(),
        ));
        self.backup_to_file(cancel, &path).await?;
        Ok(path)
    }

    /// Dump the database into `path`.
    pub async fn backup_to_file(&self, cancel: &CancellationToken, path: &Path) -> DbResult<()> {
        info!(
            database = %self.config.database,
            backup_path = %path.display(),
            "Starting database backup"
        );
        cancellable(cancel, "backup", self.backuper.backup(&self.config, path)).await?;
        info!(backup_path = %path.display(), "Database backup completed");
        Ok(())
    }

    /// Restore the database from `path`.
    pub async fn restore(&self, cancel: &CancellationToken, path: &Path) -> DbResult<()> {
        info!(
            database = %self.config.database,
            backup_path = %path.display(),
            "Starting database restore"
        );
        cancellable(cancel, "restore", self.restorer.restore(&self.config, path)).await?;
        info!(backup_path = %path.display(), "Database restore completed");
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("target", &self.config.target())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Classify a ping or health check failure. A specific category from the driver (for
/// example `AuthenticationError`) is kept; a generic one becomes `fallback`.
fn check_failure(
    err: sqlx::Error,
    fallback: ErrorCode,
    operation: &str,
    message: &str,
) -> DbError {
    let classified = DbError::from(err);
    if classified.is(ErrorCode::QueryFailed) || classified.is(ErrorCode::Unknown) {
        return DbError::new(fallback, message)
            .with_operation(operation)
            .with_source(classified);
    }
    DbError::wrap(classified, fallback, operation, message)
}

async fn raw_ping(pool: &PgPool) -> Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    conn.ping().await
}

/// Open a pool, bounded by the connect timeout when one is set.
async fn open_pool(config: &Config) -> DbResult<PgPool> {
    let connect = config
        .pool_options()
        .connect_with(config.connect_options());

    let result = if config.connect_timeout.is_zero() {
        connect.await
    } else {
        match tokio::time::timeout(config.connect_timeout, connect).await {
            Ok(result) => result,
            Err(elapsed) => {
                return Err(DbError::new(
                    ErrorCode::ConnectionTimeout,
                    format!(
                        "connection timed out after {}",
                        humantime::format_duration(config.connect_timeout)
                    ),
                )
                .with_operation("connect")
                .with_context("host", config.host.as_str())
                .with_context("port", config.port)
                .with_context("database", config.database.as_str())
                .with_source(elapsed)
                .with_user_message(
                    "Timed out connecting to the database. Please check the host and network.",
                ));
            }
        }
    };

    result.map_err(|e| {
        DbError::wrap(
            DbError::from(e),
            ErrorCode::ConnectionFailed,
            "connect",
            "failed to open database connection",
        )
        .with_context("host", config.host.as_str())
        .with_context("port", config.port)
        .with_context("database", config.database.as_str())
    })
}
