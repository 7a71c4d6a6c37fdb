//! `db-kit status`: a one-shot report of connection, health, metadata,
//! migrations and pool usage.

use crate::db::{Database, PoolStats};
use humansize::{DECIMAL, format_size};
use serde::Serialize;
use std::fmt::Write as _;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DatabaseStatus {
    pub connection: ConnectionStatus,
    pub health: HealthStatus,
    pub database: DatabaseMetadata,
    pub migrations: MigrationSummary,
    pub pool: PoolSummary,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStatus {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub status: String,
    pub ping: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthStatus {
    pub overall: String,
    pub connection: String,
    pub query: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DatabaseMetadata {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    pub schemas: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationSummary {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub current_version: i64,
    pub latest_version: i64,
    pub applied_count: usize,
    pub pending_count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolSummary {
    pub open_connections: u32,
    pub in_use_connections: u32,
    pub idle_connections: usize,
    pub max_open_connections: u32,
}

impl From<PoolStats> for PoolSummary {
    fn from(stats: PoolStats) -> Self {
        Self {
            open_connections: stats.size,
            in_use_connections: stats.in_use(),
            idle_connections: stats.idle,
            max_open_connections: stats.max_open,
        }
    }
}

/// Collect the status report.
///
/// Individual checks never fail the report: a failed ping marks the
/// connection as down and skips the remaining sections, and metadata or
/// migration lookups that fail leave their fields empty.
pub async fn collect(db: &Database, cancel: &CancellationToken) -> DatabaseStatus {
    let config = db.config();
    let mut status = DatabaseStatus {
        connection: ConnectionStatus {
            host: config.host.clone(),
            port: config.port,
            database: config.database.clone(),
            user: config.user.clone(),
            ..Default::default()
        },
        ..Default::default()
    };

    if let Err(e) = db.ping(cancel).await {
        debug!(error = %e, "Status ping failed");
        status.connection.status = "disconnected".into();
        status.connection.ping = "failed".into();
        status.health = HealthStatus {
            overall: "unhealthy".into(),
            connection: "failed".into(),
            query: "unknown".into(),
        };
        return status;
    }

    status.connection.status = "connected".into();
    status.connection.ping = "successful".into();
    status.health.connection = "healthy".into();

    match db.health_check_no_retry(cancel).await {
        Ok(()) => {
            status.health.query = "healthy".into();
            status.health.overall = "healthy".into();
        }
        Err(e) => {
            debug!(error = %e, "Status health check failed");
            status.health.query = "failed".into();
            status.health.overall = "unhealthy".into();
        }
    }

    let introspection = db.introspection();
    if let Ok(version) = introspection.database_version(cancel).await {
        status.database.version = version;
    }
    status.database.size = introspection.database_size(cancel).await.ok();
    if let Ok(schemas) = introspection.schemas(cancel).await {
        status.database.schemas = schemas;
    }

    match db.migrator().status(cancel).await {
        Ok(report) => {
            status.migrations = MigrationSummary {
                status: "available".into(),
                error: None,
                current_version: report.current_version,
                latest_version: report.latest_version,
                applied_count: report.applied_count,
                pending_count: report.pending_count,
            };
        }
        Err(e) => {
            status.migrations.status = "error".into();
            status.migrations.error = Some(e.display_message().to_string());
        }
    }

    status.pool = db.pool_stats().await.into();
    status
}

/// Human-readable report.
pub fn render(status: &DatabaseStatus) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = write_report(&mut out, status);
    out
}

fn write_report(out: &mut String, status: &DatabaseStatus) -> std::fmt::Result {
    let c = &status.connection;
    writeln!(out, "=== Database Status ===")?;

    writeln!(out, "\nConnection:")?;
    writeln!(out, "  Host: {}:{}", c.host, c.port)?;
    writeln!(out, "  Database: {}", c.database)?;
    writeln!(out, "  User: {}", c.user)?;
    writeln!(out, "  Status: {}", c.status)?;
    writeln!(out, "  Ping: {}", c.ping)?;

    let h = &status.health;
    writeln!(out, "\nHealth:")?;
    writeln!(out, "  Overall: {}", h.overall)?;
    writeln!(out, "  Connection: {}", h.connection)?;
    writeln!(out, "  Query: {}", h.query)?;

    let d = &status.database;
    writeln!(out, "\nDatabase:")?;
    writeln!(out, "  Version: {}", d.version)?;
    if let Some(size) = d.size {
        let bytes = u64::try_from(size).unwrap_or_default();
        writeln!(out, "  Size: {} ({size} bytes)", format_size(bytes, DECIMAL))?;
    }
    writeln!(out, "  Schemas: {}", d.schemas.len())?;
    if !d.schemas.is_empty() {
        writeln!(out, "  Schema list: {}", d.schemas.join(", "))?;
    }

    let m = &status.migrations;
    writeln!(out, "\nMigrations:")?;
    writeln!(out, "  Status: {}", m.status)?;
    if let Some(error) = &m.error {
        writeln!(out, "  Error: {error}")?;
    }
    writeln!(out, "  Current Version: {}", m.current_version)?;
    writeln!(out, "  Latest Version: {}", m.latest_version)?;
    writeln!(out, "  Applied: {}, Pending: {}", m.applied_count, m.pending_count)?;

    let p = &status.pool;
    writeln!(out, "\nConnection Pool:")?;
    writeln!(out, "  Open Connections: {}", p.open_connections)?;
    writeln!(out, "  In Use: {}", p.in_use_connections)?;
    writeln!(out, "  Idle: {}", p.idle_connections)?;
    writeln!(out, "  Max Open: {}", p.max_open_connections)?;

    Ok(())
}
