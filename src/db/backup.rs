//! Backup and restore through the PostgreSQL client binaries.
//!
//! `PgDump` shells out to `pg_dump`; `PgRestore` tries `pg_restore` first and
//! falls back to `psql` for plain SQL dumps. Both traits are injectable so
//! callers and tests can swap in their own adapters.

use crate::config::Config;
use crate::error::{DbError, DbResult, ErrorCode};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Longest stderr tail kept in error context.
const MAX_STDERR_CHARS: usize = 2000;

#[async_trait]
pub trait Backuper: Send + Sync {
    /// Write a dump of `config.database` to `path`.
    async fn backup(&self, config: &Config, path: &Path) -> DbResult<()>;
}

#[async_trait]
pub trait Restorer: Send + Sync {
    /// Restore `config.database` from the dump at `path`.
    async fn restore(&self, config: &Config, path: &Path) -> DbResult<()>;
}

/// `pg_dump` based backups.
#[derive(Debug, Default, Clone, Copy)]
pub struct PgDump;

/// `pg_restore`/`psql` based restores.
#[derive(Debug, Default, Clone, Copy)]
pub struct PgRestore;

#[async_trait]
impl Backuper for PgDump {
    async fn backup(&self, config: &Config, path: &Path) -> DbResult<()> {
        run(pg_dump_command(config, path)).await.map_err(|failure| {
            DbError::backup("pg_dump command failed")
                .with_operation("backup")
                .with_context("backup_path", path.display().to_string())
                .with_context("database", config.database.as_str())
                .with_failure(failure)
        })
    }
}

#[async_trait]
impl Restorer for PgRestore {
    async fn restore(&self, config: &Config, path: &Path) -> DbResult<()> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(DbError::new(
                ErrorCode::InvalidBackupFile,
                format!("backup file not found: {}", path.display()),
            )
            .with_operation("restore")
            .with_context("backup_path", path.display().to_string())
            .with_user_message("The backup file does not exist or cannot be read."));
        }

        let first = match run(pg_restore_command(config, path)).await {
            Ok(()) => return Ok(()),
            Err(failure) => failure,
        };
        warn!(
            backup_path = %path.display(),
            error = %first.summary(),
            "pg_restore failed, retrying as plain SQL with psql"
        );

        run(psql_command(config, path)).await.map_err(|failure| {
            DbError::restore("both pg_restore and psql commands failed")
                .with_operation("restore")
                .with_context("backup_path", path.display().to_string())
                .with_context("database", config.database.as_str())
                .with_context("pg_restore_stderr", first.stderr.clone())
                .with_failure(failure)
        })
    }
}

/// `backup_<db>_<YYYYmmdd_HHMMSS>.sql`
pub fn backup_file_name<Tz>(database: &str, at: DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!("backup_{}_{}.sql", database, at.format("%Y%m%d_%H%M%S"))
}

pub(crate) fn pg_dump_command(config: &Config, path: &Path) -> Command {
    let mut cmd = client_command("pg_dump", config);
    cmd.arg("--file").arg(path).args(["--verbose", "--no-password"]);
    cmd
}

pub(crate) fn pg_restore_command(config: &Config, path: &Path) -> Command {
    let mut cmd = client_command("pg_restore", config);
    cmd.args(["--verbose", "--no-password", "--clean", "--if-exists"])
        .arg(path);
    cmd
}

pub(crate) fn psql_command(config: &Config, path: &Path) -> Command {
    let mut cmd = client_command("psql", config);
    cmd.arg("--no-password").arg("--file").arg(path);
    cmd
}

/// Connection arguments and environment shared by every client binary.
fn client_command(program: &str, config: &Config) -> Command {
    let mut cmd = Command::new(program);
    cmd.arg("--host")
        .arg(&config.host)
        .arg("--port")
        .arg(config.port.to_string())
        .arg("--username")
        .arg(&config.user)
        .arg("--dbname")
        .arg(&config.database)
        .env("PGPASSWORD", &config.password)
        .env("PGSSLMODE", config.ssl_mode.as_str())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(path) = &config.ssl_root_cert {
        cmd.env("PGSSLROOTCERT", path);
    }
    if let Some(path) = &config.ssl_cert {
        cmd.env("PGSSLCERT", path);
    }
    if let Some(path) = &config.ssl_key {
        cmd.env("PGSSLKEY", path);
    }
    cmd
}

/// Why a client process did not succeed.
#[derive(Debug)]
pub(crate) struct CommandFailure {
    program: String,
    status: Option<i32>,
    stderr: String,
    source: Option<std::io::Error>,
}

impl CommandFailure {
    fn summary(&self) -> String {
        match (&self.source, self.status) {
            (Some(e), _) => format!("{}: {}", self.program, e),
            (None, Some(code)) => format!("{} exited with status {}", self.program, code),
            (None, None) => format!("{} terminated by signal", self.program),
        }
    }
}

trait WithFailure {
    fn with_failure(self, failure: CommandFailure) -> Self;
}

impl WithFailure for DbError {
    fn with_failure(self, failure: CommandFailure) -> Self {
        let summary = failure.summary();
        let mut err = self
            .with_context("command", failure.program.as_str())
            .with_context("detail", summary);
        if let Some(code) = failure.status {
            err = err.with_context("exit_code", code);
        }
        if !failure.stderr.is_empty() {
            err = err.with_context("stderr", failure.stderr);
        }
        match failure.source {
            Some(source) => err.with_source(source),
            None => err,
        }
    }
}

async fn run(mut cmd: Command) -> Result<(), CommandFailure> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    debug!(program = %program, "Running client command");

    let output = match cmd.output().await {
        Ok(output) => output,
        Err(e) => {
            return Err(CommandFailure {
                program,
                status: None,
                stderr: String::new(),
                source: Some(e),
            });
        }
    };

    if output.status.success() {
        return Ok(());
    }

    Err(CommandFailure {
        program,
        status: output.status.code(),
        stderr: stderr_tail(&String::from_utf8_lossy(&output.stderr)),
        source: None,
    })
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    let count = trimmed.chars().count();
    if count <= MAX_STDERR_CHARS {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - MAX_STDERR_CHARS).collect()
}
