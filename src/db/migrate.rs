//! Migration runner.
//!
//! Applying and reverting is delegated to `sqlx::migrate`; this module adds
//! targeted moves (`up_to`, `down_to`, one step at a time), batch moves with
//! compensation, file creation and a status report built by cross-referencing
//! the migrations directory against the applied rows.

use crate::db::database::Database;
use crate::db::retry::cancellable;
use crate::error::{DbError, DbResult, ErrorCode};
use crate::models::{
    CreatedMigration, MigrationFile, MigrationKind, MigrationStatus, MigrationStatusReport,
};
use chrono::{DateTime, Utc};
use sqlx::migrate::{Migrate, MigrateError, Migration, Migrator as Engine};
use sqlx::PgPool;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const APPLIED_MIGRATIONS_QUERY: &str =
    "SELECT version, installed_on FROM _sqlx_migrations WHERE success ORDER BY version";

/// Runs migrations from one directory against a [`Database`].
#[derive(Debug)]
pub struct Migrator<'a> {
    db: &'a Database,
    dir: PathBuf,
}

impl<'a> Migrator<'a> {
    pub fn new(db: &'a Database, dir: impl Into<PathBuf>) -> Self {
        Self {
            db,
            dir: dir.into(),
        }
    }

    /// Directory migrations are read from.
    pub fn source(&self) -> &Path {
        &self.dir
    }

    pub fn set_source(&mut self, dir: impl Into<PathBuf>) {
        self.dir = dir.into();
    }

    /// Apply every pending migration.
    pub async fn up(&self, cancel: &CancellationToken) -> DbResult<()> {
        const OP: &str = "migrate_up";
        let engine = self.load(OP).await?;
        let pool = self.ready_pool(cancel, OP).await?;

        cancellable(cancel, OP, async {
            engine
                .run(&pool)
                .await
                .map_err(|e| migrate_error(e, OP, "failed to apply migrations"))
        })
        .await?;

        info!(dir = %self.dir.display(), "Migrations applied");
        Ok(())
    }

    /// Apply pending migrations up to and including `version`.
    pub async fn up_to(&self, cancel: &CancellationToken, version: i64) -> DbResult<Vec<i64>> {
        const OP: &str = "migrate_up_to";
        self.apply_pending(cancel, OP, |m| m.version <= version, usize::MAX)
            .await
            .map_err(|e| {
                DbError::wrap(
                    e,
                    ErrorCode::MigrationFailed,
                    OP,
                    &format!("failed to migrate up to version {version}"),
                )
                .with_context("target_version", version)
            })
    }

    /// Apply the next pending migration, if any.
    pub async fn up_by_one(&self, cancel: &CancellationToken) -> DbResult<Option<i64>> {
        const OP: &str = "migrate_up_by_one";
        let applied = self
            .apply_pending(cancel, OP, |_| true, 1)
            .await
            .map_err(|e| DbError::wrap(e, ErrorCode::MigrationFailed, OP, "failed to migrate up by one"))?;
        Ok(applied.first().copied())
    }

    /// Revert the most recently applied migration.
    pub async fn down(&self, cancel: &CancellationToken) -> DbResult<()> {
        const OP: &str = "migrate_down";
        let applied = self.applied(cancel, OP).await?;
        let Some((&latest, _)) = applied.last_key_value() else {
            info!("No applied migrations to revert");
            return Ok(());
        };
        let target = applied
            .range(..latest)
            .next_back()
            .map_or(0, |(version, _)| *version);

        self.undo(cancel, OP, target)
            .await
            .map_err(|e| DbError::wrap(e, ErrorCode::MigrationFailed, OP, "failed to migrate down by one"))
    }

    /// Revert every applied migration newer than `version`.
    pub async fn down_to(&self, cancel: &CancellationToken, version: i64) -> DbResult<()> {
        const OP: &str = "migrate_down_to";
        self.undo(cancel, OP, version).await.map_err(|e| {
            DbError::wrap(
                e,
                ErrorCode::MigrationFailed,
                OP,
                &format!("failed to migrate down to version {version}"),
            )
            .with_context("target_version", version)
        })
    }

    /// Revert every applied migration.
    pub async fn reset(&self, cancel: &CancellationToken) -> DbResult<()> {
        const OP: &str = "migrate_reset";
        self.undo(cancel, OP, 0)
            .await
            .map_err(|e| DbError::wrap(e, ErrorCode::MigrationFailed, OP, "failed to reset migrations"))
    }

    /// Highest applied version, 0 when nothing is applied.
    pub async fn version(&self, cancel: &CancellationToken) -> DbResult<i64> {
        let applied = self.applied(cancel, "get_version").await?;
        Ok(applied.keys().next_back().copied().unwrap_or(0))
    }

    /// Cross-reference the directory against applied rows.
    pub async fn status(&self, cancel: &CancellationToken) -> DbResult<MigrationStatusReport> {
        const OP: &str = "get_status";
        let files = scan_migrations_dir(&self.dir).await.map_err(|e| {
            DbError::wrap(e, ErrorCode::MigrationFailed, OP, "")
        })?;
        let applied = self.applied(cancel, OP).await?;
        Ok(build_status(&files, &applied))
    }

    /// Create a new timestamp-prefixed migration in the directory.
    pub async fn create(&self, name: &str, kind: MigrationKind) -> DbResult<CreatedMigration> {
        create_migration(&self.dir, name, kind, Utc::now()).await
    }

    /// Check that the directory loads and the database is reachable.
    pub async fn validate(&self, cancel: &CancellationToken) -> DbResult<()> {
        const OP: &str = "validate_migrations";
        if self.dir.as_os_str().is_empty() {
            return Err(DbError::validation("migrations directory not set").with_operation(OP));
        }

        self.load(OP)
            .await
            .map_err(|e| DbError::wrap(e, ErrorCode::Validation, OP, "invalid migrations directory"))
            .map_err(retag(ErrorCode::Validation))?;

        self.version(cancel)
            .await
            .map_err(|e| {
                DbError::wrap(e, ErrorCode::Validation, OP, "failed to validate database connection")
            })
            .map_err(retag(ErrorCode::Validation))?;
        Ok(())
    }

    /// Apply `versions` in order, moving back to the starting version if any
    /// step fails. An empty list applies everything pending.
    pub async fn up_batch(&self, cancel: &CancellationToken, versions: &[i64]) -> DbResult<()> {
        const OP: &str = "migrate_up_transaction";
        if versions.is_empty() {
            return self.up(cancel).await;
        }

        let start = self.version(cancel).await.map_err(|e| {
            DbError::wrap(
                e,
                ErrorCode::MigrationFailed,
                OP,
                "failed to get current version before batch migration",
            )
        })?;

        for &version in versions {
            let Err(err) = self.up_to(cancel, version).await else {
                continue;
            };
            warn!(target_version = version, start_version = start, "Batch migration failed, moving back");
            let err = DbError::wrap(
                err,
                ErrorCode::MigrationFailed,
                OP,
                &format!("failed to migrate to version {version} in batch operation"),
            )
            .with_context("target_version", version);

            return Err(match self.down_to(cancel, start).await {
                Ok(()) => err,
                Err(rollback) => err.with_context("rollback_error", rollback.to_string()),
            });
        }
        Ok(())
    }

    /// Revert to each of `versions`, newest target last in the list first,
    /// moving forward to the starting version if any step fails. An empty
    /// list reverts one migration.
    pub async fn down_batch(&self, cancel: &CancellationToken, versions: &[i64]) -> DbResult<()> {
        const OP: &str = "migrate_down_transaction";
        if versions.is_empty() {
            return self.down(cancel).await;
        }

        let start = self.version(cancel).await.map_err(|e| {
            DbError::wrap(
                e,
                ErrorCode::MigrationFailed,
                OP,
                "failed to get current version before batch rollback",
            )
        })?;

        for &version in versions.iter().rev() {
            let Err(err) = self.down_to(cancel, version).await else {
                continue;
            };
            warn!(target_version = version, start_version = start, "Batch rollback failed, restoring");
            let err = DbError::wrap(
                err,
                ErrorCode::MigrationFailed,
                OP,
                &format!("failed to rollback to version {version} in batch operation"),
            )
            .with_context("target_version", version);

            return Err(match self.up_to(cancel, start).await {
                Ok(_) => err,
                Err(restore) => err.with_context("restore_error", restore.to_string()),
            });
        }
        Ok(())
    }

    async fn load(&self, operation: &str) -> DbResult<Engine> {
        Engine::new(self.dir.clone()).await.map_err(|e| {
            migrate_error(e, operation, "failed to load migrations")
                .with_context("dir", self.dir.display().to_string())
        })
    }

    /// Validated pool for a migration step. Migration steps are not retried.
    async fn ready_pool(&self, cancel: &CancellationToken, operation: &str) -> DbResult<PgPool> {
        self.db.validate_connection(cancel).await.map_err(|e| {
            DbError::wrap(e, ErrorCode::ConnectionFailed, operation, "connection validation failed")
        })?;
        Ok(self.db.pool().await)
    }

    /// Applied versions with their install time.
    async fn applied(
        &self,
        cancel: &CancellationToken,
        operation: &str,
    ) -> DbResult<BTreeMap<i64, DateTime<Utc>>> {
        self.db
            .with_validation(cancel, operation, |pool| async move {
                let mut conn = pool.acquire().await?;
                conn.ensure_migrations_table()
                    .await
                    .map_err(|e| migrate_error(e, operation, "failed to prepare migrations table"))?;

                let rows: Vec<(i64, DateTime<Utc>)> = sqlx::query_as(APPLIED_MIGRATIONS_QUERY)
                    .fetch_all(&mut *conn)
                    .await
                    .map_err(|e| {
                        DbError::new(ErrorCode::MigrationFailed, "failed to read applied migrations")
                            .with_operation(operation)
                            .with_source(e)
                    })?;
                let applied: BTreeMap<i64, DateTime<Utc>> = rows.into_iter().collect();
                Ok(applied)
            })
            .await
    }

    /// Apply up to `max` pending forward migrations accepted by `accept`.
    async fn apply_pending<F>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        accept: F,
        max: usize,
    ) -> DbResult<Vec<i64>>
    where
        F: Fn(&Migration) -> bool,
    {
        let engine = self.load(operation).await?;
        let pool = self.ready_pool(cancel, operation).await?;

        let applied = cancellable(cancel, operation, async {
            let mut conn = pool.acquire().await?;
            let fail = |e: MigrateError| migrate_error(e, operation, "migration step failed");

            conn.lock().await.map_err(fail)?;
            let result: DbResult<Vec<i64>> = async {
                conn.ensure_migrations_table().await.map_err(fail)?;
                if let Some(version) = conn.dirty_version().await.map_err(fail)? {
                    return Err(dirty(version, operation));
                }

                let done: HashMap<i64, Vec<u8>> = conn
                    .list_applied_migrations()
                    .await
                    .map_err(fail)?
                    .into_iter()
                    .map(|m| (m.version, m.checksum.into_owned()))
                    .collect();

                let mut applied = Vec::new();
                for migration in engine.iter() {
                    if migration.migration_type.is_down_migration() {
                        continue;
                    }
                    if let Some(checksum) = done.get(&migration.version) {
                        if *checksum != *migration.checksum {
                            return Err(checksum_mismatch(migration.version, operation));
                        }
                        continue;
                    }
                    if applied.len() >= max || !accept(migration) {
                        continue;
                    }

                    let elapsed = conn.apply(migration).await.map_err(fail)?;
                    debug!(
                        version = migration.version,
                        description = %migration.description,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Applied migration"
                    );
                    applied.push(migration.version);
                }
                Ok(applied)
            }
            .await;

            if let Err(e) = conn.unlock().await {
                warn!(error = %e, "Failed to release migration lock");
            }
            result
        })
        .await?;

        info!(operation, applied = ?applied, "Migrations applied");
        Ok(applied)
    }

    /// Revert every applied reversible migration newer than `target`.
    async fn undo(&self, cancel: &CancellationToken, operation: &str, target: i64) -> DbResult<()> {
        let engine = self.load(operation).await?;
        let pool = self.ready_pool(cancel, operation).await?;

        cancellable(cancel, operation, async {
            engine
                .undo(&pool, target)
                .await
                .map_err(|e| migrate_error(e, operation, "failed to revert migrations"))
        })
        .await?;

        info!(operation, target_version = target, "Migrations reverted");
        Ok(())
    }
}

fn migrate_error(err: MigrateError, operation: &str, message: &str) -> DbError {
    match err {
        MigrateError::VersionMismatch(version) => checksum_mismatch(version, operation),
        MigrateError::Dirty(version) => dirty(version, operation),
        MigrateError::VersionMissing(version) => DbError::new(
            ErrorCode::MigrationNotFound,
            format!("applied migration {version} is missing from the migrations directory"),
        )
        .with_operation(operation)
        .with_context("version", version),
        other => DbError::migration(message)
            .with_operation(operation)
            .with_source(other),
    }
}

fn checksum_mismatch(version: i64, operation: &str) -> DbError {
    DbError::new(
        ErrorCode::MigrationConflict,
        format!("migration {version} was applied but has since been modified"),
    )
    .with_operation(operation)
    .with_context("version", version)
}

fn dirty(version: i64, operation: &str) -> DbError {
    DbError::new(
        ErrorCode::MigrationConflict,
        format!("migration {version} is partially applied; fix it manually before continuing"),
    )
    .with_operation(operation)
    .with_context("version", version)
}

/// Force the category of an error while keeping everything else.
fn retag(code: ErrorCode) -> impl Fn(DbError) -> DbError {
    move |err| {
        if err.is(code) {
            return err;
        }
        let mut tagged = DbError::new(code, err.message().to_string());
        if let Some(operation) = err.operation() {
            tagged = tagged.with_operation(operation.to_string());
        }
        tagged.with_source(err)
    }
}

/// Parse `<digits>_<description>.sql` (or `.up.sql`).
///
/// Down files, other extensions and non-numeric prefixes yield `None`.
pub fn parse_migration_file_name(file_name: &str) -> Option<(i64, String)> {
    if file_name.ends_with(".down.sql") {
        return None;
    }
    let stem = file_name
        .strip_suffix(".up.sql")
        .or_else(|| file_name.strip_suffix(".sql"))?;
    let (prefix, description) = stem.split_once('_')?;
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let version = prefix.parse().ok()?;
    Some((version, description.replace('_', " ")))
}

/// Migration files in `dir`, one per version, ordered by version.
pub async fn scan_migrations_dir(dir: &Path) -> DbResult<Vec<MigrationFile>> {
    let read_err = |e: std::io::Error| {
        DbError::migration("failed to read migrations directory")
            .with_context("dir", dir.display().to_string())
            .with_source(e)
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(read_err)?;
    let mut files: BTreeMap<i64, MigrationFile> = BTreeMap::new();

    while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
        if entry.file_type().await.map_err(read_err)?.is_dir() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let Some((version, description)) = parse_migration_file_name(&file_name) else {
            continue;
        };
        files.entry(version).or_insert(MigrationFile {
            version,
            description,
            file_name,
        });
    }

    Ok(files.into_values().collect())
}

/// Combine files on disk with applied rows into a report.
pub fn build_status(
    files: &[MigrationFile],
    applied: &BTreeMap<i64, DateTime<Utc>>,
) -> MigrationStatusReport {
    let mut migrations: Vec<MigrationStatus> = files
        .iter()
        .map(|file| {
            let applied_at = applied.get(&file.version).copied();
            MigrationStatus {
                version: file.version,
                description: file.description.clone(),
                source: file.file_name.clone(),
                is_applied: applied_at.is_some(),
                applied_at,
            }
        })
        .collect();
    migrations.sort_by_key(|m| m.version);

    let applied_count = migrations.iter().filter(|m| m.is_applied).count();
    MigrationStatusReport {
        current_version: applied.keys().next_back().copied().unwrap_or(0),
        latest_version: migrations.last().map_or(0, |m| m.version),
        pending_count: migrations.len() - applied_count,
        applied_count,
        migrations,
    }
}

/// Write the file(s) for a new migration named `name`.
pub async fn create_migration(
    dir: &Path,
    name: &str,
    kind: MigrationKind,
    now: DateTime<Utc>,
) -> DbResult<CreatedMigration> {
    const OP: &str = "create_migration";

    let slug: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let slug = slug.trim_matches('_').to_string();
    if slug.is_empty() {
        return Err(DbError::validation("migration name must contain letters or digits")
            .with_operation(OP)
            .with_context("name", name));
    }

    let prefix = now.format("%Y%m%d%H%M%S").to_string();
    let version: i64 = prefix.parse().map_err(|e| {
        DbError::new(ErrorCode::Internal, "invalid migration timestamp")
            .with_operation(OP)
            .with_source(e)
    })?;

    let write_err = |path: &Path, e: std::io::Error| {
        DbError::migration("failed to write migration file")
            .with_operation(OP)
            .with_context("path", path.display().to_string())
            .with_source(e)
    };

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| write_err(dir, e))?;

    let files: Vec<(PathBuf, String)> = match kind {
        MigrationKind::Simple => vec![(
            dir.join(format!("{prefix}_{slug}.sql")),
            format!("-- {name}\n"),
        )],
        MigrationKind::Reversible => vec![
            (
                dir.join(format!("{prefix}_{slug}.up.sql")),
                format!("-- {name}: apply\n"),
            ),
            (
                dir.join(format!("{prefix}_{slug}.down.sql")),
                format!("-- {name}: revert\n"),
            ),
        ],
    };

    for (path, contents) in &files {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(DbError::new(
                ErrorCode::MigrationConflict,
                format!("migration file already exists: {}", path.display()),
            )
            .with_operation(OP));
        }
        tokio::fs::write(path, contents)
            .await
            .map_err(|e| write_err(path, e))?;
    }

    let files: Vec<PathBuf> = files.into_iter().map(|(path, _)| path).collect();
    info!(version, files = ?files, "Created migration");
    Ok(CreatedMigration { version, files })
}
