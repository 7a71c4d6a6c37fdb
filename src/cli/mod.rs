//! The `db-kit` command line.
//!
//! Every command connects with the flattened [`Config`], runs under the
//! `--timeout` budget and a token that Ctrl-C cancels, then prints either a
//! success message or a structured error. The process exit status encodes
//! the error family (see [`output::exit_code`]).

pub mod output;
pub mod status;

use crate::config::Config;
use crate::db::Database;
use crate::db::migrate::create_migration;
use crate::error::DbError;
use crate::models::MigrationKind;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use thiserror::Error;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use output::{ErrorOutput, Output};

/// Command-line arguments.
#[derive(Parser)]
#[command(name = "db-kit", version, about = "PostgreSQL toolkit: health, migrations, introspection, backups")]
pub struct Cli {
    #[command(flatten)]
    pub config: Config,

    /// Print results and errors as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Show operation, context and technical details on errors
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, env = "DB_KIT_LOG_JSON", global = true)]
    pub log_json: bool,

    /// Time budget for the whole command
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration, global = true)]
    pub timeout: Duration,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Show connection, health, metadata, migration and pool status
    Status,
    /// Ping the database
    Ping,
    /// Ping and run a trivial query
    Health,
    /// Apply, revert and inspect migrations
    #[command(subcommand)]
    Migrate(MigrateCommand),
    /// Introspect database schema and metadata
    #[command(subcommand)]
    Introspect(IntrospectCommand),
    /// Dump the database
    Backup {
        /// Write to this file instead of a timestamped file in the backups directory
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Restore the database from a dump
    Restore {
        /// Dump produced by `backup`
        file: PathBuf,
    },
}

#[derive(Debug, Clone, Subcommand)]
pub enum MigrateCommand {
    /// Apply all pending migrations
    Up,
    /// Apply pending migrations up to and including a version
    UpTo { version: i64 },
    /// Apply the next pending migration
    UpByOne,
    /// Revert the most recent migration
    Down,
    /// Revert migrations newer than a version
    DownTo { version: i64 },
    /// Revert every applied migration
    Reset,
    /// Show applied and pending migrations
    Status,
    /// Print the current migration version
    Version,
    /// Create a new migration file
    Create {
        name: String,
        /// Single forward-only file or an up/down pair
        #[arg(long = "type", short = 't', value_enum, default_value_t = MigrationKind::Simple)]
        kind: MigrationKind,
    },
    /// Check migration files against the applied history
    Validate,
}

#[derive(Debug, Clone, Subcommand)]
pub enum IntrospectCommand {
    /// List schemas, or the tables of one schema
    Schema { schema: Option<String> },
    /// List tables with columns, indexes and constraints
    Tables { schema: Option<String> },
    /// Show one table
    Table { schema: String, table: String },
    /// Show the columns of a table
    Columns { schema: String, table: String },
    /// Show the indexes of a table
    Indexes { schema: String, table: String },
    /// Show the constraints of a table
    Constraints { schema: String, table: String },
    /// Show foreign key relationships
    Relationships { schema: Option<String> },
    /// Show the server version
    Version,
    /// Show the database size
    Size,
    /// Show version, size, schemas and tables
    Info,
}

/// Failure of a CLI command.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("command timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),

    #[error("failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),
}

type CliResult<T = ()> = Result<T, CliError>;

impl Command {
    /// Operation name reported when an error carries none.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Status => "get_status",
            Self::Ping => "ping",
            Self::Health => "health_check",
            Self::Migrate(cmd) => match cmd {
                MigrateCommand::Up => "migrate_up",
                MigrateCommand::UpTo { .. } => "migrate_up_to",
                MigrateCommand::UpByOne => "migrate_up_by_one",
                MigrateCommand::Down => "migrate_down",
                MigrateCommand::DownTo { .. } => "migrate_down_to",
                MigrateCommand::Reset => "migrate_reset",
                MigrateCommand::Status => "migration_status",
                MigrateCommand::Version => "get_version",
                MigrateCommand::Create { .. } => "create_migration",
                MigrateCommand::Validate => "validate_migrations",
            },
            Self::Introspect(cmd) => match cmd {
                IntrospectCommand::Schema { .. } => "get_schemas",
                IntrospectCommand::Tables { .. } => "get_tables",
                IntrospectCommand::Table { .. } => "get_table_info",
                IntrospectCommand::Columns { .. } => "get_table_columns",
                IntrospectCommand::Indexes { .. } => "get_table_indexes",
                IntrospectCommand::Constraints { .. } => "get_table_constraints",
                IntrospectCommand::Relationships { .. } => "get_foreign_key_relationships",
                IntrospectCommand::Version => "get_database_version",
                IntrospectCommand::Size => "get_database_size",
                IntrospectCommand::Info => "get_database_info",
            },
            Self::Backup { .. } => "backup",
            Self::Restore { .. } => "restore",
        }
    }
}

/// Run the parsed command line and map the outcome to an exit status.
pub async fn run(cli: Cli) -> ExitCode {
    let output = Output::new(cli.json, cli.verbose);
    let operation = cli.command.operation();

    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_signal() => {
                info!("Interrupt received, cancelling");
                watcher.cancel();
            }
            _ = watcher.cancelled() => {}
        }
    });

    let result = match tokio::time::timeout(
        cli.timeout,
        execute(&cli.command, cli.config, &cancel, &output),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(CliError::Timeout(cli.timeout)),
    };
    cancel.cancel();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => output.error(&e, operation),
    }
}

async fn execute(
    command: &Command,
    config: Config,
    cancel: &CancellationToken,
    output: &Output,
) -> CliResult {
    // Creating a migration only touches the filesystem.
    if let Command::Migrate(MigrateCommand::Create { name, kind }) = command {
        return create(&config.migrations_dir, name, *kind, output).await;
    }

    let db = Database::connect(config).await?;
    let result = dispatch(&db, command, cancel, output).await;
    db.close().await;
    debug!("Connection closed");
    result
}

async fn dispatch(
    db: &Database,
    command: &Command,
    cancel: &CancellationToken,
    output: &Output,
) -> CliResult {
    match command {
        Command::Status => {
            let report = status::collect(db, cancel).await;
            if output.json {
                output.success(
                    "Database status retrieved successfully",
                    Some(json!({ "status": report })),
                );
            } else {
                print!("{}", status::render(&report));
            }
        }
        Command::Ping => {
            db.ping(cancel).await?;
            output.success("Database ping successful", None);
        }
        Command::Health => {
            db.health_check(cancel).await?;
            output.success("Database is healthy", None);
        }
        Command::Migrate(cmd) => migrate(db, cmd, cancel, output).await?,
        Command::Introspect(cmd) => introspect(db, cmd, cancel, output).await?,
        Command::Backup { file } => {
            let path = match file {
                Some(path) => {
                    db.backup_to_file(cancel, path).await?;
                    path.clone()
                }
                None => db.backup(cancel).await?,
            };
            output.success(
                &format!("Backup written to {}", path.display()),
                Some(json!({ "path": path })),
            );
        }
        Command::Restore { file } => {
            db.restore(cancel, file).await?;
            output.success(
                &format!("Database restored from {}", file.display()),
                Some(json!({ "path": file })),
            );
        }
    }
    Ok(())
}

async fn migrate(
    db: &Database,
    command: &MigrateCommand,
    cancel: &CancellationToken,
    output: &Output,
) -> CliResult {
    let migrator = db.migrator();

    match command {
        MigrateCommand::Up => {
            migrator.up(cancel).await?;
            output.success("Migration up completed successfully", None);
        }
        MigrateCommand::UpTo { version } => {
            let applied = migrator.up_to(cancel, *version).await?;
            output.success(
                &format!("Migrated up to version {version}"),
                Some(json!({ "applied": applied })),
            );
        }
        MigrateCommand::UpByOne => match migrator.up_by_one(cancel).await? {
            Some(version) => output.success(
                &format!("Applied migration {version}"),
                Some(json!({ "version": version })),
            ),
            None => output.success("No pending migrations", None),
        },
        MigrateCommand::Down => {
            migrator.down(cancel).await?;
            output.success("Migration down completed successfully", None);
        }
        MigrateCommand::DownTo { version } => {
            migrator.down_to(cancel, *version).await?;
            output.success(&format!("Migrated down to version {version}"), None);
        }
        MigrateCommand::Reset => {
            migrator.reset(cancel).await?;
            output.success("Database reset completed successfully", None);
        }
        MigrateCommand::Status => {
            let report = migrator.status(cancel).await?;
            output.success(
                "Migration status retrieved successfully",
                Some(to_json(&report)?),
            );
        }
        MigrateCommand::Version => {
            let version = migrator.version(cancel).await?;
            output.success(
                &format!("Current migration version: {version}"),
                Some(json!({ "version": version })),
            );
        }
        MigrateCommand::Validate => {
            migrator.validate(cancel).await?;
            output.success("Migrations are valid", None);
        }
        MigrateCommand::Create { name, kind } => {
            create(migrator.source(), name, *kind, output).await?;
        }
    }
    Ok(())
}

async fn create(dir: &Path, name: &str, kind: MigrationKind, output: &Output) -> CliResult {
    let created = create_migration(dir, name, kind, Utc::now()).await?;
    output.success(
        &format!("Migration '{name}' created successfully"),
        Some(to_json(&created)?),
    );
    Ok(())
}

async fn introspect(
    db: &Database,
    command: &IntrospectCommand,
    cancel: &CancellationToken,
    output: &Output,
) -> CliResult {
    let service = db.introspection();

    match command {
        IntrospectCommand::Schema { schema: None } => {
            let schemas = service.schemas(cancel).await?;
            output.success(
                "Schemas retrieved successfully",
                Some(json!({ "schemas": schemas })),
            );
        }
        IntrospectCommand::Schema {
            schema: Some(schema),
        } => {
            let tables = service.tables(cancel, Some(schema)).await?;
            output.success(
                &format!("Schema '{schema}' tables retrieved successfully"),
                Some(json!({ "schema": schema, "tables": tables })),
            );
        }
        IntrospectCommand::Tables { schema } => {
            let tables = service.tables(cancel, schema.as_deref()).await?;
            output.success(
                "Tables retrieved successfully",
                Some(json!({ "tables": tables, "count": tables.len() })),
            );
        }
        IntrospectCommand::Table { schema, table } => {
            if !service.table_exists(cancel, schema, table).await? {
                return Err(table_not_found(schema, table).into());
            }
            let info = service
                .tables(cancel, Some(schema))
                .await?
                .into_iter()
                .find(|t| &t.name == table)
                .ok_or_else(|| table_not_found(schema, table))?;
            output.success(
                &format!("Table '{schema}.{table}' information retrieved successfully"),
                Some(json!({ "table": info })),
            );
        }
        IntrospectCommand::Columns { schema, table } => {
            let columns = service.table_columns(cancel, schema, table).await?;
            output.success(
                &format!("Columns for table '{schema}.{table}' retrieved successfully"),
                Some(json!({ "schema": schema, "table": table, "columns": columns })),
            );
        }
        IntrospectCommand::Indexes { schema, table } => {
            let indexes = service.table_indexes(cancel, schema, table).await?;
            output.success(
                &format!("Indexes for table '{schema}.{table}' retrieved successfully"),
                Some(json!({ "schema": schema, "table": table, "indexes": indexes })),
            );
        }
        IntrospectCommand::Constraints { schema, table } => {
            let constraints = service.table_constraints(cancel, schema, table).await?;
            output.success(
                &format!("Constraints for table '{schema}.{table}' retrieved successfully"),
                Some(json!({ "schema": schema, "table": table, "constraints": constraints })),
            );
        }
        IntrospectCommand::Relationships { schema } => {
            let relationships = service
                .foreign_key_relationships(cancel, schema.as_deref())
                .await?;
            output.success(
                "Foreign key relationships retrieved successfully",
                Some(json!({ "relationships": relationships })),
            );
        }
        IntrospectCommand::Version => {
            let version = service.database_version(cancel).await?;
            output.success(
                "Database version retrieved successfully",
                Some(json!({ "version": version })),
            );
        }
        IntrospectCommand::Size => {
            let size = service.database_size(cancel).await?;
            let human = humansize::format_size(u64::try_from(size).unwrap_or_default(), humansize::DECIMAL);
            output.success(
                &format!("Database size: {human}"),
                Some(json!({ "size": size, "size_human": human })),
            );
        }
        IntrospectCommand::Info => {
            let info = service.database_info(cancel).await?;
            output.success(
                "Database information retrieved successfully",
                Some(to_json(&info)?),
            );
        }
    }
    Ok(())
}

fn table_not_found(schema: &str, table: &str) -> DbError {
    DbError::validation(format!("table '{schema}.{table}' does not exist"))
        .with_operation("get_table_info")
        .with_context("schema", schema)
        .with_context("table", table)
        .with_user_message(format!("Table '{schema}.{table}' does not exist."))
}

fn to_json<T: Serialize>(value: &T) -> Result<JsonValue, serde_json::Error> {
    serde_json::to_value(value)
}

/// Resolve on SIGINT or SIGTERM. Pends forever if no handler can be installed.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_global_flags() {
        let cli = Cli::try_parse_from([
            "db-kit",
            "--host",
            "db.internal",
            "--db",
            "app",
            "--timeout",
            "2m",
            "status",
            "--json",
        ])
        .unwrap();

        assert_eq!(cli.config.host, "db.internal");
        assert_eq!(cli.config.database, "app");
        assert_eq!(cli.timeout, Duration::from_secs(120));
        assert!(cli.json);
        assert!(matches!(cli.command, Command::Status));
    }

    #[test]
    fn test_parse_migrate_create() {
        let cli = Cli::try_parse_from(["db-kit", "migrate", "create", "add_users", "-t", "reversible"])
            .unwrap();
        match cli.command {
            Command::Migrate(MigrateCommand::Create { name, kind }) => {
                assert_eq!(name, "add_users");
                assert_eq!(kind, MigrationKind::Reversible);
            }
            _ => panic!("expected migrate create"),
        }
    }

    #[test]
    fn test_parse_introspect_table_requires_both_names() {
        assert!(Cli::try_parse_from(["db-kit", "introspect", "table", "public"]).is_err());

        let cli = Cli::try_parse_from(["db-kit", "introspect", "table", "public", "users"]).unwrap();
        assert_eq!(cli.command.operation(), "get_table_info");
    }

    #[test]
    fn test_parse_migrate_up_to() {
        let cli = Cli::try_parse_from(["db-kit", "migrate", "up-to", "20240101120000"]).unwrap();
        match cli.command {
            Command::Migrate(MigrateCommand::UpTo { version }) => assert_eq!(version, 20240101120000),
            _ => panic!("expected migrate up-to"),
        }
    }

    #[test]
    fn test_parse_backup_file() {
        let cli = Cli::try_parse_from(["db-kit", "backup", "--file", "/tmp/app.sql"]).unwrap();
        match cli.command {
            Command::Backup { file } => assert_eq!(file, Some(PathBuf::from("/tmp/app.sql"))),
            _ => panic!("expected backup"),
        }
    }

    #[test]
    fn test_table_not_found_is_validation() {
        let err = table_not_found("public", "missing");
        assert_eq!(err.code(), crate::error::ErrorCode::Validation);
        assert_eq!(err.display_message(), "Table 'public.missing' does not exist.");
    }

    #[tokio::test]
    async fn test_create_runs_without_database() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            migrations_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let command = Command::Migrate(MigrateCommand::Create {
            name: "add users".to_string(),
            kind: MigrationKind::Simple,
        });

        execute(&command, config, &CancellationToken::new(), &Output::default())
            .await
            .unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
