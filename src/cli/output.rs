//! Success and error rendering for the command line.
//!
//! Results go to stdout, errors to stderr. With `--json` both sides are
//! pretty-printed JSON objects so scripts can parse them.

use super::CliError;
use crate::error::ErrorCode;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue, json};
use std::collections::BTreeMap;
use std::process::ExitCode;

/// Rendering switches shared by every command.
#[derive(Debug, Clone, Copy, Default)]
pub struct Output {
    pub json: bool,
    pub verbose: bool,
}

impl Output {
    pub fn new(json: bool, verbose: bool) -> Self {
        Self { json, verbose }
    }

    /// Print a success message and optional data.
    ///
    /// Human mode prints the message followed by the data as indented JSON.
    pub fn success(&self, message: &str, data: Option<JsonValue>) {
        if self.json {
            let mut out = Map::new();
            out.insert("success".to_string(), JsonValue::Bool(true));
            out.insert("message".to_string(), JsonValue::String(message.to_string()));
            if let Some(data) = data {
                out.insert("data".to_string(), data);
            }
            match serde_json::to_string_pretty(&out) {
                Ok(text) => println!("{text}"),
                Err(_) => println!("{message}"),
            }
            return;
        }

        println!("{message}");
        if let Some(data) = data.filter(|d| !d.is_null()) {
            if let Ok(text) = serde_json::to_string_pretty(&data) {
                println!("{text}");
            }
        }
    }

    /// Print an error and return the matching exit code.
    pub fn error(&self, err: &CliError, operation: &str) -> ExitCode {
        let report = ErrorOutput::build(err, operation);
        if self.json {
            match serde_json::to_string_pretty(&report) {
                Ok(text) => eprintln!("{text}"),
                Err(_) => eprintln!("Error: {err}"),
            }
        } else {
            eprint!("{}", report.render_human(self.verbose));
        }
        exit_code(report.code)
    }
}

/// Structured error report.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorOutput {
    pub error: String,
    pub code: ErrorCode,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub operation: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, JsonValue>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user_message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<&'static str>,
}

impl ErrorOutput {
    /// Collect the report for `err`. `operation` names the command step and is
    /// used when the error carries no operation of its own.
    pub fn build(err: &CliError, operation: &str) -> Self {
        match err {
            CliError::Db(db_err) => Self {
                error: db_err.to_string(),
                code: db_err.code(),
                operation: db_err.operation().unwrap_or(operation).to_string(),
                context: db_err.context().clone(),
                user_message: db_err.display_message().to_string(),
                suggestions: suggestions(db_err.code()).to_vec(),
            },
            CliError::Timeout(limit) => Self {
                error: err.to_string(),
                code: ErrorCode::OperationTimeout,
                operation: operation.to_string(),
                context: BTreeMap::from([(
                    "timeout".to_string(),
                    json!(humantime::format_duration(*limit).to_string()),
                )]),
                user_message: format!(
                    "The command did not finish within {}.",
                    humantime::format_duration(*limit)
                ),
                suggestions: suggestions(ErrorCode::OperationTimeout).to_vec(),
            },
            other => Self {
                error: other.to_string(),
                code: ErrorCode::Unknown,
                operation: operation.to_string(),
                context: BTreeMap::new(),
                user_message: other.to_string(),
                suggestions: suggestions(ErrorCode::Unknown).to_vec(),
            },
        }
    }

    /// Multi-line text for stderr.
    pub fn render_human(&self, verbose: bool) -> String {
        let mut out = String::new();

        if self.user_message.is_empty() {
            out.push_str(&format!("Error: {}\n", self.error));
        } else {
            out.push_str(&format!("Error: {}\n", self.user_message));
        }
        if self.code != ErrorCode::Unknown {
            out.push_str(&format!("Error Code: {}\n", self.code));
        }
        if verbose && !self.operation.is_empty() {
            out.push_str(&format!("Operation: {}\n", self.operation));
        }
        if verbose && !self.context.is_empty() {
            out.push_str("Context:\n");
            for (key, value) in &self.context {
                out.push_str(&format!("  {key}: {}\n", display_value(value)));
            }
        }
        if !self.suggestions.is_empty() {
            out.push_str("\nSuggestions:\n");
            for suggestion in &self.suggestions {
                out.push_str(&format!("  • {suggestion}\n"));
            }
        }
        if verbose {
            out.push_str(&format!("\nTechnical Details: {}\n", self.error));
        }

        out
    }
}

fn display_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Hints shown under an error, keyed by category.
pub fn suggestions(code: ErrorCode) -> &'static [&'static str] {
    match code {
        ErrorCode::ConnectionFailed | ErrorCode::ConnectionRefused => &[
            "Check if the database server is running",
            "Verify the host and port configuration",
            "Ensure the database is accepting connections",
            "Check firewall settings",
        ],
        ErrorCode::AuthenticationError | ErrorCode::InvalidCredentials => &[
            "Verify your username and password",
            "Check if the user has sufficient privileges",
            "Ensure the database exists and is accessible",
        ],
        ErrorCode::ConnectionTimeout => &[
            "Check network connectivity to the database",
            "Increase the connect timeout if the database is slow",
            "Verify the database is not overloaded",
        ],
        ErrorCode::MigrationFailed | ErrorCode::MigrationConflict => &[
            "Check the migration files for syntax errors",
            "Verify the database schema state",
            "Review migration dependencies and order",
            "Check database permissions for schema changes",
        ],
        ErrorCode::MigrationNotFound => &[
            "Check that the migrations directory is correct",
            "Verify the requested version exists on disk",
        ],
        ErrorCode::BackupFailed => &[
            "Ensure pg_dump is installed and accessible",
            "Check disk space for the backup destination",
            "Verify write permissions for the backup directory",
            "Check if the database is accessible",
        ],
        ErrorCode::RestoreFailed | ErrorCode::InvalidBackupFile => &[
            "Ensure pg_restore or psql is installed",
            "Verify the backup file exists and is readable",
            "Check if the backup file format is compatible",
            "Ensure the target database is accessible",
        ],
        ErrorCode::InvalidConfig | ErrorCode::MissingConfig => &[
            "Review your database configuration settings",
            "Check environment variables for typos",
            "Verify all required configuration is provided",
        ],
        ErrorCode::TooManyConnections => &[
            "Reduce the number of concurrent connections",
            "Lower --max-open-conns for this client",
            "Check the server's max_connections setting",
        ],
        ErrorCode::RetryExhausted => &[
            "Check if the issue persists and try again later",
            "Verify network stability",
            "Consider increasing retry attempts or delays",
            "Check database server health and load",
        ],
        ErrorCode::OperationTimeout => &[
            "Increase --timeout for long-running commands",
            "Check database server load",
        ],
        ErrorCode::Validation => &["Check the command arguments"],
        ErrorCode::Cancelled => &[],
        _ => &[
            "Check the database server status",
            "Review configuration and network connectivity",
            "Enable --verbose for more detailed error information",
        ],
    }
}

/// Process exit status for an error category.
pub fn exit_code(code: ErrorCode) -> ExitCode {
    ExitCode::from(exit_status(code))
}

fn exit_status(code: ErrorCode) -> u8 {
    match code {
        ErrorCode::InvalidConfig | ErrorCode::MissingConfig | ErrorCode::Validation => 2,
        ErrorCode::ConnectionFailed
        | ErrorCode::ConnectionTimeout
        | ErrorCode::ConnectionRefused
        | ErrorCode::AuthenticationError
        | ErrorCode::InvalidCredentials
        | ErrorCode::RetryExhausted => 3,
        ErrorCode::MigrationFailed | ErrorCode::MigrationNotFound | ErrorCode::MigrationConflict => {
            4
        }
        ErrorCode::BackupFailed | ErrorCode::RestoreFailed | ErrorCode::InvalidBackupFile => 5,
        ErrorCode::QueryFailed
        | ErrorCode::SyntaxError
        | ErrorCode::ConstraintViolation
        | ErrorCode::InsufficientResources
        | ErrorCode::TooManyConnections
        | ErrorCode::DiskFull
        | ErrorCode::OperationTimeout
        | ErrorCode::Cancelled
        | ErrorCode::TransactionBegin
        | ErrorCode::TransactionCommit
        | ErrorCode::TransactionRollback
        | ErrorCode::TransactionFailed
        | ErrorCode::Unknown
        | ErrorCode::Internal => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use std::time::Duration;

    #[test]
    fn test_exit_status_families() {
        assert_eq!(exit_status(ErrorCode::InvalidConfig), 2);
        assert_eq!(exit_status(ErrorCode::Validation), 2);
        assert_eq!(exit_status(ErrorCode::ConnectionRefused), 3);
        assert_eq!(exit_status(ErrorCode::RetryExhausted), 3);
        assert_eq!(exit_status(ErrorCode::MigrationConflict), 4);
        assert_eq!(exit_status(ErrorCode::InvalidBackupFile), 5);
        assert_eq!(exit_status(ErrorCode::QueryFailed), 1);
        assert_eq!(exit_status(ErrorCode::Cancelled), 1);
    }

    #[test]
    fn test_every_code_has_an_exit_status() {
        for code in ErrorCode::ALL {
            assert!(exit_status(code) <= 5);
        }
    }

    #[test]
    fn test_query_resource_and_transaction_codes_exit_one() {
        for code in [
            ErrorCode::SyntaxError,
            ErrorCode::ConstraintViolation,
            ErrorCode::TooManyConnections,
            ErrorCode::DiskFull,
            ErrorCode::OperationTimeout,
            ErrorCode::TransactionCommit,
            ErrorCode::TransactionFailed,
            ErrorCode::Internal,
        ] {
            assert_eq!(exit_status(code), 1, "{code}");
        }
    }

    #[test]
    fn test_error_output_from_db_error() {
        let err = CliError::Db(
            DbError::backup("pg_dump exited with status 1")
                .with_operation("backup")
                .with_context("database", "app"),
        );
        let report = ErrorOutput::build(&err, "run_backup");

        assert_eq!(report.code, ErrorCode::BackupFailed);
        assert_eq!(report.operation, "backup");
        assert!(report.user_message.starts_with("Database backup failed"));
        assert!(!report.suggestions.is_empty());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["code"], "BACKUP_FAILED");
        assert_eq!(json["context"]["database"], "app");
    }

    #[test]
    fn test_error_output_falls_back_to_command_operation() {
        let err = CliError::Db(DbError::validation("bad version"));
        let report = ErrorOutput::build(&err, "migrate_up_to");
        assert_eq!(report.operation, "migrate_up_to");
    }

    #[test]
    fn test_timeout_report() {
        let err = CliError::Timeout(Duration::from_secs(30));
        let report = ErrorOutput::build(&err, "status");
        assert_eq!(report.code, ErrorCode::OperationTimeout);
        assert_eq!(report.context["timeout"], "30s");
    }

    #[test]
    fn test_render_human_verbose() {
        let err = CliError::Db(
            DbError::connection("dial failed")
                .with_operation("connect")
                .with_context("host", "db.internal"),
        );
        let report = ErrorOutput::build(&err, "status");

        let quiet = report.render_human(false);
        assert!(quiet.starts_with("Error: Unable to connect"));
        assert!(quiet.contains("Error Code: CONNECTION_FAILED"));
        assert!(!quiet.contains("Technical Details"));

        let verbose = report.render_human(true);
        assert!(verbose.contains("Operation: connect"));
        assert!(verbose.contains("  host: db.internal"));
        assert!(verbose.contains("Technical Details: [CONNECTION_FAILED] connect: dial failed"));
    }
}
