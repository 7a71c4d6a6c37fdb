//! Error types for db-kit.
//!
//! Every failure that leaves a module is a [`DbError`]: a category from the
//! closed [`ErrorCode`] set, a technical message, an optional operation name,
//! key/value context, an optional user-facing message and the wrapped cause.
//! Retriability is derived from the category when the error is created and
//! never changes afterwards.

use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use thiserror::Error;

/// Boxed error used for wrapped causes and transaction bodies.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Connection
    ConnectionFailed,
    ConnectionTimeout,
    ConnectionRefused,
    AuthenticationError,
    InvalidCredentials,

    // Configuration
    InvalidConfig,
    MissingConfig,

    // Migrations
    MigrationFailed,
    MigrationNotFound,
    MigrationConflict,

    // Backup / restore
    BackupFailed,
    RestoreFailed,
    InvalidBackupFile,

    // Queries
    QueryFailed,
    SyntaxError,
    ConstraintViolation,

    // Server resources
    InsufficientResources,
    TooManyConnections,
    DiskFull,

    // Retry engine
    RetryExhausted,
    OperationTimeout,
    Cancelled,

    // Transactions
    TransactionBegin,
    TransactionCommit,
    TransactionRollback,
    TransactionFailed,

    // Generic
    Validation,
    Unknown,
    Internal,
}

impl ErrorCode {
    /// Every category, in declaration order.
    pub const ALL: [ErrorCode; 29] = [
        Self::ConnectionFailed,
        Self::ConnectionTimeout,
        Self::ConnectionRefused,
        Self::AuthenticationError,
        Self::InvalidCredentials,
        Self::InvalidConfig,
        Self::MissingConfig,
        Self::MigrationFailed,
        Self::MigrationNotFound,
        Self::MigrationConflict,
        Self::BackupFailed,
        Self::RestoreFailed,
        Self::InvalidBackupFile,
        Self::QueryFailed,
        Self::SyntaxError,
        Self::ConstraintViolation,
        Self::InsufficientResources,
        Self::TooManyConnections,
        Self::DiskFull,
        Self::RetryExhausted,
        Self::OperationTimeout,
        Self::Cancelled,
        Self::TransactionBegin,
        Self::TransactionCommit,
        Self::TransactionRollback,
        Self::TransactionFailed,
        Self::Validation,
        Self::Unknown,
        Self::Internal,
    ];

    /// Whether a failure of this category is worth another attempt.
    pub fn is_retriable(self) -> bool {
        match self {
            Self::ConnectionFailed
            | Self::ConnectionTimeout
            | Self::ConnectionRefused
            | Self::InsufficientResources
            | Self::TooManyConnections
            | Self::DiskFull
            | Self::OperationTimeout => true,
            Self::AuthenticationError
            | Self::InvalidCredentials
            | Self::InvalidConfig
            | Self::MissingConfig
            | Self::MigrationFailed
            | Self::MigrationNotFound
            | Self::MigrationConflict
            | Self::BackupFailed
            | Self::RestoreFailed
            | Self::InvalidBackupFile
            | Self::QueryFailed
            | Self::SyntaxError
            | Self::ConstraintViolation
            | Self::RetryExhausted
            | Self::Cancelled
            | Self::TransactionBegin
            | Self::TransactionCommit
            | Self::TransactionRollback
            | Self::TransactionFailed
            | Self::Validation
            | Self::Unknown
            | Self::Internal => false,
        }
    }

    /// Stable wire name, e.g. `CONNECTION_FAILED`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionFailed => "CONNECTION_FAILED",
            Self::ConnectionTimeout => "CONNECTION_TIMEOUT",
            Self::ConnectionRefused => "CONNECTION_REFUSED",
            Self::AuthenticationError => "AUTHENTICATION_ERROR",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::InvalidConfig => "INVALID_CONFIG",
            Self::MissingConfig => "MISSING_CONFIG",
            Self::MigrationFailed => "MIGRATION_FAILED",
            Self::MigrationNotFound => "MIGRATION_NOT_FOUND",
            Self::MigrationConflict => "MIGRATION_CONFLICT",
            Self::BackupFailed => "BACKUP_FAILED",
            Self::RestoreFailed => "RESTORE_FAILED",
            Self::InvalidBackupFile => "INVALID_BACKUP_FILE",
            Self::QueryFailed => "QUERY_FAILED",
            Self::SyntaxError => "SYNTAX_ERROR",
            Self::ConstraintViolation => "CONSTRAINT_VIOLATION",
            Self::InsufficientResources => "INSUFFICIENT_RESOURCES",
            Self::TooManyConnections => "TOO_MANY_CONNECTIONS",
            Self::DiskFull => "DISK_FULL",
            Self::RetryExhausted => "RETRY_EXHAUSTED",
            Self::OperationTimeout => "OPERATION_TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::TransactionBegin => "TRANSACTION_BEGIN",
            Self::TransactionCommit => "TRANSACTION_COMMIT",
            Self::TransactionRollback => "TRANSACTION_ROLLBACK",
            Self::TransactionFailed => "TRANSACTION_FAILED",
            Self::Validation => "VALIDATION",
            Self::Unknown => "UNKNOWN",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured database error.
///
/// Two errors compare equal when their categories match, regardless of
/// message or context, so callers can match on `err == DbError::new(code, "")`
/// or, more directly, on [`DbError::is`].
#[derive(Error, Debug, Serialize)]
#[error("[{code}] {}{message}", operation_prefix(.operation))]
pub struct DbError {
    code: ErrorCode,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    operation: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    context: BTreeMap<String, JsonValue>,
    #[source]
    #[serde(skip)]
    source: Option<BoxError>,
    retriable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_message: Option<String>,
}

fn operation_prefix(operation: &Option<String>) -> String {
    match operation {
        Some(op) => format!("{op}: "),
        None => String::new(),
    }
}

impl PartialEq for DbError {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
    }
}

impl DbError {
    /// Create an error of the given category with no cause.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            operation: None,
            context: BTreeMap::new(),
            source: None,
            retriable: code.is_retriable(),
            user_message: None,
        }
    }

    /// Create a connection error with the default user message.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConnectionFailed, message).with_user_message(
            "Unable to connect to the database. Please check your connection settings.",
        )
    }

    /// Create a migration error with the default user message.
    pub fn migration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MigrationFailed, message).with_user_message(
            "Database migration failed. Please check the migration files and database state.",
        )
    }

    /// Create a backup error with the default user message.
    pub fn backup(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BackupFailed, message)
            .with_user_message("Database backup failed. Please check disk space and permissions.")
    }

    /// Create a restore error with the default user message.
    pub fn restore(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RestoreFailed, message).with_user_message(
            "Database restore failed. Please check the backup file and database permissions.",
        )
    }

    /// Create a configuration error with the default user message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfig, message)
            .with_user_message("Database configuration is invalid. Please check your settings.")
    }

    /// Create a validation error with the default user message.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
            .with_user_message("Input validation failed. Please check your parameters.")
    }

    /// Error returned when the caller's cancellation token fired.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, "operation cancelled").with_operation(operation)
    }

    /// Terminal error after the retry budget is spent.
    pub fn retry_exhausted(operation: impl Into<String>, attempts: u32, last: DbError) -> Self {
        Self::new(
            ErrorCode::RetryExhausted,
            format!("operation failed after {attempts} attempts"),
        )
        .with_operation(operation)
        .with_context("attempts", attempts)
        .with_source(last)
        .with_user_message(
            "Operation failed after multiple retry attempts. Please try again later or check your connection.",
        )
    }

    /// Wrap `err` with a category, operation and message.
    ///
    /// An error that already is a `DbError` keeps its category and cause: the
    /// operation is replaced when `operation` is non-empty and `message` is
    /// prefixed onto the existing message. A `DbError` found further down the
    /// cause chain lends its category, context and user message to the new
    /// error, which keeps the whole chain as its cause. Anything else becomes
    /// the cause of a fresh `DbError`.
    pub fn wrap<E>(err: E, code: ErrorCode, operation: &str, message: &str) -> Self
    where
        E: Into<BoxError>,
    {
        let raw = match err.into().downcast::<DbError>() {
            Ok(existing) => return existing.enhance(operation, message),
            Err(raw) => raw,
        };

        let err = match find_in_chain(&*raw) {
            Some(inner) => {
                let mut err = Self::new(inner.code, message);
                err.retriable = inner.retriable;
                err.context = inner.context.clone();
                err.user_message = inner.user_message.clone();
                err.operation = inner.operation.clone();
                err
            }
            None => Self::new(code, message),
        };
        let err = err.with_source(raw);
        if operation.is_empty() {
            err
        } else {
            err.with_operation(operation)
        }
    }

    /// [`DbError::wrap`] for an optional error: `None` stays `None`.
    pub fn wrap_opt<E>(
        err: Option<E>,
        code: ErrorCode,
        operation: &str,
        message: &str,
    ) -> Option<Self>
    where
        E: Into<BoxError>,
    {
        err.map(|e| Self::wrap(e, code, operation, message))
    }

    fn enhance(mut self: Box<Self>, operation: &str, message: &str) -> Self {
        if !operation.is_empty() {
            self.operation = Some(operation.to_string());
        }
        if !message.is_empty() {
            self.message = format!("{}: {}", message, self.message);
        }
        *self
    }

    /// Set the wrapped cause.
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the operation name.
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Add a context entry, replacing any previous value for `key`.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Set the user-facing message.
    pub fn with_user_message(mut self, message: impl Into<String>) -> Self {
        self.user_message = Some(message.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn operation(&self) -> Option<&str> {
        self.operation.as_deref()
    }

    pub fn context(&self) -> &BTreeMap<String, JsonValue> {
        &self.context
    }

    pub fn user_message(&self) -> Option<&str> {
        self.user_message.as_deref()
    }

    /// The user-facing message when present, the technical message otherwise.
    pub fn display_message(&self) -> &str {
        self.user_message.as_deref().unwrap_or(&self.message)
    }

    pub fn is_retriable(&self) -> bool {
        self.retriable
    }

    /// Check the category.
    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code
    }

    /// The wrapped cause, if any.
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }
}

/// Extension for attaching db-kit context to any `Result`.
///
/// `Ok` values pass through untouched; only an actual error is wrapped.
pub trait ResultExt<T> {
    fn wrap_err(self, code: ErrorCode, operation: &str, message: &str) -> DbResult<T>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<BoxError>,
{
    fn wrap_err(self, code: ErrorCode, operation: &str, message: &str) -> DbResult<T> {
        self.map_err(|e| DbError::wrap(e, code, operation, message))
    }
}

/// Category of the first `DbError` in the chain, `Unknown` for foreign errors.
pub fn error_code(err: &(dyn StdError + 'static)) -> ErrorCode {
    find_db_error(err).map_or(ErrorCode::Unknown, DbError::code)
}

/// User-facing message of the first `DbError` in the chain, falling back to
/// the error's own display text.
pub fn user_message(err: &(dyn StdError + 'static)) -> String {
    match find_db_error(err) {
        Some(db_err) => db_err.display_message().to_string(),
        None => err.to_string(),
    }
}

fn find_db_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a DbError> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(db_err) = e.downcast_ref::<DbError>() {
            return Some(db_err);
        }
        current = e.source();
    }
    None
}

// =============================================================================
// Raw error classification
// =============================================================================

/// SQLSTATE codes for resource exhaustion and connection failures.
const TRANSIENT_SQL_STATES: &[&str] = &[
    "53000", // insufficient_resources
    "53100", // disk_full
    "53200", // out_of_memory
    "53300", // too_many_connections
    "08000", // connection_exception
    "08003", // connection_does_not_exist
    "08006", // connection_failure
    "08001", // sqlclient_unable_to_establish_sqlconnection
    "08004", // sqlserver_rejected_establishment_of_sqlconnection
    "57P03", // cannot_connect_now
];

const TRANSIENT_MESSAGES: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timeout",
    "network is unreachable",
    "temporary failure",
    "server is not available",
    "database is starting up",
];

/// First `DbError` below the top of `err`'s cause chain.
fn find_in_chain<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a DbError> {
    let mut current = err.source();
    while let Some(e) = current {
        if let Some(db_err) = e.downcast_ref::<DbError>() {
            return Some(db_err);
        }
        current = e.source();
    }
    None
}

/// Heuristic for errors that have not been classified yet.
///
/// Walks the cause chain looking for timeouts, connection reset/refused
/// signals, transient SQLSTATE codes, a closed pool or a retriable
/// `DbError`, and finally scans each message for well-known phrases.
pub fn looks_transient(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(db_err) = e.downcast_ref::<DbError>() {
            if db_err.is_retriable() {
                return true;
            }
        } else if let Some(sqlx_err) = e.downcast_ref::<sqlx::Error>() {
            if sqlx_signals_transient(sqlx_err) {
                return true;
            }
        } else if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if io_kind_is_transient(io_err.kind()) {
                return true;
            }
        } else if e.is::<tokio::time::error::Elapsed>() {
            return true;
        }

        let message = e.to_string().to_lowercase();
        if TRANSIENT_MESSAGES.iter().any(|m| message.contains(m)) {
            return true;
        }
        current = e.source();
    }
    false
}

fn sqlx_signals_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(io_err) => io_kind_is_transient(io_err.kind()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_err) => db_err
            .code()
            .is_some_and(|code| TRANSIENT_SQL_STATES.contains(&&*code)),
        _ => false,
    }
}

fn io_kind_is_transient(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::BrokenPipe
    )
}

fn code_for_io(kind: io::ErrorKind) -> ErrorCode {
    match kind {
        io::ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused,
        io::ErrorKind::TimedOut => ErrorCode::ConnectionTimeout,
        _ => ErrorCode::ConnectionFailed,
    }
}

fn code_for_sql_state(state: &str) -> ErrorCode {
    match state {
        "53000" | "53200" => ErrorCode::InsufficientResources,
        "53100" => ErrorCode::DiskFull,
        "53300" => ErrorCode::TooManyConnections,
        "57P03" => ErrorCode::ConnectionFailed,
        "57014" => ErrorCode::OperationTimeout,
        "28P01" => ErrorCode::InvalidCredentials,
        "42601" => ErrorCode::SyntaxError,
        s if s.starts_with("08") => ErrorCode::ConnectionFailed,
        s if s.starts_with("23") => ErrorCode::ConstraintViolation,
        s if s.starts_with("28") => ErrorCode::AuthenticationError,
        _ => ErrorCode::QueryFailed,
    }
}

/// Classify driver errors into the most specific category.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        let mut sql_state = None;
        let (code, summary) = match &err {
            sqlx::Error::Configuration(_) => {
                (ErrorCode::InvalidConfig, "invalid connection configuration")
            }
            sqlx::Error::Database(db_err) => {
                let state = db_err.code().map(|c| c.into_owned());
                let code = state
                    .as_deref()
                    .map_or(ErrorCode::QueryFailed, code_for_sql_state);
                sql_state = state;
                (code, "database error")
            }
            sqlx::Error::Io(io_err) => (code_for_io(io_err.kind()), "I/O error"),
            sqlx::Error::Tls(_) => (ErrorCode::ConnectionFailed, "TLS error"),
            sqlx::Error::Protocol(_) => (ErrorCode::ConnectionFailed, "protocol error"),
            sqlx::Error::PoolTimedOut => (
                ErrorCode::ConnectionTimeout,
                "timed out acquiring a pooled connection",
            ),
            sqlx::Error::PoolClosed => (ErrorCode::ConnectionFailed, "connection pool is closed"),
            sqlx::Error::WorkerCrashed => {
                (ErrorCode::ConnectionFailed, "connection worker crashed")
            }
            sqlx::Error::RowNotFound => (ErrorCode::QueryFailed, "no rows returned"),
            sqlx::Error::TypeNotFound { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_) => (ErrorCode::QueryFailed, "failed to decode result"),
            sqlx::Error::Migrate(_) => (ErrorCode::MigrationFailed, "migration error"),
            other if looks_transient(other) => {
                (ErrorCode::ConnectionFailed, "transient driver error")
            }
            _ => (ErrorCode::Unknown, "unclassified driver error"),
        };

        let mut db_err = DbError::new(code, format!("{summary}: {err}"));
        if let Some(state) = sql_state {
            db_err = db_err.with_context("sql_state", state);
        }
        db_err.with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RETRIABLE: &[ErrorCode] = &[
        ErrorCode::ConnectionFailed,
        ErrorCode::ConnectionTimeout,
        ErrorCode::ConnectionRefused,
        ErrorCode::InsufficientResources,
        ErrorCode::TooManyConnections,
        ErrorCode::DiskFull,
        ErrorCode::OperationTimeout,
    ];

    #[test]
    fn test_retriable_table_is_exhaustive() {
        for code in ErrorCode::ALL {
            assert_eq!(
                code.is_retriable(),
                RETRIABLE.contains(&code),
                "unexpected retriability for {code}"
            );
        }
    }

    #[test]
    fn test_retriable_flag_follows_category() {
        for code in ErrorCode::ALL {
            assert_eq!(DbError::new(code, "x").is_retriable(), code.is_retriable());
        }
    }

    #[test]
    fn test_display_with_and_without_operation() {
        let err = DbError::new(ErrorCode::QueryFailed, "boom");
        assert_eq!(err.to_string(), "[QUERY_FAILED] boom");

        let err = err.with_operation("select_users");
        assert_eq!(err.to_string(), "[QUERY_FAILED] select_users: boom");
    }

    #[test]
    fn test_equality_ignores_message_and_context() {
        let a = DbError::new(ErrorCode::DiskFull, "first").with_context("k", 1);
        let b = DbError::new(ErrorCode::DiskFull, "second").with_operation("op");
        let c = DbError::new(ErrorCode::QueryFailed, "first");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.is(ErrorCode::DiskFull));
    }

    #[test]
    fn test_wrap_none_is_none() {
        for code in ErrorCode::ALL {
            let wrapped = DbError::wrap_opt(None::<io::Error>, code, "op", "msg");
            assert!(wrapped.is_none());
        }
    }

    #[test]
    fn test_wrap_ok_passes_through() {
        let result: Result<u8, io::Error> = Ok(7);
        let wrapped = result.wrap_err(ErrorCode::QueryFailed, "op", "msg");
        assert_eq!(wrapped.ok(), Some(7));
    }

    #[test]
    fn test_wrap_raw_error_creates_structured_error() {
        let raw = io::Error::other("disk on fire");
        let err = DbError::wrap(raw, ErrorCode::BackupFailed, "backup", "pg_dump failed");

        assert_eq!(err.code(), ErrorCode::BackupFailed);
        assert_eq!(err.operation(), Some("backup"));
        assert_eq!(err.message(), "pg_dump failed");
        assert_eq!(err.cause().map(|c| c.to_string()).as_deref(), Some("disk on fire"));
    }

    #[test]
    fn test_wrap_existing_enhances_in_place() {
        let inner = DbError::new(ErrorCode::ConstraintViolation, "duplicate key")
            .with_source(io::Error::other("root cause"))
            .with_operation("insert_user")
            .with_context("table", "users");

        let err = DbError::wrap(
            inner,
            ErrorCode::TransactionFailed,
            "with_transaction",
            "transaction function failed",
        );

        assert_eq!(err.code(), ErrorCode::ConstraintViolation);
        assert_eq!(err.operation(), Some("with_transaction"));
        assert_eq!(err.message(), "transaction function failed: duplicate key");
        assert_eq!(err.context().get("table"), Some(&JsonValue::from("users")));
        assert_eq!(err.cause().map(|c| c.to_string()).as_deref(), Some("root cause"));
    }

    /// Foreign error type that carries a `DbError` as its cause.
    #[derive(Debug)]
    struct Layered(DbError);

    impl fmt::Display for Layered {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "worker failed")
        }
    }

    impl StdError for Layered {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_wrap_finds_db_error_in_cause_chain() {
        let inner = DbError::new(ErrorCode::TooManyConnections, "too many clients")
            .with_operation("acquire")
            .with_context("sql_state", "53300");

        let err = DbError::wrap(
            Layered(inner),
            ErrorCode::TransactionFailed,
            "with_transaction",
            "transaction function failed",
        );

        assert_eq!(err.code(), ErrorCode::TooManyConnections);
        assert!(err.is_retriable());
        assert_eq!(err.operation(), Some("with_transaction"));
        assert_eq!(err.message(), "transaction function failed");
        assert_eq!(err.context().get("sql_state"), Some(&JsonValue::from("53300")));
        assert_eq!(err.cause().map(|c| c.to_string()).as_deref(), Some("worker failed"));

        let err = DbError::wrap(
            Layered(DbError::new(ErrorCode::DiskFull, "no space")),
            ErrorCode::Unknown,
            "",
            "outer",
        );
        assert_eq!(err.code(), ErrorCode::DiskFull);
        assert_eq!(err.operation(), None);
    }

    #[test]
    fn test_wrap_existing_keeps_operation_when_empty() {
        let inner = DbError::new(ErrorCode::QueryFailed, "bad").with_operation("inner_op");
        let err = DbError::wrap(inner, ErrorCode::Unknown, "", "outer");
        assert_eq!(err.operation(), Some("inner_op"));
        assert_eq!(err.message(), "outer: bad");
    }

    #[test]
    fn test_retry_exhausted_records_attempts() {
        let last = DbError::new(ErrorCode::ConnectionTimeout, "timeout");
        let err = DbError::retry_exhausted("ping", 3, last);
        assert_eq!(err.code(), ErrorCode::RetryExhausted);
        assert!(!err.is_retriable());
        assert_eq!(err.context().get("attempts"), Some(&JsonValue::from(3)));
        assert_eq!(err.operation(), Some("ping"));
        assert!(err.cause().is_some());
    }

    #[test]
    fn test_display_message_prefers_user_message() {
        let err = DbError::connection("dial tcp: refused");
        assert!(err.display_message().starts_with("Unable to connect"));

        let err = DbError::new(ErrorCode::Internal, "technical");
        assert_eq!(err.display_message(), "technical");
    }

    #[test]
    fn test_error_code_and_user_message_helpers() {
        let err = DbError::backup("pg_dump failed");
        assert_eq!(error_code(&err), ErrorCode::BackupFailed);
        assert!(user_message(&err).contains("backup failed"));

        let raw = io::Error::other("plain");
        assert_eq!(error_code(&raw), ErrorCode::Unknown);
        assert_eq!(user_message(&raw), "plain");
    }

    #[test]
    fn test_serializes_to_json() {
        let err = DbError::config("bad port").with_context("port", 0);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "INVALID_CONFIG");
        assert_eq!(json["message"], "bad port");
        assert_eq!(json["retriable"], false);
        assert_eq!(json["context"]["port"], 0);
        assert!(json.get("operation").is_none());
    }

    #[test]
    fn test_looks_transient_io_kinds() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "nope");
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "nope");
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert!(looks_transient(&refused));
        assert!(looks_transient(&reset));
        assert!(!looks_transient(&denied));
    }

    #[test]
    fn test_looks_transient_message_scan() {
        let err = io::Error::other("FATAL: the Database Is Starting Up");
        assert!(looks_transient(&err));
        let err = io::Error::other("relation \"users\" does not exist");
        assert!(!looks_transient(&err));
    }

    #[test]
    fn test_looks_transient_pool_sentinels() {
        assert!(looks_transient(&sqlx::Error::PoolClosed));
        assert!(looks_transient(&sqlx::Error::PoolTimedOut));
        assert!(!looks_transient(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn test_looks_transient_follows_cause_chain() {
        let err = DbError::new(ErrorCode::QueryFailed, "health check query failed")
            .with_source(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert!(looks_transient(&err));
    }

    #[test]
    fn test_from_sqlx_io_error() {
        let err: DbError =
            sqlx::Error::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")).into();
        assert_eq!(err.code(), ErrorCode::ConnectionRefused);
        assert!(err.is_retriable());
    }

    #[test]
    fn test_from_sqlx_pool_errors() {
        let err: DbError = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err.code(), ErrorCode::ConnectionTimeout);

        let err: DbError = sqlx::Error::PoolClosed.into();
        assert_eq!(err.code(), ErrorCode::ConnectionFailed);

        let err: DbError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.code(), ErrorCode::QueryFailed);
    }

    #[test]
    fn test_sql_state_mapping() {
        assert_eq!(code_for_sql_state("53300"), ErrorCode::TooManyConnections);
        assert_eq!(code_for_sql_state("53100"), ErrorCode::DiskFull);
        assert_eq!(code_for_sql_state("23505"), ErrorCode::ConstraintViolation);
        assert_eq!(code_for_sql_state("42601"), ErrorCode::SyntaxError);
        assert_eq!(code_for_sql_state("28P01"), ErrorCode::InvalidCredentials);
        assert_eq!(code_for_sql_state("28000"), ErrorCode::AuthenticationError);
        assert_eq!(code_for_sql_state("08006"), ErrorCode::ConnectionFailed);
        assert_eq!(code_for_sql_state("42P01"), ErrorCode::QueryFailed);
    }
}
