//! db-kit: a resilient PostgreSQL access layer.
//!
//! The library wraps a `sqlx` pool in a self-healing connection handle with
//! structured errors, retry with capped exponential backoff, scoped
//! transactions, schema introspection, migrations and backup/restore. The
//! `db-kit` binary exposes the same operations on the command line.

pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{Config, SslMode};
pub use db::{Database, IsolationLevel, QueryBuilder, RetryPolicy, TxSession};
pub use error::{BoxError, DbError, DbResult, ErrorCode, ResultExt};
