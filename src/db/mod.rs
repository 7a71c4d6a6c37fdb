//! PostgreSQL access layer.
//!
//! - [`Database`]: connection handle with a self-healing pool
//! - [`retry`]: retry engine with capped exponential backoff
//! - [`transaction`]: scoped transactions with rollback on error or panic
//! - [`schema`]: schema introspection
//! - [`migrate`]: migration runner over `sqlx::migrate`
//! - [`backup`]: `pg_dump` / `pg_restore` adapters
//! - [`QueryBuilder`]: fluent SQL assembly

pub mod backup;
pub mod database;
pub mod migrate;
pub mod params;
pub mod query_builder;
pub mod retry;
pub mod schema;
pub mod transaction;

pub use backup::{Backuper, PgDump, PgRestore, Restorer, backup_file_name};
pub use database::{Database, PoolStats};
pub use migrate::Migrator;
pub use params::{bind_params, bind_params_as, expand_named};
pub use query_builder::QueryBuilder;
pub use retry::{RetryPolicy, cancellable, with_retry};
pub use schema::IntrospectionService;
pub use transaction::{IsolationLevel, TxSession};
