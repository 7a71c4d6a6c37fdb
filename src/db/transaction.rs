//! Transaction executor with panic-safe rollback.
//!
//! Each attempt validates the connection, begins a fresh transaction, runs
//! the caller's body and then commits or rolls back. The whole attempt is
//! the unit handed to the retry engine, so a retriable failure starts over
//! with a brand-new transaction.

use crate::db::database::Database;
use crate::db::params::{bind_params, bind_params_as, expand_named};
use crate::db::retry::{self, cancellable};
use crate::error::{BoxError, DbError, DbResult, ErrorCode};
use crate::models::QueryParam;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use sqlx::postgres::{PgArguments, PgQueryResult, PgRow, PgStatement};
use sqlx::query::Query;
use sqlx::{Execute, Executor, FromRow, PgConnection, Postgres, Statement, Transaction};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Isolation level applied as the first statement of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl Database {
    /// Run `f` inside a transaction, retrying the whole attempt on
    /// retriable failures.
    ///
    /// `f` may be invoked once per attempt. A panic inside `f` rolls the
    /// transaction back and then continues unwinding with the original
    /// payload.
    pub async fn with_transaction<T, F>(&self, cancel: &CancellationToken, f: F) -> DbResult<T>
    where
        F: for<'s> FnMut(&'s mut TxSession) -> BoxFuture<'s, Result<T, BoxError>>,
    {
        self.run_transaction(cancel, "with_transaction", None, f)
            .await
    }

    /// [`Database::with_transaction`] with an explicit isolation level.
    pub async fn with_transaction_isolation<T, F>(
        &self,
        cancel: &CancellationToken,
        isolation: IsolationLevel,
        f: F,
    ) -> DbResult<T>
    where
        F: for<'s> FnMut(&'s mut TxSession) -> BoxFuture<'s, Result<T, BoxError>>,
    {
        self.run_transaction(cancel, "with_transaction_isolation", Some(isolation), f)
            .await
    }

    async fn run_transaction<T, F>(
        &self,
        cancel: &CancellationToken,
        operation: &'static str,
        isolation: Option<IsolationLevel>,
        f: F,
    ) -> DbResult<T>
    where
        F: for<'s> FnMut(&'s mut TxSession) -> BoxFuture<'s, Result<T, BoxError>>,
    {
        let body = Mutex::new(f);
        let body = &body;

        retry::with_retry(cancel, &self.retry_policy(), operation, move || async move {
            let mut f = body.lock().await;
            self.transaction_attempt(cancel, operation, isolation, &mut *f)
                .await
        })
        .await
    }

    async fn transaction_attempt<T, F>(
        &self,
        cancel: &CancellationToken,
        operation: &'static str,
        isolation: Option<IsolationLevel>,
        f: &mut F,
    ) -> DbResult<T>
    where
        F: for<'s> FnMut(&'s mut TxSession) -> BoxFuture<'s, Result<T, BoxError>>,
    {
        self.validate_connection(cancel).await.map_err(|e| {
            DbError::wrap(
                e,
                ErrorCode::ConnectionFailed,
                operation,
                "connection validation failed",
            )
        })?;

        let pool = self.pool().await;
        let tx = cancellable(cancel, operation, async {
            pool.begin().await.map_err(|e| {
                DbError::new(ErrorCode::TransactionBegin, "failed to begin transaction")
                    .with_operation(operation)
                    .with_source(e)
            })
        })
        .await?;

        let mut session = TxSession::new(tx, cancel.clone(), self.config().database.clone());

        if let Some(level) = isolation {
            let sql = format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql());
            if let Err(e) = (&mut *session.tx).execute(sql.as_str()).await {
                rollback_logged(session, operation).await;
                return Err(DbError::new(
                    ErrorCode::TransactionBegin,
                    "failed to set transaction isolation level",
                )
                .with_operation(operation)
                .with_context("isolation", level.as_sql())
                .with_source(e));
            }
        }

        let outcome = AssertUnwindSafe(f(&mut session)).catch_unwind().await;

        match outcome {
            Err(payload) => {
                error!(operation, "Transaction body panicked, rolling back");
                rollback_logged(session, operation).await;
                panic::resume_unwind(payload)
            }
            Ok(Err(err)) => {
                rollback_logged(session, operation).await;
                Err(DbError::wrap(
                    err,
                    ErrorCode::TransactionFailed,
                    operation,
                    "transaction function failed",
                ))
            }
            Ok(Ok(value)) => {
                session.tx.commit().await.map_err(|e| {
                    DbError::new(ErrorCode::TransactionCommit, "failed to commit transaction")
                        .with_operation(operation)
                        .with_source(e)
                })?;
                Ok(value)
            }
        }
    }
}

async fn rollback_logged(session: TxSession, operation: &str) {
    let TxSession { tx, database, .. } = session;
    if let Err(e) = tx.rollback().await {
        let err = DbError::new(ErrorCode::TransactionRollback, "failed to rollback transaction")
            .with_operation(operation)
            .with_source(e);
        error!(operation, database = %database, error = %err, "Failed to rollback transaction");
    }
}

/// Handle given to a transaction body. Statements run in call order on the
/// transaction's connection.
pub struct TxSession {
    tx: Transaction<'static, Postgres>,
    cancel: CancellationToken,
    database: String,
}

impl fmt::Debug for TxSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxSession")
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

impl TxSession {
    fn new(
        tx: Transaction<'static, Postgres>,
        cancel: CancellationToken,
        database: String,
    ) -> Self {
        Self {
            tx,
            cancel,
            database,
        }
    }

    /// Name of the database the transaction runs against.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Execute a prepared `sqlx::query(...)` with its bound arguments.
    pub async fn execute<'q>(
        &mut self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> DbResult<PgQueryResult> {
        let sql = query.sql().to_string();
        debug!(database = %self.database, sql = %sql, "transaction_execute");
        let fut = query.execute(&mut *self.tx);
        cancellable(&self.cancel, "transaction_execute", async {
            fut.await
                .map_err(|e| query_failed(e, "transaction_execute", &sql))
        })
        .await
    }

    /// Execute SQL text with positional parameters.
    pub async fn execute_sql(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<PgQueryResult> {
        self.execute(bind_params(sqlx::query(sql), params)).await
    }

    /// Fetch all rows.
    pub async fn fetch_all(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<PgRow>> {
        debug!(database = %self.database, sql = %sql, "transaction_query");
        let fut = bind_params(sqlx::query(sql), params).fetch_all(&mut *self.tx);
        cancellable(&self.cancel, "transaction_query", async {
            fut.await
                .map_err(|e| query_failed(e, "transaction_query", sql))
        })
        .await
    }

    /// Fetch at most one row.
    pub async fn fetch_optional(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<PgRow>> {
        debug!(database = %self.database, sql = %sql, "transaction_query_row");
        let fut = bind_params(sqlx::query(sql), params).fetch_optional(&mut *self.tx);
        cancellable(&self.cancel, "transaction_query_row", async {
            fut.await
                .map_err(|e| query_failed(e, "transaction_query_row", sql))
        })
        .await
    }

    /// Fetch exactly one row.
    pub async fn fetch_one(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<PgRow> {
        debug!(database = %self.database, sql = %sql, "transaction_query_row");
        let fut = bind_params(sqlx::query(sql), params).fetch_one(&mut *self.tx);
        cancellable(&self.cancel, "transaction_query_row", async {
            fut.await
                .map_err(|e| query_failed(e, "transaction_query_row", sql))
        })
        .await
    }

    /// Fetch all rows mapped into `R`.
    pub async fn fetch_all_as<R>(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<R>>
    where
        R: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        debug!(database = %self.database, sql = %sql, "transaction_select");
        let fut = bind_params_as(sqlx::query_as::<_, R>(sql), params).fetch_all(&mut *self.tx);
        cancellable(&self.cancel, "transaction_select", async {
            fut.await
                .map_err(|e| query_failed(e, "transaction_select", sql))
        })
        .await
    }

    /// Fetch exactly one row mapped into `R`.
    pub async fn fetch_one_as<R>(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<R>
    where
        R: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        debug!(database = %self.database, sql = %sql, "transaction_get");
        let fut = bind_params_as(sqlx::query_as::<_, R>(sql), params).fetch_one(&mut *self.tx);
        cancellable(&self.cancel, "transaction_get", async {
            fut.await
                .map_err(|e| query_failed(e, "transaction_get", sql))
        })
        .await
    }

    /// Execute SQL with `:name` placeholders.
    pub async fn execute_named(
        &mut self,
        sql: &str,
        params: &HashMap<String, QueryParam>,
    ) -> DbResult<PgQueryResult> {
        let (expanded, values) = expand_named(sql, params)
            .map_err(|e| e.with_operation("transaction_named_exec"))?;
        debug!(database = %self.database, sql = %expanded, "transaction_named_exec");
        let fut = bind_params(sqlx::query(&expanded), &values).execute(&mut *self.tx);
        cancellable(&self.cancel, "transaction_named_exec", async {
            fut.await
                .map_err(|e| query_failed(e, "transaction_named_exec", &expanded))
        })
        .await
    }

    /// Fetch all rows of a query with `:name` placeholders.
    pub async fn fetch_all_named(
        &mut self,
        sql: &str,
        params: &HashMap<String, QueryParam>,
    ) -> DbResult<Vec<PgRow>> {
        let (expanded, values) = expand_named(sql, params)
            .map_err(|e| e.with_operation("transaction_named_query"))?;
        debug!(database = %self.database, sql = %expanded, "transaction_named_query");
        let fut = bind_params(sqlx::query(&expanded), &values).fetch_all(&mut *self.tx);
        cancellable(&self.cancel, "transaction_named_query", async {
            fut.await
                .map_err(|e| query_failed(e, "transaction_named_query", &expanded))
        })
        .await
    }

    /// Prepare a statement on the transaction's connection.
    pub async fn prepare(&mut self, sql: &str) -> DbResult<PgStatement<'static>> {
        debug!(database = %self.database, sql = %sql, "transaction_prepare");
        let fut = (&mut *self.tx).prepare(sql);
        let statement = cancellable(&self.cancel, "transaction_prepare", async {
            fut.await
                .map_err(|e| query_failed(e, "transaction_prepare", sql))
        })
        .await?;
        Ok(Statement::to_owned(&statement))
    }

    /// The underlying connection, for anything the helpers above do not cover.
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.tx
    }
}

fn query_failed(err: sqlx::Error, operation: &str, sql: &str) -> DbError {
    DbError::new(ErrorCode::QueryFailed, format!("{operation} failed"))
        .with_operation(operation)
        .with_context("query", sql)
        .with_source(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_sql() {
        assert_eq!(IsolationLevel::ReadUncommitted.as_sql(), "READ UNCOMMITTED");
        assert_eq!(IsolationLevel::ReadCommitted.as_sql(), "READ COMMITTED");
        assert_eq!(IsolationLevel::RepeatableRead.as_sql(), "REPEATABLE READ");
        assert_eq!(IsolationLevel::Serializable.to_string(), "SERIALIZABLE");
    }

    #[test]
    fn test_query_failed_context() {
        let err = query_failed(sqlx::Error::RowNotFound, "transaction_get", "SELECT 1");
        assert_eq!(err.code(), ErrorCode::QueryFailed);
        assert_eq!(err.operation(), Some("transaction_get"));
        assert_eq!(
            err.context().get("query"),
            Some(&serde_json::json!("SELECT 1"))
        );
        assert!(!err.is_retriable());
    }
}
