//! Schema introspection.
//!
//! SQL lives in the `queries` submodule. Every lookup runs through
//! [`Database::with_validation`], so a dropped connection is healed and
//! transient failures are retried before an error surfaces.

use crate::db::database::Database;
use crate::error::{DbError, DbResult, ErrorCode};
use crate::models::{
    ColumnInfo, ConstraintInfo, ConstraintType, DatabaseInfo, ForeignKeyAction, IndexInfo,
    TableInfo, TableType,
};
use sqlx::postgres::PgRow;
use sqlx::Row;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound for a single table's constraint lookup.
const CONSTRAINT_TIMEOUT: Duration = Duration::from_secs(10);

mod queries {
    pub const VERSION: &str = "SELECT version()";

    pub const SIZE: &str = "SELECT pg_database_size($1)";

    pub const SCHEMAS: &str = r#"
        SELECT schema_name::text
        FROM information_schema.schemata
        WHERE schema_name NOT IN ('information_schema', 'pg_catalog', 'pg_toast')
        ORDER BY schema_name
        "#;

    pub const TABLES: &str = r#"
        SELECT
            t.table_name::text AS table_name,
            t.table_schema::text AS table_schema,
            t.table_type::text AS table_type,
            obj_description(c.oid, 'pg_class') AS table_comment
        FROM information_schema.tables t
        LEFT JOIN pg_namespace n ON n.nspname = t.table_schema
        LEFT JOIN pg_class c ON c.relname = t.table_name AND c.relnamespace = n.oid
        WHERE t.table_schema NOT IN ('information_schema', 'pg_catalog')
          AND ($1::text IS NULL OR t.table_schema = $1)
        ORDER BY t.table_schema, t.table_name
        "#;

    pub const COLUMNS: &str = r#"
        SELECT
            c.column_name::text AS column_name,
            c.data_type::text AS data_type,
            c.is_nullable = 'YES' AS is_nullable,
            c.column_default::text AS column_default,
            c.character_maximum_length::int4 AS character_maximum_length,
            c.numeric_precision::int4 AS numeric_precision,
            c.numeric_scale::int4 AS numeric_scale,
            EXISTS (
                SELECT 1
                FROM information_schema.table_constraints tc
                JOIN information_schema.key_column_usage ku
                  ON tc.constraint_name = ku.constraint_name
                 AND tc.table_schema = ku.table_schema
                WHERE tc.constraint_type = 'PRIMARY KEY'
                  AND tc.table_schema = c.table_schema
                  AND tc.table_name = c.table_name
                  AND ku.column_name = c.column_name
            ) AS is_primary_key,
            EXISTS (
                SELECT 1
                FROM information_schema.table_constraints tc
                JOIN information_schema.key_column_usage ku
                  ON tc.constraint_name = ku.constraint_name
                 AND tc.table_schema = ku.table_schema
                WHERE tc.constraint_type = 'FOREIGN KEY'
                  AND tc.table_schema = c.table_schema
                  AND tc.table_name = c.table_name
                  AND ku.column_name = c.column_name
            ) AS is_foreign_key,
            EXISTS (
                SELECT 1
                FROM information_schema.table_constraints tc
                JOIN information_schema.key_column_usage ku
                  ON tc.constraint_name = ku.constraint_name
                 AND tc.table_schema = ku.table_schema
                WHERE tc.constraint_type = 'UNIQUE'
                  AND tc.table_schema = c.table_schema
                  AND tc.table_name = c.table_name
                  AND ku.column_name = c.column_name
            ) AS is_unique,
            col_description(pgc.oid, c.ordinal_position::int4) AS column_comment
        FROM information_schema.columns c
        LEFT JOIN pg_namespace pgn ON pgn.nspname = c.table_schema
        LEFT JOIN pg_class pgc ON pgc.relname = c.table_name AND pgc.relnamespace = pgn.oid
        WHERE c.table_schema = $1 AND c.table_name = $2
        ORDER BY c.ordinal_position
        "#;

    pub const INDEXES: &str = r#"
        SELECT
            i.relname::text AS index_name,
            t.relname::text AS table_name,
            array_agg(a.attname::text ORDER BY array_position(ix.indkey::int2[], a.attnum)) AS columns,
            ix.indisunique AS is_unique,
            ix.indisprimary AS is_primary,
            am.amname::text AS index_type
        FROM pg_class t
        JOIN pg_namespace n ON n.oid = t.relnamespace
        JOIN pg_index ix ON t.oid = ix.indrelid
        JOIN pg_class i ON i.oid = ix.indexrelid
        JOIN pg_am am ON i.relam = am.oid
        JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
        WHERE n.nspname = $1 AND t.relname = $2
        GROUP BY i.relname, t.relname, ix.indisunique, ix.indisprimary, am.amname
        ORDER BY i.relname
        "#;

    pub const CONSTRAINTS: &str = r#"
        SELECT
            tc.constraint_name::text AS constraint_name,
            tc.constraint_type::text AS constraint_type,
            tc.table_name::text AS table_name,
            kcu.column_name::text AS column_name,
            ccu.table_name::text AS referenced_table_name,
            ccu.column_name::text AS referenced_column_name,
            rc.update_rule::text AS update_rule,
            rc.delete_rule::text AS delete_rule
        FROM information_schema.table_constraints tc
        LEFT JOIN information_schema.key_column_usage kcu
            ON tc.constraint_name = kcu.constraint_name
           AND tc.table_schema = kcu.table_schema
        LEFT JOIN information_schema.constraint_column_usage ccu
            ON tc.constraint_name = ccu.constraint_name
           AND tc.table_schema = ccu.table_schema
           AND tc.constraint_type = 'FOREIGN KEY'
        LEFT JOIN information_schema.referential_constraints rc
            ON tc.constraint_name = rc.constraint_name
           AND tc.table_schema = rc.constraint_schema
        WHERE tc.table_schema = $1 AND tc.table_name = $2
        ORDER BY tc.constraint_name, kcu.ordinal_position
        "#;

    pub const TABLE_EXISTS: &str = r#"
        SELECT EXISTS (
            SELECT 1 FROM information_schema.tables
            WHERE table_schema = $1 AND table_name = $2
        )
        "#;

    pub const COLUMN_EXISTS: &str = r#"
        SELECT EXISTS (
            SELECT 1 FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2 AND column_name = $3
        )
        "#;

    pub const FOREIGN_KEYS: &str = r#"
        SELECT
            tc.constraint_name::text AS constraint_name,
            tc.table_name::text AS table_name,
            array_agg(kcu.column_name::text ORDER BY kcu.ordinal_position) AS columns,
            ccu.table_name::text AS referenced_table_name,
            array_agg(ccu.column_name::text ORDER BY kcu.ordinal_position) AS referenced_columns,
            rc.update_rule::text AS update_rule,
            rc.delete_rule::text AS delete_rule
        FROM information_schema.table_constraints tc
        JOIN information_schema.key_column_usage kcu
            ON tc.constraint_name = kcu.constraint_name
           AND tc.table_schema = kcu.table_schema
        JOIN information_schema.constraint_column_usage ccu
            ON tc.constraint_name = ccu.constraint_name
           AND tc.table_schema = ccu.table_schema
        JOIN information_schema.referential_constraints rc
            ON tc.constraint_name = rc.constraint_name
           AND tc.table_schema = rc.constraint_schema
        WHERE tc.constraint_type = 'FOREIGN KEY'
          AND ($1::text IS NULL OR tc.table_schema = $1)
        GROUP BY tc.constraint_name, tc.table_name, ccu.table_name, rc.update_rule, rc.delete_rule
        ORDER BY tc.table_name, tc.constraint_name
        "#;
}

/// Read-only schema queries bound to a [`Database`].
#[derive(Debug, Clone, Copy)]
pub struct IntrospectionService<'a> {
    db: &'a Database,
}

impl<'a> IntrospectionService<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Name, version, size, schemas and tables in one call.
    ///
    /// A failed size lookup is logged and leaves `size` empty.
    pub async fn database_info(&self, cancel: &CancellationToken) -> DbResult<DatabaseInfo> {
        const OP: &str = "get_database_info";

        let version = self.database_version(cancel).await.map_err(|e| {
            DbError::wrap(e, ErrorCode::QueryFailed, OP, "failed to get database version")
        })?;

        let size = match self.database_size(cancel).await {
            Ok(size) => Some(size),
            Err(e) => {
                warn!(error = %e, "Failed to get database size");
                None
            }
        };

        let schemas = self
            .schemas(cancel)
            .await
            .map_err(|e| DbError::wrap(e, ErrorCode::QueryFailed, OP, "failed to get schemas"))?;

        let tables = self
            .tables(cancel, None)
            .await
            .map_err(|e| DbError::wrap(e, ErrorCode::QueryFailed, OP, "failed to get tables"))?;

        Ok(DatabaseInfo {
            name: self.db.config().database.clone(),
            version,
            size,
            schemas,
            tables,
        })
    }

    /// Full `version()` string.
    pub async fn database_version(&self, cancel: &CancellationToken) -> DbResult<String> {
        const OP: &str = "get_database_version";
        self.db
            .with_validation(cancel, OP, |pool| async move {
                sqlx::query_scalar::<_, String>(queries::VERSION)
                    .fetch_one(&pool)
                    .await
                    .map_err(query_error(OP, "failed to get database version"))
            })
            .await
    }

    /// Size of the configured database in bytes.
    pub async fn database_size(&self, cancel: &CancellationToken) -> DbResult<i64> {
        const OP: &str = "get_database_size";
        let name = self.db.config().database.as_str();
        self.db
            .with_validation(cancel, OP, |pool| async move {
                sqlx::query_scalar::<_, i64>(queries::SIZE)
                    .bind(name)
                    .fetch_one(&pool)
                    .await
                    .map_err(query_error(OP, "failed to get database size"))
            })
            .await
    }

    /// User-visible schemas.
    pub async fn schemas(&self, cancel: &CancellationToken) -> DbResult<Vec<String>> {
        const OP: &str = "get_schemas";
        self.db
            .with_validation(cancel, OP, |pool| async move {
                sqlx::query_scalar::<_, String>(queries::SCHEMAS)
                    .fetch_all(&pool)
                    .await
                    .map_err(query_error(OP, "failed to get schemas"))
            })
            .await
    }

    /// Tables, optionally limited to one schema, with columns, indexes and
    /// constraints filled in.
    pub async fn tables(
        &self,
        cancel: &CancellationToken,
        schema: Option<&str>,
    ) -> DbResult<Vec<TableInfo>> {
        const OP: &str = "get_tables";

        let mut tables = self
            .db
            .with_validation(cancel, OP, |pool| async move {
                let rows = sqlx::query(queries::TABLES)
                    .bind(schema)
                    .fetch_all(&pool)
                    .await
                    .map_err(query_error(OP, "failed to get tables"))?;
                rows.iter()
                    .map(table_from_row)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(query_error(OP, "failed to decode tables"))
            })
            .await?;

        for table in &mut tables {
            let qualified = table.qualified_name();

            table.columns = self
                .table_columns(cancel, &table.schema, &table.name)
                .await
                .map_err(|e| {
                    DbError::wrap(
                        e,
                        ErrorCode::QueryFailed,
                        OP,
                        &format!("failed to get columns for table {qualified}"),
                    )
                })?;

            table.indexes = self
                .table_indexes(cancel, &table.schema, &table.name)
                .await
                .map_err(|e| {
                    DbError::wrap(
                        e,
                        ErrorCode::QueryFailed,
                        OP,
                        &format!("failed to get indexes for table {qualified}"),
                    )
                })?;

            table.constraints = match self
                .bounded_constraints(cancel, &table.schema, &table.name)
                .await
            {
                Ok(constraints) => constraints,
                Err(e) => {
                    warn!(
                        schema = %table.schema,
                        table = %table.name,
                        error = %e,
                        "Failed to get constraints for table"
                    );
                    Vec::new()
                }
            };
        }

        debug!(count = tables.len(), "Listed tables");
        Ok(tables)
    }

    pub async fn table_columns(
        &self,
        cancel: &CancellationToken,
        schema: &str,
        table: &str,
    ) -> DbResult<Vec<ColumnInfo>> {
        const OP: &str = "get_table_columns";
        self.db
            .with_validation(cancel, OP, |pool| async move {
                let rows = sqlx::query(queries::COLUMNS)
                    .bind(schema)
                    .bind(table)
                    .fetch_all(&pool)
                    .await
                    .map_err(query_error(OP, "failed to get table columns"))?;
                rows.iter()
                    .map(column_from_row)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(query_error(OP, "failed to decode table columns"))
            })
            .await
    }

    pub async fn table_indexes(
        &self,
        cancel: &CancellationToken,
        schema: &str,
        table: &str,
    ) -> DbResult<Vec<IndexInfo>> {
        const OP: &str = "get_table_indexes";
        self.db
            .with_validation(cancel, OP, |pool| async move {
                let rows = sqlx::query(queries::INDEXES)
                    .bind(schema)
                    .bind(table)
                    .fetch_all(&pool)
                    .await
                    .map_err(query_error(OP, "failed to get table indexes"))?;
                rows.iter()
                    .map(index_from_row)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(query_error(OP, "failed to decode table indexes"))
            })
            .await
    }

    pub async fn table_constraints(
        &self,
        cancel: &CancellationToken,
        schema: &str,
        table: &str,
    ) -> DbResult<Vec<ConstraintInfo>> {
        const OP: &str = "get_table_constraints";
        self.db
            .with_validation(cancel, OP, |pool| async move {
                let rows = sqlx::query(queries::CONSTRAINTS)
                    .bind(schema)
                    .bind(table)
                    .fetch_all(&pool)
                    .await
                    .map_err(query_error(OP, "failed to get table constraints"))?;
                rows.iter()
                    .map(ConstraintRow::from_row)
                    .collect::<Result<Vec<_>, _>>()
                    .map(group_constraints)
                    .map_err(query_error(OP, "failed to decode constraints"))
            })
            .await
    }

    /// [`IntrospectionService::table_constraints`] bounded by a fixed timeout.
    async fn bounded_constraints(
        &self,
        cancel: &CancellationToken,
        schema: &str,
        table: &str,
    ) -> DbResult<Vec<ConstraintInfo>> {
        match tokio::time::timeout(
            CONSTRAINT_TIMEOUT,
            self.table_constraints(cancel, schema, table),
        )
        .await
        {
            Ok(result) => result,
            Err(elapsed) => Err(DbError::new(
                ErrorCode::OperationTimeout,
                "constraint lookup timed out",
            )
            .with_operation("get_table_constraints")
            .with_context("timeout_secs", CONSTRAINT_TIMEOUT.as_secs())
            .with_source(elapsed)),
        }
    }

    pub async fn table_exists(
        &self,
        cancel: &CancellationToken,
        schema: &str,
        table: &str,
    ) -> DbResult<bool> {
        const OP: &str = "get_table_exists";
        self.db
            .with_validation(cancel, OP, |pool| async move {
                sqlx::query_scalar::<_, bool>(queries::TABLE_EXISTS)
                    .bind(schema)
                    .bind(table)
                    .fetch_one(&pool)
                    .await
                    .map_err(query_error(OP, "failed to check table existence"))
            })
            .await
    }

    pub async fn column_exists(
        &self,
        cancel: &CancellationToken,
        schema: &str,
        table: &str,
        column: &str,
    ) -> DbResult<bool> {
        const OP: &str = "get_column_exists";
        self.db
            .with_validation(cancel, OP, |pool| async move {
                sqlx::query_scalar::<_, bool>(queries::COLUMN_EXISTS)
                    .bind(schema)
                    .bind(table)
                    .bind(column)
                    .fetch_one(&pool)
                    .await
                    .map_err(query_error(OP, "failed to check column existence"))
            })
            .await
    }

    /// Foreign keys across all schemas, or only `schema`.
    pub async fn foreign_key_relationships(
        &self,
        cancel: &CancellationToken,
        schema: Option<&str>,
    ) -> DbResult<Vec<ConstraintInfo>> {
        const OP: &str = "get_foreign_key_relationships";
        self.db
            .with_validation(cancel, OP, |pool| async move {
                let rows = sqlx::query(queries::FOREIGN_KEYS)
                    .bind(schema)
                    .fetch_all(&pool)
                    .await
                    .map_err(query_error(OP, "failed to get foreign key relationships"))?;
                rows.iter()
                    .map(foreign_key_from_row)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(query_error(OP, "failed to decode foreign keys"))
            })
            .await
    }
}

fn query_error(operation: &'static str, message: &'static str) -> impl Fn(sqlx::Error) -> DbError {
    move |e| {
        DbError::new(ErrorCode::QueryFailed, message)
            .with_operation(operation)
            .with_source(e)
    }
}

fn table_from_row(row: &PgRow) -> Result<TableInfo, sqlx::Error> {
    let table_type: String = row.try_get("table_type")?;
    let mut table = TableInfo::new(
        row.try_get::<String, _>("table_schema")?,
        row.try_get::<String, _>("table_name")?,
        TableType::parse(&table_type),
    );
    if let Some(comment) = row.try_get::<Option<String>, _>("table_comment")? {
        table = table.with_comment(comment);
    }
    Ok(table)
}

fn column_from_row(row: &PgRow) -> Result<ColumnInfo, sqlx::Error> {
    Ok(ColumnInfo {
        name: row.try_get("column_name")?,
        data_type: row.try_get("data_type")?,
        is_nullable: row.try_get("is_nullable")?,
        default_value: row.try_get("column_default")?,
        is_primary_key: row.try_get("is_primary_key")?,
        is_foreign_key: row.try_get("is_foreign_key")?,
        is_unique: row.try_get("is_unique")?,
        max_length: row.try_get("character_maximum_length")?,
        numeric_precision: row.try_get("numeric_precision")?,
        numeric_scale: row.try_get("numeric_scale")?,
        comment: row.try_get("column_comment")?,
    })
}

fn index_from_row(row: &PgRow) -> Result<IndexInfo, sqlx::Error> {
    Ok(IndexInfo {
        name: row.try_get("index_name")?,
        table_name: row.try_get("table_name")?,
        columns: row.try_get("columns")?,
        is_unique: row.try_get("is_unique")?,
        is_primary: row.try_get("is_primary")?,
        index_type: row.try_get("index_type")?,
    })
}

fn foreign_key_from_row(row: &PgRow) -> Result<ConstraintInfo, sqlx::Error> {
    let mut fk = ConstraintInfo::new(
        row.try_get::<String, _>("constraint_name")?,
        ConstraintType::ForeignKey,
        row.try_get::<String, _>("table_name")?,
    );
    for column in row.try_get::<Vec<String>, _>("columns")? {
        fk.push_column(column);
    }
    for column in row.try_get::<Vec<String>, _>("referenced_columns")? {
        fk.push_referenced_column(column);
    }
    fk.referenced_table = row.try_get("referenced_table_name")?;
    fk.on_update = rule(row, "update_rule")?;
    fk.on_delete = rule(row, "delete_rule")?;
    Ok(fk)
}

fn rule(row: &PgRow, column: &str) -> Result<Option<ForeignKeyAction>, sqlx::Error> {
    Ok(row
        .try_get::<Option<String>, _>(column)?
        .map(|r| ForeignKeyAction::parse(&r)))
}

/// One row of the constraints query: a constraint joined with one of its
/// columns.
#[derive(Debug, Clone, Default)]
struct ConstraintRow {
    name: String,
    constraint_type: String,
    table_name: String,
    column_name: Option<String>,
    referenced_table: Option<String>,
    referenced_column: Option<String>,
    update_rule: Option<String>,
    delete_rule: Option<String>,
}

impl ConstraintRow {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            name: row.try_get("constraint_name")?,
            constraint_type: row.try_get("constraint_type")?,
            table_name: row.try_get("table_name")?,
            column_name: row.try_get("column_name")?,
            referenced_table: row.try_get("referenced_table_name")?,
            referenced_column: row.try_get("referenced_column_name")?,
            update_rule: row.try_get("update_rule")?,
            delete_rule: row.try_get("delete_rule")?,
        })
    }
}

/// Fold one-row-per-column constraint rows into constraints, keeping the
/// order in which constraint names first appear.
fn group_constraints(rows: Vec<ConstraintRow>) -> Vec<ConstraintInfo> {
    let mut constraints: Vec<ConstraintInfo> = Vec::new();

    for row in rows {
        let index = match constraints.iter().position(|c| c.name == row.name) {
            Some(index) => index,
            None => {
                let mut constraint = ConstraintInfo::new(
                    row.name,
                    ConstraintType::parse(&row.constraint_type),
                    row.table_name,
                );
                constraint.referenced_table = row.referenced_table;
                constraint.on_update = row.update_rule.as_deref().map(ForeignKeyAction::parse);
                constraint.on_delete = row.delete_rule.as_deref().map(ForeignKeyAction::parse);
                constraints.push(constraint);
                constraints.len() - 1
            }
        };

        let constraint = &mut constraints[index];
        if let Some(column) = row.column_name {
            constraint.push_column(column);
        }
        if let Some(column) = row.referenced_column {
            constraint.push_referenced_column(column);
        }
    }

    constraints
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, kind: &str, column: &str) -> ConstraintRow {
        ConstraintRow {
            name: name.to_string(),
            constraint_type: kind.to_string(),
            table_name: "orders".to_string(),
            column_name: Some(column.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_group_constraints_merges_columns() {
        let rows = vec![
            row("orders_pkey", "PRIMARY KEY", "id"),
            row("orders_tenant_number_key", "UNIQUE", "tenant_id"),
            row("orders_tenant_number_key", "UNIQUE", "number"),
        ];

        let constraints = group_constraints(rows);
        assert_eq!(constraints.len(), 2);
        assert_eq!(constraints[0].name, "orders_pkey");
        assert_eq!(constraints[0].constraint_type, ConstraintType::PrimaryKey);
        assert_eq!(constraints[1].columns, vec!["tenant_id", "number"]);
    }

    #[test]
    fn test_group_constraints_foreign_key() {
        let mut fk = row("orders_user_fk", "FOREIGN KEY", "user_id");
        fk.referenced_table = Some("users".to_string());
        fk.referenced_column = Some("id".to_string());
        fk.update_rule = Some("NO ACTION".to_string());
        fk.delete_rule = Some("CASCADE".to_string());

        // The constraint_column_usage join repeats rows.
        let constraints = group_constraints(vec![fk.clone(), fk]);
        assert_eq!(constraints.len(), 1);

        let fk = &constraints[0];
        assert_eq!(fk.constraint_type, ConstraintType::ForeignKey);
        assert_eq!(fk.columns, vec!["user_id"]);
        assert_eq!(fk.referenced_table.as_deref(), Some("users"));
        assert_eq!(fk.referenced_columns, vec!["id"]);
        assert_eq!(fk.on_delete, Some(ForeignKeyAction::Cascade));
        assert_eq!(fk.on_update, Some(ForeignKeyAction::NoAction));
    }

    #[test]
    fn test_group_constraints_check_without_columns() {
        let mut check = row("orders_total_check", "CHECK", "");
        check.column_name = None;

        let constraints = group_constraints(vec![check]);
        assert_eq!(constraints[0].constraint_type, ConstraintType::Check);
        assert!(constraints[0].columns.is_empty());
    }

    #[test]
    fn test_query_error_category() {
        let err = query_error("get_schemas", "failed to get schemas")(sqlx::Error::RowNotFound);
        assert_eq!(err.code(), ErrorCode::QueryFailed);
        assert_eq!(err.operation(), Some("get_schemas"));
        assert!(err.cause().is_some());
    }
}
