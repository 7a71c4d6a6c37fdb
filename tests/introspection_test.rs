//! Integration tests for schema introspection.

mod common;

use db_kit::models::{ConstraintType, ForeignKeyAction, TableType};
use db_kit::Database;
use tokio_util::sync::CancellationToken;

async fn create_fixture(db: &Database, schema: &str) {
    let pool = db.pool().await;
    let statements = [
        format!("DROP SCHEMA IF EXISTS {schema} CASCADE"),
        format!("CREATE SCHEMA {schema}"),
        format!(
            "CREATE TABLE {schema}.authors (
                id BIGINT PRIMARY KEY,
                email VARCHAR(120) NOT NULL UNIQUE,
                rating NUMERIC(4, 2)
            )"
        ),
        format!("COMMENT ON TABLE {schema}.authors IS 'people who write'"),
        format!(
            "CREATE TABLE {schema}.books (
                id BIGINT PRIMARY KEY,
                author_id BIGINT NOT NULL REFERENCES {schema}.authors (id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                pages INT CHECK (pages > 0)
            )"
        ),
        format!("CREATE INDEX books_title_idx ON {schema}.books (title)"),
        format!(
            "CREATE VIEW {schema}.long_books AS
                SELECT id, title FROM {schema}.books WHERE pages > 500"
        ),
    ];
    for sql in &statements {
        sqlx::query(sql).execute(&pool).await.unwrap();
    }
}

async fn drop_fixture(db: &Database, schema: &str) {
    let pool = db.pool().await;
    let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE"))
        .execute(&pool)
        .await;
}

#[tokio::test]
async fn test_tables_with_columns_indexes_and_constraints() {
    let Some(db) = common::connect("test_tables_with_columns_indexes_and_constraints").await else {
        return;
    };
    let cancel = CancellationToken::new();
    const SCHEMA: &str = "introspect_tables";
    create_fixture(&db, SCHEMA).await;

    let tables = db.introspection().tables(&cancel, Some(SCHEMA)).await.unwrap();
    let names: Vec<&str> = tables.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["authors", "books", "long_books"]);

    let authors = &tables[0];
    assert_eq!(authors.table_type, TableType::Table);
    assert_eq!(authors.comment.as_deref(), Some("people who write"));
    assert_eq!(authors.qualified_name(), format!("{SCHEMA}.authors"));

    let id = authors.columns.iter().find(|c| c.name == "id").unwrap();
    assert!(id.is_primary_key);
    assert!(!id.is_nullable);

    let email = authors.columns.iter().find(|c| c.name == "email").unwrap();
    assert!(email.is_unique);
    assert_eq!(email.max_length, Some(120));

    let rating = authors.columns.iter().find(|c| c.name == "rating").unwrap();
    assert!(rating.is_nullable);
    assert_eq!(rating.numeric_precision, Some(4));
    assert_eq!(rating.numeric_scale, Some(2));

    let books = &tables[1];
    let author_id = books.columns.iter().find(|c| c.name == "author_id").unwrap();
    assert!(author_id.is_foreign_key);

    let title_idx = books
        .indexes
        .iter()
        .find(|i| i.name == "books_title_idx")
        .unwrap();
    assert_eq!(title_idx.columns, vec!["title"]);
    assert!(!title_idx.is_unique);
    assert_eq!(title_idx.index_type, "btree");
    assert!(books.indexes.iter().any(|i| i.is_primary));

    let fk = books
        .constraints
        .iter()
        .find(|c| c.constraint_type == ConstraintType::ForeignKey)
        .unwrap();
    assert_eq!(fk.columns, vec!["author_id"]);
    assert_eq!(fk.referenced_table.as_deref(), Some("authors"));
    assert_eq!(fk.referenced_columns, vec!["id"]);
    assert_eq!(fk.on_delete, Some(ForeignKeyAction::Cascade));
    assert!(books
        .constraints
        .iter()
        .any(|c| c.constraint_type == ConstraintType::PrimaryKey));

    assert_eq!(tables[2].table_type, TableType::View);

    drop_fixture(&db, SCHEMA).await;
    db.close().await;
}

#[tokio::test]
async fn test_table_and_column_exists() {
    let Some(db) = common::connect("test_table_and_column_exists").await else {
        return;
    };
    let cancel = CancellationToken::new();
    const SCHEMA: &str = "introspect_exists";
    create_fixture(&db, SCHEMA).await;
    let introspection = db.introspection();

    assert!(introspection.table_exists(&cancel, SCHEMA, "books").await.unwrap());
    assert!(!introspection.table_exists(&cancel, SCHEMA, "magazines").await.unwrap());
    assert!(!introspection.table_exists(&cancel, "public", "books").await.unwrap());

    assert!(introspection
        .column_exists(&cancel, SCHEMA, "books", "title")
        .await
        .unwrap());
    assert!(!introspection
        .column_exists(&cancel, SCHEMA, "books", "isbn")
        .await
        .unwrap());

    drop_fixture(&db, SCHEMA).await;
    db.close().await;
}

#[tokio::test]
async fn test_foreign_key_relationships() {
    let Some(db) = common::connect("test_foreign_key_relationships").await else {
        return;
    };
    let cancel = CancellationToken::new();
    const SCHEMA: &str = "introspect_fks";
    create_fixture(&db, SCHEMA).await;

    let relationships = db
        .introspection()
        .foreign_key_relationships(&cancel, Some(SCHEMA))
        .await
        .unwrap();
    assert_eq!(relationships.len(), 1);

    let fk = &relationships[0];
    assert_eq!(fk.table_name, "books");
    assert_eq!(fk.columns, vec!["author_id"]);
    assert_eq!(fk.referenced_table.as_deref(), Some("authors"));
    assert_eq!(fk.on_delete, Some(ForeignKeyAction::Cascade));
    assert_eq!(fk.on_update, Some(ForeignKeyAction::NoAction));

    drop_fixture(&db, SCHEMA).await;
    db.close().await;
}

#[tokio::test]
async fn test_database_info() {
    let Some(db) = common::connect("test_database_info").await else {
        return;
    };
    let cancel = CancellationToken::new();
    const SCHEMA: &str = "introspect_info";
    create_fixture(&db, SCHEMA).await;

    let info = db.introspection().database_info(&cancel).await.unwrap();
    assert_eq!(info.name, db.config().database);
    assert!(info.version.starts_with("PostgreSQL"));
    assert!(info.size.is_some_and(|size| size > 0));
    assert!(info.schemas.iter().any(|s| s == SCHEMA));
    assert!(!info.schemas.iter().any(|s| s == "pg_catalog"));
    assert!(info.tables.iter().any(|t| t.qualified_name() == format!("{SCHEMA}.books")));

    let columns = db
        .introspection()
        .table_columns(&cancel, SCHEMA, "missing_table")
        .await
        .unwrap();
    assert!(columns.is_empty());

    drop_fixture(&db, SCHEMA).await;
    db.close().await;
}
