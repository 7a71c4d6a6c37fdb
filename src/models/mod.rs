//! Serializable data models shared by the database layer and the CLI.

pub mod migration;
pub mod query;
pub mod schema;

pub use migration::{
    CreatedMigration, MigrationFile, MigrationKind, MigrationStatus, MigrationStatusReport,
};
pub use query::QueryParam;
pub use schema::{
    ColumnInfo, ConstraintInfo, ConstraintType, DatabaseInfo, ForeignKeyAction, IndexInfo,
    TableInfo, TableType,
};
