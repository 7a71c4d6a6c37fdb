//! Migration bookkeeping models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Shape of a newly created migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MigrationKind {
    /// One `<version>_<name>.sql` file, applied forward only.
    #[default]
    Simple,
    /// An `.up.sql` / `.down.sql` pair that can be reverted.
    Reversible,
}

/// A migration file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub version: i64,
    pub description: String,
    pub file_name: String,
}

/// Status of a single migration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStatus {
    pub version: i64,
    pub description: String,
    pub source: String,
    pub is_applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
}

/// Migration status across the whole directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStatusReport {
    pub migrations: Vec<MigrationStatus>,
    pub current_version: i64,
    pub latest_version: i64,
    pub pending_count: usize,
    pub applied_count: usize,
}

impl MigrationStatusReport {
    pub fn is_up_to_date(&self) -> bool {
        self.pending_count == 0
    }
}

/// Files written by `create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedMigration {
    pub version: i64,
    pub files: Vec<PathBuf>,
}
