//! Error kinds surfaced by the migration engine.
//!
//! The engine reports typed errors so callers can distinguish "nothing to
//! do" (`QueryNoAffectRows`) from real failures. The CLI boundary wraps
//! these in `anyhow` for display.

use std::path::PathBuf;

use thiserror::Error;

pub type MigrateResult<T> = Result<T, MigrateError>;

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("unable to connect to database: {0}")]
    Connection(String),

    #[error("failed to apply advisory lock, another migrator may be running against this database")]
    LockBusy,

    #[error("invalid migration format specified (allow \"sql\" or \"rust\"): {0}")]
    InvalidFormat(String),

    #[error("migration name is required")]
    MigrationNameRequired,

    #[error("migration version must be greater than zero")]
    BadVersion,

    #[error("migration file already exists: {}", .0.display())]
    MigrationFileExists(PathBuf),

    #[error("failed to create migration file {}: {}", .path.display(), .detail)]
    CreateMigrationFile { path: PathBuf, detail: String },

    #[error("postfix not found for migration (.down or .up): {}", .0.display())]
    Postfix(PathBuf),

    #[error(
        "sql migrations (down and up) must have the same name: \
         {existing} and {incoming} are different names for version {version}"
    )]
    SqlPairNameMismatch {
        version: u64,
        existing: String,
        incoming: String,
    },

    #[error("migration version {0} must be unique")]
    VersionNotUnique(u64),

    #[error("no separator found in migration file name: {}", .0.display())]
    SeparatorNotFound(PathBuf),

    #[error("version must be greater than 0 in the migration file ({})", .0.display())]
    MigrateVersionFile(PathBuf),

    #[error("error reading file {}: {}", .path.display(), .detail)]
    ReadFile { path: PathBuf, detail: String },

    #[error("migration path is not specified or it is incorrect: {}", .0.display())]
    MigrationPath(PathBuf),

    #[error("failed to load migrations: {0}")]
    LoadMigrations(#[source] Box<MigrateError>),

    #[error("failed to get the recent migration version: {0}")]
    GetRecentMigration(#[source] Box<MigrateError>),

    /// Internal marker: the reservation statement matched no row because the
    /// migration is already in the requested state. Consumed by the
    /// executors, never shown to the user.
    #[error("query did not affect the rows")]
    QueryNoAffectRows,

    #[error("query deadline exceeded, a concurrent migrator may hold the row lock")]
    QueryDeadlineExceeded,

    #[error("transaction cancellation error: {0}")]
    TransactionCancel(String),

    #[error("error applying migration: {0}")]
    ApplyingMigration(String),

    #[error("error while building the program for migrations: {0}")]
    BuildProgramForMigrations(String),

    #[error("an error occurred while starting the program for migrations: {0}")]
    StartingProgramForMigrations(String),

    #[error("`{command}` failed: {detail}")]
    Command { command: String, detail: String },

    #[error("operation was interrupted")]
    Interrupted,

    #[error(transparent)]
    Database(#[from] tokio_postgres::Error),
}

impl MigrateError {
    /// Wrap a loader-side error for propagation to the user.
    pub fn load(err: MigrateError) -> Self {
        MigrateError::LoadMigrations(Box::new(err))
    }

    /// Wrap a recent-migration lookup failure.
    pub fn recent(err: MigrateError) -> Self {
        MigrateError::GetRecentMigration(Box::new(err))
    }
}
