/// Errors surfaced by every storage operation. Callers in `nexus-proxy`
/// log-and-continue on write failures (spec §4.4 "failures are logged and
/// do not propagate to the already-responded client"); callers in
/// `nexus-analysis` propagate them as lease/job failures.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type StorageResult<T> = Result<T, StorageError>;
