//! Error types for Flaglane

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlaglaneError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type FlaglaneResult<T> = Result<T, FlaglaneError>;
