//! # Repository Layer
//!
//! SeaORM-backed persistence for integrations, their credentials and
//! connector side tables. Multi-table writes run in a single transaction and
//! unique-constraint violations surface as [`RepositoryError::Duplicate`].

pub mod credential;
pub mod integration;
pub mod resource;

pub use credential::{CredentialRepository, SealedCredential};
pub use integration::{IntegrationQuery, IntegrationRepository, NewIntegration};
pub use resource::{ReconcileSummary, ResourceRepository};

use sea_orm::{DbErr, RuntimeErr, SqlErr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("unique constraint violated: {0}")]
    Duplicate(String),
    #[error("record not found")]
    NotFound,
    #[error("database error: {0}")]
    Db(DbErr),
}

impl From<DbErr> for RepositoryError {
    fn from(error: DbErr) -> Self {
        if is_unique_violation(&error) {
            tracing::debug!(?error, "Unique constraint violation detected");
            return RepositoryError::Duplicate(error.to_string());
        }
        match error {
            DbErr::RecordNotFound(_) | DbErr::RecordNotUpdated => RepositoryError::NotFound,
            other => RepositoryError::Db(other),
        }
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Detect unique violations across Postgres and SQLite.
pub fn is_unique_violation(error: &DbErr) -> bool {
    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    if matches!(error.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
        return true;
    }

    let runtime_err = match error {
        DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error.code().is_some_and(|code| {
        let code: &str = &code;
        code == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code)
    })
}
