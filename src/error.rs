//! Error types for cmdq.

use thiserror::Error;

use crate::model::{CommandId, Status};

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid command: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("command name {name:?} is ambiguous, candidates: {candidates:?}")]
    Ambiguous {
        name: String,
        candidates: Vec<String>,
    },

    #[error("command {id} is {status}, expected started")]
    InconsistentState { id: CommandId, status: Status },

    #[error("command store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::StoreUnavailable(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Error::StoreUnavailable(format!("migration failed: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
