use nexuts_common::error::{Classified, Kind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl Classified for StoreError {
    fn kind(&self) -> Kind {
        match self {
            StoreError::Sqlite(_) => Kind::Transient,
            StoreError::NotFound(_) => Kind::NotFound,
            StoreError::Fatal(_) => Kind::Fatal,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
