use nexuts_common::error::{Classified, Kind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SentryError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("pod not registered: {0}")]
    NotFound(String),

    #[error(transparent)]
    Tree(#[from] nexuts_tree::TreeError),

    #[error(transparent)]
    Store(#[from] nexuts_store::error::StoreError),

    #[error("transient I/O error: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl Classified for SentryError {
    fn kind(&self) -> Kind {
        match self {
            SentryError::Validation(_) => Kind::Validation,
            SentryError::NotFound(_) => Kind::NotFound,
            SentryError::Tree(e) => e.kind(),
            SentryError::Store(e) => e.kind(),
            SentryError::Transient(_) => Kind::Transient,
            SentryError::Fatal(_) => Kind::Fatal,
        }
    }
}

pub type SentryResult<T> = Result<T, SentryError>;
