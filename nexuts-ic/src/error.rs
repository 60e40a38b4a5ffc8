use nexuts_common::error::{Classified, Kind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IcError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Tree(#[from] nexuts_tree::TreeError),

    #[error(transparent)]
    Wal(#[from] nexuts_wal::WalError),

    #[error(transparent)]
    Store(#[from] nexuts_store::error::StoreError),

    #[error("transient I/O error: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl Classified for IcError {
    fn kind(&self) -> Kind {
        match self {
            IcError::Validation(_) => Kind::Validation,
            IcError::NotFound(_) => Kind::NotFound,
            IcError::Tree(e) => e.kind(),
            IcError::Wal(e) => e.kind(),
            IcError::Store(e) => e.kind(),
            IcError::Transient(_) => Kind::Transient,
            IcError::Fatal(_) => Kind::Fatal,
        }
    }
}

pub type IcResult<T> = Result<T, IcError>;
