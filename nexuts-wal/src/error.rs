use nexuts_common::error::{Classified, Kind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt snapshot: {0}")]
    Corruption(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl Classified for WalError {
    fn kind(&self) -> Kind {
        match self {
            WalError::Io(_) => Kind::Transient,
            WalError::Serialization(_) => Kind::Validation,
            WalError::Corruption(_) => Kind::Corruption,
            WalError::Fatal(_) => Kind::Fatal,
        }
    }
}

pub type WalResult<T> = Result<T, WalError>;
