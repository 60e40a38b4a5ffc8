use nexuts_common::error::{Classified, Kind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("node path not found: {0:?}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("internal tree error: {0}")]
    Internal(String),
}

impl Classified for TreeError {
    fn kind(&self) -> Kind {
        match self {
            TreeError::NotFound(_) => Kind::NotFound,
            TreeError::Validation(_) => Kind::Validation,
            TreeError::Internal(_) => Kind::Fatal,
        }
    }
}

pub type TreeResult<T> = Result<T, TreeError>;
