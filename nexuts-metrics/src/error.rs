use nexuts_common::error::{Classified, Kind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl Classified for MetricsError {
    fn kind(&self) -> Kind {
        Kind::Transient
    }
}

pub type MetricsResult<T> = Result<T, MetricsError>;
