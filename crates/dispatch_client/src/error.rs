use shared::error::ResourceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request cancelled")]
    Cancelled,
    #[error("invalid url for resource {resource}: {source}")]
    InvalidUrl {
        resource: String,
        source: url::ParseError,
    },
    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("transport failure: {0}")]
    Other(#[source] anyhow::Error),
}

impl TransportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    InvalidResource(#[from] ResourceError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("dispatch requires a running tokio runtime")]
    NoRuntime,
    #[error("scheduled call for {resource} ended without a result")]
    Abandoned { resource: String },
}
