use thiserror::Error;

/// Result type alias for dispatcher operations
pub type Result<T, E = DispatchError> = std::result::Result<T, E>;

/// Errors that can occur while dispatching a request
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] stores::StoreError),

    #[error("upstream fetch failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("upstream deadline exceeded for {0}")]
    UpstreamTimeout(String),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid embed url parameter")]
    InvalidEmbedUrl,

    #[error("could not decode rule bundle: {0}")]
    BundleDecode(#[from] serde_json::Error),

    #[error("request body error: {0}")]
    RequestBody(String),
}
