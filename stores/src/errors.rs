use thiserror::Error;

/// Result type alias for store operations
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Errors that can occur talking to the external stores
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not decode stored value: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("unexpected status from {service}: {status}")]
    UnexpectedStatus { service: &'static str, status: u16 },
}
