use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("invalid catalog endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("{path} returned {status}")]
    NotFound { path: String, status: StatusCode },
    #[error(
        "asset {name} with version {version} not found. Available versions: {available:?}"
    )]
    VersionNotFound {
        name: String,
        version: String,
        available: Vec<String>,
    },
    #[error("request to {path} failed after {attempts} attempts")]
    RetriesExhausted {
        path: String,
        attempts: u32,
        #[source]
        last: AttemptFailure,
    },
    #[error("request to {path} failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid response from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl CatalogError {
    /// True for errors that mean the requested record does not exist, as
    /// opposed to the catalog being unreachable.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CatalogError::NotFound { .. } | CatalogError::VersionNotFound { .. }
        )
    }
}

/// Why a single attempt did not produce a usable response.
#[derive(Debug, Error)]
pub enum AttemptFailure {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server error {0}")]
    Status(StatusCode),
}
