use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T, E = ProxyError> = std::result::Result<T, E>;

/// Top-level errors: anything that can abort startup or the serve loop.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("failed to build resolver: {0}")]
    Resolver(#[from] hickory_resolver::error::ResolveError),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("failed to build response: {0}")]
    ResponseBuild(#[from] http::Error),

    #[error("failed to serialize response: {0}")]
    ResponseSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a single upstream operation. The batcher never propagates
/// these to callers; a failed batch leaves its entries holding the
/// pre-populated error response.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("reached retry limit")]
    RetryLimitReached,

    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to encode batch payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// Message supplied by the upstream when it rejects a whole batch.
    #[error("{0}")]
    Upstream(String),

    #[error("backend response count ({got}) doesn't match requested count ({want})")]
    CountMismatch { got: usize, want: usize },

    #[error("pops endpoint returned: {0}")]
    PopsStatus(http::StatusCode),
}
