use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScryError {
    #[error("Invalid argument: {0}")]
    Argument(String),

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Transient provider failure: {0}")]
    TransientProvider(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Malformed provider response: {0}")]
    Parsing(String),

    #[error("Provider reported failure: {0}")]
    ProviderReported(String),
}

impl ScryError {
    /// Whether another attempt may succeed. Timeouts and transient provider
    /// conditions (5xx, rate limiting, dropped connections) are retryable;
    /// argument, fetch, auth, parsing, and provider-reported failures are
    /// terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ScryError::Timeout(_) | ScryError::TransientProvider(_)
        )
    }

    /// Stable taxonomy label carried on reported failures.
    pub fn code(&self) -> &'static str {
        match self {
            ScryError::Argument(_) => "ArgumentError",
            ScryError::Fetch(_) => "FetchError",
            ScryError::Timeout(_) => "TimeoutError",
            ScryError::TransientProvider(_) => "TransientProviderError",
            ScryError::Auth(_) => "AuthError",
            ScryError::Parsing(_) => "ParsingError",
            ScryError::ProviderReported(_) => "ProviderReportedError",
        }
    }
}

pub type Result<T> = std::result::Result<T, ScryError>;
