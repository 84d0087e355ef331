use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Authentication failed for {provider}: {message}")]
    Authentication { provider: String, message: String },

    #[error("Rate limit exceeded for {provider}: {message}")]
    RateLimitExceeded { provider: String, message: String },

    #[error("Daily budget exceeded for {provider}")]
    BudgetExceeded { provider: String },

    #[error("Request to {provider} timed out after {seconds}s")]
    Timeout { provider: String, seconds: u64 },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No providers available")]
    NoProvidersAvailable,

    #[error("All providers failed: {0}")]
    AllProvidersFailed(String),

    #[error("Model provider error: {0}")]
    ModelProvider(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by the routing layer and carried on
/// synthesized error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    RateLimitExceeded,
    BudgetExceeded,
    Timeout,
    InvalidInput,
    NoProvidersAvailable,
    AllProvidersFailed,
    Transient,
    Internal,
}

impl Error {
    pub fn platform(msg: impl Into<String>) -> Self {
        Error::Platform(msg.into())
    }

    pub fn model_provider(msg: impl Into<String>) -> Self {
        Error::ModelProvider(msg.into())
    }

    pub fn authentication(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::Authentication {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    pub fn rate_limited(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::RateLimitExceeded {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Authentication { .. } => ErrorKind::Authentication,
            Error::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            Error::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::NoProvidersAvailable => ErrorKind::NoProvidersAvailable,
            Error::AllProvidersFailed(_) => ErrorKind::AllProvidersFailed,
            Error::Http(e) if e.is_timeout() => ErrorKind::Timeout,
            Error::Http(_) | Error::ModelProvider(_) | Error::Io(_) => ErrorKind::Transient,
            Error::Json(_) => ErrorKind::Transient,
            Error::Config(_) | Error::Platform(_) | Error::Validation(_) | Error::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether another provider may succeed where this attempt failed.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl ErrorKind {
    /// Authentication is provider-specific, so a different provider is
    /// still worth trying. Only defects in the request itself stop the chain.
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::InvalidInput)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Authentication => "authentication_error",
            ErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::NoProvidersAvailable => "no_providers_available",
            ErrorKind::AllProvidersFailed => "all_providers_failed",
            ErrorKind::Transient => "transient",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(config::ConfigError::Message(e.to_string()))
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Config(config::ConfigError::Message(e.to_string()))
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(e: validator::ValidationErrors) -> Self {
        Error::Validation(e.to_string())
    }
}
