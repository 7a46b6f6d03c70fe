use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("No accounts configured for backend {0}")]
    ConfigMissing(&'static str),

    #[error("All accounts are cooling down. Quota resets in ~{reset_mins} minute(s)")]
    Unavailable { reset_mins: u64 },

    #[error("Upstream rejected credentials: {0}")]
    Unauthorized(String),

    #[error("Upstream rate limited: {0}")]
    RateLimited(String),

    #[error("Upstream error {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Network error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid request: {0}")]
    ContractViolation(String),

    #[error("Backend produced no content")]
    StreamEmpty,

    #[error("OAuth error: {0}")]
    OAuth(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request failed after {attempts} attempt(s): {last_error}")]
    RetriesExhausted { attempts: usize, last_error: String },
}

impl ProxyError {
    // HTTP status surfaced to the client for this error kind.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::ConfigMissing(_) => 503,
            ProxyError::Unavailable { .. } => 503,
            ProxyError::Unauthorized(_) => 401,
            ProxyError::RateLimited(_) => 429,
            ProxyError::Upstream { status, .. } => *status,
            ProxyError::Transport(_) => 502,
            ProxyError::ContractViolation(_) => 400,
            ProxyError::StreamEmpty => 502,
            ProxyError::OAuth(_) => 401,
            ProxyError::Io(_) => 500,
            ProxyError::RetriesExhausted { .. } => 502,
        }
    }

    // Anthropic-style error type tag for the response body.
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::ConfigMissing(_) | ProxyError::Unavailable { .. } => "overloaded_error",
            ProxyError::Unauthorized(_) | ProxyError::OAuth(_) => "authentication_error",
            ProxyError::RateLimited(_) => "rate_limit_error",
            ProxyError::ContractViolation(_) => "invalid_request_error",
            _ => "api_error",
        }
    }
}

impl Serialize for ProxyError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_maps_to_503_overloaded() {
        let err = ProxyError::Unavailable { reset_mins: 2 };
        assert_eq!(err.status_code(), 503);
        assert_eq!(err.error_type(), "overloaded_error");
        assert!(err.to_string().contains("2 minute"));
    }

    #[test]
    fn upstream_status_passes_through() {
        let err = ProxyError::Upstream {
            status: 418,
            body: "teapot".to_string(),
        };
        assert_eq!(err.status_code(), 418);
    }
}
