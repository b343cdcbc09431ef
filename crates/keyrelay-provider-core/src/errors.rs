use std::time::Duration;

use bytes::Bytes;

use crate::headers::Headers;
use crate::upstream::{UpstreamFailure, UpstreamTransportErrorKind};

pub type ExecResult<T> = Result<T, ExecutorError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutorError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Deny-all client key, or a restriction that leaves no eligible credential.
    #[error("client key is not permitted to use any credential")]
    Forbidden,
    #[error("no eligible credential for provider {0}")]
    NoEligibleCredential(String),
    #[error("quota exhausted ({})", reason.unwrap_or("rate_limited"))]
    RateLimited {
        retry_after: Option<Duration>,
        reason: Option<&'static str>,
        body: Bytes,
    },
    #[error("upstream responded with status {status}")]
    Upstream {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
    #[error("transport error ({kind:?}): {message}")]
    Transport {
        kind: UpstreamTransportErrorKind,
        message: String,
    },
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("{0}")]
    Other(String),
}

impl ExecutorError {
    pub fn status_code(&self) -> u16 {
        match self {
            ExecutorError::Validation(_) => 400,
            ExecutorError::NotFound(_) => 404,
            ExecutorError::Forbidden => 403,
            ExecutorError::NoEligibleCredential(_) => 503,
            ExecutorError::RateLimited { .. } => 429,
            ExecutorError::Upstream { status, .. } => *status,
            ExecutorError::Transport { kind, .. } => match kind {
                UpstreamTransportErrorKind::Timeout | UpstreamTransportErrorKind::ReadTimeout => {
                    504
                }
                _ => 502,
            },
            ExecutorError::Unsupported(_) => 501,
            ExecutorError::Other(_) => 500,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ExecutorError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Short machine-readable tag used in error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutorError::Validation(_) => "invalid_request",
            ExecutorError::NotFound(_) => "not_found",
            ExecutorError::Forbidden => "forbidden",
            ExecutorError::NoEligibleCredential(_) => "no_eligible_credential",
            ExecutorError::RateLimited { .. } => "rate_limited",
            ExecutorError::Upstream { .. } => "upstream_error",
            ExecutorError::Transport { .. } => "transport_error",
            ExecutorError::Unsupported(_) => "unsupported",
            ExecutorError::Other(_) => "internal_error",
        }
    }
}

impl From<UpstreamFailure> for ExecutorError {
    fn from(value: UpstreamFailure) -> Self {
        match value {
            UpstreamFailure::Transport { kind, message } => {
                ExecutorError::Transport { kind, message }
            }
            UpstreamFailure::Http {
                status,
                headers,
                body,
            } => ExecutorError::Upstream {
                status,
                headers,
                body,
            },
        }
    }
}

impl From<serde_json::Error> for ExecutorError {
    fn from(value: serde_json::Error) -> Self {
        ExecutorError::Validation(value.to_string())
    }
}
