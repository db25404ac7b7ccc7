//! Error taxonomy for the document pipeline.
//!
//! Mirrors the shape of [`crate::repository::RepositoryError`] and
//! [`crate::llm::LlmError`]: one `thiserror`-derived enum per concern, with a
//! single classification boundary (`PipelineError::classify`) consumed by the
//! task runner to decide retry vs. terminal failure.

use std::time::Duration;

use thiserror::Error;

/// Error codes surfaced to the job ledger and, eventually, to API consumers.
/// Stable strings rather than a bare enum discriminant so they can be stored
/// verbatim in `Job.error_message` / logged without a lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ExternalServiceError,
    InvalidPdfFormat,
    EmptyFile,
    OversizePdf,
    Authorization,
    Integrity,
    Cancelled,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExternalServiceError => "EXTERNAL_SERVICE_ERROR",
            Self::InvalidPdfFormat => "INVALID_PDF_FORMAT",
            Self::EmptyFile => "EMPTY_FILE",
            Self::OversizePdf => "OVERSIZE_PDF",
            Self::Authorization => "AUTHORIZATION_DENIED",
            Self::Integrity => "INTEGRITY_VIOLATION",
            Self::Cancelled => "CANCELLED",
        }
    }
}

/// A typed error raised by router, pipeline stage, ledger, lock or cache
/// code. Grouped "by kind, not type" per the error taxonomy: callers that
/// need to decide retry vs. fail should match on `classify()`, not on the
/// enum variant directly.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("transient external error: {0}")]
    TransientExternal(String),

    #[error("rate limited by provider {provider}")]
    RateLimit {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("validation failed: {0}")]
    Validation(ValidationError),

    #[error("authorization denied")]
    Authorization,

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("cancelled")]
    Cancelled,

    #[error("ledger error: {0}")]
    Ledger(#[from] crate::ledger::LedgerError),

    #[error("lock error: {0}")]
    Lock(#[from] crate::lock::LockError),

    #[error("router error: {0}")]
    Router(#[from] crate::router::RouterError),

    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

/// Specific validation failures, each mapped to one of the spec's
/// non-retryable error codes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("document has no pages")]
    EmptyDocument,
    #[error("document exceeds the maximum page count")]
    OversizePdf,
    #[error("malformed PDF: {0}")]
    InvalidPdf(String),
}

/// What the task runner should do with an error it caught at the single
/// classification boundary (§9: "the task runner catches at a single
/// boundary to classify retry vs. fail").
#[derive(Debug, Clone)]
pub enum RetryDecision {
    Retry { backoff: Duration },
    Fail { code: ErrorCode, retryable: bool },
}

impl PipelineError {
    /// Classify this error for the task runner. Backoff for `TransientExternal`
    /// and `RateLimit` is computed by the caller (it needs the attempt count),
    /// this only decides retry-eligibility and the terminal error code.
    pub fn classify(&self) -> RetryDecision {
        match self {
            PipelineError::TransientExternal(_) => RetryDecision::Fail {
                code: ErrorCode::ExternalServiceError,
                retryable: true,
            },
            PipelineError::RateLimit { retry_after, .. } => RetryDecision::Retry {
                backoff: retry_after.unwrap_or(Duration::from_secs(30)),
            },
            PipelineError::Validation(ValidationError::EmptyDocument) => RetryDecision::Fail {
                code: ErrorCode::EmptyFile,
                retryable: false,
            },
            PipelineError::Validation(ValidationError::OversizePdf) => RetryDecision::Fail {
                code: ErrorCode::OversizePdf,
                retryable: false,
            },
            PipelineError::Validation(ValidationError::InvalidPdf(_)) => RetryDecision::Fail {
                code: ErrorCode::InvalidPdfFormat,
                retryable: false,
            },
            PipelineError::Authorization => RetryDecision::Fail {
                code: ErrorCode::Authorization,
                retryable: false,
            },
            PipelineError::Integrity(_) => RetryDecision::Fail {
                code: ErrorCode::Integrity,
                retryable: false,
            },
            PipelineError::Cancelled => RetryDecision::Fail {
                code: ErrorCode::Cancelled,
                retryable: false,
            },
            PipelineError::Router(router_err) => match router_err {
                crate::router::RouterError::EmptyDocument => {
                    RetryDecision::Fail { code: ErrorCode::EmptyFile, retryable: false }
                }
                crate::router::RouterError::OversizePdf(_) => {
                    RetryDecision::Fail { code: ErrorCode::OversizePdf, retryable: false }
                }
                crate::router::RouterError::MissingMagicBytes | crate::router::RouterError::ParseError(_) => {
                    RetryDecision::Fail { code: ErrorCode::InvalidPdfFormat, retryable: false }
                }
            },
            PipelineError::Ledger(_) | PipelineError::Lock(_) | PipelineError::Store(_) => RetryDecision::Fail {
                code: ErrorCode::ExternalServiceError,
                retryable: true,
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classify(),
            RetryDecision::Retry { .. } | RetryDecision::Fail { retryable: true, .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_not_retryable() {
        let err = PipelineError::Validation(ValidationError::OversizePdf);
        assert!(!err.is_retryable());
        match err.classify() {
            RetryDecision::Fail { code, retryable } => {
                assert_eq!(code.as_str(), "OVERSIZE_PDF");
                assert!(!retryable);
            }
            _ => panic!("expected Fail"),
        }
    }

    #[test]
    fn transient_external_is_retryable() {
        let err = PipelineError::TransientExternal("timed out".into());
        assert!(err.is_retryable());
    }

    #[test]
    fn rate_limit_always_retries() {
        let err = PipelineError::RateLimit {
            provider: "ocr-provider".into(),
            retry_after: Some(Duration::from_secs(5)),
        };
        assert!(matches!(err.classify(), RetryDecision::Retry { .. }));
    }
}
