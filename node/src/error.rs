use thiserror::Error;

/// Error kinds surfaced across component boundaries and to API callers.
///
/// Every kind carries a stable code (`WF01nnn`) so callers can match on it
/// without parsing messages; logs carry the code plus the cause chain.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("WF01100 Invalid input: {0}")]
    InvalidInput(String),

    #[error("WF01110 Invalid data reference: {0}")]
    InvalidRef(String),

    #[error("WF01120 Author is not a known local identity: {0}")]
    Unauthorized(String),

    #[error("WF01130 Conflict: {0}")]
    Conflict(String),

    #[error("WF01140 Not found: {0}")]
    NotFound(String),

    #[error("WF01150 Row exists with a different id: {0}")]
    IdMismatch(String),

    #[error("WF01200 Remote temporarily unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("WF01210 Remote rejected the request: {0}")]
    RemoteRejected(String),

    #[error("WF01300 Integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("WF01400 Cancelled")]
    Cancelled,

    #[error("WF01500 Internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidInput(_) => "WF01100",
            CoreError::InvalidRef(_) => "WF01110",
            CoreError::Unauthorized(_) => "WF01120",
            CoreError::Conflict(_) => "WF01130",
            CoreError::NotFound(_) => "WF01140",
            CoreError::IdMismatch(_) => "WF01150",
            CoreError::RemoteUnavailable(_) => "WF01200",
            CoreError::RemoteRejected(_) => "WF01210",
            CoreError::IntegrityViolation(_) => "WF01300",
            CoreError::Cancelled => "WF01400",
            CoreError::Internal(_) => "WF01500",
        }
    }

    /// Whether a retry of the same work can be expected to succeed.
    pub fn retryable(&self) -> bool {
        matches!(self, CoreError::RemoteUnavailable(_))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_codes_stable() {
        assert_eq!(CoreError::InvalidInput("x".into()).code(), "WF01100");
        assert_eq!(CoreError::NotFound("x".into()).code(), "WF01140");
        assert_eq!(CoreError::Cancelled.code(), "WF01400");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(CoreError::RemoteUnavailable("x".into()).retryable());
        assert!(!CoreError::RemoteRejected("x".into()).retryable());
        assert!(!CoreError::IntegrityViolation("x".into()).retryable());
    }

    #[test]
    fn test_display_carries_code() {
        let err = CoreError::Unauthorized("did:org/alice".into());
        assert!(err.to_string().starts_with("WF01120"));
    }
}
