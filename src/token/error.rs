use thiserror::Error;

use super::TokenKind;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("invalid signature")]
    Signature,
    #[error("token expired")]
    Expired,
    #[error("wrong token kind: expected {expected}, got {actual}")]
    WrongKind {
        expected: TokenKind,
        actual: TokenKind,
    },
    #[error("invalid token ttl")]
    InvalidTtl,
    #[error("invalid token subject")]
    InvalidSubject,
    #[error("signing secret must be at least {min} bytes")]
    WeakSecret { min: usize },
    #[error("failed to encode token claims")]
    Encoding,
    #[error("failed to generate random token material")]
    Entropy,
}

impl TokenError {
    /// Short machine-readable reason for logs and audit events.
    ///
    /// Never put this in a response body; callers must not be able to tell
    /// a forged token from an expired one.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::Signature => "signature",
            Self::Expired => "expired",
            Self::WrongKind { .. } => "wrong_kind",
            Self::InvalidTtl => "invalid_ttl",
            Self::InvalidSubject => "invalid_subject",
            Self::WeakSecret { .. } => "weak_secret",
            Self::Encoding => "encoding",
            Self::Entropy => "entropy",
        }
    }
}
