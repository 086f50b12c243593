//! Security audit events.
//!
//! The pipeline only reports events; formatting and persistence belong to the sink.
//! [`TracingAuditSink`] writes them as structured `tracing` events on the
//! `security_audit` target so they can be routed separately from application logs.

use std::sync::Mutex;
use tracing::{info, warn};

use crate::rate_limit::EndpointClass;
use crate::token::{TokenError, TokenKind};

pub const AUDIT_TARGET: &str = "security_audit";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureReason {
    Malformed,
    Signature,
    Expired,
    WrongKind,
    IdentityNotFound,
    LookupFailed,
    BadCredentials,
    SecondFactor,
    Revoked,
}

impl FailureReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::Signature => "signature",
            Self::Expired => "expired",
            Self::WrongKind => "wrong_kind",
            Self::IdentityNotFound => "identity_not_found",
            Self::LookupFailed => "lookup_failed",
            Self::BadCredentials => "bad_credentials",
            Self::SecondFactor => "second_factor",
            Self::Revoked => "revoked",
        }
    }
}

impl From<&TokenError> for FailureReason {
    fn from(err: &TokenError) -> Self {
        match err {
            TokenError::Signature => Self::Signature,
            TokenError::Expired => Self::Expired,
            TokenError::WrongKind { .. } => Self::WrongKind,
            _ => Self::Malformed,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuditEvent {
    AuthenticationSucceeded {
        identity: String,
        client_ip: Option<String>,
    },
    AuthenticationFailed {
        identity: Option<String>,
        reason: FailureReason,
        client_ip: Option<String>,
    },
    RateLimitExceeded {
        key: String,
        endpoint: EndpointClass,
        limit: u32,
    },
    TokenIssued {
        identity: String,
        kind: TokenKind,
    },
    RefreshRotated {
        identity: String,
    },
    RefreshRevoked {
        identity: String,
        count: usize,
    },
}

impl AuditEvent {
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::AuthenticationSucceeded { .. } => "authentication_success",
            Self::AuthenticationFailed { .. } => "authentication_failure",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::TokenIssued { .. } => "token_issued",
            Self::RefreshRotated { .. } => "refresh_token_rotated",
            Self::RefreshRevoked { .. } => "refresh_token_revoked",
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) {
        let event_type = event.event_type();
        match event {
            AuditEvent::AuthenticationSucceeded {
                identity,
                client_ip,
            } => info!(
                target: AUDIT_TARGET,
                event_type,
                identity = %identity,
                client_ip = client_ip.as_deref().unwrap_or("unknown"),
                "Authentication succeeded"
            ),
            AuditEvent::AuthenticationFailed {
                identity,
                reason,
                client_ip,
            } => warn!(
                target: AUDIT_TARGET,
                event_type,
                identity = identity.as_deref().unwrap_or("-"),
                reason = reason.as_str(),
                client_ip = client_ip.as_deref().unwrap_or("unknown"),
                "Authentication failed"
            ),
            AuditEvent::RateLimitExceeded {
                key,
                endpoint,
                limit,
            } => warn!(
                target: AUDIT_TARGET,
                event_type,
                key = %key,
                endpoint = endpoint.as_str(),
                limit,
                "Rate limit exceeded"
            ),
            AuditEvent::TokenIssued { identity, kind } => info!(
                target: AUDIT_TARGET,
                event_type,
                identity = %identity,
                kind = kind.as_str(),
                "Token issued"
            ),
            AuditEvent::RefreshRotated { identity } => info!(
                target: AUDIT_TARGET,
                event_type,
                identity = %identity,
                "Refresh token rotated"
            ),
            AuditEvent::RefreshRevoked { identity, count } => info!(
                target: AUDIT_TARGET,
                event_type,
                identity = %identity,
                count,
                "Refresh tokens revoked"
            ),
        }
    }
}

/// Keeps every event in memory. Useful for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
