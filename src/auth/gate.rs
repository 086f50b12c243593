//! Authentication gate.
//!
//! Runs once per request: extract the bearer token, verify it as an `access` token,
//! resolve the subject through [`CredentialLookup`] and attach an [`AuthContext`].
//! Every failure on the way degrades to [`AuthContext::Anonymous`]; the gate never
//! rejects a request on its own.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{AuthContext, CredentialLookup, LookupError, Principal};
use crate::audit::{AuditEvent, AuditSink, FailureReason};
use crate::rate_limit::client_address;
use crate::token::{TokenCodec, TokenKind};

const BEARER_PREFIX: &str = "Bearer ";

/// Read the token from `Authorization: Bearer <token>`.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix(BEARER_PREFIX))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

pub struct AuthGate {
    codec: Arc<TokenCodec>,
    credentials: CredentialLookup,
    audit: Arc<dyn AuditSink>,
}

impl fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthGate")
            .field("codec", &self.codec)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl AuthGate {
    #[must_use]
    pub fn new(
        codec: Arc<TokenCodec>,
        credentials: CredentialLookup,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            codec,
            credentials,
            audit,
        }
    }

    /// Resolve the caller for one request.
    pub async fn authenticate(&self, headers: &HeaderMap, client_ip: Option<&str>) -> AuthContext {
        let Some(raw) = bearer_token(headers) else {
            return AuthContext::Anonymous;
        };

        let token = match self.codec.verify_kind(raw, TokenKind::Access) {
            Ok(token) => token,
            Err(err) => {
                debug!(reason = err.reason(), "Rejected bearer token");
                self.audit.record(&AuditEvent::AuthenticationFailed {
                    identity: None,
                    reason: FailureReason::from(&err),
                    client_ip: client_ip.map(str::to_string),
                });
                return AuthContext::Anonymous;
            }
        };

        let identity = token.identity();
        match self.credentials.find_by_identity(identity).await {
            Ok(record) => {
                self.audit.record(&AuditEvent::AuthenticationSucceeded {
                    identity: record.identity.clone(),
                    client_ip: client_ip.map(str::to_string),
                });
                AuthContext::Authenticated(Principal {
                    identity: record.identity,
                    user_id: record.user_id,
                    role: record.role,
                })
            }
            Err(err) => {
                let reason = match err {
                    LookupError::NotFound => {
                        warn!(identity, "Valid access token for unknown identity");
                        FailureReason::IdentityNotFound
                    }
                    LookupError::Store(ref message) => {
                        warn!(identity, "Credential lookup failed: {message}");
                        FailureReason::LookupFailed
                    }
                };
                self.audit.record(&AuditEvent::AuthenticationFailed {
                    identity: Some(identity.to_string()),
                    reason,
                    client_ip: client_ip.map(str::to_string),
                });
                AuthContext::Anonymous
            }
        }
    }
}

/// Axum middleware attaching an [`AuthContext`] to every request.
pub async fn authenticate_request(
    State(gate): State<Arc<AuthGate>>,
    mut request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client_ip = client_address(request.headers(), peer);

    let context = gate.authenticate(request.headers(), Some(&client_ip)).await;
    request.extensions_mut().insert(context);

    next.run(request).await
}
