//! Login, MFA promotion and refresh-token endpoints.
//!
//! Flow Overview:
//! 1) `POST /v1/auth/login` checks the password. Users without MFA get a token pair;
//!    MFA users get a short-lived temp token instead.
//! 2) Temp-token holders call `GET /v1/auth/mfa/pending` to see who is mid-login and
//!    `POST /v1/auth/mfa/complete` to trade the temp token and a code for a pair.
//! 3) `POST /v1/auth/token/refresh` rotates a refresh token; `POST /v1/auth/logout`
//!    revokes one.
//!
//! Every credential failure answers with the same 401 body.

use argon2::{password_hash::PasswordHash, Argon2, PasswordVerifier};
use axum::{
    extract::{ConnectInfo, Extension},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error};
use utoipa::ToSchema;

use super::{service_unavailable, unauthorized, user_agent, ErrorBody};
use crate::api::AppState;
use crate::audit::{AuditEvent, FailureReason};
use crate::auth::{bearer_token, LookupError, SessionError, SessionMeta, TokenPair, UserRecord};
use crate::rate_limit::{client_address, RateLimitDenied};
use crate::token::{TokenKind, VerifiedToken};

#[derive(Deserialize, ToSchema)]
pub struct LoginRequest {
    pub username: String,
    #[schema(format = Password)]
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MfaChallenge {
    pub mfa_required: bool,
    pub temp_token: String,
    /// Temp token lifetime in seconds.
    pub expires_in: u64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MfaPending {
    pub username: String,
    pub user_id: i64,
}

#[derive(Deserialize, ToSchema)]
pub struct MfaCompleteRequest {
    pub code: String,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Verified in place of a real hash when the username is unknown. Uses the default
/// argon2id cost so both paths take the same time. No password matches it.
const DUMMY_PASSWORD_HASH: &str =
    "$argon2id$v=19$m=19456,t=2,p=1$c29tZXNhbHRzb21lc2FsdA$AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

fn session_meta(headers: &HeaderMap, peer: Option<SocketAddr>) -> SessionMeta {
    SessionMeta {
        client_ip: Some(client_address(headers, peer)),
        user_agent: user_agent(headers),
    }
}

fn peer_address(connect_info: Option<ConnectInfo<SocketAddr>>) -> Option<SocketAddr> {
    connect_info.map(|ConnectInfo(addr)| addr)
}

fn verify_password(password_hash: &str, password: &SecretString) -> bool {
    PasswordHash::new(password_hash).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(password.expose_secret().as_bytes(), &parsed)
            .is_ok()
    })
}

fn session_error_response(err: &SessionError) -> Response {
    match err {
        SessionError::Store(message) => {
            error!("Refresh store failed: {message}");
            service_unavailable()
        }
        SessionError::Token(token_err) => {
            debug!(reason = token_err.reason(), "Rejected refresh token");
            unauthorized()
        }
        other => {
            debug!("Rejected refresh token: {other}");
            unauthorized()
        }
    }
}

impl AppState {
    fn audit_failure(&self, identity: Option<&str>, reason: FailureReason, client_ip: &str) {
        self.audit.record(&AuditEvent::AuthenticationFailed {
            identity: identity.map(str::to_string),
            reason,
            client_ip: Some(client_ip.to_string()),
        });
    }

    /// Verify the bearer token as a temp token and resolve its user.
    async fn pending_login(
        &self,
        headers: &HeaderMap,
        client_ip: &str,
    ) -> Result<(VerifiedToken, UserRecord), Response> {
        let Some(raw) = bearer_token(headers) else {
            return Err(unauthorized());
        };

        let token = match self.codec.verify_kind(raw, TokenKind::Temp) {
            Ok(token) => token,
            Err(err) => {
                self.audit_failure(None, FailureReason::from(&err), client_ip);
                return Err(unauthorized());
            }
        };

        let Some(user_id) = token.user_id() else {
            self.audit_failure(Some(token.identity()), FailureReason::Malformed, client_ip);
            return Err(unauthorized());
        };

        match self.credentials.find_by_identity(token.identity()).await {
            Ok(record) if record.user_id == user_id => Ok((token, record)),
            Ok(_) | Err(LookupError::NotFound) => {
                self.audit_failure(
                    Some(token.identity()),
                    FailureReason::IdentityNotFound,
                    client_ip,
                );
                Err(unauthorized())
            }
            Err(LookupError::Store(message)) => {
                error!("Credential lookup failed: {message}");
                Err(service_unavailable())
            }
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Token pair, or an MFA challenge for MFA users", body = TokenPair),
        (status = 401, description = "Invalid credentials", body = ErrorBody),
        (status = 429, description = "Rate limit exceeded", body = RateLimitDenied),
    ),
    tag = "auth"
)]
pub async fn login(
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<LoginRequest>,
) -> Response {
    let peer = peer_address(connect_info);
    let client_ip = client_address(&headers, peer);
    let username = request.username.trim().to_string();

    let record = match state.credentials.find_by_identity(&username).await {
        Ok(record) => Some(record),
        Err(LookupError::NotFound) => None,
        Err(LookupError::Store(message)) => {
            error!("Credential lookup failed: {message}");
            return service_unavailable();
        }
    };

    // argon2 verification is CPU bound; unknown users pay for it too
    let password_hash = record.as_ref().map_or_else(
        || DUMMY_PASSWORD_HASH.to_string(),
        |record| record.password_hash.clone(),
    );
    let password = SecretString::from(request.password);
    let verified =
        tokio::task::spawn_blocking(move || verify_password(&password_hash, &password)).await;
    let record = match (verified, record) {
        (Ok(true), Some(record)) => record,
        (Ok(_), None) => {
            state.audit_failure(
                Some(username.as_str()),
                FailureReason::IdentityNotFound,
                &client_ip,
            );
            return unauthorized();
        }
        (Ok(false), Some(_)) => {
            state.audit_failure(
                Some(username.as_str()),
                FailureReason::BadCredentials,
                &client_ip,
            );
            return unauthorized();
        }
        (Err(err), _) => {
            error!("Password verification task failed: {err}");
            return service_unavailable();
        }
    };

    if record.mfa_enabled {
        return match state.codec.issue_temp(&record.identity, record.user_id) {
            Ok(temp) => {
                state.audit.record(&AuditEvent::TokenIssued {
                    identity: record.identity.clone(),
                    kind: TokenKind::Temp,
                });
                Json(MfaChallenge {
                    mfa_required: true,
                    temp_token: temp.into_token(),
                    expires_in: state.codec.config().temp_ttl().as_secs(),
                })
                .into_response()
            }
            Err(err) => {
                error!("Failed to issue temp token: {err}");
                service_unavailable()
            }
        };
    }

    match state
        .sessions
        .issue(&record.identity, session_meta(&headers, peer))
        .await
    {
        Ok(pair) => {
            state.audit.record(&AuditEvent::AuthenticationSucceeded {
                identity: record.identity,
                client_ip: Some(client_ip),
            });
            Json(pair).into_response()
        }
        Err(err) => session_error_response(&err),
    }
}

#[utoipa::path(
    get,
    path = "/v1/auth/mfa/pending",
    responses(
        (status = 200, description = "The user behind a temp token", body = MfaPending),
        (status = 401, description = "Missing, invalid or non-temp token", body = ErrorBody),
        (status = 429, description = "Rate limit exceeded", body = RateLimitDenied),
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn mfa_pending(
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Extension(state): Extension<Arc<AppState>>,
) -> Response {
    let client_ip = client_address(&headers, peer_address(connect_info));
    match state.pending_login(&headers, &client_ip).await {
        Ok((_token, record)) => Json(MfaPending {
            username: record.identity,
            user_id: record.user_id,
        })
        .into_response(),
        Err(response) => response,
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/mfa/complete",
    request_body = MfaCompleteRequest,
    responses(
        (status = 200, description = "Second factor accepted", body = TokenPair),
        (status = 401, description = "Invalid temp token or code", body = ErrorBody),
        (status = 429, description = "Rate limit exceeded", body = RateLimitDenied),
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn mfa_complete(
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<MfaCompleteRequest>,
) -> Response {
    let peer = peer_address(connect_info);
    let client_ip = client_address(&headers, peer);
    let (_token, record) = match state.pending_login(&headers, &client_ip).await {
        Ok(pending) => pending,
        Err(response) => return response,
    };

    if !state.second_factor.verify(&record, &request.code).await {
        state.audit_failure(
            Some(record.identity.as_str()),
            FailureReason::SecondFactor,
            &client_ip,
        );
        return unauthorized();
    }

    match state
        .sessions
        .issue(&record.identity, session_meta(&headers, peer))
        .await
    {
        Ok(pair) => {
            state.audit.record(&AuditEvent::AuthenticationSucceeded {
                identity: record.identity,
                client_ip: Some(client_ip),
            });
            Json(pair).into_response()
        }
        Err(err) => session_error_response(&err),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/token/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Rotated token pair", body = TokenPair),
        (status = 401, description = "Invalid, expired or revoked refresh token", body = ErrorBody),
        (status = 429, description = "Rate limit exceeded", body = RateLimitDenied),
    ),
    tag = "auth"
)]
pub async fn refresh(
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<RefreshRequest>,
) -> Response {
    let meta = session_meta(&headers, peer_address(connect_info));
    match state.sessions.rotate(&request.refresh_token, meta).await {
        Ok(pair) => Json(pair).into_response(),
        Err(err) => session_error_response(&err),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    request_body = RefreshRequest,
    responses(
        (status = 204, description = "Refresh token revoked"),
        (status = 401, description = "Invalid refresh token", body = ErrorBody),
        (status = 429, description = "Rate limit exceeded", body = RateLimitDenied),
    ),
    tag = "auth"
)]
pub async fn logout(
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<RefreshRequest>,
) -> Response {
    let meta = session_meta(&headers, peer_address(connect_info));
    match state.sessions.revoke(&request.refresh_token, &meta).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => session_error_response(&err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon2::password_hash::{PasswordHasher, SaltString};

    fn hash(password: &str) -> String {
        let salt = SaltString::encode_b64(b"fixed-test-salt!").unwrap_or_else(|err| {
            panic!("salt: {err}");
        });
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .unwrap_or_else(|err| panic!("hash: {err}"))
    }

    #[test]
    fn password_verification() {
        let stored = hash("correct horse");
        assert!(verify_password(
            &stored,
            &SecretString::from("correct horse".to_string())
        ));
        assert!(!verify_password(
            &stored,
            &SecretString::from("battery staple".to_string())
        ));
        assert!(!verify_password(
            "not-a-phc-string",
            &SecretString::from("correct horse".to_string())
        ));
    }

    #[test]
    fn dummy_hash_uses_default_cost_and_never_matches() {
        let parsed = PasswordHash::new(DUMMY_PASSWORD_HASH)
            .unwrap_or_else(|err| panic!("dummy hash must parse: {err}"));
        let params =
            argon2::Params::try_from(&parsed).unwrap_or_else(|err| panic!("params: {err}"));
        assert_eq!(params.m_cost(), argon2::Params::DEFAULT_M_COST);
        assert_eq!(params.t_cost(), argon2::Params::DEFAULT_T_COST);
        assert_eq!(params.p_cost(), argon2::Params::DEFAULT_P_COST);

        for guess in ["", "password", "hunter2"] {
            assert!(!verify_password(
                DUMMY_PASSWORD_HASH,
                &SecretString::from(guess.to_string())
            ));
        }
    }

    #[test]
    fn login_request_accepts_json() -> anyhow::Result<()> {
        let request: LoginRequest =
            serde_json::from_str(r#"{"username":"alice","password":"secret"}"#)?;
        assert_eq!(request.username, "alice");
        assert_eq!(request.password, "secret");

        let request: RefreshRequest = serde_json::from_str(r#"{"refreshToken":"ts1.a.b"}"#)?;
        assert_eq!(request.refresh_token, "ts1.a.b");
        Ok(())
    }
}
