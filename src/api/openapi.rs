use super::handlers::{auth, health, me, ErrorBody};
use crate::auth::{Role, TokenPair};
use crate::rate_limit::RateLimitDenied;
use axum::response::{IntoResponse, Json};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};

/// Registers the `bearer` scheme referenced by token-protected paths.
struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        auth::login,
        auth::mfa_pending,
        auth::mfa_complete,
        auth::refresh,
        auth::logout,
        me::get_me,
    ),
    components(schemas(
        health::Health,
        auth::LoginRequest,
        auth::MfaChallenge,
        auth::MfaPending,
        auth::MfaCompleteRequest,
        auth::RefreshRequest,
        me::MeResponse,
        TokenPair,
        Role,
        ErrorBody,
        RateLimitDenied,
    )),
    modifiers(&BearerAuth),
    tags(
        (name = "health", description = "Liveness"),
        (name = "auth", description = "Login, MFA promotion and refresh tokens"),
        (name = "me", description = "The authenticated caller"),
    )
)]
pub struct ApiDoc;

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

pub async fn openapi_json() -> impl IntoResponse {
    Json(openapi())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_every_route() {
        let doc = openapi();
        for path in [
            "/health",
            "/v1/auth/login",
            "/v1/auth/mfa/pending",
            "/v1/auth/mfa/complete",
            "/v1/auth/token/refresh",
            "/v1/auth/logout",
            "/v1/me",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
        assert_eq!(doc.info.title, env!("CARGO_PKG_NAME"));
    }

    #[test]
    fn document_declares_bearer_scheme() {
        let doc = openapi();
        let schemes = doc
            .components
            .map(|components| components.security_schemes)
            .unwrap_or_default();
        assert!(schemes.contains_key("bearer"));
    }
}
