//! Request-scoped identity.
//!
//! The gate inserts exactly one [`AuthContext`] into the request extensions. Handlers
//! branch on it explicitly; [`RequireAuth`] is the downstream check that turns
//! `Anonymous` into a 401.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::convert::Infallible;
use utoipa::ToSchema;

use super::Role;

/// Authenticated caller resolved from an access token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct Principal {
    pub identity: String,
    pub user_id: i64,
    pub role: Role,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum AuthContext {
    Authenticated(Principal),
    #[default]
    Anonymous,
}

impl AuthContext {
    #[must_use]
    pub fn principal(&self) -> Option<&Principal> {
        match self {
            Self::Authenticated(principal) => Some(principal),
            Self::Anonymous => None,
        }
    }

    #[must_use]
    pub fn identity(&self) -> Option<&str> {
        self.principal()
            .map(|principal| principal.identity.as_str())
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }
}

/// Requests that never went through the gate read as anonymous.
#[async_trait]
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .unwrap_or_default())
    }
}

/// Extractor for endpoints that need full authentication.
#[derive(Clone, Debug)]
pub struct RequireAuth(pub Principal);

#[derive(Debug)]
pub struct Unauthorized;

impl IntoResponse for Unauthorized {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "error": "unauthorized",
                "message": "Authentication required",
            })),
        )
            .into_response()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for RequireAuth
where
    S: Send + Sync,
{
    type Rejection = Unauthorized;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match parts.extensions.get::<AuthContext>() {
            Some(AuthContext::Authenticated(principal)) => Ok(Self(principal.clone())),
            _ => Err(Unauthorized),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn principal() -> Principal {
        Principal {
            identity: "user1".to_string(),
            user_id: 1,
            role: Role::User,
        }
    }

    #[tokio::test]
    async fn missing_context_reads_as_anonymous() {
        let (mut parts, ()) = Request::new(()).into_parts();
        let context = AuthContext::from_request_parts(&mut parts, &()).await;
        assert_eq!(context, Ok(AuthContext::Anonymous));
    }

    #[tokio::test]
    async fn require_auth_rejects_anonymous() {
        let mut request = Request::new(());
        request.extensions_mut().insert(AuthContext::Anonymous);
        let (mut parts, ()) = request.into_parts();

        let result = RequireAuth::from_request_parts(&mut parts, &()).await;
        let Err(rejection) = result else {
            panic!("anonymous request must be rejected");
        };
        assert_eq!(rejection.into_response().status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn require_auth_yields_principal() {
        let mut request = Request::new(());
        request
            .extensions_mut()
            .insert(AuthContext::Authenticated(principal()));
        let (mut parts, ()) = request.into_parts();

        let result = RequireAuth::from_request_parts(&mut parts, &()).await;
        assert_eq!(result.map(|RequireAuth(p)| p).ok(), Some(principal()));
    }

    #[test]
    fn context_accessors() {
        let context = AuthContext::Authenticated(principal());
        assert!(context.is_authenticated());
        assert_eq!(context.identity(), Some("user1"));
        assert_eq!(AuthContext::Anonymous.identity(), None);
    }
}
