use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header::RETRY_AFTER, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use utoipa::ToSchema;

use super::{
    client_address, is_exempt, EndpointClass, RateLimitDecision, RateLimitSubject, RateLimiter,
};
use crate::auth::AuthContext;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

pub const RATE_LIMIT_EXCEEDED: &str = "Rate limit exceeded";
const RATE_LIMIT_MESSAGE: &str = "Too many requests. Please try again later.";

/// Body of every 429 response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RateLimitDenied {
    pub error: String,
    pub message: String,
    pub limit: u32,
    /// Epoch seconds.
    #[serde(rename = "resetTime")]
    pub reset_time: i64,
}

impl RateLimitDenied {
    #[must_use]
    pub fn new(decision: &RateLimitDecision) -> Self {
        Self {
            error: RATE_LIMIT_EXCEEDED.to_string(),
            message: RATE_LIMIT_MESSAGE.to_string(),
            limit: decision.limit,
            reset_time: decision.reset_at,
        }
    }
}

fn annotate(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at));
}

/// Axum middleware; must run after the authentication gate so identities are known.
pub async fn enforce_rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if is_exempt(path) {
        return next.run(request).await;
    }
    let class = EndpointClass::from_path(path);

    let subject = match request
        .extensions()
        .get::<AuthContext>()
        .and_then(AuthContext::identity)
    {
        Some(identity) => RateLimitSubject::User(identity.to_string()),
        None => {
            let peer = request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr);
            RateLimitSubject::Address(client_address(request.headers(), peer))
        }
    };

    let Some(decision) = limiter.check(&subject, class) else {
        return next.run(request).await;
    };

    if !decision.allowed {
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(RateLimitDenied::new(&decision)),
        )
            .into_response();
        annotate(response.headers_mut(), &decision);
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(decision.retry_after));
        return response;
    }

    let mut response = next.run(request).await;
    annotate(response.headers_mut(), &decision);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::auth::{Principal, Role};
    use crate::clock::ManualClock;
    use crate::rate_limit::RateLimitConfig;
    use axum::{
        body::{to_bytes, Body},
        http::Request as HttpRequest,
        middleware::from_fn_with_state,
        routing::{get, post},
        Extension, Router,
    };
    use tower::ServiceExt;

    const T0: i64 = 1_700_000_000_000;

    fn app(limiter: Arc<RateLimiter>) -> Router {
        Router::new()
            .route("/v1/auth/login", post(|| async { "ok" }))
            .route("/v1/me", get(|| async { "me" }))
            .route("/health", get(|| async { "healthy" }))
            .layer(from_fn_with_state(limiter, enforce_rate_limit))
    }

    fn limiter(config: RateLimitConfig) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(
            config,
            Arc::new(ManualClock::new(T0)),
            Arc::new(MemoryAuditSink::new()),
        ))
    }

    fn login_from(address: &str) -> Request {
        HttpRequest::builder()
            .method("POST")
            .uri("/v1/auth/login")
            .header("x-forwarded-for", address)
            .body(Body::empty())
            .unwrap_or_default()
    }

    fn header(response: &Response, name: &HeaderName) -> Option<String> {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    #[tokio::test]
    async fn five_logins_then_denied() -> anyhow::Result<()> {
        let app = app(limiter(RateLimitConfig::default()));
        let reset = ((T0 + 60_000) / 1000).to_string();

        for remaining in ["4", "3", "2", "1", "0"] {
            let response = app.clone().oneshot(login_from("10.0.0.1")).await?;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(header(&response, &X_RATELIMIT_LIMIT).as_deref(), Some("5"));
            assert_eq!(
                header(&response, &X_RATELIMIT_REMAINING).as_deref(),
                Some(remaining)
            );
            assert_eq!(
                header(&response, &X_RATELIMIT_RESET).as_deref(),
                Some(reset.as_str())
            );
        }

        let response = app.clone().oneshot(login_from("10.0.0.1")).await?;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            header(&response, &X_RATELIMIT_REMAINING).as_deref(),
            Some("0")
        );
        assert_eq!(header(&response, &RETRY_AFTER).as_deref(), Some("60"));

        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let denied: RateLimitDenied = serde_json::from_slice(&body)?;
        assert_eq!(
            denied,
            RateLimitDenied {
                error: "Rate limit exceeded".to_string(),
                message: "Too many requests. Please try again later.".to_string(),
                limit: 5,
                reset_time: (T0 + 60_000) / 1000,
            }
        );

        // another address still has its own bucket
        let response = app.oneshot(login_from("10.0.0.2")).await?;
        assert_eq!(response.status(), StatusCode::OK);
        Ok(())
    }

    #[tokio::test]
    async fn deny_body_uses_reset_time_field() -> anyhow::Result<()> {
        let body = serde_json::to_value(RateLimitDenied {
            error: RATE_LIMIT_EXCEEDED.to_string(),
            message: RATE_LIMIT_MESSAGE.to_string(),
            limit: 5,
            reset_time: 42,
        })?;
        assert_eq!(body.get("resetTime"), Some(&serde_json::json!(42)));
        assert!(body.get("reset_time").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn exempt_paths_have_no_headers() -> anyhow::Result<()> {
        let app = app(limiter(RateLimitConfig::default()));
        let response = app
            .oneshot(HttpRequest::builder().uri("/health").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(X_RATELIMIT_LIMIT).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn disabled_limiter_passes_through() -> anyhow::Result<()> {
        let app = app(limiter(RateLimitConfig::default().with_enabled(false)));
        for _ in 0..10 {
            let response = app.clone().oneshot(login_from("10.0.0.1")).await?;
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get(X_RATELIMIT_LIMIT).is_none());
        }
        Ok(())
    }

    #[tokio::test]
    async fn authenticated_requests_are_keyed_by_identity() -> anyhow::Result<()> {
        let limiter = limiter(RateLimitConfig::default());
        let principal = Principal {
            identity: "user1".to_string(),
            user_id: 1,
            role: Role::User,
        };
        let app = app(limiter.clone()).layer(Extension(AuthContext::Authenticated(principal)));

        let response = app
            .oneshot(HttpRequest::builder().uri("/v1/me").body(Body::empty())?)
            .await?;
        assert_eq!(
            header(&response, &X_RATELIMIT_LIMIT).as_deref(),
            Some("1000")
        );

        let subject = RateLimitSubject::User("user1".to_string());
        let decision = limiter.check(&subject, EndpointClass::Api);
        assert_eq!(decision.map(|d| d.remaining), Some(998));
        Ok(())
    }
}
