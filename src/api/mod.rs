use crate::{
    api::handlers::{auth, health, me},
    audit::AuditSink,
    auth::{
        authenticate_request, AuthGate, CredentialLookup, CredentialStore, InMemoryRefreshStore,
        SecondFactor, Sessions, TotpSecondFactor,
    },
    rate_limit::{enforce_rate_limit, RateLimitConfig, RateLimiter},
    token::TokenCodec,
};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    middleware::from_fn_with_state,
    routing::{get, post},
    Extension, Router,
};
use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{error, info, info_span, Span};
use ulid::Ulid;

pub mod handlers;
mod openapi;

pub use openapi::{openapi, ApiDoc};

/// How often expired rate-limit buckets and refresh records are swept.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Everything the request pipeline and handlers share.
#[derive(Clone)]
pub struct AppState {
    pub(crate) codec: Arc<TokenCodec>,
    pub(crate) credentials: CredentialLookup,
    pub(crate) gate: Arc<AuthGate>,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) sessions: Arc<Sessions>,
    pub(crate) second_factor: Arc<dyn SecondFactor>,
    pub(crate) audit: Arc<dyn AuditSink>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("codec", &self.codec)
            .field("limiter", &self.limiter)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Wire the gate, limiter and sessions around one codec and credential store.
    ///
    /// Refresh records live in memory and second factors are checked with
    /// [`TotpSecondFactor`] on the codec clock. Replace either with
    /// [`AppState::with_sessions`] and [`AppState::with_second_factor`].
    #[must_use]
    pub fn new(
        codec: Arc<TokenCodec>,
        credentials: Arc<dyn CredentialStore>,
        rate_limits: RateLimitConfig,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let credentials = CredentialLookup::new(credentials);
        let gate = AuthGate::new(codec.clone(), credentials.clone(), audit.clone());
        let limiter = RateLimiter::new(rate_limits, codec.clock().clone(), audit.clone());
        let sessions = Sessions::new(
            codec.clone(),
            credentials.clone(),
            Arc::new(InMemoryRefreshStore::new()),
            audit.clone(),
        );
        let second_factor = Arc::new(TotpSecondFactor::new(codec.clock().clone()));

        Self {
            codec,
            credentials,
            gate: Arc::new(gate),
            limiter: Arc::new(limiter),
            sessions: Arc::new(sessions),
            second_factor,
            audit,
        }
    }

    #[must_use]
    pub fn with_sessions(mut self, sessions: Sessions) -> Self {
        self.sessions = Arc::new(sessions);
        self
    }

    #[must_use]
    pub fn with_second_factor(mut self, second_factor: Arc<dyn SecondFactor>) -> Self {
        self.second_factor = second_factor;
        self
    }

    #[must_use]
    pub fn codec(&self) -> &Arc<TokenCodec> {
        &self.codec
    }

    #[must_use]
    pub fn credentials(&self) -> &CredentialLookup {
        &self.credentials
    }

    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<Sessions> {
        &self.sessions
    }
}

/// Build the router: request id, tracing, authentication gate, rate limiter, handlers.
#[must_use]
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/openapi.json", get(openapi::openapi_json))
        .route("/v1/auth/login", post(auth::login))
        .route("/v1/auth/mfa/pending", get(auth::mfa_pending))
        .route("/v1/auth/mfa/complete", post(auth::mfa_complete))
        .route("/v1/auth/token/refresh", post(auth::refresh))
        .route("/v1/auth/logout", post(auth::logout))
        .route("/v1/me", get(me::get_me))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(state.clone()))
                .layer(from_fn_with_state(state.gate.clone(), authenticate_request))
                .layer(from_fn_with_state(
                    state.limiter.clone(),
                    enforce_rate_limit,
                )),
        )
}

/// Start the server
/// # Errors
/// Return error if failed to bind or serve
pub async fn new(port: u16, state: Arc<AppState>) -> Result<()> {
    spawn_purge_task(state.clone());

    let app = router(state);

    let listener = TcpListener::bind(format!("::0:{port}"))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;

    info!("Listening on [::]:{}", port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

fn spawn_purge_task(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        // the first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            let buckets = state.limiter.purge_expired();
            if buckets > 0 {
                info!(buckets, "Purged expired rate-limit buckets");
            }
            if let Err(err) = state.sessions.purge().await {
                error!("Failed to purge refresh records: {err}");
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!("Failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Gracefully shutdown");
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
