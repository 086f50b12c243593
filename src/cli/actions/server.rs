use crate::{
    api::{self, AppState},
    audit::TracingAuditSink,
    auth::{
        CredentialLookup, InMemoryCredentialStore, InMemoryRefreshStore, Sessions, TotpSecondFactor,
    },
    clock::SystemClock,
    rate_limit::RateLimitConfig,
    token::{TokenCodec, TokenConfig},
};
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::{path::PathBuf, sync::Arc};
use tracing::{debug, info};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub signing_secret: SecretString,
    pub token_config: TokenConfig,
    pub max_refresh_tokens: usize,
    pub users_file: PathBuf,
    pub rate_limits: RateLimitConfig,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the signing secret is too weak, the users file cannot be loaded,
/// or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let codec = TokenCodec::new(
        &args.signing_secret,
        args.token_config,
        Arc::new(SystemClock),
    )
    .context("Invalid signing secret")?;
    let codec = Arc::new(codec);

    let store = InMemoryCredentialStore::from_json_file(&args.users_file)?;
    info!(
        users = store.len(),
        "Loaded user records from {}",
        args.users_file.display()
    );
    let store = Arc::new(store);

    debug!(rate_limits = ?args.rate_limits, "Rate limit configuration");

    let audit = Arc::new(TracingAuditSink);
    let sessions = Sessions::new(
        codec.clone(),
        CredentialLookup::new(store.clone()),
        Arc::new(InMemoryRefreshStore::new()),
        audit.clone(),
    )
    .with_max_active(args.max_refresh_tokens);

    let second_factor = Arc::new(TotpSecondFactor::new(codec.clock().clone()));
    let enrolled = store.totp_enrolled();
    info!(enrolled, "TOTP second factor enabled");

    let state = AppState::new(codec, store, args.rate_limits, audit)
        .with_sessions(sessions)
        .with_second_factor(second_factor);

    api::new(args.port, Arc::new(state)).await
}
