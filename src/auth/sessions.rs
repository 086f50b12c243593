//! Refresh-token sessions.
//!
//! Flow Overview: login mints an access/refresh pair and stores a [`RefreshRecord`] keyed
//! by the refresh token's `rid` claim. Rotation revokes the presented record (pointing
//! it at its replacement) before the new pair is handed out, so a refresh token is
//! single use even under concurrent presentation. At most `max_active` records stay
//! active per identity; the oldest are revoked first.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use super::{CredentialLookup, LookupError};
use crate::audit::{AuditEvent, AuditSink, FailureReason};
use crate::clock::{duration_millis, Clock};
use crate::token::{IssuedToken, TokenCodec, TokenError, TokenKind, VerifiedToken};

pub const DEFAULT_MAX_ACTIVE: usize = 5;
/// Revoked records are kept this long for forensics before purge deletes them.
pub const REVOKED_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshRecord {
    pub refresh_id: String,
    pub identity: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub revoked_at: Option<i64>,
    pub replaced_by: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

impl RefreshRecord {
    #[must_use]
    pub fn is_active(&self, now_millis: i64) -> bool {
        self.revoked_at.is_none() && now_millis < self.expires_at
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("refresh token is not known")]
    UnknownToken,
    #[error("refresh token was revoked or expired")]
    Revoked,
    #[error("identity no longer exists")]
    UnknownIdentity,
    #[error("refresh store failed: {0}")]
    Store(String),
}

/// Persistence for refresh records. Timestamps are epoch milliseconds.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn insert(&self, record: RefreshRecord) -> Result<(), SessionError>;

    async fn find(&self, refresh_id: &str) -> Result<Option<RefreshRecord>, SessionError>;

    /// Active records for an identity, oldest first.
    async fn active_for_identity(
        &self,
        identity: &str,
        now_millis: i64,
    ) -> Result<Vec<RefreshRecord>, SessionError>;

    /// Revoke a record if it is still active. Returns `false` when it was not.
    async fn revoke(
        &self,
        refresh_id: &str,
        now_millis: i64,
        replaced_by: Option<String>,
    ) -> Result<bool, SessionError>;

    /// Delete expired records and records revoked before `revoked_before`.
    async fn purge(&self, now_millis: i64, revoked_before: i64) -> Result<usize, SessionError>;
}

#[derive(Debug, Default)]
pub struct InMemoryRefreshStore {
    records: DashMap<String, RefreshRecord>,
}

impl InMemoryRefreshStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl RefreshTokenStore for InMemoryRefreshStore {
    async fn insert(&self, record: RefreshRecord) -> Result<(), SessionError> {
        self.records.insert(record.refresh_id.clone(), record);
        Ok(())
    }

    async fn find(&self, refresh_id: &str) -> Result<Option<RefreshRecord>, SessionError> {
        Ok(self.records.get(refresh_id).map(|entry| entry.clone()))
    }

    async fn active_for_identity(
        &self,
        identity: &str,
        now_millis: i64,
    ) -> Result<Vec<RefreshRecord>, SessionError> {
        let mut active: Vec<RefreshRecord> = self
            .records
            .iter()
            .filter(|entry| entry.identity == identity && entry.is_active(now_millis))
            .map(|entry| entry.clone())
            .collect();
        active.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.refresh_id.cmp(&b.refresh_id))
        });
        Ok(active)
    }

    async fn revoke(
        &self,
        refresh_id: &str,
        now_millis: i64,
        replaced_by: Option<String>,
    ) -> Result<bool, SessionError> {
        // get_mut holds the shard lock, so check-and-revoke is atomic per record
        let Some(mut record) = self.records.get_mut(refresh_id) else {
            return Ok(false);
        };
        if !record.is_active(now_millis) {
            return Ok(false);
        }
        record.revoked_at = Some(now_millis);
        record.replaced_by = replaced_by;
        Ok(true)
    }

    async fn purge(&self, now_millis: i64, revoked_before: i64) -> Result<usize, SessionError> {
        let before = self.records.len();
        self.records.retain(|_, record| match record.revoked_at {
            Some(revoked_at) => revoked_at >= revoked_before,
            None => now_millis < record.expires_at,
        });
        Ok(before.saturating_sub(self.records.len()))
    }
}

/// Request metadata stored alongside a refresh record.
#[derive(Clone, Debug, Default)]
pub struct SessionMeta {
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
}

pub struct Sessions {
    codec: Arc<TokenCodec>,
    credentials: CredentialLookup,
    store: Arc<dyn RefreshTokenStore>,
    max_active: usize,
    audit: Arc<dyn AuditSink>,
}

impl fmt::Debug for Sessions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sessions")
            .field("max_active", &self.max_active)
            .finish_non_exhaustive()
    }
}

impl Sessions {
    #[must_use]
    pub fn new(
        codec: Arc<TokenCodec>,
        credentials: CredentialLookup,
        store: Arc<dyn RefreshTokenStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            codec,
            credentials,
            store,
            max_active: DEFAULT_MAX_ACTIVE,
            audit,
        }
    }

    #[must_use]
    pub fn with_max_active(mut self, max_active: usize) -> Self {
        self.max_active = max_active.max(1);
        self
    }

    #[must_use]
    pub fn max_active(&self) -> usize {
        self.max_active
    }

    fn now(&self) -> i64 {
        self.codec.clock().now_millis()
    }

    /// Mint an access/refresh pair for an identity that has fully authenticated.
    ///
    /// # Errors
    /// Returns an error if token issuance or the store fails.
    pub async fn issue(
        &self,
        identity: &str,
        meta: SessionMeta,
    ) -> Result<TokenPair, SessionError> {
        let (pair, refresh) = self.mint(identity)?;
        self.store_refresh(identity, &refresh, meta).await?;
        self.record_issued(identity);
        self.enforce_max_active(identity).await?;
        Ok(pair)
    }

    /// Exchange a refresh token for a new pair. The presented token stops working.
    ///
    /// Every rejection except store failures is recorded as an
    /// [`AuditEvent::AuthenticationFailed`].
    ///
    /// # Errors
    /// [`SessionError::Token`] for tokens failing verification, [`SessionError::UnknownToken`]
    /// or [`SessionError::Revoked`] for tokens without an active record, and
    /// [`SessionError::UnknownIdentity`] when the subject no longer exists.
    pub async fn rotate(&self, raw: &str, meta: SessionMeta) -> Result<TokenPair, SessionError> {
        let verified = match self.codec.verify_kind(raw, TokenKind::Refresh) {
            Ok(verified) => verified,
            Err(err) => {
                let err = SessionError::from(err);
                self.audit_rejection(None, &err, meta.client_ip.as_deref());
                return Err(err);
            }
        };

        let client_ip = meta.client_ip.clone();
        let result = self.rotate_verified(&verified, meta).await;
        if let Err(err) = &result {
            self.audit_rejection(Some(verified.identity()), err, client_ip.as_deref());
        }
        result
    }

    async fn rotate_verified(
        &self,
        verified: &VerifiedToken,
        meta: SessionMeta,
    ) -> Result<TokenPair, SessionError> {
        let refresh_id = verified.refresh_id().ok_or(TokenError::Malformed)?;
        let identity = verified.identity();

        let record = self
            .store
            .find(refresh_id)
            .await?
            .ok_or(SessionError::UnknownToken)?;
        if record.identity != identity {
            warn!(identity, "Refresh record belongs to another identity");
            return Err(SessionError::UnknownToken);
        }
        if !record.is_active(self.now()) {
            if record.replaced_by.is_some() {
                warn!(identity, "Rotated refresh token presented again");
            }
            return Err(SessionError::Revoked);
        }

        match self.credentials.find_by_identity(identity).await {
            Ok(_) => {}
            Err(LookupError::NotFound) => return Err(SessionError::UnknownIdentity),
            Err(LookupError::Store(message)) => return Err(SessionError::Store(message)),
        }

        let (pair, refresh) = self.mint(identity)?;
        let replacement = refresh.claims().refresh_id().map(str::to_string);
        // a concurrent rotation of the same record loses here
        let now = self.now();
        if !self.store.revoke(refresh_id, now, replacement).await? {
            warn!(identity, "Refresh token rotated concurrently");
            return Err(SessionError::Revoked);
        }
        self.store_refresh(identity, &refresh, meta).await?;
        self.record_issued(identity);
        self.enforce_max_active(identity).await?;

        self.audit.record(&AuditEvent::RefreshRotated {
            identity: identity.to_string(),
        });
        Ok(pair)
    }

    /// Revoke the record behind one refresh token. Revoking twice is not an error.
    ///
    /// # Errors
    /// Returns an error if the token fails verification or the store fails.
    pub async fn revoke(&self, raw: &str, meta: &SessionMeta) -> Result<(), SessionError> {
        let verified = match self.codec.verify_kind(raw, TokenKind::Refresh) {
            Ok(verified) => verified,
            Err(err) => {
                let err = SessionError::from(err);
                self.audit_rejection(None, &err, meta.client_ip.as_deref());
                return Err(err);
            }
        };
        let Some(refresh_id) = verified.refresh_id() else {
            let err = SessionError::from(TokenError::Malformed);
            self.audit_rejection(Some(verified.identity()), &err, meta.client_ip.as_deref());
            return Err(err);
        };

        if self.store.revoke(refresh_id, self.now(), None).await? {
            self.audit.record(&AuditEvent::RefreshRevoked {
                identity: verified.identity().to_string(),
                count: 1,
            });
        }
        Ok(())
    }

    /// Revoke every active refresh record of an identity.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn revoke_all(&self, identity: &str) -> Result<usize, SessionError> {
        let now = self.now();
        let mut revoked = 0;
        for record in self.store.active_for_identity(identity, now).await? {
            if self.store.revoke(&record.refresh_id, now, None).await? {
                revoked += 1;
            }
        }

        if revoked > 0 {
            self.audit.record(&AuditEvent::RefreshRevoked {
                identity: identity.to_string(),
                count: revoked,
            });
        }
        Ok(revoked)
    }

    /// Delete expired records and records revoked more than [`REVOKED_RETENTION`] ago.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn purge(&self) -> Result<usize, SessionError> {
        let now = self.now();
        let cutoff = now.saturating_sub(duration_millis(REVOKED_RETENTION));
        let removed = self.store.purge(now, cutoff).await?;
        if removed > 0 {
            info!(removed, "Purged refresh records");
        }
        Ok(removed)
    }

    fn mint(&self, identity: &str) -> Result<(TokenPair, IssuedToken), TokenError> {
        let access = self.codec.issue_access(identity)?;
        let refresh = self.codec.issue_refresh(identity)?;

        let pair = TokenPair {
            access_token: access.into_token(),
            refresh_token: refresh.token().to_string(),
            token_type: "Bearer".to_string(),
            expires_in: self.codec.config().access_ttl().as_secs(),
        };
        Ok((pair, refresh))
    }

    /// Record both halves of a pair once its refresh record is stored.
    fn record_issued(&self, identity: &str) {
        for kind in [TokenKind::Access, TokenKind::Refresh] {
            self.audit.record(&AuditEvent::TokenIssued {
                identity: identity.to_string(),
                kind,
            });
        }
    }

    fn audit_rejection(
        &self,
        identity: Option<&str>,
        err: &SessionError,
        client_ip: Option<&str>,
    ) {
        let reason = match err {
            SessionError::Token(token_err) => FailureReason::from(token_err),
            SessionError::UnknownToken | SessionError::Revoked => FailureReason::Revoked,
            SessionError::UnknownIdentity => FailureReason::IdentityNotFound,
            SessionError::Store(_) => return,
        };
        self.audit.record(&AuditEvent::AuthenticationFailed {
            identity: identity.map(str::to_string),
            reason,
            client_ip: client_ip.map(str::to_string),
        });
    }

    async fn store_refresh(
        &self,
        identity: &str,
        refresh: &IssuedToken,
        meta: SessionMeta,
    ) -> Result<(), SessionError> {
        let refresh_id = refresh
            .claims()
            .refresh_id()
            .ok_or(TokenError::Malformed)?
            .to_string();

        self.store
            .insert(RefreshRecord {
                refresh_id,
                identity: identity.to_string(),
                created_at: refresh.claims().iat,
                expires_at: refresh.expires_at_millis(),
                revoked_at: None,
                replaced_by: None,
                client_ip: meta.client_ip,
                user_agent: meta.user_agent,
            })
            .await
    }

    async fn enforce_max_active(&self, identity: &str) -> Result<(), SessionError> {
        let now = self.now();
        let active = self.store.active_for_identity(identity, now).await?;
        let excess = active.len().saturating_sub(self.max_active);
        for record in active.iter().take(excess) {
            self.store.revoke(&record.refresh_id, now, None).await?;
        }
        if excess > 0 {
            debug!(identity, excess, "Revoked oldest refresh tokens");
        }
        Ok(())
    }
}
