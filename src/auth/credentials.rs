//! Credential lookup: the boundary between the gate and the user-record store.
//!
//! The store is an external collaborator behind [`CredentialStore`]. The gate only
//! talks to [`CredentialLookup`], which wraps every call in an explicit
//! `credentials.lookup` span and folds "absent" into a [`LookupError`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use dashmap::DashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, instrument, Span};
use utoipa::ToSchema;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl Role {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }
}

/// A user record as returned by the store.
///
/// `password_hash` is an argon2 PHC string. `totp_secret` is the base32 TOTP seed and
/// `backup_codes` hold base64url SHA-256 digests of single-use recovery codes. None of
/// them is ever logged.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    #[serde(alias = "username")]
    pub identity: String,
    pub user_id: i64,
    pub password_hash: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub mfa_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub totp_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backup_codes: Vec<String>,
}

impl fmt::Debug for UserRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserRecord")
            .field("identity", &self.identity)
            .field("user_id", &self.user_id)
            .field("password_hash", &"[REDACTED]")
            .field("role", &self.role)
            .field("mfa_enabled", &self.mfa_enabled)
            .field(
                "totp_secret",
                &self.totp_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("backup_codes", &self.backup_codes.len())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialStoreError {
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
}

/// External user-record store.
///
/// Implementations must be idempotent and side-effect free; the gate calls this on
/// every authenticated request.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_by_identity(
        &self,
        identity: &str,
    ) -> Result<Option<UserRecord>, CredentialStoreError>;
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("identity not found")]
    NotFound,
    #[error("credential lookup failed: {0}")]
    Store(String),
}

/// Process-local store, loaded once at startup.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    records: DashMap<String, UserRecord>,
}

impl InMemoryCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_records(records: impl IntoIterator<Item = UserRecord>) -> Self {
        let records = records
            .into_iter()
            .map(|record| (record.identity.clone(), record))
            .collect();
        Self { records }
    }

    /// Load a JSON array of user records.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or if an identity repeats.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read users file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid users file {}", path.display()))
    }

    /// # Errors
    /// Returns an error if the JSON is not an array of user records or an identity repeats.
    pub fn from_json(raw: &str) -> Result<Self> {
        let records: Vec<UserRecord> =
            serde_json::from_str(raw).context("failed to parse user records")?;

        let by_identity = DashMap::with_capacity(records.len());
        for record in records {
            if record.identity.trim().is_empty() {
                anyhow::bail!("user record with empty identity");
            }
            if by_identity.contains_key(&record.identity) {
                anyhow::bail!("duplicate user record: {}", record.identity);
            }
            by_identity.insert(record.identity.clone(), record);
        }

        Ok(Self {
            records: by_identity,
        })
    }

    /// Insert or replace a record. Returns the previous one, if any.
    pub fn insert(&self, record: UserRecord) -> Option<UserRecord> {
        self.records.insert(record.identity.clone(), record)
    }

    pub fn remove(&self, identity: &str) -> Option<UserRecord> {
        self.records.remove(identity).map(|(_, record)| record)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records with a TOTP secret.
    #[must_use]
    pub fn totp_enrolled(&self) -> usize {
        self.records
            .iter()
            .filter(|entry| entry.value().totp_secret.is_some())
            .count()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn find_by_identity(
        &self,
        identity: &str,
    ) -> Result<Option<UserRecord>, CredentialStoreError> {
        Ok(self
            .records
            .get(identity)
            .map(|entry| entry.value().clone()))
    }
}

/// Instrumented adapter in front of a [`CredentialStore`].
#[derive(Clone)]
pub struct CredentialLookup {
    store: Arc<dyn CredentialStore>,
}

impl fmt::Debug for CredentialLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialLookup").finish_non_exhaustive()
    }
}

impl CredentialLookup {
    #[must_use]
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Resolve an identity to its record.
    ///
    /// # Errors
    /// [`LookupError::NotFound`] when the store has no record, [`LookupError::Store`] when
    /// the store itself fails.
    #[instrument(name = "credentials.lookup", skip(self), fields(found))]
    pub async fn find_by_identity(&self, identity: &str) -> Result<UserRecord, LookupError> {
        let result = match self.store.find_by_identity(identity).await {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(LookupError::NotFound),
            Err(err) => Err(LookupError::Store(err.to_string())),
        };
        Span::current().record("found", result.is_ok());
        debug!(found = result.is_ok(), "Credential lookup finished");
        result
    }
}
