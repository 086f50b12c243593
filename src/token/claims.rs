use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Extra claim carrying the pending user's numeric id on temp tokens.
pub const CLAIM_USER_ID: &str = "userId";
/// Extra claim carrying the opaque value that links a refresh token to its record.
pub const CLAIM_REFRESH_ID: &str = "rid";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// Full authentication, accepted on business endpoints.
    Access,
    /// Partial authentication while a multi-factor login is pending.
    Temp,
    /// Long-lived credential exchanged for new access tokens.
    Refresh,
}

impl TokenKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Temp => "temp",
            Self::Refresh => "refresh",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signed token payload. `iat` and `exp` are epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub kind: TokenKind,
    pub jti: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ext: BTreeMap<String, Value>,
}

impl Claims {
    #[must_use]
    pub fn user_id(&self) -> Option<i64> {
        self.ext.get(CLAIM_USER_ID).and_then(Value::as_i64)
    }

    #[must_use]
    pub fn refresh_id(&self) -> Option<&str> {
        self.ext.get(CLAIM_REFRESH_ID).and_then(Value::as_str)
    }
}

/// A freshly signed token and the claims it carries.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    token: String,
    claims: Claims,
}

impl IssuedToken {
    pub(super) fn new(token: String, claims: Claims) -> Self {
        Self { token, claims }
    }

    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    #[must_use]
    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    #[must_use]
    pub fn expires_at_millis(&self) -> i64 {
        self.claims.exp
    }

    #[must_use]
    pub fn into_token(self) -> String {
        self.token
    }
}

/// Claims whose signature and expiry have already been checked.
///
/// Only [`super::TokenCodec`] builds this type, so holding one is proof of
/// verification; reading claims from it never repeats the MAC check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    claims: Claims,
}

impl VerifiedToken {
    pub(super) fn new(claims: Claims) -> Self {
        Self { claims }
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.claims.sub
    }

    #[must_use]
    pub fn kind(&self) -> TokenKind {
        self.claims.kind
    }

    #[must_use]
    pub fn issued_at_millis(&self) -> i64 {
        self.claims.iat
    }

    #[must_use]
    pub fn expires_at_millis(&self) -> i64 {
        self.claims.exp
    }

    #[must_use]
    pub fn token_id(&self) -> &str {
        &self.claims.jti
    }

    #[must_use]
    pub fn claim(&self, key: &str) -> Option<&Value> {
        self.claims.ext.get(key)
    }

    #[must_use]
    pub fn user_id(&self) -> Option<i64> {
        self.claims.user_id()
    }

    #[must_use]
    pub fn refresh_id(&self) -> Option<&str> {
        self.claims.refresh_id()
    }

    #[must_use]
    pub fn claims(&self) -> &Claims {
        &self.claims
    }
}
