use base64ct::{Base64UrlUnpadded, Encoding};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretSlice, SecretString};
use serde_json::Value;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use ulid::Ulid;

use super::{
    Claims, IssuedToken, TokenError, TokenKind, VerifiedToken, CLAIM_REFRESH_ID, CLAIM_USER_ID,
};
use crate::clock::{duration_millis, Clock};

type HmacSha256 = Hmac<Sha256>;

pub const HEADER: &str = "ts1.";
/// HS256 keys shorter than the digest size weaken the MAC.
pub const MIN_SECRET_LEN: usize = 32;

const DEFAULT_ACCESS_TTL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_TEMP_TTL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const REFRESH_ID_BYTES: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenConfig {
    access_ttl: Duration,
    temp_ttl: Duration,
    refresh_ttl: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            access_ttl: DEFAULT_ACCESS_TTL,
            temp_ttl: DEFAULT_TEMP_TTL,
            refresh_ttl: DEFAULT_REFRESH_TTL,
        }
    }
}

impl TokenConfig {
    #[must_use]
    pub fn with_access_ttl(mut self, ttl: Duration) -> Self {
        self.access_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_temp_ttl(mut self, ttl: Duration) -> Self {
        self.temp_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_ttl = ttl;
        self
    }

    #[must_use]
    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    #[must_use]
    pub fn temp_ttl(&self) -> Duration {
        self.temp_ttl
    }

    #[must_use]
    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }
}

/// Issues and verifies tokens with a single signing key fixed at construction.
#[derive(Debug)]
pub struct TokenCodec {
    key: SecretSlice<u8>,
    config: TokenConfig,
    clock: Arc<dyn Clock>,
}

impl TokenCodec {
    /// Build a codec around the process signing secret.
    ///
    /// # Errors
    /// Returns [`TokenError::WeakSecret`] if the secret is shorter than [`MIN_SECRET_LEN`] bytes.
    pub fn new(
        secret: &SecretString,
        config: TokenConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TokenError> {
        let bytes = secret.expose_secret().as_bytes();
        if bytes.len() < MIN_SECRET_LEN {
            return Err(TokenError::WeakSecret {
                min: MIN_SECRET_LEN,
            });
        }

        Ok(Self {
            key: SecretSlice::from(bytes.to_vec()),
            config,
            clock,
        })
    }

    #[must_use]
    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Sign a token for `identity` valid for `ttl` from now.
    ///
    /// # Errors
    /// Returns an error if the identity is blank, the ttl rounds to zero milliseconds,
    /// or the claims cannot be encoded.
    pub fn issue(
        &self,
        identity: &str,
        kind: TokenKind,
        ttl: Duration,
        extra: BTreeMap<String, Value>,
    ) -> Result<IssuedToken, TokenError> {
        if identity.trim().is_empty() {
            return Err(TokenError::InvalidSubject);
        }

        let ttl_millis = duration_millis(ttl);
        if ttl_millis <= 0 {
            return Err(TokenError::InvalidTtl);
        }

        let iat = self.clock.now_millis();
        let exp = iat.checked_add(ttl_millis).ok_or(TokenError::InvalidTtl)?;
        let claims = Claims {
            sub: identity.to_string(),
            iat,
            exp,
            kind,
            jti: Ulid::new().to_string(),
            ext: extra,
        };

        let payload = serde_json::to_vec(&claims).map_err(|_| TokenError::Encoding)?;
        let signature = self.mac(&payload)?.finalize().into_bytes();
        let token = format!(
            "{HEADER}{}.{}",
            Base64UrlUnpadded::encode_string(&payload),
            Base64UrlUnpadded::encode_string(&signature)
        );

        debug!(identity, kind = %kind, expires_at = exp, "Issued token");

        Ok(IssuedToken::new(token, claims))
    }

    /// # Errors
    /// See [`TokenCodec::issue`].
    pub fn issue_access(&self, identity: &str) -> Result<IssuedToken, TokenError> {
        self.issue(
            identity,
            TokenKind::Access,
            self.config.access_ttl,
            BTreeMap::new(),
        )
    }

    /// Temp tokens carry the pending user's numeric id for the MFA step.
    ///
    /// # Errors
    /// See [`TokenCodec::issue`].
    pub fn issue_temp(&self, identity: &str, user_id: i64) -> Result<IssuedToken, TokenError> {
        let mut extra = BTreeMap::new();
        extra.insert(CLAIM_USER_ID.to_string(), Value::from(user_id));
        self.issue(identity, TokenKind::Temp, self.config.temp_ttl, extra)
    }

    /// Refresh tokens carry a random value naming their persisted record.
    ///
    /// # Errors
    /// Returns [`TokenError::Entropy`] if the OS random source fails, or see [`TokenCodec::issue`].
    pub fn issue_refresh(&self, identity: &str) -> Result<IssuedToken, TokenError> {
        let mut bytes = [0u8; REFRESH_ID_BYTES];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|_| TokenError::Entropy)?;

        let mut extra = BTreeMap::new();
        extra.insert(
            CLAIM_REFRESH_ID.to_string(),
            Value::from(Base64UrlUnpadded::encode_string(&bytes)),
        );
        self.issue(identity, TokenKind::Refresh, self.config.refresh_ttl, extra)
    }

    /// Check structure, signature and expiry of a raw token.
    ///
    /// # Errors
    /// Returns [`TokenError::Malformed`], [`TokenError::Signature`] or [`TokenError::Expired`].
    pub fn verify(&self, raw: &str) -> Result<VerifiedToken, TokenError> {
        let body = raw.strip_prefix(HEADER).ok_or(TokenError::Malformed)?;
        let (payload_b64, signature_b64) = body.split_once('.').ok_or(TokenError::Malformed)?;

        let payload =
            Base64UrlUnpadded::decode_vec(payload_b64).map_err(|_| TokenError::Malformed)?;
        let signature =
            Base64UrlUnpadded::decode_vec(signature_b64).map_err(|_| TokenError::Malformed)?;

        // verify_slice compares in constant time
        self.mac(&payload)?
            .verify_slice(&signature)
            .map_err(|_| TokenError::Signature)?;

        let claims: Claims = serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;
        if claims.sub.is_empty() || claims.exp <= claims.iat {
            return Err(TokenError::Malformed);
        }

        if self.clock.now_millis() >= claims.exp {
            return Err(TokenError::Expired);
        }

        Ok(VerifiedToken::new(claims))
    }

    /// Verify and additionally require a specific token kind.
    ///
    /// # Errors
    /// Returns any [`TokenCodec::verify`] error, or [`TokenError::WrongKind`].
    pub fn verify_kind(&self, raw: &str, expected: TokenKind) -> Result<VerifiedToken, TokenError> {
        let token = self.verify(raw)?;
        if token.kind() != expected {
            return Err(TokenError::WrongKind {
                expected,
                actual: token.kind(),
            });
        }
        Ok(token)
    }

    /// Read one extra claim for a caller that holds only the raw token.
    ///
    /// Callers that already hold a [`VerifiedToken`] should use [`VerifiedToken::claim`].
    ///
    /// # Errors
    /// Returns any [`TokenCodec::verify`] error.
    pub fn extract_claim(&self, raw: &str, key: &str) -> Result<Option<Value>, TokenError> {
        Ok(self.verify(raw)?.claim(key).cloned())
    }

    fn mac(&self, payload: &[u8]) -> Result<HmacSha256, TokenError> {
        let mut mac = HmacSha256::new_from_slice(self.key.expose_secret()).map_err(|_| {
            TokenError::WeakSecret {
                min: MIN_SECRET_LEN,
            }
        })?;
        mac.update(&pae(&[HEADER.as_bytes(), payload])?);
        Ok(mac)
    }
}

/// Length-prefixed encoding so header and payload boundaries cannot be shifted.
fn pae(pieces: &[&[u8]]) -> Result<Vec<u8>, TokenError> {
    let count = u64::try_from(pieces.len()).map_err(|_| TokenError::Malformed)?;
    let mut out = Vec::new();
    out.extend_from_slice(&count.to_le_bytes());
    for piece in pieces {
        let len = u64::try_from(piece.len()).map_err(|_| TokenError::Malformed)?;
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(piece);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    const SECRET_A: &str = "0123456789abcdef0123456789abcdef-secret-a";
    const SECRET_B: &str = "0123456789abcdef0123456789abcdef-secret-b";
    const T0: i64 = 1_700_000_000_000;

    fn codec_with(secret: &str, clock: Arc<ManualClock>) -> TokenCodec {
        match TokenCodec::new(
            &SecretString::from(secret.to_string()),
            TokenConfig::default(),
            clock,
        ) {
            Ok(codec) => codec,
            Err(err) => panic!("codec construction failed: {err}"),
        }
    }

    fn codec() -> (TokenCodec, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        (codec_with(SECRET_A, clock.clone()), clock)
    }

    #[test]
    fn rejects_short_secret() {
        let result = TokenCodec::new(
            &SecretString::from("short".to_string()),
            TokenConfig::default(),
            Arc::new(ManualClock::new(T0)),
        );
        assert_eq!(
            result.err(),
            Some(TokenError::WeakSecret {
                min: MIN_SECRET_LEN
            })
        );
    }

    #[test]
    fn access_token_round_trip() -> Result<(), TokenError> {
        let (codec, _clock) = codec();
        for identity in ["user1", "alice@example.com", "ünïcødé"] {
            let issued = codec.issue(
                identity,
                TokenKind::Access,
                Duration::from_secs(3600),
                BTreeMap::new(),
            )?;
            assert!(issued.token().starts_with(HEADER));
            let verified = codec.verify(issued.token())?;
            assert_eq!(verified.identity(), identity);
            assert_eq!(verified.kind(), TokenKind::Access);
            assert_eq!(verified.issued_at_millis(), T0);
            assert_eq!(verified.expires_at_millis(), T0 + 3_600_000);
        }
        Ok(())
    }

    #[test]
    fn expiry_boundary() -> Result<(), TokenError> {
        let (codec, clock) = codec();
        let issued = codec.issue(
            "user1",
            TokenKind::Access,
            Duration::from_secs(60),
            BTreeMap::new(),
        )?;

        clock.set_millis(T0 + 59_999);
        assert!(codec.verify(issued.token()).is_ok());

        clock.set_millis(T0 + 60_000);
        assert_eq!(codec.verify(issued.token()), Err(TokenError::Expired));

        clock.set_millis(T0 + 3_600_000);
        assert_eq!(codec.verify(issued.token()), Err(TokenError::Expired));
        Ok(())
    }

    #[test]
    fn token_from_other_secret_is_rejected() -> Result<(), TokenError> {
        let clock = Arc::new(ManualClock::new(T0));
        let codec_a = codec_with(SECRET_A, clock.clone());
        let codec_b = codec_with(SECRET_B, clock);

        let issued = codec_a.issue_access("user1")?;
        assert_eq!(codec_b.verify(issued.token()), Err(TokenError::Signature));
        Ok(())
    }

    #[test]
    fn tampered_payload_is_rejected() -> Result<(), TokenError> {
        let (codec, _clock) = codec();
        let issued = codec.issue_access("user1")?;

        let forged_claims = Claims {
            sub: "admin".to_string(),
            ..issued.claims().clone()
        };
        let forged_payload = serde_json::to_vec(&forged_claims).map_err(|_| TokenError::Encoding)?;
        let signature = issued
            .token()
            .rsplit_once('.')
            .map(|(_, sig)| sig.to_string())
            .unwrap_or_default();
        let forged = format!(
            "{HEADER}{}.{signature}",
            Base64UrlUnpadded::encode_string(&forged_payload)
        );

        assert_eq!(codec.verify(&forged), Err(TokenError::Signature));
        Ok(())
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let (codec, _clock) = codec();
        for raw in [
            "",
            "ts1.",
            "ts1.onlyonepart",
            "v4.public.abc.def",
            "ts1.!!!.abc",
            "ts1.abc.def.ghi",
            "invalid.token.here",
        ] {
            assert_eq!(codec.verify(raw), Err(TokenError::Malformed), "{raw}");
        }
    }

    #[test]
    fn temp_token_fails_access_kind_check() -> Result<(), TokenError> {
        let (codec, _clock) = codec();
        let issued = codec.issue_temp("user2", 42)?;

        assert!(codec.verify(issued.token()).is_ok());
        assert_eq!(
            codec.verify_kind(issued.token(), TokenKind::Access),
            Err(TokenError::WrongKind {
                expected: TokenKind::Access,
                actual: TokenKind::Temp,
            })
        );

        let temp = codec.verify_kind(issued.token(), TokenKind::Temp)?;
        assert_eq!(temp.user_id(), Some(42));
        assert_eq!(temp.identity(), "user2");
        Ok(())
    }

    #[test]
    fn access_token_fails_temp_kind_check() -> Result<(), TokenError> {
        let (codec, _clock) = codec();
        let issued = codec.issue_access("user1")?;
        assert!(matches!(
            codec.verify_kind(issued.token(), TokenKind::Temp),
            Err(TokenError::WrongKind { .. })
        ));
        Ok(())
    }

    #[test]
    fn rapid_reissue_produces_distinct_tokens() -> Result<(), TokenError> {
        let (codec, _clock) = codec();
        // frozen clock: same identity, same millisecond
        let first = codec.issue_access("user1")?;
        let second = codec.issue_access("user1")?;
        assert_ne!(first.token(), second.token());
        Ok(())
    }

    #[test]
    fn refresh_token_carries_random_id() -> Result<(), TokenError> {
        let (codec, _clock) = codec();
        let first = codec.verify(codec.issue_refresh("user1")?.token())?;
        let second = codec.verify(codec.issue_refresh("user1")?.token())?;

        assert_eq!(first.kind(), TokenKind::Refresh);
        let first_id = first.refresh_id().map(ToString::to_string);
        assert!(first_id.is_some());
        assert_ne!(first_id.as_deref(), second.refresh_id());
        assert_eq!(
            first.expires_at_millis() - first.issued_at_millis(),
            7 * 24 * 60 * 60 * 1000
        );
        Ok(())
    }

    #[test]
    fn extract_claim_verifies_first() -> Result<(), TokenError> {
        let (codec, clock) = codec();
        let issued = codec.issue_temp("user2", 42)?;

        assert_eq!(
            codec.extract_claim(issued.token(), CLAIM_USER_ID)?,
            Some(json!(42))
        );
        assert_eq!(codec.extract_claim(issued.token(), "nope")?, None);

        clock.advance(Duration::from_secs(301));
        assert_eq!(
            codec.extract_claim(issued.token(), CLAIM_USER_ID),
            Err(TokenError::Expired)
        );
        Ok(())
    }

    #[test]
    fn issue_rejects_zero_ttl_and_blank_identity() {
        let (codec, _clock) = codec();
        assert_eq!(
            codec
                .issue("user1", TokenKind::Access, Duration::ZERO, BTreeMap::new())
                .err(),
            Some(TokenError::InvalidTtl)
        );
        assert_eq!(codec.issue_access(" ").err(), Some(TokenError::InvalidSubject));
    }

    #[test]
    fn config_defaults_and_overrides() {
        let config = TokenConfig::default();
        assert_eq!(config.access_ttl(), DEFAULT_ACCESS_TTL);
        assert_eq!(config.temp_ttl(), Duration::from_secs(300));
        assert_eq!(config.refresh_ttl(), DEFAULT_REFRESH_TTL);

        let config = config
            .with_access_ttl(Duration::from_secs(10))
            .with_temp_ttl(Duration::from_secs(20))
            .with_refresh_ttl(Duration::from_secs(30));
        assert_eq!(config.access_ttl(), Duration::from_secs(10));
        assert_eq!(config.temp_ttl(), Duration::from_secs(20));
        assert_eq!(config.refresh_ttl(), Duration::from_secs(30));
    }

    #[test]
    fn pae_prefixes_lengths() -> Result<(), TokenError> {
        let encoded = pae(&[b"ab", b""])?;
        assert_eq!(encoded.len(), 8 + 8 + 2 + 8);
        assert_eq!(&encoded[..8], &2u64.to_le_bytes());
        Ok(())
    }
}
