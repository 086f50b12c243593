//! Second-factor check used to promote a temp token to a full session.
//!
//! [`TotpSecondFactor`] accepts a 6-digit TOTP code (SHA-1, 30 s step, one step of
//! skew) derived from the user's `totp_secret`, or one of the user's 8-character
//! backup codes. A backup code works once per process.

use async_trait::async_trait;
use base64ct::{Base64UrlUnpadded, Encoding};
use dashmap::DashSet;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::{debug, info, warn};

use super::UserRecord;
use crate::clock::Clock;

const TOTP_DIGITS: usize = 6;
const TOTP_SKEW: u8 = 1;
const TOTP_STEP: u64 = 30;
const BACKUP_CODE_LEN: usize = 8;

#[async_trait]
pub trait SecondFactor: Send + Sync {
    /// Returns `true` when `code` is valid for the user.
    async fn verify(&self, user: &UserRecord, code: &str) -> bool;
}

/// Digest stored in [`UserRecord::backup_codes`] for a plaintext backup code.
#[must_use]
pub fn backup_code_digest(code: &str) -> String {
    Base64UrlUnpadded::encode_string(&Sha256::digest(code.trim().to_ascii_uppercase()))
}

pub struct TotpSecondFactor {
    clock: Arc<dyn Clock>,
    used_backup_codes: DashSet<(String, String)>,
}

impl fmt::Debug for TotpSecondFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TotpSecondFactor")
            .field("used_backup_codes", &self.used_backup_codes.len())
            .finish_non_exhaustive()
    }
}

impl TotpSecondFactor {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            used_backup_codes: DashSet::new(),
        }
    }

    fn verify_totp(&self, user: &UserRecord, code: &str) -> bool {
        let Some(secret) = user.totp_secret.as_deref() else {
            debug!(identity = user.identity, "No TOTP secret enrolled");
            return false;
        };

        let totp = match totp_for(secret) {
            Ok(totp) => totp,
            Err(err) => {
                warn!(identity = user.identity, "Unusable TOTP secret: {err}");
                return false;
            }
        };

        let now_secs = u64::try_from(self.clock.now_millis() / 1000).unwrap_or(0);
        totp.check(code, now_secs)
    }

    fn use_backup_code(&self, user: &UserRecord, code: &str) -> bool {
        let digest = backup_code_digest(code);
        if !user.backup_codes.iter().any(|stored| *stored == digest) {
            return false;
        }
        // insert is atomic per set shard, so only one caller can spend a code
        let fresh = self
            .used_backup_codes
            .insert((user.identity.clone(), digest));
        if fresh {
            info!(identity = user.identity, "Backup code used");
        } else {
            warn!(identity = user.identity, "Backup code presented again");
        }
        fresh
    }
}

fn totp_for(secret: &str) -> anyhow::Result<TOTP> {
    let bytes = Secret::Encoded(secret.to_string())
        .to_bytes()
        .map_err(|e| anyhow::anyhow!("invalid base32 secret: {e:?}"))?;
    TOTP::new(
        Algorithm::SHA1,
        TOTP_DIGITS,
        TOTP_SKEW,
        TOTP_STEP,
        bytes,
        Some(env!("CARGO_PKG_NAME").to_string()),
        "user".to_string(),
    )
    .map_err(|e| anyhow::anyhow!("TOTP init error: {e}"))
}

#[async_trait]
impl SecondFactor for TotpSecondFactor {
    async fn verify(&self, user: &UserRecord, code: &str) -> bool {
        let code = code.trim();
        if code.len() == TOTP_DIGITS && code.bytes().all(|b| b.is_ascii_digit()) {
            return self.verify_totp(user, code);
        }
        if code.len() == BACKUP_CODE_LEN && code.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return self.use_backup_code(user, code);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::clock::ManualClock;

    const SECRET: &str = "JBSWY3DPEHPK3PXPJBSWY3DPEHPK3PXP";
    const T0: i64 = 1_700_000_000_000;

    fn user(totp_secret: Option<&str>, backup_codes: &[&str]) -> UserRecord {
        UserRecord {
            identity: "user2".to_string(),
            user_id: 42,
            password_hash: String::new(),
            role: Role::User,
            mfa_enabled: true,
            totp_secret: totp_secret.map(str::to_string),
            backup_codes: backup_codes.iter().map(|c| backup_code_digest(c)).collect(),
        }
    }

    fn code_at(millis: i64) -> String {
        match totp_for(SECRET) {
            Ok(totp) => totp.generate(u64::try_from(millis / 1000).unwrap_or(0)),
            Err(err) => panic!("totp: {err}"),
        }
    }

    #[tokio::test]
    async fn accepts_current_totp_code() {
        let factor = TotpSecondFactor::new(Arc::new(ManualClock::new(T0)));
        assert!(factor.verify(&user(Some(SECRET), &[]), &code_at(T0)).await);
    }

    #[tokio::test]
    async fn tolerates_one_step_of_skew_only() {
        let clock = Arc::new(ManualClock::new(T0));
        let factor = TotpSecondFactor::new(clock.clone());
        let record = user(Some(SECRET), &[]);
        let code = code_at(T0);

        clock.advance(std::time::Duration::from_secs(TOTP_STEP));
        assert!(factor.verify(&record, &code).await);

        clock.advance(std::time::Duration::from_secs(3 * TOTP_STEP));
        assert!(!factor.verify(&record, &code).await);
    }

    #[tokio::test]
    async fn rejects_without_enrolled_secret() {
        let factor = TotpSecondFactor::new(Arc::new(ManualClock::new(T0)));
        assert!(!factor.verify(&user(None, &[]), &code_at(T0)).await);
        let unusable = user(Some("not base32!"), &[]);
        assert!(!factor.verify(&unusable, "123456").await);
    }

    #[tokio::test]
    async fn backup_code_is_single_use() {
        let factor = TotpSecondFactor::new(Arc::new(ManualClock::new(T0)));
        let record = user(None, &["AB12CD34"]);

        assert!(factor.verify(&record, "ab12cd34").await);
        assert!(!factor.verify(&record, "AB12CD34").await);
        assert!(!factor.verify(&record, "ZZ99ZZ99").await);
    }

    #[tokio::test]
    async fn rejects_malformed_codes() {
        let factor = TotpSecondFactor::new(Arc::new(ManualClock::new(T0)));
        let record = user(Some(SECRET), &["AB12CD34"]);
        assert!(!factor.verify(&record, "").await);
        assert!(!factor.verify(&record, "12345").await);
        assert!(!factor.verify(&record, "AB12-CD3").await);
    }
}
