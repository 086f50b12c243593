//! # Turnstile (token authentication and admission control)
//!
//! `turnstile` sits in front of business handlers and decides, for every inbound
//! request, *who* is calling and *whether* the call is admitted.
//!
//! ## Request pipeline
//!
//! transport -> [`auth::authenticate_request`] -> [`rate_limit::enforce_rate_limit`] -> handler
//!
//! - **Authentication Gate:** extracts the `Bearer` token, verifies it with the
//!   [`token::TokenCodec`], resolves the subject through the credential lookup adapter and
//!   attaches an [`auth::AuthContext`] to the request. Bad or missing tokens never abort the
//!   request; they produce `AuthContext::Anonymous`.
//! - **Rate Limiter:** keys a fixed-window bucket by the authenticated identity (or the
//!   client address) and the endpoint class. Denials short-circuit with `429` and a
//!   structured body; every limited response carries `X-RateLimit-*` headers.
//!
//! ## Tokens
//!
//! Three kinds share one signing secret: `access` (full authentication), `temp`
//! (mid-MFA, never accepted by the gate) and `refresh` (rotated through
//! [`auth::Sessions`]). Tokens are HMAC-SHA256 signed and verified in constant time.

pub mod api;
pub mod audit;
pub mod auth;
pub mod cli;
pub mod clock;
pub mod rate_limit;
pub mod token;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }
}
