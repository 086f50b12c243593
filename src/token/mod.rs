//! Signed bearer tokens: issuance and verification.
//!
//! Wire format: `ts1.<payload>.<mac>`
//!
//! - `payload` is the base64url (unpadded) JSON encoding of [`Claims`].
//! - `mac` is base64url HMAC-SHA256 over a length-prefixed encoding of the header
//!   and the raw payload bytes, keyed by the process-wide signing secret.
//!
//! Verification order is fixed: structure, MAC (constant-time), claims, expiry.
//! Claims are never parsed from a payload whose MAC has not been checked.

mod claims;
mod codec;
mod error;

pub use claims::{Claims, IssuedToken, TokenKind, VerifiedToken, CLAIM_REFRESH_ID, CLAIM_USER_ID};
pub use codec::{TokenCodec, TokenConfig, HEADER, MIN_SECRET_LEN};
pub use error::TokenError;
