//! Authentication: credential lookup, the per-request gate, and refresh sessions.

mod credentials;
mod gate;
mod principal;
mod second_factor;
mod sessions;

pub use credentials::{
    CredentialLookup, CredentialStore, CredentialStoreError, InMemoryCredentialStore, LookupError,
    Role, UserRecord,
};
pub use gate::{authenticate_request, bearer_token, AuthGate};
pub use principal::{AuthContext, Principal, RequireAuth, Unauthorized};
pub use second_factor::{backup_code_digest, SecondFactor, TotpSecondFactor};
pub use sessions::{
    InMemoryRefreshStore, RefreshRecord, RefreshTokenStore, SessionError, SessionMeta, Sessions,
    TokenPair, DEFAULT_MAX_ACTIVE, REVOKED_RETENTION,
};
