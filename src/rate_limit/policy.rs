//! Endpoint classes and their quotas.

use std::time::Duration;

const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_MFA_WINDOW: Duration = Duration::from_secs(300);

/// Paths that never pass through the limiter.
const EXEMPT_PATHS: [&str; 2] = ["/health", "/openapi.json"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    /// Password login and registration.
    Auth,
    /// Second-factor steps.
    Mfa,
    /// Versioned business endpoints.
    Api,
    General,
}

impl EndpointClass {
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        if path.starts_with("/v1/auth/login") || path.starts_with("/v1/auth/register") {
            Self::Auth
        } else if path.starts_with("/v1/auth/mfa/") {
            Self::Mfa
        } else if path.starts_with("/v1/") {
            Self::Api
        } else {
            Self::General
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Mfa => "mfa",
            Self::Api => "api",
            Self::General => "general",
        }
    }
}

#[must_use]
pub fn is_exempt(path: &str) -> bool {
    EXEMPT_PATHS.contains(&path)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub limit: u32,
    pub window: Duration,
}

impl RateLimitPolicy {
    #[must_use]
    pub const fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    enabled: bool,
    general: RateLimitPolicy,
    auth: RateLimitPolicy,
    api: RateLimitPolicy,
    mfa: RateLimitPolicy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            general: RateLimitPolicy::new(100, DEFAULT_WINDOW),
            auth: RateLimitPolicy::new(5, DEFAULT_WINDOW),
            api: RateLimitPolicy::new(1000, DEFAULT_WINDOW),
            mfa: RateLimitPolicy::new(5, DEFAULT_MFA_WINDOW),
        }
    }
}

impl RateLimitConfig {
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, class: EndpointClass, policy: RateLimitPolicy) -> Self {
        match class {
            EndpointClass::Auth => self.auth = policy,
            EndpointClass::Mfa => self.mfa = policy,
            EndpointClass::Api => self.api = policy,
            EndpointClass::General => self.general = policy,
        }
        self
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn policy(&self, class: EndpointClass) -> RateLimitPolicy {
        match class {
            EndpointClass::Auth => self.auth,
            EndpointClass::Mfa => self.mfa,
            EndpointClass::Api => self.api,
            EndpointClass::General => self.general,
        }
    }
}
