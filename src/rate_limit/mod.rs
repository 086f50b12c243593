//! Per-key fixed-window admission control.
//!
//! Requests are keyed by the authenticated identity when the gate resolved one,
//! otherwise by client address, and bucketed per [`EndpointClass`].

mod bucket;
mod client_ip;
mod middleware;
mod policy;

pub use bucket::{BucketKey, BucketStore, RateLimitDecision};
pub use client_ip::{client_address, UNKNOWN_ADDRESS};
pub use middleware::{
    enforce_rate_limit, RateLimitDenied, RATE_LIMIT_EXCEEDED, X_RATELIMIT_LIMIT,
    X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use policy::{is_exempt, EndpointClass, RateLimitConfig, RateLimitPolicy};

use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::audit::{AuditEvent, AuditSink};
use crate::clock::Clock;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RateLimitSubject {
    User(String),
    Address(String),
}

impl RateLimitSubject {
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::User(identity) => format!("user:{identity}"),
            Self::Address(address) => format!("ip:{address}"),
        }
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    store: BucketStore,
    audit: Arc<dyn AuditSink>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            config,
            store: BucketStore::new(clock),
            audit,
        }
    }

    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &BucketStore {
        &self.store
    }

    /// Consume quota for one request. `None` when limiting is disabled.
    pub fn check(
        &self,
        subject: &RateLimitSubject,
        class: EndpointClass,
    ) -> Option<RateLimitDecision> {
        if !self.config.enabled() {
            return None;
        }

        let policy = self.config.policy(class);
        let key = BucketKey::new(subject.key(), class);
        let decision = self.store.check(key, policy);

        if !decision.allowed {
            debug!(
                key = %subject.key(),
                endpoint = class.as_str(),
                limit = decision.limit,
                "Rate limit exceeded"
            );
            self.audit.record(&AuditEvent::RateLimitExceeded {
                key: subject.key(),
                endpoint: class,
                limit: decision.limit,
            });
        }

        Some(decision)
    }

    /// Drop buckets whose window has ended.
    pub fn purge_expired(&self) -> usize {
        self.store.purge_expired()
    }
}
