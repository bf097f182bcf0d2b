//! Shared constants for Portcullis components.

/// Default Redis connection URL
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Default sidecar HTTP listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8787";

/// Consecutive failures before an identity is locked out
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Lockout duration in minutes
pub const DEFAULT_LOCKOUT_MINUTES: u64 = 10;

/// Failures after which a captcha challenge is required
pub const DEFAULT_CAPTCHA_AFTER_ATTEMPTS: u32 = 3;

/// Captcha challenge expiry (5 minutes)
pub const CAPTCHA_TTL_SECS: u64 = 300;

/// Upper bound on a single lockout notification delivery
pub const DEFAULT_NOTIFY_TIMEOUT_SECS: u64 = 5;

/// Site name used in notification subjects
pub const DEFAULT_SITE_NAME: &str = "Portcullis";

/// Canonical form every loopback address collapses to before hashing
pub const CANONICAL_LOOPBACK: &str = "127.0.0.1";

/// Redis key prefixes
pub mod redis_keys {
    /// Attempt record hash: portcullis:attempt:{identity_hash}
    pub const ATTEMPT_PREFIX: &str = "portcullis:attempt:";

    /// Set of every identity hash with a record
    pub const ATTEMPT_INDEX: &str = "portcullis:attempt:index";

    /// Captcha challenge: portcullis:captcha:{token}
    pub const CAPTCHA_PREFIX: &str = "portcullis:captcha:";
}

/// HTTP header names
pub mod headers {
    /// Client address set by some proxies
    pub const CLIENT_IP: &str = "Client-IP";

    /// Standard forwarding chain, client first
    pub const X_FORWARDED_FOR: &str = "X-Forwarded-For";
}
