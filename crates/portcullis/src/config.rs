//! Configuration management for Portcullis.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use portcullis_common::PortcullisError;
use portcullis_common::constants::{
    CAPTCHA_TTL_SECS, DEFAULT_CAPTCHA_AFTER_ATTEMPTS, DEFAULT_LISTEN_ADDR,
    DEFAULT_LOCKOUT_MINUTES, DEFAULT_MAX_ATTEMPTS, DEFAULT_NOTIFY_TIMEOUT_SECS, DEFAULT_REDIS_URL,
    DEFAULT_SITE_NAME,
};

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Redis connection URL (used by the redis backend)
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Where attempt records and challenges live
    #[serde(default)]
    pub backend: StoreBackend,

    /// Installation secret mixed into identity hashes (random if unset)
    #[serde(default)]
    pub hash_secret: Option<String>,

    /// Behaviour when the record store is unreachable
    #[serde(default)]
    pub fail_mode: FailMode,

    /// Trust Client-IP / X-Forwarded-For when resolving the caller
    #[serde(default)]
    pub trust_proxy_headers: bool,

    /// Site name used in notification subjects
    #[serde(default = "default_site_name")]
    pub site_name: String,

    /// Lockout and challenge policy
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Captcha configuration
    #[serde(default)]
    pub captcha: CaptchaConfig,

    /// Lockout notification delivery
    #[serde(default)]
    pub notifier: NotifierConfig,
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Single process only
    #[default]
    Memory,
    /// Shared across processes
    Redis,
}

/// What the gate does when the record store cannot be reached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Log and let the attempt proceed to credential verification
    #[default]
    Open,
    /// Refuse the attempt
    Closed,
}

/// Lockout policy, read-only per decision
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PolicyConfig {
    /// Consecutive failures that trigger a lockout
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Lockout length in minutes
    #[serde(default = "default_lockout_minutes")]
    pub lockout_minutes: u64,

    /// Failures after which a captcha is required
    #[serde(default = "default_captcha_after")]
    pub captcha_after_attempts: u32,

    #[serde(default = "default_true")]
    pub captcha_enabled: bool,

    /// Administrator address for lockout notices
    #[serde(default)]
    pub notify_address: Option<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            lockout_minutes: default_lockout_minutes(),
            captcha_after_attempts: default_captcha_after(),
            captcha_enabled: true,
            notify_address: None,
        }
    }
}

impl PolicyConfig {
    pub fn lockout_duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.lockout_minutes.min(i64::MAX as u64 / 60_000) as i64)
    }

    /// Notification target, if one is configured and non-blank
    pub fn notify_address(&self) -> Option<&str> {
        self.notify_address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
    }

    pub fn validate(&self) -> portcullis_common::Result<()> {
        if self.max_attempts == 0 {
            return Err(PortcullisError::Config("policy.max_attempts must be at least 1".into()));
        }
        if self.lockout_minutes == 0 {
            return Err(PortcullisError::Config("policy.lockout_minutes must be at least 1".into()));
        }
        if self.captcha_after_attempts == 0 {
            return Err(PortcullisError::Config(
                "policy.captcha_after_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Captcha-specific configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CaptchaConfig {
    /// Challenge validity in seconds
    #[serde(default = "default_challenge_ttl")]
    pub challenge_ttl_secs: u64,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            challenge_ttl_secs: default_challenge_ttl(),
        }
    }
}

impl CaptchaConfig {
    pub fn challenge_ttl(&self) -> Duration {
        Duration::from_secs(self.challenge_ttl_secs)
    }
}

/// Notification delivery configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    /// Mail relay webhook; notices are only logged when unset
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Upper bound on one delivery
    #[serde(default = "default_notify_timeout")]
    pub timeout_secs: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_notify_timeout(),
        }
    }
}

impl NotifierConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Values supplied on the command line, applied last
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub redis_url: Option<String>,
    pub listen_addr: Option<String>,
}

// Default value functions
fn default_redis_url() -> String { DEFAULT_REDIS_URL.to_string() }
fn default_listen_addr() -> String { DEFAULT_LISTEN_ADDR.to_string() }
fn default_site_name() -> String { DEFAULT_SITE_NAME.to_string() }
fn default_max_attempts() -> u32 { DEFAULT_MAX_ATTEMPTS }
fn default_lockout_minutes() -> u64 { DEFAULT_LOCKOUT_MINUTES }
fn default_captcha_after() -> u32 { DEFAULT_CAPTCHA_AFTER_ATTEMPTS }
fn default_true() -> bool { true }
fn default_challenge_ttl() -> u64 { CAPTCHA_TTL_SECS } // 5 minutes
fn default_notify_timeout() -> u64 { DEFAULT_NOTIFY_TIMEOUT_SECS }

impl AppConfig {
    /// Load configuration from file and `PORTCULLIS__*` env vars, with CLI overrides
    pub fn load(config_path: &str, overrides: &CliOverrides) -> Result<Self> {
        let mut builder = config::Config::builder();

        if Path::new(config_path).exists() {
            builder = builder.add_source(config::File::with_name(config_path));
        } else {
            tracing::warn!(path = %config_path, "Config file not found, using defaults");
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("PORTCULLIS")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .context("Failed to load config")?;

        let mut config: AppConfig = settings
            .try_deserialize()
            .context("Failed to parse config")?;

        // Apply CLI overrides
        if let Some(ref redis_url) = overrides.redis_url {
            config.redis_url = redis_url.clone();
        }
        if let Some(ref listen) = overrides.listen_addr {
            config.listen_addr = listen.clone();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> portcullis_common::Result<()> {
        self.policy.validate()?;
        if self.captcha.challenge_ttl_secs == 0 {
            return Err(PortcullisError::Config(
                "captcha.challenge_ttl_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            redis_url: default_redis_url(),
            backend: StoreBackend::default(),
            hash_secret: None,
            fail_mode: FailMode::default(),
            trust_proxy_headers: false,
            site_name: default_site_name(),
            policy: PolicyConfig::default(),
            captcha: CaptchaConfig::default(),
            notifier: NotifierConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_policy() {
        let config = AppConfig::default();
        assert_eq!(config.policy.max_attempts, 5);
        assert_eq!(config.policy.lockout_minutes, 10);
        assert_eq!(config.policy.captcha_after_attempts, 3);
        assert!(config.policy.captcha_enabled);
        assert_eq!(config.captcha.challenge_ttl_secs, 300);
        assert_eq!(config.fail_mode, FailMode::Open);
        assert_eq!(config.backend, StoreBackend::Memory);
        assert!(!config.trust_proxy_headers);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_values_rejected() {
        let policy = PolicyConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(matches!(policy.validate(), Err(PortcullisError::Config(_))));

        let policy = PolicyConfig {
            lockout_minutes: 0,
            ..Default::default()
        };
        assert!(policy.validate().is_err());

        let policy = PolicyConfig {
            captcha_after_attempts: 0,
            ..Default::default()
        };
        assert!(policy.validate().is_err());

        let mut config = AppConfig::default();
        config.captcha.challenge_ttl_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_blank_notify_address_is_unset() {
        let mut policy = PolicyConfig::default();
        assert_eq!(policy.notify_address(), None);

        policy.notify_address = Some("   ".to_string());
        assert_eq!(policy.notify_address(), None);

        policy.notify_address = Some(" admin@example.com ".to_string());
        assert_eq!(policy.notify_address(), Some("admin@example.com"));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(
                r#"
                backend = "redis"
                fail_mode = "closed"

                [policy]
                max_attempts = 3
                notify_address = "ops@example.com"
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let config: AppConfig = settings.try_deserialize().unwrap();

        assert_eq!(config.backend, StoreBackend::Redis);
        assert_eq!(config.fail_mode, FailMode::Closed);
        assert_eq!(config.policy.max_attempts, 3);
        assert_eq!(config.policy.lockout_minutes, 10);
        assert_eq!(config.policy.notify_address(), Some("ops@example.com"));
        assert_eq!(config.listen_addr, DEFAULT_LISTEN_ADDR);
    }

    #[test]
    fn test_lockout_duration() {
        let policy = PolicyConfig {
            lockout_minutes: 15,
            ..Default::default()
        };
        assert_eq!(policy.lockout_duration(), chrono::Duration::minutes(15));
    }
}
