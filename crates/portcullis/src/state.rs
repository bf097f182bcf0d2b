//! Application state and shared resources.

use anyhow::{Context, Result};
use portcullis_common::IdentityHash;
use std::sync::Arc;

use crate::config::{AppConfig, StoreBackend};
use crate::gate::PolicyGate;
use crate::identity::IdentityHasher;
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::store::{
    AttemptStore, ChallengeCache, MemoryChallengeCache, MemoryRecordStore, RedisStore,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: AppConfig,

    /// Lockout and captcha decisions
    pub gate: Arc<PolicyGate>,

    /// Raw address to identity hash
    pub hasher: Arc<IdentityHasher>,
}

impl AppState {
    /// Build state from configuration, connecting to Redis if selected
    pub async fn new(config: AppConfig) -> Result<Self> {
        let (store, cache): (Arc<dyn AttemptStore>, Arc<dyn ChallengeCache>) = match config.backend
        {
            StoreBackend::Redis => {
                let redis = Arc::new(
                    RedisStore::connect(&config.redis_url)
                        .await
                        .context("Failed to connect to Redis")?,
                );
                tracing::info!(url = %config.redis_url, "Redis connected");
                (redis.clone(), redis)
            }
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory store (single process only, lost on restart)");
                (
                    Arc::new(MemoryRecordStore::new()),
                    Arc::new(MemoryChallengeCache::new()),
                )
            }
        };

        let notifier: Arc<dyn Notifier> = match config.notifier.webhook_url {
            Some(ref url) => Arc::new(
                WebhookNotifier::new(url.clone(), config.notifier.timeout())
                    .context("Failed to build webhook notifier")?,
            ),
            None => Arc::new(LogNotifier),
        };

        let hasher = match config.hash_secret.as_deref().filter(|s| !s.is_empty()) {
            Some(secret) => IdentityHasher::new(secret),
            None => IdentityHasher::ephemeral(),
        };

        let gate = PolicyGate::from_config(&config, store, cache, notifier);
        Ok(Self::from_parts(config, gate, hasher))
    }

    pub fn from_parts(config: AppConfig, gate: PolicyGate, hasher: IdentityHasher) -> Self {
        Self {
            config,
            gate: Arc::new(gate),
            hasher: Arc::new(hasher),
        }
    }

    pub fn identity(&self, raw_ip: &str) -> IdentityHash {
        self.hasher.hash(raw_ip)
    }
}
