//! Storage seams for attempt records and captcha challenges.
//!
//! Both traits require atomicity from the backend: `upsert_increment`
//! serializes concurrent failures for one identity, and `take` guarantees a
//! challenge is consumed at most once. Multi-process hosts must use a shared
//! backend (Redis); the memory backend only covers a single process.

mod memory;
mod redis;

pub use memory::{MemoryChallengeCache, MemoryRecordStore};
pub use redis::RedisStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use portcullis_common::{AttemptRecord, IdentityHash, Result};
use std::time::Duration;

/// Durable per-identity attempt state
#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Fetch the record for an identity, if any
    async fn get(&self, identity: &IdentityHash) -> Result<Option<AttemptRecord>>;

    /// Atomically insert (attempts = 1) or increment, returning the
    /// post-increment record
    async fn upsert_increment(
        &self,
        identity: &IdentityHash,
        now: DateTime<Utc>,
    ) -> Result<AttemptRecord>;

    /// Zero the attempt count and clear any lock. Never creates a record.
    async fn reset(&self, identity: &IdentityHash) -> Result<()>;

    /// Reset only if the record's lock ran out at or before `now`. Returns
    /// false (and leaves the record alone) when it is unlocked, absent, or
    /// was re-locked since it was read.
    async fn reset_if_expired(&self, identity: &IdentityHash, now: DateTime<Utc>) -> Result<bool>;

    /// Set the lock expiry. Returns false if no record exists.
    async fn set_lock(&self, identity: &IdentityHash, locked_until: DateTime<Utc>) -> Result<bool>;

    /// Every record, most recent failure first
    async fn list_all(&self) -> Result<Vec<AttemptRecord>>;

    /// Remove a record. Returns false if none existed.
    async fn delete(&self, identity: &IdentityHash) -> Result<bool>;

    /// Connectivity check for readiness
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Expiring key-value store for short-lived challenge state
#[async_trait]
pub trait ChallengeCache: Send + Sync {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Atomic get-and-delete. Expired entries are never returned.
    async fn take(&self, key: &str) -> Result<Option<String>>;
}

/// Most recent failure first
fn sort_by_recency(records: &mut [AttemptRecord]) {
    records.sort_by(|a, b| b.last_attempt_at.cmp(&a.last_attempt_at));
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use portcullis_common::PortcullisError;

    /// Record store whose every call fails as if the server were down
    pub struct UnavailableStore;

    fn down<T>() -> Result<T> {
        Err(PortcullisError::Store("connection refused".into()))
    }

    #[async_trait]
    impl AttemptStore for UnavailableStore {
        async fn get(&self, _: &IdentityHash) -> Result<Option<AttemptRecord>> {
            down()
        }

        async fn upsert_increment(&self, _: &IdentityHash, _: DateTime<Utc>) -> Result<AttemptRecord> {
            down()
        }

        async fn reset(&self, _: &IdentityHash) -> Result<()> {
            down()
        }

        async fn reset_if_expired(&self, _: &IdentityHash, _: DateTime<Utc>) -> Result<bool> {
            down()
        }

        async fn set_lock(&self, _: &IdentityHash, _: DateTime<Utc>) -> Result<bool> {
            down()
        }

        async fn list_all(&self) -> Result<Vec<AttemptRecord>> {
            down()
        }

        async fn delete(&self, _: &IdentityHash) -> Result<bool> {
            down()
        }

        async fn ping(&self) -> Result<()> {
            down()
        }
    }
}
