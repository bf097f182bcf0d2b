//! In-process backends.
//!
//! Entries are sharded, so work on one identity only locks that identity's
//! shard for the duration of a single map operation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use portcullis_common::{AttemptRecord, IdentityHash, PortcullisError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::{AttemptStore, ChallengeCache, sort_by_recency};

/// Attempt records held in memory
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: DashMap<IdentityHash, AttemptRecord>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with records (imports, fixtures)
    pub fn with_records(records: impl IntoIterator<Item = AttemptRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.records.insert(record.identity_hash.clone(), record);
        }
        store
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl AttemptStore for MemoryRecordStore {
    async fn get(&self, identity: &IdentityHash) -> Result<Option<AttemptRecord>> {
        Ok(self.records.get(identity).map(|r| r.value().clone()))
    }

    async fn upsert_increment(
        &self,
        identity: &IdentityHash,
        now: DateTime<Utc>,
    ) -> Result<AttemptRecord> {
        // The entry guard holds the shard lock across read-modify-write
        let record = match self.records.entry(identity.clone()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if record.attempts == 0 {
                    record.first_attempt_at = now;
                }
                record.attempts = record.attempts.saturating_add(1);
                record.last_attempt_at = now;
                record.clone()
            }
            Entry::Vacant(entry) => entry
                .insert(AttemptRecord::first_failure(identity.clone(), now))
                .clone(),
        };

        Ok(record)
    }

    async fn reset(&self, identity: &IdentityHash) -> Result<()> {
        if let Some(mut record) = self.records.get_mut(identity) {
            record.attempts = 0;
            record.locked_until = None;
        }
        Ok(())
    }

    async fn reset_if_expired(&self, identity: &IdentityHash, now: DateTime<Utc>) -> Result<bool> {
        // Checked and cleared under the same shard guard
        let Some(mut record) = self.records.get_mut(identity) else {
            return Ok(false);
        };
        if !record.lock_expired_at(now) {
            return Ok(false);
        }
        record.attempts = 0;
        record.locked_until = None;
        Ok(true)
    }

    async fn set_lock(&self, identity: &IdentityHash, locked_until: DateTime<Utc>) -> Result<bool> {
        match self.records.get_mut(identity) {
            Some(mut record) => {
                record.locked_until = Some(locked_until);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_all(&self) -> Result<Vec<AttemptRecord>> {
        let mut records: Vec<AttemptRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        sort_by_recency(&mut records);
        Ok(records)
    }

    async fn delete(&self, identity: &IdentityHash) -> Result<bool> {
        Ok(self.records.remove(identity).is_some())
    }
}

/// Expired entries are swept once every this many puts
const PURGE_EVERY: u64 = 256;

/// Live challenges held at most; further puts fail until a sweep frees room
const DEFAULT_CAPACITY: usize = 65_536;

#[derive(Debug, Clone)]
struct CachedValue {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Expiring challenge cache held in memory
#[derive(Debug)]
pub struct MemoryChallengeCache {
    entries: DashMap<String, CachedValue>,
    capacity: usize,
    puts: AtomicU64,
}

impl Default for MemoryChallengeCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl MemoryChallengeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            puts: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn purge_expired(&self, now: DateTime<Utc>) {
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    /// Small caches sweep more often so a full cache can drain
    fn purge_interval(&self) -> u64 {
        (self.capacity as u64).min(PURGE_EVERY)
    }
}

#[async_trait]
impl ChallengeCache for MemoryChallengeCache {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let now = Utc::now();
        let n = self.puts.fetch_add(1, Ordering::Relaxed);
        if n % self.purge_interval() == 0 {
            self.purge_expired(now);
        }

        if self.entries.len() >= self.capacity {
            return Err(PortcullisError::Store(format!(
                "challenge cache full ({} entries)",
                self.capacity
            )));
        }

        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.entries
            .insert(key.to_string(), CachedValue { value, expires_at });
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<Option<String>> {
        // remove() is the single atomic step; a racing caller sees None
        let Some((_, entry)) = self.entries.remove(key) else {
            return Ok(None);
        };

        if entry.expires_at <= Utc::now() {
            return Ok(None);
        }

        Ok(Some(entry.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn id(s: &str) -> IdentityHash {
        IdentityHash::from_digest(s)
    }

    #[tokio::test]
    async fn test_upsert_creates_then_increments() {
        let store = MemoryRecordStore::new();
        let now = Utc::now();

        let first = store.upsert_increment(&id("a"), now).await.unwrap();
        assert_eq!(first.attempts, 1);
        assert_eq!(first.first_attempt_at, now);

        let later = now + ChronoDuration::seconds(5);
        let second = store.upsert_increment(&id("a"), later).await.unwrap();
        assert_eq!(second.attempts, 2);
        assert_eq!(second.first_attempt_at, now);
        assert_eq!(second.last_attempt_at, later);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_increment_after_reset_starts_new_streak() {
        let store = MemoryRecordStore::new();
        let now = Utc::now();
        store.upsert_increment(&id("a"), now).await.unwrap();
        store.reset(&id("a")).await.unwrap();

        let later = now + ChronoDuration::minutes(30);
        let record = store.upsert_increment(&id("a"), later).await.unwrap();
        assert_eq!(record.attempts, 1);
        assert_eq!(record.first_attempt_at, later);
    }

    #[tokio::test]
    async fn test_reset_and_lock_never_create() {
        let store = MemoryRecordStore::new();
        store.reset(&id("ghost")).await.unwrap();
        let locked = store.set_lock(&id("ghost"), Utc::now()).await.unwrap();

        assert!(!locked);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_reset_clears_lock() {
        let store = MemoryRecordStore::new();
        let now = Utc::now();
        store.upsert_increment(&id("a"), now).await.unwrap();
        assert!(store
            .set_lock(&id("a"), now + ChronoDuration::minutes(10))
            .await
            .unwrap());

        store.reset(&id("a")).await.unwrap();
        let record = store.get(&id("a")).await.unwrap().unwrap();
        assert_eq!(record.attempts, 0);
        assert_eq!(record.locked_until, None);
    }

    #[tokio::test]
    async fn test_reset_if_expired_spares_live_lock() {
        let store = MemoryRecordStore::new();
        let now = Utc::now();
        assert!(!store.reset_if_expired(&id("ghost"), now).await.unwrap());

        store.upsert_increment(&id("a"), now).await.unwrap();
        assert!(!store.reset_if_expired(&id("a"), now).await.unwrap());

        // Lock was renewed by a failure after the caller saw it expire
        let until = now + ChronoDuration::minutes(10);
        store.set_lock(&id("a"), until).await.unwrap();
        assert!(!store.reset_if_expired(&id("a"), now).await.unwrap());
        let record = store.get(&id("a")).await.unwrap().unwrap();
        assert_eq!(record.attempts, 1);
        assert_eq!(record.locked_until, Some(until));

        let after = until + ChronoDuration::seconds(1);
        assert!(store.reset_if_expired(&id("a"), after).await.unwrap());
        let record = store.get(&id("a")).await.unwrap().unwrap();
        assert_eq!(record.attempts, 0);
        assert_eq!(record.locked_until, None);
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let store = MemoryRecordStore::new();
        let now = Utc::now();
        store.upsert_increment(&id("old"), now).await.unwrap();
        store
            .upsert_increment(&id("new"), now + ChronoDuration::seconds(1))
            .await
            .unwrap();

        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].identity_hash, id("new"));

        assert!(store.delete(&id("old")).await.unwrap());
        assert!(!store.delete(&id("old")).await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let store = std::sync::Arc::new(MemoryRecordStore::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.upsert_increment(&id("busy"), Utc::now()).await.unwrap()
            }));
        }

        let mut counts = Vec::new();
        for handle in handles {
            counts.push(handle.await.unwrap().attempts);
        }
        counts.sort_unstable();
        assert_eq!(counts, (1..=32).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_take_is_single_use() {
        let cache = MemoryChallengeCache::new();
        cache
            .put("tok", "9".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(cache.take("tok").await.unwrap().as_deref(), Some("9"));
        assert_eq!(cache.take("tok").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_take_skips_expired() {
        let cache = MemoryChallengeCache::new();
        cache
            .put("tok", "9".to_string(), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(cache.take("tok").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_full_cache_rejects_until_sweep() {
        let cache = MemoryChallengeCache::with_capacity(2);
        let ttl = Duration::from_secs(60);
        cache.put("a", "1".to_string(), ttl).await.unwrap();
        cache.put("b", "2".to_string(), ttl).await.unwrap();

        let err = cache.put("c", "3".to_string(), ttl).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(cache.len(), 2);

        cache.take("a").await.unwrap();
        cache.put("c", "3".to_string(), ttl).await.unwrap();
        assert_eq!(cache.take("c").await.unwrap().as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_expired_entries_swept_periodically() {
        let cache = MemoryChallengeCache::with_capacity(2);
        // puts #0 and #1: both expire immediately
        cache.put("a", "1".to_string(), Duration::ZERO).await.unwrap();
        cache.put("b", "2".to_string(), Duration::ZERO).await.unwrap();
        assert_eq!(cache.len(), 2);

        // put #2 lands on the sweep interval and frees both slots
        cache
            .put("c", "3".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.len(), 1);
    }
}
