//! Redis backend, shared across every process of a host.
//!
//! Each identity is one hash at `portcullis:attempt:{hash}` with fields
//! `attempts`, `first_attempt_at`, `last_attempt_at` and (when locked)
//! `locked_until`, all unix seconds. Mutations run as Lua scripts so the
//! read-modify-write happens server-side in one step. Captcha entries use
//! `SET EX` and `GETDEL` (Redis 6.2+).

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use portcullis_common::constants::redis_keys::{ATTEMPT_INDEX, ATTEMPT_PREFIX, CAPTCHA_PREFIX};
use portcullis_common::{AttemptRecord, IdentityHash, PortcullisError, Result};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::time::Duration;

use super::{AttemptStore, ChallengeCache, sort_by_recency};

/// KEYS[1] record, KEYS[2] index; ARGV[1] now, ARGV[2] identity hash
const INCREMENT_SCRIPT: &str = r#"
local n = redis.call('HINCRBY', KEYS[1], 'attempts', 1)
if n == 1 then
  redis.call('HSET', KEYS[1], 'first_attempt_at', ARGV[1])
end
redis.call('HSET', KEYS[1], 'last_attempt_at', ARGV[1])
redis.call('SADD', KEYS[2], ARGV[2])
return redis.call('HGETALL', KEYS[1])
"#;

/// KEYS[1] record
const RESET_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  redis.call('HSET', KEYS[1], 'attempts', 0)
  redis.call('HDEL', KEYS[1], 'locked_until')
  return 1
end
return 0
"#;

/// KEYS[1] record; ARGV[1] now
const RESET_IF_EXPIRED_SCRIPT: &str = r#"
local until = redis.call('HGET', KEYS[1], 'locked_until')
if until and tonumber(until) <= tonumber(ARGV[1]) then
  redis.call('HSET', KEYS[1], 'attempts', 0)
  redis.call('HDEL', KEYS[1], 'locked_until')
  return 1
end
return 0
"#;

/// KEYS[1] record; ARGV[1] locked_until
const SET_LOCK_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  redis.call('HSET', KEYS[1], 'locked_until', ARGV[1])
  return 1
end
return 0
"#;

/// Redis-backed record store and challenge cache
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    increment: Script,
    reset: Script,
    reset_if_expired: Script,
    set_lock: Script,
}

impl RedisStore {
    /// Connect with an auto-reconnecting connection manager
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(store_err)?;
        let conn = ConnectionManager::new(client).await.map_err(store_err)?;
        Ok(Self::new(conn))
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            increment: Script::new(INCREMENT_SCRIPT),
            reset: Script::new(RESET_SCRIPT),
            reset_if_expired: Script::new(RESET_IF_EXPIRED_SCRIPT),
            set_lock: Script::new(SET_LOCK_SCRIPT),
        }
    }
}

fn store_err(err: redis::RedisError) -> PortcullisError {
    PortcullisError::Store(err.to_string())
}

fn record_key(identity: &IdentityHash) -> String {
    format!("{}{}", ATTEMPT_PREFIX, identity)
}

fn captcha_key(token: &str) -> String {
    format!("{}{}", CAPTCHA_PREFIX, token)
}

fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>> {
    let secs: i64 = raw
        .parse()
        .map_err(|_| PortcullisError::Store(format!("corrupt {} value {:?}", field, raw)))?;
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| PortcullisError::Store(format!("{} out of range: {}", field, secs)))
}

/// Rebuild a record from its hash fields; an empty hash means no record
fn record_from_fields(
    identity: &IdentityHash,
    fields: &HashMap<String, String>,
) -> Result<Option<AttemptRecord>> {
    if fields.is_empty() {
        return Ok(None);
    }

    let required = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| PortcullisError::Store(format!("record missing field {}", name)))
    };

    let attempts = required("attempts")?
        .parse::<u32>()
        .map_err(|_| PortcullisError::Store("corrupt attempts value".to_string()))?;
    let first_attempt_at = parse_timestamp("first_attempt_at", required("first_attempt_at")?)?;
    let last_attempt_at = parse_timestamp("last_attempt_at", required("last_attempt_at")?)?;
    let locked_until = fields
        .get("locked_until")
        .map(|raw| parse_timestamp("locked_until", raw))
        .transpose()?;

    Ok(Some(AttemptRecord {
        identity_hash: identity.clone(),
        attempts,
        first_attempt_at,
        last_attempt_at,
        locked_until,
    }))
}

#[async_trait]
impl AttemptStore for RedisStore {
    async fn get(&self, identity: &IdentityHash) -> Result<Option<AttemptRecord>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> =
            conn.hgetall(record_key(identity)).await.map_err(store_err)?;
        record_from_fields(identity, &fields)
    }

    async fn upsert_increment(
        &self,
        identity: &IdentityHash,
        now: DateTime<Utc>,
    ) -> Result<AttemptRecord> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = self
            .increment
            .key(record_key(identity))
            .key(ATTEMPT_INDEX)
            .arg(now.timestamp())
            .arg(identity.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        record_from_fields(identity, &fields)?
            .ok_or_else(|| PortcullisError::Store("increment returned no record".to_string()))
    }

    async fn reset(&self, identity: &IdentityHash) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i32 = self
            .reset
            .key(record_key(identity))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn reset_if_expired(&self, identity: &IdentityHash, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn.clone();
        let cleared: i32 = self
            .reset_if_expired
            .key(record_key(identity))
            .arg(now.timestamp())
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(cleared == 1)
    }

    async fn set_lock(&self, identity: &IdentityHash, locked_until: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn.clone();
        let updated: i32 = self
            .set_lock
            .key(record_key(identity))
            .arg(locked_until.timestamp())
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(updated == 1)
    }

    async fn list_all(&self) -> Result<Vec<AttemptRecord>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(ATTEMPT_INDEX).await.map_err(store_err)?;
        if members.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for member in &members {
            pipe.hgetall(format!("{}{}", ATTEMPT_PREFIX, member));
        }
        let rows: Vec<HashMap<String, String>> =
            pipe.query_async(&mut conn).await.map_err(store_err)?;

        let mut records = Vec::with_capacity(rows.len());
        for (member, fields) in members.iter().zip(rows.iter()) {
            let identity = IdentityHash::from_digest(member.as_str());
            match record_from_fields(&identity, fields) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(identity = %identity, error = %e, "Skipping unreadable attempt record");
                }
            }
        }

        sort_by_recency(&mut records);
        Ok(records)
    }

    async fn delete(&self, identity: &IdentityHash) -> Result<bool> {
        let mut conn = self.conn.clone();
        let (removed, _): (i32, i32) = redis::pipe()
            .atomic()
            .del(record_key(identity))
            .srem(ATTEMPT_INDEX, identity.as_str())
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(removed > 0)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

#[async_trait]
impl ChallengeCache for RedisStore {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(captcha_key(key), value, ttl.as_secs().max(1))
            .await
            .map_err(store_err)
    }

    async fn take(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GETDEL")
            .arg(captcha_key(key))
            .query_async(&mut conn)
            .await
            .map_err(store_err)
    }
}
