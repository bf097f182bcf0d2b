//! Per-identity lockout state machine over an [`AttemptStore`].
//!
//! Lockout expiry is lazy: nothing sweeps expired locks, the first read that
//! observes one resets the record. "Locked" is therefore only authoritative
//! as of the most recent read.

use chrono::{DateTime, Utc};
use portcullis_common::{AttemptRecord, IdentityHash, Result};
use portcullis_common::constants::{DEFAULT_NOTIFY_TIMEOUT_SECS, DEFAULT_SITE_NAME};
use std::sync::Arc;
use std::time::Duration;

use crate::config::PolicyConfig;
use crate::notify::{self, LockoutNotice, Notifier};
use crate::store::AttemptStore;

/// Lock status of one identity at evaluation time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locked {
        until: DateTime<Utc>,
        retry_after_minutes: u64,
    },
}

impl LockState {
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }
}

/// Attempt tracking service
pub struct AttemptTracker {
    store: Arc<dyn AttemptStore>,
    notifier: Arc<dyn Notifier>,
    policy: PolicyConfig,
    site_name: String,
    notify_timeout: Duration,
}

impl AttemptTracker {
    pub fn new(
        store: Arc<dyn AttemptStore>,
        notifier: Arc<dyn Notifier>,
        policy: PolicyConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            policy,
            site_name: DEFAULT_SITE_NAME.to_string(),
            notify_timeout: Duration::from_secs(DEFAULT_NOTIFY_TIMEOUT_SECS),
        }
    }

    pub fn with_site_name(mut self, site_name: impl Into<String>) -> Self {
        self.site_name = site_name.into();
        self
    }

    pub fn with_notify_timeout(mut self, timeout: Duration) -> Self {
        self.notify_timeout = timeout;
        self
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// Raw record, no expiry handling
    pub async fn record(&self, identity: &IdentityHash) -> Result<Option<AttemptRecord>> {
        self.store.get(identity).await
    }

    /// Current lock status; resets the record if its lock has run out
    pub async fn lock_state(&self, identity: &IdentityHash) -> Result<LockState> {
        let Some(record) = self.store.get(identity).await? else {
            return Ok(LockState::Unlocked);
        };

        let now = Utc::now();
        if !record.lock_expired_at(now) {
            return Ok(Self::state_of(&record, now));
        }

        if self.store.reset_if_expired(identity, now).await? {
            tracing::info!(identity = %identity, "Lockout expired, record reset");
            return Ok(LockState::Unlocked);
        }

        // A concurrent failure renewed the lock between the read and the reset
        Ok(self
            .store
            .get(identity)
            .await?
            .map(|r| Self::state_of(&r, now))
            .unwrap_or(LockState::Unlocked))
    }

    fn state_of(record: &AttemptRecord, now: DateTime<Utc>) -> LockState {
        match record.locked_until {
            Some(until) if until > now => LockState::Locked {
                until,
                retry_after_minutes: record.remaining_lockout_minutes(now),
            },
            _ => LockState::Unlocked,
        }
    }

    pub async fn is_locked(&self, identity: &IdentityHash) -> Result<bool> {
        Ok(self.lock_state(identity).await?.is_locked())
    }

    /// Minutes left on the lockout, rounded up; 0 if not locked
    pub async fn remaining_lockout_minutes(&self, identity: &IdentityHash) -> Result<u64> {
        Ok(self
            .store
            .get(identity)
            .await?
            .map(|r| r.remaining_lockout_minutes(Utc::now()))
            .unwrap_or(0))
    }

    /// Failures left before lockout; `max_attempts` for unseen identities
    pub async fn remaining_attempts(&self, identity: &IdentityHash) -> Result<u32> {
        Ok(self
            .store
            .get(identity)
            .await?
            .map(|r| r.remaining_attempts(self.policy.max_attempts))
            .unwrap_or(self.policy.max_attempts))
    }

    /// Record a failed login. The only place a lockout is entered.
    ///
    /// The threshold is checked against the post-increment count returned by
    /// the store, so concurrent failures cannot both observe the same count.
    pub async fn record_failure(&self, identity: &IdentityHash) -> Result<AttemptRecord> {
        let now = Utc::now();
        let mut record = self.store.upsert_increment(identity, now).await?;

        if record.attempts >= self.policy.max_attempts {
            let until = now + self.policy.lockout_duration();
            self.store.set_lock(identity, until).await?;
            record.locked_until = Some(until);

            tracing::warn!(
                identity = %identity,
                attempts = record.attempts,
                locked_until = %until,
                "Identity locked out due to failed attempts"
            );

            // Exactly one failure observes the crossing count
            if record.attempts == self.policy.max_attempts {
                self.notify_lockout(record.attempts);
            }
        } else {
            tracing::debug!(
                identity = %identity,
                attempts = record.attempts,
                "Failed login recorded"
            );
        }

        Ok(record)
    }

    /// Reset after a successful login. No-op for unseen identities.
    pub async fn record_success(&self, identity: &IdentityHash) -> Result<()> {
        self.store.reset(identity).await?;
        tracing::debug!(identity = %identity, "Attempts reset after successful login");
        Ok(())
    }

    /// All records, most recent first. Lock status is as of their last read.
    pub async fn records(&self) -> Result<Vec<AttemptRecord>> {
        self.store.list_all().await
    }

    /// Drop an identity's record entirely
    pub async fn forget(&self, identity: &IdentityHash) -> Result<bool> {
        let removed = self.store.delete(identity).await?;
        if removed {
            tracing::info!(identity = %identity, "Attempt record deleted");
        }
        Ok(removed)
    }

    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }

    fn notify_lockout(&self, attempts: u32) {
        let Some(address) = self.policy.notify_address() else {
            return;
        };

        let notice = LockoutNotice::new(
            address,
            &self.site_name,
            attempts,
            self.policy.lockout_minutes,
        );
        notify::dispatch(self.notifier.clone(), notice, self.notify_timeout);
    }
}
