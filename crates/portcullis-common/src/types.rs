//! Core types shared across Portcullis components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Salted, one-way digest of a client identity (hex SHA-256).
///
/// Raw addresses never leave the hasher; everything downstream keys on this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityHash(String);

impl IdentityHash {
    /// Wrap an already-computed digest (e.g. one read back from a store)
    pub fn from_digest(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-identity failed login state.
///
/// Invariants kept by the tracker:
/// - `attempts == 0` implies `locked_until` is `None`
/// - `locked_until`, when set, is after `first_attempt_at`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Store key
    pub identity_hash: IdentityHash,

    /// Consecutive failures since the last reset
    pub attempts: u32,

    /// Start of the current failure streak
    pub first_attempt_at: DateTime<Utc>,

    /// Most recent failure
    pub last_attempt_at: DateTime<Utc>,

    /// Lockout end, if a lockout was entered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<DateTime<Utc>>,
}

impl AttemptRecord {
    /// Record for the first failure of a never-seen identity
    pub fn first_failure(identity_hash: IdentityHash, now: DateTime<Utc>) -> Self {
        Self {
            identity_hash,
            attempts: 1,
            first_attempt_at: now,
            last_attempt_at: now,
            locked_until: None,
        }
    }

    /// Locked iff `locked_until` is set and still in the future
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }

    /// True when a lockout was entered but has since run out
    pub fn lock_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until <= now)
    }

    /// Whole minutes left on the lockout, rounded up; 0 when not locked
    pub fn remaining_lockout_minutes(&self, now: DateTime<Utc>) -> u64 {
        match self.locked_until {
            Some(until) if until > now => {
                let millis = (until - now).num_milliseconds().max(0) as u64;
                millis.div_ceil(60_000)
            }
            _ => 0,
        }
    }

    /// Failures left before lockout, floored at zero
    pub fn remaining_attempts(&self, max_attempts: u32) -> u32 {
        max_attempts.saturating_sub(self.attempts)
    }
}

/// Why a login attempt was refused outright
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    /// Too many consecutive failures
    Lockout,
    /// The record store could not be reached and the gate fails closed
    StoreUnavailable,
}

/// Why a captcha check did not pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeFailure {
    /// Token or answer absent/empty
    Missing,
    /// Wrong, expired, reused, or malformed answer
    Wrong,
}

/// Outcome of the policy gate for one login request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    /// Proceed to credential verification
    Allow,
    /// Refuse before credentials are checked
    Blocked {
        reason: BlockReason,
        retry_after_minutes: u64,
    },
    /// A captcha answer must accompany the next attempt
    ChallengeRequired,
    /// The captcha answer was missing or wrong
    ChallengeFailed { reason: ChallengeFailure },
}

/// Headlines of every message the gate produces
pub const OWN_MESSAGE_HEADLINES: [&str; 4] = [
    "Access Blocked.",
    "Security Check Required.",
    "Security Check Failed.",
    "Wrong Answer.",
];

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// User-facing message, `None` for `Allow`
    pub fn message(&self) -> Option<String> {
        match self {
            Self::Allow => None,
            Self::Blocked {
                reason: BlockReason::Lockout,
                retry_after_minutes,
            } => Some(format!(
                "Access Blocked. Too many failed attempts. Please try again in {} minute(s).",
                retry_after_minutes
            )),
            Self::Blocked {
                reason: BlockReason::StoreUnavailable,
                ..
            } => Some(
                "Access Blocked. Login protection is temporarily unavailable. Please try again shortly."
                    .to_string(),
            ),
            Self::ChallengeRequired => {
                Some("Security Check Required. Please answer the math question.".to_string())
            }
            Self::ChallengeFailed {
                reason: ChallengeFailure::Missing,
            } => Some("Security Check Failed. Please answer the math question.".to_string()),
            Self::ChallengeFailed {
                reason: ChallengeFailure::Wrong,
            } => Some("Wrong Answer. Please solve the math problem correctly.".to_string()),
        }
    }
}

/// Returns true if `message` carries one of the gate's own messages
pub fn is_own_message(message: &str) -> bool {
    OWN_MESSAGE_HEADLINES.iter().any(|h| message.contains(h))
}

/// Captcha challenge data handed to the client (never includes the answer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeView {
    /// Human-readable question, e.g. "What is 4 + 5?"
    pub question: String,

    /// Opaque single-use token to submit with the answer
    pub token: String,

    /// Challenge expiry timestamp
    pub expires_at: DateTime<Utc>,
}

/// Everything a login form needs to render for one identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginStatus {
    pub locked: bool,
    pub retry_after_minutes: u64,
    pub remaining_attempts: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge: Option<ChallengeView>,
}
