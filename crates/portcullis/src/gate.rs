//! Policy gate: the single entry point for a host's login pipeline.
//!
//! The pipeline calls [`PolicyGate::precheck`] before verifying credentials,
//! then exactly one of [`PolicyGate::on_failure`] (credentials rejected) or
//! [`PolicyGate::on_success`]. Lockout and captcha refusals never reach
//! credential verification and are not counted as failures.
//!
//! Store faults never escape as errors from the decision path. They are
//! logged and resolved by the configured [`FailMode`].

use portcullis_common::{
    AttemptRecord, BlockReason, ChallengeFailure, ChallengeView, GateDecision, IdentityHash,
    LoginStatus, PortcullisError, Result, is_own_message,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::attempts::{AttemptTracker, LockState};
use crate::captcha::CaptchaManager;
use crate::config::{AppConfig, FailMode, PolicyConfig};
use crate::notify::Notifier;
use crate::store::{AttemptStore, ChallengeCache};

/// Retry hint when failing closed on a store outage
pub(crate) const STORE_OUTAGE_RETRY_MINUTES: u64 = 1;

/// What the pipeline knows about the submitted login form
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginSubmission {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password_supplied: bool,
    #[serde(default)]
    pub captcha_token: Option<String>,
    #[serde(default)]
    pub captcha_answer: Option<String>,
}

impl LoginSubmission {
    /// No username and no password: a page load, not a login attempt
    pub fn is_blank(&self) -> bool {
        self.username.is_empty() && !self.password_supplied
    }
}

fn non_blank(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}

/// Composes attempt tracking and captcha checks into one decision
pub struct PolicyGate {
    tracker: AttemptTracker,
    captcha: CaptchaManager,
    fail_mode: FailMode,
}

impl PolicyGate {
    pub fn new(tracker: AttemptTracker, captcha: CaptchaManager, fail_mode: FailMode) -> Self {
        Self {
            tracker,
            captcha,
            fail_mode,
        }
    }

    /// Wire a gate from configuration and its collaborators
    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn AttemptStore>,
        cache: Arc<dyn ChallengeCache>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let tracker = AttemptTracker::new(store.clone(), notifier, config.policy.clone())
            .with_site_name(config.site_name.clone())
            .with_notify_timeout(config.notifier.timeout());
        let captcha = CaptchaManager::new(
            cache,
            store,
            &config.policy,
            config.captcha.challenge_ttl(),
        );
        Self::new(tracker, captcha, config.fail_mode)
    }

    pub fn policy(&self) -> &PolicyConfig {
        self.tracker.policy()
    }

    pub fn tracker(&self) -> &AttemptTracker {
        &self.tracker
    }

    pub fn captcha(&self) -> &CaptchaManager {
        &self.captcha
    }

    /// Decide whether a login attempt may proceed to credential verification
    pub async fn precheck(
        &self,
        identity: &IdentityHash,
        submission: &LoginSubmission,
    ) -> GateDecision {
        if submission.is_blank() {
            return GateDecision::Allow;
        }

        match self.evaluate(identity, submission).await {
            Ok(decision) => {
                if !decision.is_allowed() {
                    tracing::info!(identity = %identity, decision = ?decision, "Login attempt refused");
                }
                decision
            }
            Err(e) => self.degrade("precheck", identity, &e),
        }
    }

    async fn evaluate(
        &self,
        identity: &IdentityHash,
        submission: &LoginSubmission,
    ) -> Result<GateDecision> {
        if let LockState::Locked {
            retry_after_minutes,
            ..
        } = self.tracker.lock_state(identity).await?
        {
            return Ok(GateDecision::Blocked {
                reason: BlockReason::Lockout,
                retry_after_minutes,
            });
        }

        if self.captcha.should_challenge(identity).await? {
            let (Some(token), Some(answer)) = (
                non_blank(submission.captcha_token.as_ref()),
                non_blank(submission.captcha_answer.as_ref()),
            ) else {
                return Ok(GateDecision::ChallengeFailed {
                    reason: ChallengeFailure::Missing,
                });
            };

            if !self.captcha.validate(token, answer).await? {
                return Ok(GateDecision::ChallengeFailed {
                    reason: ChallengeFailure::Wrong,
                });
            }
        }

        Ok(GateDecision::Allow)
    }

    /// Read-only peek for rendering a form: blocked, challenge required, or allow
    pub async fn assess(&self, identity: &IdentityHash) -> GateDecision {
        match self.peek(identity).await {
            Ok(decision) => decision,
            Err(e) => self.degrade("assess", identity, &e),
        }
    }

    async fn peek(&self, identity: &IdentityHash) -> Result<GateDecision> {
        if let LockState::Locked {
            retry_after_minutes,
            ..
        } = self.tracker.lock_state(identity).await?
        {
            return Ok(GateDecision::Blocked {
                reason: BlockReason::Lockout,
                retry_after_minutes,
            });
        }

        if self.captcha.should_challenge(identity).await? {
            return Ok(GateDecision::ChallengeRequired);
        }

        Ok(GateDecision::Allow)
    }

    /// Everything a login form needs, minting a challenge when one is due
    pub async fn login_status(&self, identity: &IdentityHash) -> LoginStatus {
        match self.build_status(identity).await {
            Ok(status) => status,
            Err(e) => {
                let max_attempts = self.policy().max_attempts;
                match self.degrade("login_status", identity, &e) {
                    GateDecision::Blocked {
                        retry_after_minutes,
                        ..
                    } => LoginStatus {
                        locked: true,
                        retry_after_minutes,
                        remaining_attempts: 0,
                        max_attempts,
                        challenge: None,
                    },
                    _ => LoginStatus {
                        locked: false,
                        retry_after_minutes: 0,
                        remaining_attempts: max_attempts,
                        max_attempts,
                        challenge: None,
                    },
                }
            }
        }
    }

    async fn build_status(&self, identity: &IdentityHash) -> Result<LoginStatus> {
        let lock = self.tracker.lock_state(identity).await?;
        let remaining_attempts = self.tracker.remaining_attempts(identity).await?;

        let (locked, retry_after_minutes) = match lock {
            LockState::Locked {
                retry_after_minutes,
                ..
            } => (true, retry_after_minutes),
            LockState::Unlocked => (false, 0),
        };

        let challenge = if !locked && self.captcha.should_challenge(identity).await? {
            Some(self.captcha.generate().await?)
        } else {
            None
        };

        Ok(LoginStatus {
            locked,
            retry_after_minutes,
            remaining_attempts,
            max_attempts: self.policy().max_attempts,
            challenge,
        })
    }

    /// Credentials were rejected. Returns the updated record, or `None` if
    /// the store could not be reached.
    pub async fn on_failure(&self, identity: &IdentityHash) -> Option<AttemptRecord> {
        match self.tracker.record_failure(identity).await {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "Could not record failed login");
                None
            }
        }
    }

    /// Credentials were accepted
    pub async fn on_success(&self, identity: &IdentityHash) {
        if let Err(e) = self.tracker.record_success(identity).await {
            tracing::warn!(identity = %identity, error = %e, "Could not reset attempts after login");
        }
    }

    /// Append a remaining-attempts hint to a plain credential failure message.
    ///
    /// Left unchanged when the message is one of ours, the identity is
    /// locked, or the hint would read 0 or `max_attempts`.
    pub async fn decorate_error(&self, identity: &IdentityHash, base_message: &str) -> String {
        if is_own_message(base_message) {
            return base_message.to_string();
        }

        let remaining = match self.tracker.lock_state(identity).await {
            Ok(LockState::Locked { .. }) => return base_message.to_string(),
            Ok(LockState::Unlocked) => self.tracker.remaining_attempts(identity).await,
            Err(e) => Err(e),
        };

        match remaining {
            Ok(remaining) if remaining > 0 && remaining < self.policy().max_attempts => format!(
                "{} {} attempt(s) remaining before lockout.",
                base_message, remaining
            ),
            Ok(_) => base_message.to_string(),
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "Skipping attempts hint");
                base_message.to_string()
            }
        }
    }

    /// Fresh challenge, independent of any identity
    pub async fn new_challenge(&self) -> Result<ChallengeView> {
        self.captcha.generate().await
    }

    /// All attempt records for administration
    pub async fn records(&self) -> Result<Vec<AttemptRecord>> {
        self.tracker.records().await
    }

    /// Delete one identity's record (manual unlock)
    pub async fn forget(&self, identity: &IdentityHash) -> Result<bool> {
        self.tracker.forget(identity).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.tracker.ping().await
    }

    fn degrade(&self, op: &str, identity: &IdentityHash, err: &PortcullisError) -> GateDecision {
        match self.fail_mode {
            FailMode::Open => {
                tracing::warn!(op, identity = %identity, error = %err, "Store error, failing open");
                GateDecision::Allow
            }
            FailMode::Closed => {
                tracing::error!(op, identity = %identity, error = %err, "Store error, failing closed");
                GateDecision::Blocked {
                    reason: BlockReason::StoreUnavailable,
                    retry_after_minutes: STORE_OUTAGE_RETRY_MINUTES,
                }
            }
        }
    }
}
