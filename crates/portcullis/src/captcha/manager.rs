//! Challenge issuing and single-use validation.

use chrono::Utc;
use portcullis_common::{ChallengeView, IdentityHash, PortcullisError, Result};
use std::sync::Arc;
use std::time::Duration;

use super::StoredChallenge;
use super::generator::{MathQuestion, generate_token, is_well_formed_token, token_hint};
use crate::config::PolicyConfig;
use crate::store::{AttemptStore, ChallengeCache};

/// Captcha challenge service
pub struct CaptchaManager {
    cache: Arc<dyn ChallengeCache>,
    records: Arc<dyn AttemptStore>,
    /// Challenge TTL
    ttl: Duration,
    enabled: bool,
    challenge_after: u32,
}

impl CaptchaManager {
    pub fn new(
        cache: Arc<dyn ChallengeCache>,
        records: Arc<dyn AttemptStore>,
        policy: &PolicyConfig,
        ttl: Duration,
    ) -> Self {
        Self {
            cache,
            records,
            ttl,
            enabled: policy.captcha_enabled,
            challenge_after: policy.captcha_after_attempts,
        }
    }

    /// Generate a new random challenge
    pub async fn generate(&self) -> Result<ChallengeView> {
        let question = MathQuestion::random(&mut rand::rng());
        self.issue(question).await
    }

    /// Store the answer to `question` under a fresh token
    pub async fn issue(&self, question: MathQuestion) -> Result<ChallengeView> {
        let token = generate_token();
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| PortcullisError::Captcha(format!("invalid ttl: {}", e)))?;
        let expires_at = now + ttl;

        let stored = StoredChallenge {
            answer: question.answer(),
            created_at: now.timestamp(),
            expires_at: expires_at.timestamp(),
        };
        let value = serde_json::to_string(&stored)
            .map_err(|e| PortcullisError::Captcha(e.to_string()))?;
        self.cache.put(&token, value, self.ttl).await?;

        tracing::debug!(token = %token_hint(&token), "Generated captcha challenge");

        Ok(ChallengeView {
            question: question.to_string(),
            token,
            expires_at,
        })
    }

    /// Check an answer. The challenge is consumed on lookup, before the
    /// comparison, so a token can succeed at most once.
    pub async fn validate(&self, token: &str, submitted_answer: &str) -> Result<bool> {
        if !is_well_formed_token(token) {
            return Ok(false);
        }

        let Ok(submitted) = submitted_answer.trim().parse::<i64>() else {
            tracing::debug!(token = %token_hint(token), "Captcha answer is not an integer");
            return Ok(false);
        };

        let Some(raw) = self.cache.take(token).await? else {
            tracing::debug!(token = %token_hint(token), "Captcha token expired or already used");
            return Ok(false);
        };

        let stored: StoredChallenge = match serde_json::from_str(&raw) {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(token = %token_hint(token), error = %e, "Discarding unreadable captcha entry");
                return Ok(false);
            }
        };

        // Cache TTLs are coarse (whole seconds in Redis)
        if Utc::now().timestamp() > stored.expires_at {
            return Ok(false);
        }

        let success = submitted == stored.answer;
        tracing::debug!(token = %token_hint(token), success, "Captcha verified");
        Ok(success)
    }

    /// True iff captchas are on and the identity has a record with at least
    /// `captcha_after_attempts` failures. Unseen identities are never challenged.
    pub async fn should_challenge(&self, identity: &IdentityHash) -> Result<bool> {
        if !self.enabled {
            return Ok(false);
        }

        Ok(self
            .records
            .get(identity)
            .await?
            .is_some_and(|r| r.attempts >= self.challenge_after))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::captcha::Operator;
    use crate::store::{MemoryChallengeCache, MemoryRecordStore};

    fn manager_with(policy: &PolicyConfig, ttl: Duration) -> (CaptchaManager, Arc<MemoryRecordStore>) {
        let records = Arc::new(MemoryRecordStore::new());
        let manager = CaptchaManager::new(
            Arc::new(MemoryChallengeCache::new()),
            records.clone(),
            policy,
            ttl,
        );
        (manager, records)
    }

    fn manager() -> CaptchaManager {
        manager_with(&PolicyConfig::default(), Duration::from_secs(300)).0
    }

    #[tokio::test]
    async fn test_correct_answer_is_single_use() {
        let manager = manager();
        let challenge = manager
            .issue(MathQuestion::new(4, Operator::Add, 5))
            .await
            .unwrap();
        assert_eq!(challenge.question, "What is 4 + 5?");

        assert!(manager.validate(&challenge.token, "9").await.unwrap());
        assert!(!manager.validate(&challenge.token, "9").await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_answer_consumes_token() {
        let manager = manager();
        let challenge = manager
            .issue(MathQuestion::new(3, Operator::Sub, 8))
            .await
            .unwrap();

        assert!(!manager.validate(&challenge.token, "6").await.unwrap());
        assert!(!manager.validate(&challenge.token, "-5").await.unwrap());
    }

    #[tokio::test]
    async fn test_negative_and_padded_answers_parse() {
        let manager = manager();
        let challenge = manager
            .issue(MathQuestion::new(3, Operator::Sub, 8))
            .await
            .unwrap();

        assert!(manager.validate(&challenge.token, " -5 ").await.unwrap());
    }

    #[tokio::test]
    async fn test_non_integer_answer_fails_without_consuming() {
        let manager = manager();
        let challenge = manager
            .issue(MathQuestion::new(1, Operator::Add, 1))
            .await
            .unwrap();

        assert!(!manager.validate(&challenge.token, "two").await.unwrap());
        assert!(!manager.validate(&challenge.token, "2.5").await.unwrap());
        assert!(!manager.validate(&challenge.token, "").await.unwrap());
        assert!(manager.validate(&challenge.token, "2").await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_or_unknown_token_fails() {
        let manager = manager();
        assert!(!manager.validate("", "9").await.unwrap());
        assert!(!manager.validate("nonexistent", "9").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_challenge_fails() {
        let (manager, _) = manager_with(&PolicyConfig::default(), Duration::ZERO);
        let challenge = manager
            .issue(MathQuestion::new(4, Operator::Add, 5))
            .await
            .unwrap();

        assert!(!manager.validate(&challenge.token, "9").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_validation_succeeds_once() {
        let manager = Arc::new(manager());
        let challenge = manager
            .issue(MathQuestion::new(2, Operator::Add, 2))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let token = challenge.token.clone();
            handles.push(tokio::spawn(async move {
                manager.validate(&token, "4").await.unwrap()
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_generated_challenge_validates() {
        let manager = manager();
        let challenge = manager.generate().await.unwrap();

        // "What is A op B?"
        let parts: Vec<&str> = challenge
            .question
            .trim_start_matches("What is ")
            .trim_end_matches('?')
            .split(' ')
            .collect();
        let (l, r): (i64, i64) = (parts[0].parse().unwrap(), parts[2].parse().unwrap());
        let answer = if parts[1] == "+" { l + r } else { l - r };

        assert!(manager.validate(&challenge.token, &answer.to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn test_challenge_threshold() {
        let policy = PolicyConfig {
            captcha_after_attempts: 2,
            ..Default::default()
        };
        let (manager, records) = manager_with(&policy, Duration::from_secs(300));
        let who = IdentityHash::from_digest("ip");

        assert!(!manager.should_challenge(&who).await.unwrap());

        records.upsert_increment(&who, Utc::now()).await.unwrap();
        assert!(!manager.should_challenge(&who).await.unwrap());

        records.upsert_increment(&who, Utc::now()).await.unwrap();
        assert!(manager.should_challenge(&who).await.unwrap());
    }

    #[tokio::test]
    async fn test_disabled_captcha_never_challenges() {
        let policy = PolicyConfig {
            captcha_enabled: false,
            captcha_after_attempts: 1,
            ..Default::default()
        };
        let (manager, records) = manager_with(&policy, Duration::from_secs(300));
        let who = IdentityHash::from_digest("ip");
        records.upsert_increment(&who, Utc::now()).await.unwrap();

        assert!(!manager.should_challenge(&who).await.unwrap());
    }
}
