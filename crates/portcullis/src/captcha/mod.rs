//! Math captcha challenges.
//!
//! A challenge is a question plus an opaque token; the expected answer lives
//! only in the challenge cache, keyed by token, until it is consumed.

mod generator;
mod manager;

pub use generator::{MathQuestion, Operator};
pub use manager::CaptchaManager;

use serde::{Deserialize, Serialize};

/// Stored challenge data in the challenge cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredChallenge {
    /// The expected answer
    pub answer: i64,
    /// Creation timestamp
    pub created_at: i64,
    /// Expiry timestamp
    pub expires_at: i64,
}
