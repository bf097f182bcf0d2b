//! Math question generation.
//!
//! Two operands in 1..=9, addition three times as likely as subtraction so a
//! negative answer is the uncommon case.

use rand::Rng;
use std::fmt;

/// Arithmetic operator of a challenge question
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Add,
    Sub,
}

impl Operator {
    fn symbol(&self) -> char {
        match self {
            Self::Add => '+',
            Self::Sub => '-',
        }
    }
}

/// A single-digit arithmetic question
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MathQuestion {
    pub left: u8,
    pub operator: Operator,
    pub right: u8,
}

impl MathQuestion {
    pub fn new(left: u8, operator: Operator, right: u8) -> Self {
        Self {
            left,
            operator,
            right,
        }
    }

    /// Draw a random question
    pub fn random(rng: &mut impl Rng) -> Self {
        let left = rng.random_range(1..=9);
        let right = rng.random_range(1..=9);
        let operator = if rng.random_ratio(1, 4) {
            Operator::Sub
        } else {
            Operator::Add
        };
        Self::new(left, operator, right)
    }

    pub fn answer(&self) -> i64 {
        let (l, r) = (i64::from(self.left), i64::from(self.right));
        match self.operator {
            Operator::Add => l + r,
            Operator::Sub => l - r,
        }
    }
}

impl fmt::Display for MathQuestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "What is {} {} {}?",
            self.left,
            self.operator.symbol(),
            self.right
        )
    }
}

/// Generate a cryptographically random challenge token
pub fn generate_token() -> String {
    use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};

    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Tokens we mint are URL-safe base64; anything else is never looked up
pub fn is_well_formed_token(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= 64
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Leading characters of a token, enough to correlate log lines without
/// leaking a usable bearer value
pub fn token_hint(token: &str) -> &str {
    token.get(..6).unwrap_or(token)
}
