//! # Portcullis Common
//!
//! Shared types, errors, and constants used across Portcullis components.
//!
//! ## Modules
//! - `types` - Core data structures (AttemptRecord, GateDecision, etc.)
//! - `error` - Common error types
//! - `constants` - Shared defaults, TTLs, and key prefixes

pub mod constants;
pub mod error;
pub mod types;

pub use error::{PortcullisError, Result};
pub use types::*;
