//! # Portcullis
//!
//! Brute-force protection for a login pipeline: per-identity failure
//! counting, timed lockouts, math captcha challenges after repeated
//! failures, and a notification when an identity is first locked out.
//!
//! The library is driven through [`PolicyGate`]; the `portcullis` binary
//! exposes the same gate over HTTP for hosts written in other languages.

pub mod attempts;
pub mod captcha;
pub mod config;
pub mod gate;
pub mod identity;
pub mod notify;
pub mod routes;
pub mod state;
pub mod store;

pub use config::AppConfig;
pub use gate::{LoginSubmission, PolicyGate};
pub use identity::IdentityHasher;
pub use state::AppState;
