//! Attempt tracking module.
//!
//! Counts consecutive login failures per identity hash and enters, reports,
//! and lazily expires lockouts.

mod tracker;

pub use tracker::{AttemptTracker, LockState};
