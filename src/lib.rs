//! Turnstile - Tiered Admission Control
//!
//! This crate decides, for every incoming request, whether it may proceed
//! or must be rejected because a quota has been exhausted. Limits are
//! fixed-window counters kept in a shared counter store (Redis, or process
//! memory for single instances), grouped into route tiers and into a
//! multi-scope controller guarding one expensive operation.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use self::config::TurnstileConfig;
pub use self::error::{Result, TurnstileError};
