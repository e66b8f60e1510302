//! Quotakeeper - store-backed admission control
//!
//! This crate implements two primitives on top of an atomic key-value store:
//! a period-window rate limiter and an attempt-bounded verification matcher.
//! Every state transition runs as a single atomic procedure in the store, so
//! any number of processes may share the same keys without client-side
//! locking.

pub mod clock;
pub mod config;
pub mod error;
pub mod limit;
pub mod store;
pub mod verified;

#[cfg(test)]
mod test_support;

pub use error::{QuotaError, Result};
pub use limit::{PeriodLimitConfig, PeriodLimitStatus, PeriodLimiter};
pub use store::{AtomicStore, KeyTtl, MemoryStore, RedisStore};
pub use verified::{MatchOutcome, VerifiedConfig, VerifiedMatcher};
