//! One-time verification codes with bounded wrong attempts.

mod matcher;

pub use matcher::{MatchOutcome, VerifiedConfig, VerifiedMatcher};
