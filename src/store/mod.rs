//! Atomic key-value store abstraction.
//!
//! The limiter and matcher never touch a store directly; they issue canned
//! [`Procedure`]s through [`AtomicStore`], which must execute each one as a
//! single isolated unit per key.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{QuotaError, Result};

mod memory;
mod redis_store;
mod script;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use script::Procedure;
pub(crate) use script::{match_code, GENERATE_OK};

/// Longest TTL a store accepts; Redis keeps expiry as epoch milliseconds.
pub const MAX_TTL_SECS: u64 = i64::MAX as u64 / 1000;

/// TTL reply for a key that does not exist.
pub const TTL_MISSING: i64 = -2;
/// TTL reply for a key that exists without an expiry.
pub const TTL_PERSISTENT: i64 = -1;

/// Trait for stores able to run the limiter and matcher protocols.
///
/// Implementations must be linearizable per key: every `execute` call and
/// every plain read or write on the same key takes effect at a single point
/// between its invocation and completion.
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Run a canned procedure against `keys` with string `args`.
    async fn execute(&self, procedure: Procedure, keys: &[String], args: &[String]) -> Result<i64>;

    /// Overwrite `key` with an integer value expiring after `ttl_secs`.
    async fn set_with_ttl(&self, key: &str, value: i64, ttl_secs: u64) -> Result<()>;

    /// Read a plain value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Remaining TTL in seconds, or [`TTL_MISSING`] / [`TTL_PERSISTENT`].
    async fn ttl(&self, key: &str) -> Result<i64>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist.
    Missing,
    /// The key exists and never expires.
    Persistent,
    /// The key expires after this long.
    Expires(Duration),
}

impl KeyTtl {
    /// Interpret a raw TTL reply in seconds.
    pub fn from_reply(reply: i64) -> Result<Self> {
        match reply {
            TTL_MISSING => Ok(KeyTtl::Missing),
            TTL_PERSISTENT => Ok(KeyTtl::Persistent),
            secs if secs >= 0 => Ok(KeyTtl::Expires(Duration::from_secs(secs as u64))),
            other => Err(QuotaError::UnrecognizedResponse(format!(
                "TTL reply {}",
                other
            ))),
        }
    }

    /// The remaining duration, if the key expires.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            KeyTtl::Expires(d) => Some(*d),
            _ => None,
        }
    }

    /// Whether the key exists.
    pub fn exists(&self) -> bool {
        !matches!(self, KeyTtl::Missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ttl_from_reply() {
        assert_eq!(KeyTtl::from_reply(-2).unwrap(), KeyTtl::Missing);
        assert_eq!(KeyTtl::from_reply(-1).unwrap(), KeyTtl::Persistent);
        assert_eq!(
            KeyTtl::from_reply(7).unwrap().remaining(),
            Some(Duration::from_secs(7))
        );
        assert!(KeyTtl::from_reply(-3).is_err());
        assert!(!KeyTtl::Missing.exists());
    }
}
