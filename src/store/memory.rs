//! In-process store.
//!
//! Each procedure runs while holding the `DashMap` shard lock for its key, so
//! operations on one key are linearizable. Expired entries are dropped lazily
//! on access, or in bulk by [`MemoryStore::purge_expired`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::script::{match_code, Procedure, GENERATE_OK};
use super::{AtomicStore, TTL_MISSING, TTL_PERSISTENT};
use crate::clock::{Clock, SystemClock};
use crate::error::{QuotaError, Result};

const WRONG_TYPE: &str = "WRONGTYPE operation against a key holding the wrong kind of value";

#[derive(Debug, Clone)]
enum Value {
    Int(i64),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Duration>,
}

impl Slot {
    fn is_expired(&self, now: Duration) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// An [`AtomicStore`] kept in process memory.
pub struct MemoryStore {
    entries: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.entries.len())
            .field("available", &self.available.load(Ordering::SeqCst))
            .finish()
    }
}

impl MemoryStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails without
    /// touching state.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of stored keys, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired key.
    pub fn purge_expired(&self) {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, slot| !slot.is_expired(now));
        debug!(
            removed = before.saturating_sub(self.entries.len()),
            "Purged expired entries"
        );
    }

    #[cfg(test)]
    pub(crate) fn insert_persistent(&self, key: &str, value: i64) {
        self.entries.insert(
            key.to_string(),
            Slot {
                value: Value::Int(value),
                expires_at: None,
            },
        );
    }

    fn expiry_after(&self, ttl_secs: u64) -> Result<Duration> {
        self.clock
            .now()
            .checked_add(Duration::from_secs(ttl_secs))
            .ok_or_else(|| QuotaError::Procedure(format!("invalid expire time {}", ttl_secs)))
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QuotaError::StoreUnavailable(
                "memory store is marked unavailable".to_string(),
            ))
        }
    }

    fn increment(&self, key: &str, ttl_secs: u64) -> Result<i64> {
        let now = self.clock.now();
        let fresh = Slot {
            value: Value::Int(1),
            expires_at: Some(self.expiry_after(ttl_secs)?),
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if !occupied.get().is_expired(now) => {
                match &mut occupied.get_mut().value {
                    Value::Int(current) => {
                        *current = current.checked_add(1).ok_or_else(|| {
                            QuotaError::Procedure("increment would overflow".to_string())
                        })?;
                        Ok(*current)
                    }
                    Value::Hash(_) => Err(QuotaError::UnrecognizedResponse(WRONG_TYPE.into())),
                }
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(fresh);
                Ok(1)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(1)
            }
        }
    }

    fn generate(&self, key: &str, value: &str, quota: i64, expiry_secs: u64) -> Result<i64> {
        let fields = HashMap::from([
            ("value".to_string(), value.to_string()),
            ("quota".to_string(), quota.to_string()),
            ("err".to_string(), "0".to_string()),
        ]);
        self.entries.insert(
            key.to_string(),
            Slot {
                value: Value::Hash(fields),
                expires_at: Some(self.expiry_after(expiry_secs)?),
            },
        );
        Ok(GENERATE_OK)
    }

    fn match_candidate(&self, key: &str, candidate: &str) -> Result<i64> {
        let now = self.clock.now();
        let Entry::Occupied(mut occupied) = self.entries.entry(key.to_string()) else {
            return Ok(match_code::NOT_FOUND);
        };
        if occupied.get().is_expired(now) {
            occupied.remove();
            return Ok(match_code::NOT_FOUND);
        }

        let code = {
            let Value::Hash(fields) = &mut occupied.get_mut().value else {
                return Err(QuotaError::UnrecognizedResponse(WRONG_TYPE.into()));
            };

            if fields.get("value").map(String::as_str) == Some(candidate) {
                match_code::SUCCESS
            } else {
                let quota = hash_int(fields, "quota")?;
                let errs = hash_int(fields, "err")? + 1;
                fields.insert("err".to_string(), errs.to_string());
                if errs >= quota {
                    match_code::EXHAUSTED
                } else {
                    match_code::MISMATCH
                }
            }
        };

        if code != match_code::MISMATCH {
            occupied.remove();
        }
        Ok(code)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn int_arg<T: std::str::FromStr>(procedure: Procedure, args: &[String], index: usize) -> Result<T> {
    args[index].parse().map_err(|_| {
        QuotaError::Procedure(format!(
            "{}: argument {} is not an integer: {:?}",
            procedure,
            index + 1,
            args[index]
        ))
    })
}

fn hash_int(fields: &HashMap<String, String>, field: &str) -> Result<i64> {
    fields
        .get(field)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| QuotaError::Procedure(format!("hash field {} is not an integer", field)))
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn execute(&self, procedure: Procedure, keys: &[String], args: &[String]) -> Result<i64> {
        self.check_available()?;
        if (keys.len(), args.len()) != procedure.arity() {
            return Err(QuotaError::Procedure(format!(
                "{} expects {:?} keys/args, got ({}, {})",
                procedure,
                procedure.arity(),
                keys.len(),
                args.len()
            )));
        }

        trace!(procedure = %procedure, key = %keys[0], "Executing in-memory procedure");

        match procedure {
            Procedure::PeriodIncrement => {
                let ttl_secs = int_arg(procedure, args, 0)?;
                self.increment(&keys[0], ttl_secs)
            }
            Procedure::VerifiedGenerate => {
                let quota = int_arg(procedure, args, 1)?;
                let expiry_secs = int_arg(procedure, args, 2)?;
                self.generate(&keys[0], &args[0], quota, expiry_secs)
            }
            Procedure::VerifiedMatch => self.match_candidate(&keys[0], &args[0]),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: i64, ttl_secs: u64) -> Result<()> {
        self.check_available()?;
        let expires_at = self.expiry_after(ttl_secs)?;
        self.entries.insert(
            key.to_string(),
            Slot {
                value: Value::Int(value),
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        let now = self.clock.now();
        self.entries.remove_if(key, |_, slot| slot.is_expired(now));

        match self.entries.get(key) {
            None => Ok(None),
            Some(slot) => match &slot.value {
                Value::Int(n) => Ok(Some(n.to_string())),
                Value::Hash(_) => Err(QuotaError::UnrecognizedResponse(WRONG_TYPE.into())),
            },
        }
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        self.check_available()?;
        let now = self.clock.now();
        self.entries.remove_if(key, |_, slot| slot.is_expired(now));

        let Some(slot) = self.entries.get(key) else {
            return Ok(TTL_MISSING);
        };
        match slot.expires_at {
            None => Ok(TTL_PERSISTENT),
            // Rounded to the nearest second, as Redis reports it.
            Some(at) => Ok(((at.saturating_sub(now).as_millis() + 500) / 1000) as i64),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tokio_test::{assert_err, assert_ok};

    fn store_at(secs: u64) -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(secs)));
        (MemoryStore::with_clock(clock.clone()), clock)
    }

    fn keys(key: &str) -> Vec<String> {
        vec![key.to_string()]
    }

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn test_increment_sets_ttl_only_on_create() {
        let (store, clock) = store_at(1_000);

        let first = store
            .execute(Procedure::PeriodIncrement, &keys("c"), &args(&["10"]))
            .await;
        assert_eq!(assert_ok!(first), 1);

        clock.advance(Duration::from_secs(4));
        let second = store
            .execute(Procedure::PeriodIncrement, &keys("c"), &args(&["10"]))
            .await;
        assert_eq!(assert_ok!(second), 2);
        assert_eq!(store.ttl("c").await.unwrap(), 6);

        clock.advance(Duration::from_secs(6));
        assert_eq!(store.ttl("c").await.unwrap(), TTL_MISSING);
        assert_eq!(store.get("c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_sentinels() {
        let (store, _) = store_at(0);
        assert_eq!(store.ttl("absent").await.unwrap(), TTL_MISSING);

        store.insert_persistent("forever", 3);
        assert_eq!(store.ttl("forever").await.unwrap(), TTL_PERSISTENT);
        assert_eq!(store.get("forever").await.unwrap(), Some("3".to_string()));
    }

    #[tokio::test]
    async fn test_hash_key_rejects_plain_reads() {
        let (store, _) = store_at(0);
        store
            .execute(
                Procedure::VerifiedGenerate,
                &keys("v"),
                &args(&["secret", "3", "60"]),
            )
            .await
            .unwrap();

        let err = assert_err!(store.get("v").await);
        assert!(matches!(err, QuotaError::UnrecognizedResponse(_)));

        let err = assert_err!(
            store
                .execute(Procedure::PeriodIncrement, &keys("v"), &args(&["60"]))
                .await
        );
        assert!(matches!(err, QuotaError::UnrecognizedResponse(_)));
    }

    #[tokio::test]
    async fn test_match_codes() {
        let (store, _) = store_at(0);
        let generate = args(&["A", "2", "60"]);
        store
            .execute(Procedure::VerifiedGenerate, &keys("v"), &generate)
            .await
            .unwrap();

        let wrong = args(&["B"]);
        let code = store.execute(Procedure::VerifiedMatch, &keys("v"), &wrong).await;
        assert_eq!(code.unwrap(), match_code::MISMATCH);
        let code = store.execute(Procedure::VerifiedMatch, &keys("v"), &wrong).await;
        assert_eq!(code.unwrap(), match_code::EXHAUSTED);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_arguments_are_rejected() {
        let (store, _) = store_at(0);

        let err = assert_err!(
            store
                .execute(Procedure::PeriodIncrement, &keys("c"), &args(&["soon"]))
                .await
        );
        assert!(matches!(err, QuotaError::Procedure(_)));

        let err = assert_err!(
            store
                .execute(Procedure::VerifiedMatch, &keys("c"), &args(&[]))
                .await
        );
        assert!(matches!(err, QuotaError::Procedure(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store_does_not_mutate() {
        let (store, _) = store_at(0);
        store.set_available(false);

        let err = assert_err!(
            store
                .execute(Procedure::PeriodIncrement, &keys("c"), &args(&["10"]))
                .await
        );
        assert!(matches!(err, QuotaError::StoreUnavailable(_)));
        assert!(store.is_empty());

        store.set_available(true);
        assert_eq!(store.get("c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unrepresentable_expiry_is_rejected() {
        let (store, _) = store_at(1_000);
        let forever = u64::MAX.to_string();

        let err = assert_err!(
            store
                .execute(Procedure::PeriodIncrement, &keys("c"), &args(&[forever.as_str()]))
                .await
        );
        assert!(matches!(err, QuotaError::Procedure(_)));

        let err = assert_err!(
            store
                .execute(
                    Procedure::VerifiedGenerate,
                    &keys("v"),
                    &args(&["A", "2", forever.as_str()]),
                )
                .await
        );
        assert!(matches!(err, QuotaError::Procedure(_)));

        let err = assert_err!(store.set_with_ttl("s", 1, u64::MAX).await);
        assert!(matches!(err, QuotaError::Procedure(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_increment_overflow_is_rejected() {
        let (store, _) = store_at(0);
        store.insert_persistent("c", i64::MAX);

        let err = assert_err!(
            store
                .execute(Procedure::PeriodIncrement, &keys("c"), &args(&["10"]))
                .await
        );
        assert!(matches!(err, QuotaError::Procedure(_)));
        assert_eq!(store.get("c").await.unwrap(), Some(i64::MAX.to_string()));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = store_at(0);
        store.set_with_ttl("short", 1, 1).await.unwrap();
        store.set_with_ttl("long", 1, 100).await.unwrap();

        clock.advance(Duration::from_secs(2));
        store.purge_expired();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("long").await.unwrap(), Some("1".to_string()));
    }
}
