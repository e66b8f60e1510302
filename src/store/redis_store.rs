//! Redis backend.
//!
//! Procedures run as Lua scripts, which Redis executes without interleaving
//! any other command. Scripts are sent by SHA and reloaded on `NOSCRIPT`.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, trace, warn};

use super::script::Procedure;
use super::AtomicStore;
use crate::config::StoreConfig;
use crate::error::{QuotaError, Result};

/// Redis-backed [`AtomicStore`].
#[derive(Clone)]
pub struct RedisStore {
    connection_manager: ConnectionManager,
    scripts: [Script; 3],
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis and verify the connection with a PING.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            warn!(error = %e, "Failed to create Redis client");
            QuotaError::Config(format!("invalid store url: {}", e))
        })?;

        let connection_manager = ConnectionManager::new(client).await.map_err(|e| {
            warn!(error = %e, "Failed to create Redis connection manager");
            QuotaError::from(e)
        })?;

        let store = Self::from_connection_manager(connection_manager);
        store.ping().await?;

        debug!("Connected to Redis store");
        Ok(store)
    }

    /// Wrap an existing connection manager.
    pub fn from_connection_manager(connection_manager: ConnectionManager) -> Self {
        Self {
            connection_manager,
            scripts: Procedure::ALL.map(|procedure| Script::new(procedure.lua())),
        }
    }

    /// Round-trip a PING.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection_manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn script(&self, procedure: Procedure) -> &Script {
        &self.scripts[procedure as usize]
    }
}

#[async_trait]
impl AtomicStore for RedisStore {
    async fn execute(&self, procedure: Procedure, keys: &[String], args: &[String]) -> Result<i64> {
        if (keys.len(), args.len()) != procedure.arity() {
            return Err(QuotaError::Procedure(format!(
                "{} expects {:?} keys/args, got ({}, {})",
                procedure,
                procedure.arity(),
                keys.len(),
                args.len()
            )));
        }

        let mut conn = self.connection_manager.clone();
        let mut invocation = self.script(procedure).prepare_invoke();
        for key in keys {
            invocation.key(key.as_str());
        }
        for arg in args {
            invocation.arg(arg.as_str());
        }

        trace!(procedure = %procedure, keys = ?keys, "Invoking Redis script");

        let reply: i64 = invocation.invoke_async(&mut conn).await.map_err(|e| {
            warn!(procedure = %procedure, error = %e, "Redis script failed");
            QuotaError::from(e)
        })?;
        Ok(reply)
    }

    async fn set_with_ttl(&self, key: &str, value: i64, ttl_secs: u64) -> Result<()> {
        let mut conn = self.connection_manager.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection_manager.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection_manager.clone();
        let ttl: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        Ok(ttl)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection_manager.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }
}

/// These tests need a running Redis; run with
/// `REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{match_code, TTL_MISSING};

    async fn connect() -> RedisStore {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        RedisStore::connect(&StoreConfig { url }).await.unwrap()
    }

    fn unique_key(name: &str) -> String {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        format!("quotakeeper-test:{}:{}", name, nanos)
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_increment_arms_ttl_once() {
        let store = connect().await;
        let key = unique_key("incr");
        let keys = vec![key.clone()];

        let first = store
            .execute(Procedure::PeriodIncrement, &keys, &["30".to_string()])
            .await
            .unwrap();
        assert_eq!(first, 1);
        let second = store
            .execute(Procedure::PeriodIncrement, &keys, &["5".to_string()])
            .await
            .unwrap();
        assert_eq!(second, 2);

        let ttl = store.ttl(&key).await.unwrap();
        assert!(ttl > 5 && ttl <= 30, "ttl was {}", ttl);

        store.delete(&key).await.unwrap();
        assert_eq!(store.ttl(&key).await.unwrap(), TTL_MISSING);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_match_exhausts_entry() {
        let store = connect().await;
        let key = unique_key("verified");
        let keys = vec![key.clone()];
        let generate_args = vec!["A".to_string(), "2".to_string(), "60".to_string()];

        store
            .execute(Procedure::VerifiedGenerate, &keys, &generate_args)
            .await
            .unwrap();

        let wrong = vec!["B".to_string()];
        let right = vec!["A".to_string()];
        assert_eq!(
            store.execute(Procedure::VerifiedMatch, &keys, &wrong).await.unwrap(),
            match_code::MISMATCH
        );
        assert_eq!(
            store.execute(Procedure::VerifiedMatch, &keys, &wrong).await.unwrap(),
            match_code::EXHAUSTED
        );
        assert_eq!(
            store.execute(Procedure::VerifiedMatch, &keys, &right).await.unwrap(),
            match_code::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_url() {
        let err = RedisStore::connect(&StoreConfig {
            url: "not a url".into(),
        })
        .await
        .unwrap_err();
        assert!(matches!(err, QuotaError::Config(_)));
    }
}
