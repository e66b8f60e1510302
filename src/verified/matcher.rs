//! Verification entry generation and matching.
//!
//! An entry is a store hash `{value, quota, err}` with a TTL. A successful
//! match deletes it; so does the mismatch that brings `err` up to `quota`,
//! in the same atomic step that records it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::{QuotaError, Result};
use crate::store::{match_code, AtomicStore, Procedure, GENERATE_OK, MAX_TTL_SECS};

/// Defaults for [`VerifiedMatcher::generate_default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedConfig {
    /// Namespace prepended to every entry key
    #[serde(default)]
    pub key_prefix: String,
    /// Wrong attempts tolerated before the entry is destroyed
    #[serde(default = "default_quota")]
    pub quota: u64,
    /// Entry lifetime in seconds
    #[serde(default = "default_expiry_secs")]
    pub expiry_secs: u64,
}

impl Default for VerifiedConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            quota: default_quota(),
            expiry_secs: default_expiry_secs(),
        }
    }
}

fn default_quota() -> u64 {
    5
}

fn default_expiry_secs() -> u64 {
    300
}

impl VerifiedConfig {
    /// Entry lifetime.
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }

    /// Reject values that cannot be expressed in the store.
    pub fn validate(&self) -> Result<()> {
        validate_entry(self.quota, self.expiry())
    }
}

fn validate_entry(quota: u64, expiry: Duration) -> Result<()> {
    if quota == 0 {
        return Err(QuotaError::Config(
            "verification quota must be positive".to_string(),
        ));
    }
    if i64::try_from(quota).is_err() {
        return Err(QuotaError::Config(format!(
            "verification quota {} is too large",
            quota
        )));
    }
    if expiry.as_secs() == 0 {
        return Err(QuotaError::Config(
            "verification expiry must be at least one second".to_string(),
        ));
    }
    if expiry.as_secs() > MAX_TTL_SECS {
        return Err(QuotaError::Config(format!(
            "verification expiry of {} seconds is too long",
            expiry.as_secs()
        )));
    }
    Ok(())
}

/// Result of comparing a candidate against an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchOutcome {
    /// No entry: never generated, expired, already used or exhausted
    NotFound,
    /// The candidate matched; the entry is gone
    Success,
    /// Wrong candidate; the entry keeps its remaining attempts
    Mismatch,
    /// Wrong candidate, and it was the last allowed one; the entry is gone
    Exhausted,
}

impl MatchOutcome {
    fn from_code(code: i64) -> Result<Self> {
        match code {
            match_code::SUCCESS => Ok(MatchOutcome::Success),
            match_code::NOT_FOUND => Ok(MatchOutcome::NotFound),
            match_code::MISMATCH => Ok(MatchOutcome::Mismatch),
            match_code::EXHAUSTED => Ok(MatchOutcome::Exhausted),
            other => Err(QuotaError::UnrecognizedResponse(format!(
                "match code {}",
                other
            ))),
        }
    }

    pub fn is_success(&self) -> bool {
        *self == MatchOutcome::Success
    }

    /// A wrong candidate, whether or not it exhausted the entry.
    pub fn is_mismatch(&self) -> bool {
        matches!(self, MatchOutcome::Mismatch | MatchOutcome::Exhausted)
    }

    pub fn is_not_found(&self) -> bool {
        *self == MatchOutcome::NotFound
    }

    pub fn is_exhausted(&self) -> bool {
        *self == MatchOutcome::Exhausted
    }
}

/// Issues and checks one-time values bound to keys.
pub struct VerifiedMatcher {
    store: Arc<dyn AtomicStore>,
    config: VerifiedConfig,
}

impl std::fmt::Debug for VerifiedMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifiedMatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl VerifiedMatcher {
    /// Create a matcher over `store`.
    pub fn new(store: Arc<dyn AtomicStore>, config: VerifiedConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { store, config })
    }

    /// The matcher configuration.
    pub fn config(&self) -> &VerifiedConfig {
        &self.config
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Bind `value` to `key`, replacing any existing entry and its attempt
    /// history.
    pub async fn generate(&self, key: &str, value: &str, quota: u64, expiry: Duration) -> Result<()> {
        validate_entry(quota, expiry)?;
        let store_key = self.store_key(key);

        debug!(
            key = %store_key,
            quota = quota,
            expiry_secs = expiry.as_secs(),
            "Generating verification entry"
        );

        let reply = self
            .store
            .execute(
                Procedure::VerifiedGenerate,
                &[store_key.clone()],
                &[
                    value.to_string(),
                    quota.to_string(),
                    expiry.as_secs().to_string(),
                ],
            )
            .await
            .map_err(|e| {
                warn!(key = %store_key, error = %e, "Verification generate failed");
                e
            })?;

        if reply != GENERATE_OK {
            return Err(QuotaError::UnrecognizedResponse(format!(
                "generate code {} for {}",
                reply, store_key
            )));
        }
        Ok(())
    }

    /// [`generate`](Self::generate) with the configured quota and expiry.
    pub async fn generate_default(&self, key: &str, value: &str) -> Result<()> {
        self.generate(key, value, self.config.quota, self.config.expiry())
            .await
    }

    /// Compare `candidate` against the entry at `key`.
    pub async fn match_value(&self, key: &str, candidate: &str) -> Result<MatchOutcome> {
        let store_key = self.store_key(key);

        let code = self
            .store
            .execute(
                Procedure::VerifiedMatch,
                &[store_key.clone()],
                &[candidate.to_string()],
            )
            .await
            .map_err(|e| {
                warn!(key = %store_key, error = %e, "Verification match failed");
                e
            })?;

        let outcome = MatchOutcome::from_code(code)?;
        match outcome {
            MatchOutcome::Exhausted => {
                debug!(key = %store_key, "Verification attempts exhausted, entry destroyed");
            }
            _ => trace!(key = %store_key, outcome = ?outcome, "Verification matched"),
        }
        Ok(outcome)
    }
}
