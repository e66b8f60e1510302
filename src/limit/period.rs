//! Store-backed period limiter.
//!
//! Every `take` is one atomic increment in the store; classification happens
//! on the value the store returns, so concurrent callers in any number of
//! processes see exactly one `HitQuota` per window.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::key::LimitKey;
use super::window::window_ttl;
use crate::clock::{Clock, SystemClock};
use crate::error::{QuotaError, Result};
use crate::store::{AtomicStore, KeyTtl, Procedure, MAX_TTL_SECS};

/// Window length used when a configuration omits it.
const DEFAULT_PERIOD_SECS: u64 = 1;

/// Configuration for a period limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodLimitConfig {
    /// Window length in seconds
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    /// Maximum events permitted per window
    pub quota: u64,
    /// Snap windows to multiples of the period since the Unix epoch
    #[serde(default)]
    pub align: bool,
    /// Namespace prepended to every counter key
    #[serde(default)]
    pub key_prefix: String,
}

fn default_period_secs() -> u64 {
    DEFAULT_PERIOD_SECS
}

impl PeriodLimitConfig {
    /// Create a free-running configuration. Sub-second parts of `period`
    /// are truncated.
    pub fn new(period: Duration, quota: u64) -> Self {
        Self {
            period_secs: period.as_secs(),
            quota,
            align: false,
            key_prefix: String::new(),
        }
    }

    /// Align windows to period boundaries.
    pub fn aligned(mut self) -> Self {
        self.align = true;
        self
    }

    /// Set the key namespace.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Window length.
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    /// Reject values that cannot be expressed in the store.
    pub fn validate(&self) -> Result<()> {
        validate_limits(self.period_secs, self.quota)
    }
}

fn validate_limits(period_secs: u64, quota: u64) -> Result<()> {
    if period_secs == 0 {
        return Err(QuotaError::Config(
            "period must be at least one second".to_string(),
        ));
    }
    if period_secs > MAX_TTL_SECS {
        return Err(QuotaError::Config(format!(
            "period of {} seconds is too long",
            period_secs
        )));
    }
    if quota == 0 {
        return Err(QuotaError::Config("quota must be positive".to_string()));
    }
    if i64::try_from(quota).is_err() {
        return Err(QuotaError::Config(format!("quota {} is too large", quota)));
    }
    Ok(())
}

/// Per-call overrides for [`PeriodLimiter::take_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TakeOptions {
    /// Window length used if this call creates the counter
    pub period: Option<Duration>,
    /// Quota the resulting count is classified against
    pub quota: Option<u64>,
}

impl TakeOptions {
    /// Override the window length.
    pub fn period(mut self, period: Duration) -> Self {
        self.period = Some(period);
        self
    }

    /// Override the quota.
    pub fn quota(mut self, quota: u64) -> Self {
        self.quota = Some(quota);
        self
    }
}

/// Outcome of a `take`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PeriodLimitStatus {
    /// The limiter could not decide, usually because the store failed
    #[default]
    Unknown,
    /// Below quota
    Allowed,
    /// This call consumed the last unit of quota
    HitQuota,
    /// Quota was already exhausted
    OverQuota,
}

impl PeriodLimitStatus {
    /// Classify a post-increment counter value.
    pub fn classify(count: u64, quota: u64) -> Self {
        match count.cmp(&quota) {
            std::cmp::Ordering::Less => PeriodLimitStatus::Allowed,
            std::cmp::Ordering::Equal => PeriodLimitStatus::HitQuota,
            std::cmp::Ordering::Greater => PeriodLimitStatus::OverQuota,
        }
    }

    /// Collapse a `take` result, mapping any error to `Unknown`.
    pub fn from_outcome(outcome: &Result<Self>) -> Self {
        match outcome {
            Ok(status) => *status,
            Err(_) => PeriodLimitStatus::Unknown,
        }
    }

    pub fn is_allowed(&self) -> bool {
        *self == PeriodLimitStatus::Allowed
    }

    pub fn is_hit_quota(&self) -> bool {
        *self == PeriodLimitStatus::HitQuota
    }

    pub fn is_over_quota(&self) -> bool {
        *self == PeriodLimitStatus::OverQuota
    }

    pub fn is_unknown(&self) -> bool {
        *self == PeriodLimitStatus::Unknown
    }
}

/// Counts events per `(kind, identifier)` within fixed windows.
///
/// The limiter holds no mutable state; clone the `Arc` handles freely and
/// share one limiter across tasks.
pub struct PeriodLimiter {
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
    config: PeriodLimitConfig,
}

impl std::fmt::Debug for PeriodLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PeriodLimiter {
    /// Create a limiter over `store`.
    pub fn new(store: Arc<dyn AtomicStore>, config: PeriodLimitConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            clock: Arc::new(SystemClock),
            config,
        })
    }

    /// Replace the clock used for window alignment.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The limiter configuration.
    pub fn config(&self) -> &PeriodLimitConfig {
        &self.config
    }

    /// The counter key for `(kind, identifier)`.
    pub fn key(&self, kind: &str, identifier: &str) -> LimitKey {
        LimitKey::new(&self.config.key_prefix, kind, identifier)
    }

    /// Count one event and classify it against the quota.
    pub async fn take(&self, kind: &str, identifier: &str) -> Result<PeriodLimitStatus> {
        self.take_with(kind, identifier, TakeOptions::default())
            .await
    }

    /// Count one event using per-call period and quota overrides.
    pub async fn take_with(
        &self,
        kind: &str,
        identifier: &str,
        options: TakeOptions,
    ) -> Result<PeriodLimitStatus> {
        let period_secs = options
            .period
            .map_or(self.config.period_secs, |p| p.as_secs());
        let quota = options.quota.unwrap_or(self.config.quota);
        validate_limits(period_secs, quota)?;

        let key = self.key(kind, identifier);
        let ttl = window_ttl(self.clock.now(), period_secs, self.config.align);

        trace!(key = %key, quota = quota, ttl = ttl, "Taking from period limit");

        let reply = self
            .store
            .execute(
                Procedure::PeriodIncrement,
                &[key.to_store_key()],
                &[ttl.to_string()],
            )
            .await
            .map_err(|e| {
                warn!(key = %key, error = %e, "Period limit take failed");
                e
            })?;

        let count = u64::try_from(reply)
            .ok()
            .filter(|count| *count > 0)
            .ok_or_else(|| {
                QuotaError::UnrecognizedResponse(format!("counter {} for {}", reply, key))
            })?;

        if count == 1 {
            debug!(key = %key, ttl = ttl, "Opened new period window");
        }

        let status = PeriodLimitStatus::classify(count, quota);
        match status {
            PeriodLimitStatus::HitQuota => {
                debug!(key = %key, count = count, quota = quota, "Period quota reached");
            }
            PeriodLimitStatus::OverQuota => {
                debug!(key = %key, count = count, quota = quota, "Period quota exceeded");
            }
            _ => {}
        }

        Ok(status)
    }

    /// Exhaust the current window: counter := quota, TTL := period.
    pub async fn set_quota_full(&self, kind: &str, identifier: &str) -> Result<()> {
        let key = self.key(kind, identifier);
        // Validated at construction to fit in an i64.
        let quota = self.config.quota as i64;

        debug!(key = %key, quota = quota, "Setting period quota full");
        self.store
            .set_with_ttl(&key.to_store_key(), quota, self.config.period_secs)
            .await
    }

    /// Drop the counter; the next `take` opens a fresh window.
    pub async fn del(&self, kind: &str, identifier: &str) -> Result<()> {
        let key = self.key(kind, identifier);
        trace!(key = %key, "Deleting period counter");
        self.store.delete(&key.to_store_key()).await
    }

    /// Read the current count without changing it.
    pub async fn get_int(&self, kind: &str, identifier: &str) -> Result<Option<u64>> {
        let key = self.key(kind, identifier);
        let Some(raw) = self.store.get(&key.to_store_key()).await? else {
            return Ok(None);
        };

        raw.parse::<u64>().map(Some).map_err(|_| {
            QuotaError::UnrecognizedResponse(format!("counter {:?} for {}", raw, key))
        })
    }

    /// Remaining lifetime of the current window.
    pub async fn ttl(&self, kind: &str, identifier: &str) -> Result<KeyTtl> {
        let key = self.key(kind, identifier);
        let reply = self.store.ttl(&key.to_store_key()).await?;
        KeyTtl::from_reply(reply)
    }
}
