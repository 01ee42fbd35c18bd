//! Rate Limiter
//!
//! Sliding-window limits per action category: a rolling hour and a
//! rolling day of consumption timestamps, pruned lazily before every
//! check. Categories are independent; exhausting one never blocks
//! another. Categories with a durable daily quota are additionally
//! checked against the counter store, which survives restarts.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use super::counters::{day_key, CounterStore};
use crate::config::RateLimitConfig;

/// Result of a limit check. `reason` is human-readable and ends up in
/// the audit record for skipped decisions.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl Verdict {
    fn allow() -> Self {
        Self { allowed: true, reason: None }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self { allowed: false, reason: Some(reason.into()) }
    }
}

#[derive(Debug, Default)]
struct ConsumptionWindows {
    hour: Vec<DateTime<Utc>>,
    day: Vec<DateTime<Utc>>,
}

impl ConsumptionWindows {
    fn prune(&mut self, now: DateTime<Utc>) {
        let hour_floor = now - Duration::hours(1);
        let day_floor = now - Duration::days(1);
        self.hour.retain(|t| *t > hour_floor);
        self.day.retain(|t| *t > day_floor);
    }
}

/// Per-category sliding-window limiter with optional durable daily
/// quotas.
pub struct RateLimiter {
    windows: HashMap<String, ConsumptionWindows>,
    config: RateLimitConfig,
    counters: Arc<dyn CounterStore>,
    /// category -> hard daily quota enforced through the counter store.
    durable_quotas: HashMap<String, u32>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, counters: Arc<dyn CounterStore>) -> Self {
        Self {
            windows: HashMap::new(),
            config,
            counters,
            durable_quotas: HashMap::new(),
        }
    }

    /// Enforce a durable daily quota for a category in addition to its
    /// sliding windows.
    pub fn with_durable_quota(mut self, category: impl Into<String>, quota: u32) -> Self {
        self.durable_quotas.insert(category.into(), quota);
        self
    }

    pub async fn check(&mut self, category: &str) -> Result<Verdict> {
        self.check_at(category, Utc::now()).await
    }

    /// Check with an explicit clock, used by tests to simulate decay.
    pub async fn check_at(&mut self, category: &str, now: DateTime<Utc>) -> Result<Verdict> {
        let Some(limit) = self.config.for_category(category) else {
            // Unconfigured categories are unlimited, like the freeze
            // marker, where nothing external is consumed.
            return Ok(Verdict::allow());
        };
        let limit = limit.clone();

        let windows = self.windows.entry(category.to_string()).or_default();
        windows.prune(now);

        if windows.hour.len() >= limit.hourly_max as usize {
            return Ok(Verdict::deny(format!(
                "{category}: hourly limit of {} reached",
                limit.hourly_max
            )));
        }
        if windows.day.len() >= limit.daily_max as usize {
            return Ok(Verdict::deny(format!(
                "{category}: daily limit of {} reached",
                limit.daily_max
            )));
        }

        if let Some(quota) = self.durable_quotas.get(category) {
            let consumed = self.counters.get(&day_key(category, now.date_naive())).await?;
            if consumed >= *quota as i64 {
                return Ok(Verdict::deny(format!(
                    "{category}: durable daily quota of {quota} reached ({consumed} recorded)"
                )));
            }
        }

        Ok(Verdict::allow())
    }

    pub async fn record(&mut self, category: &str) -> Result<()> {
        self.record_at(category, Utc::now()).await
    }

    pub async fn record_at(&mut self, category: &str, now: DateTime<Utc>) -> Result<()> {
        let windows = self.windows.entry(category.to_string()).or_default();
        windows.hour.push(now);
        windows.day.push(now);

        if self.durable_quotas.contains_key(category) {
            self.counters.increment(&day_key(category, now.date_naive())).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CategoryLimit;
    use crate::safety::MemoryCounterStore;

    fn limiter() -> RateLimiter {
        let config = RateLimitConfig {
            create: CategoryLimit { hourly_max: 3, daily_max: 5 },
            ..Default::default()
        };
        RateLimiter::new(config, Arc::new(MemoryCounterStore::new()))
    }

    #[tokio::test]
    async fn denies_after_hourly_max_and_recovers() {
        let mut limiter = limiter();
        let start = Utc::now();

        for _ in 0..3 {
            assert!(limiter.check_at("create", start).await.unwrap().allowed);
            limiter.record_at("create", start).await.unwrap();
        }
        let verdict = limiter.check_at("create", start).await.unwrap();
        assert!(!verdict.allowed);
        assert!(verdict.reason.unwrap().contains("hourly"));

        // Simulated clock: once the hour window decays, checks pass.
        let later = start + Duration::minutes(61);
        assert!(limiter.check_at("create", later).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn daily_window_outlasts_hourly() {
        let mut limiter = limiter();
        let start = Utc::now();

        // 5 consumptions spread over hours exhaust the daily max.
        for i in 0..5 {
            let at = start + Duration::hours(i * 2);
            assert!(limiter.check_at("create", at).await.unwrap().allowed);
            limiter.record_at("create", at).await.unwrap();
        }
        let at = start + Duration::hours(10);
        let verdict = limiter.check_at("create", at).await.unwrap();
        assert!(!verdict.allowed);
        assert!(verdict.reason.unwrap().contains("daily"));
    }

    #[tokio::test]
    async fn categories_are_independent() {
        let mut limiter = limiter();
        let now = Utc::now();

        for _ in 0..3 {
            limiter.record_at("create", now).await.unwrap();
        }
        assert!(!limiter.check_at("create", now).await.unwrap().allowed);
        assert!(limiter.check_at("rewrite", now).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn unconfigured_category_is_unlimited() {
        let mut limiter = limiter();
        let now = Utc::now();
        for _ in 0..100 {
            limiter.record_at("freeze", now).await.unwrap();
        }
        assert!(limiter.check_at("freeze", now).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn durable_quota_counts_preexisting_consumption() {
        let store = Arc::new(MemoryCounterStore::new());
        let now = Utc::now();

        // Simulate consumption recorded by a previous process today.
        let key = day_key("propose", now.date_naive());
        for _ in 0..2 {
            store.increment(&key).await.unwrap();
        }

        let config = RateLimitConfig {
            propose: CategoryLimit { hourly_max: 10, daily_max: 10 },
            ..Default::default()
        };
        let mut limiter = RateLimiter::new(config, store).with_durable_quota("propose", 2);

        // In-memory windows are empty, but the durable quota is spent.
        let verdict = limiter.check_at("propose", now).await.unwrap();
        assert!(!verdict.allowed);
        assert!(verdict.reason.unwrap().contains("durable daily quota"));
    }
}
