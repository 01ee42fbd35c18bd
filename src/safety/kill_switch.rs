//! Safety Kill-Switch
//!
//! Pre-flight gate comparing two adjacent windows of audit history.
//! Trips on a click collapse, an excessive outward-submission error
//! rate, or the suspicious combination of impressions rising while
//! clicks fall. A trip is fatal for the whole run (no retries, no partial
//! execution), but the lock is still released by its guard.
//! With no history at all the gate passes open.

use thiserror::Error;
use tracing::{debug, info};

use crate::audit::{DecisionOutcome, RunReport};
use crate::config::KillSwitchConfig;

/// Distinguished fatal error: the run must abort immediately.
#[derive(Debug, Error, PartialEq)]
pub enum KillSwitchTrip {
    #[error(
        "click volume collapsed: {current} clicks vs {previous} in the prior window \
         ({drop_fraction:.2} drop, limit {limit:.2})"
    )]
    ClickCollapse {
        current: u64,
        previous: u64,
        drop_fraction: f64,
        limit: f64,
    },

    #[error("submission error rate {rate:.2} at or above {limit:.2} ({failures}/{attempts})")]
    SubmissionErrors {
        failures: u64,
        attempts: u64,
        rate: f64,
        limit: f64,
    },

    #[error(
        "diverging trend: impressions up {impression_rise:.2} while clicks down {click_drop:.2}"
    )]
    DivergingTrend { impression_rise: f64, click_drop: f64 },
}

/// Aggregates over the current and prior comparison windows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthMetrics {
    pub current_clicks: u64,
    pub previous_clicks: u64,
    pub current_impressions: u64,
    pub previous_impressions: u64,
    pub submission_attempts: u64,
    pub submission_failures: u64,
}

impl HealthMetrics {
    /// Aggregate two adjacent windows of run reports. Returns `None`
    /// when both windows are empty: a fresh deployment with no
    /// history, which must pass open.
    pub fn from_reports(current: &[RunReport], previous: &[RunReport]) -> Option<Self> {
        if current.is_empty() && previous.is_empty() {
            return None;
        }

        let mut metrics = HealthMetrics::default();
        for report in current {
            metrics.current_clicks += report.signals.clicks;
            metrics.current_impressions += report.signals.impressions;
            for record in &report.decisions {
                match record.outcome {
                    DecisionOutcome::Applied => metrics.submission_attempts += 1,
                    DecisionOutcome::Failed { .. } => {
                        metrics.submission_attempts += 1;
                        metrics.submission_failures += 1;
                    }
                    _ => {}
                }
            }
        }
        for report in previous {
            metrics.previous_clicks += report.signals.clicks;
            metrics.previous_impressions += report.signals.impressions;
        }
        Some(metrics)
    }
}

/// The first gate of every run. `metrics = None` (no history) passes
/// open rather than blocking a fresh deployment forever.
pub fn check_kill_switch(
    metrics: Option<&HealthMetrics>,
    config: &KillSwitchConfig,
) -> Result<(), KillSwitchTrip> {
    let Some(m) = metrics else {
        info!("Kill-switch: no history available, passing open");
        return Ok(());
    };

    let click_drop = fraction_drop(m.previous_clicks, m.current_clicks);
    if m.previous_clicks > 0 && click_drop >= config.max_click_drop {
        return Err(KillSwitchTrip::ClickCollapse {
            current: m.current_clicks,
            previous: m.previous_clicks,
            drop_fraction: click_drop,
            limit: config.max_click_drop,
        });
    }

    if m.submission_attempts > 0 {
        let rate = m.submission_failures as f64 / m.submission_attempts as f64;
        if rate >= config.max_error_rate {
            return Err(KillSwitchTrip::SubmissionErrors {
                failures: m.submission_failures,
                attempts: m.submission_attempts,
                rate,
                limit: config.max_error_rate,
            });
        }
    }

    let impression_rise = fraction_rise(m.previous_impressions, m.current_impressions);
    if m.previous_impressions > 0
        && m.previous_clicks > 0
        && impression_rise >= config.diverging_impression_rise
        && click_drop >= config.diverging_click_drop
    {
        return Err(KillSwitchTrip::DivergingTrend {
            impression_rise,
            click_drop,
        });
    }

    debug!(
        "Kill-switch: healthy (click drop {:.2}, impression rise {:.2})",
        click_drop, impression_rise
    );
    Ok(())
}

fn fraction_drop(previous: u64, current: u64) -> f64 {
    if previous == 0 || current >= previous {
        0.0
    } else {
        (previous - current) as f64 / previous as f64
    }
}

fn fraction_rise(previous: u64, current: u64) -> f64 {
    if previous == 0 || current <= previous {
        0.0
    } else {
        (current - previous) as f64 / previous as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy() -> HealthMetrics {
        HealthMetrics {
            current_clicks: 100,
            previous_clicks: 100,
            current_impressions: 2000,
            previous_impressions: 2000,
            submission_attempts: 10,
            submission_failures: 0,
        }
    }

    #[test]
    fn passes_open_with_no_history() {
        assert!(check_kill_switch(None, &KillSwitchConfig::default()).is_ok());
    }

    #[test]
    fn healthy_metrics_pass() {
        assert!(check_kill_switch(Some(&healthy()), &KillSwitchConfig::default()).is_ok());
    }

    #[test]
    fn trips_at_click_drop_threshold() {
        let config = KillSwitchConfig::default();
        let mut m = healthy();
        // Exactly the configured fraction: 100 -> 60 with limit 0.4.
        m.current_clicks = 60;
        let err = check_kill_switch(Some(&m), &config).unwrap_err();
        assert!(matches!(err, KillSwitchTrip::ClickCollapse { .. }));

        // Strictly below the threshold passes.
        m.current_clicks = 61;
        assert!(check_kill_switch(Some(&m), &config).is_ok());
    }

    #[test]
    fn trips_on_submission_error_rate() {
        let mut m = healthy();
        m.submission_attempts = 10;
        m.submission_failures = 3;
        let err = check_kill_switch(Some(&m), &KillSwitchConfig::default()).unwrap_err();
        assert!(matches!(err, KillSwitchTrip::SubmissionErrors { .. }));
    }

    #[test]
    fn trips_on_diverging_trend() {
        let mut m = healthy();
        // Impressions up 25%, clicks down 25%, each below its solo
        // threshold, together suspicious.
        m.current_impressions = 2500;
        m.current_clicks = 75;
        let err = check_kill_switch(Some(&m), &KillSwitchConfig::default()).unwrap_err();
        assert!(matches!(err, KillSwitchTrip::DivergingTrend { .. }));
    }

    #[test]
    fn zero_previous_clicks_passes_open() {
        let mut m = healthy();
        m.previous_clicks = 0;
        m.current_clicks = 0;
        assert!(check_kill_switch(Some(&m), &KillSwitchConfig::default()).is_ok());
    }
}
