//! Decision Families
//!
//! One pure filter-and-score function per family. A record qualifies
//! only if it passes every hard gate; the score is used for ordering
//! inside the family, never as a gate. Each family truncates its own
//! output to its configured batch cap.

use serde_json::json;
use std::collections::HashSet;

use super::{rank_and_cap, ActionType, Decision};
use crate::config::{
    CreateThresholds, ExpandThresholds, FreezeThresholds, ProposeThresholds, RewriteThresholds,
    ScopeConfig,
};
use crate::signals::{ExistingState, SignalRecord, TargetKey};

fn metrics_payload(record: &SignalRecord) -> serde_json::Value {
    json!({
        "impressions": record.impressions,
        "clicks": record.clicks,
        "ctr": record.ctr(),
        "position": record.position,
    })
}

/// CREATE: a target with real demand, rankable position and no page yet.
pub fn create_decisions(
    signals: &[SignalRecord],
    existing: &ExistingState,
    scope: &ScopeConfig,
    thresholds: &CreateThresholds,
) -> Vec<Decision> {
    let decisions = signals
        .iter()
        .filter(|r| r.impressions >= thresholds.min_impressions)
        .filter(|r| r.position >= thresholds.min_position && r.position <= thresholds.max_position)
        .filter(|r| !existing.contains(&r.key()))
        .filter(|r| scope.allows(&r.service, &r.location))
        .map(|r| {
            let priority = r.impressions as f64 / 10.0
                + (thresholds.max_position - r.position) * thresholds.position_weight;
            Decision {
                action: ActionType::Create,
                target: r.key(),
                reason: format!(
                    "{} impressions at position {:.1} with no page",
                    r.impressions, r.position
                ),
                priority,
                payload: metrics_payload(r),
            }
        })
        .collect();
    rank_and_cap(decisions, thresholds.batch_cap)
}

/// REWRITE: an existing page that ranks but fails to convert
/// impressions into clicks.
pub fn rewrite_decisions(
    signals: &[SignalRecord],
    existing: &ExistingState,
    protected: &HashSet<TargetKey>,
    thresholds: &RewriteThresholds,
) -> Vec<Decision> {
    let decisions = signals
        .iter()
        .filter(|r| existing.contains(&r.key()))
        .filter(|r| !protected.contains(&r.key()))
        .filter(|r| r.impressions >= thresholds.min_impressions)
        .filter(|r| r.ctr() <= thresholds.max_ctr)
        .filter(|r| r.position <= thresholds.max_position)
        .map(|r| {
            let priority =
                (thresholds.max_ctr - r.ctr()) * 1000.0 + r.impressions as f64 / 10.0;
            Decision {
                action: ActionType::Rewrite,
                target: r.key(),
                reason: format!(
                    "ctr {:.3} under {:.3} despite position {:.1}",
                    r.ctr(),
                    thresholds.max_ctr,
                    r.position
                ),
                priority,
                payload: metrics_payload(r),
            }
        })
        .collect();
    rank_and_cap(decisions, thresholds.batch_cap)
}

/// EXPAND: an existing page converting well just outside the top
/// results; deepen its content to push it over the boundary.
pub fn expand_decisions(
    signals: &[SignalRecord],
    existing: &ExistingState,
    protected: &HashSet<TargetKey>,
    thresholds: &ExpandThresholds,
) -> Vec<Decision> {
    let decisions = signals
        .iter()
        .filter(|r| existing.contains(&r.key()))
        .filter(|r| !protected.contains(&r.key()))
        .filter(|r| r.impressions >= thresholds.min_impressions)
        .filter(|r| r.ctr() >= thresholds.min_ctr)
        .filter(|r| r.position >= thresholds.min_position && r.position <= thresholds.max_position)
        .map(|r| {
            let priority = r.ctr() * 500.0 + (thresholds.max_position - r.position) * 5.0;
            Decision {
                action: ActionType::Expand,
                target: r.key(),
                reason: format!(
                    "ctr {:.3} at position {:.1}, within reach of page one",
                    r.ctr(),
                    r.position
                ),
                priority,
                payload: metrics_payload(r),
            }
        })
        .collect();
    rank_and_cap(decisions, thresholds.batch_cap)
}

/// FREEZE: an already-winning page. Execution is a no-op protection
/// marker; the engine withholds frozen targets from modifying families.
pub fn freeze_decisions(
    signals: &[SignalRecord],
    existing: &ExistingState,
    thresholds: &FreezeThresholds,
) -> Vec<Decision> {
    let decisions = signals
        .iter()
        .filter(|r| existing.contains(&r.key()))
        .filter(|r| !existing.is_frozen(&r.key()))
        .filter(|r| r.impressions >= thresholds.min_impressions)
        .filter(|r| r.ctr() >= thresholds.min_ctr)
        .filter(|r| r.position <= thresholds.max_position)
        .map(|r| {
            let priority = r.ctr() * 100.0 + r.impressions as f64 / 10.0;
            Decision {
                action: ActionType::Freeze,
                target: r.key(),
                reason: format!(
                    "winning: ctr {:.3} at position {:.1}",
                    r.ctr(),
                    r.position
                ),
                priority,
                payload: metrics_payload(r),
            }
        })
        .collect();
    rank_and_cap(decisions, thresholds.batch_cap)
}

/// PROPOSE: a competitor outranks a target with proven demand, so emit an
/// outreach intent. Guarded mode only; the executor additionally holds
/// these to the durable daily quota.
pub fn propose_decisions(
    signals: &[SignalRecord],
    scope: &ScopeConfig,
    thresholds: &ProposeThresholds,
) -> Vec<Decision> {
    let decisions = signals
        .iter()
        .filter(|r| r.impressions >= thresholds.min_impressions)
        .filter(|r| scope.allows(&r.service, &r.location))
        .filter_map(|r| {
            let competitor = r.competitor.as_ref()?;
            let gap = r.position - competitor.position;
            if gap < thresholds.min_position_gap {
                return None;
            }
            let mut payload = metrics_payload(r);
            payload["competitor"] = json!({
                "name": competitor.name,
                "position": competitor.position,
                "gap": gap,
            });
            Some(Decision {
                action: ActionType::Propose,
                target: r.key(),
                reason: format!(
                    "'{}' at position {:.1} outranks us by {:.1}",
                    competitor.name, competitor.position, gap
                ),
                priority: gap * 10.0 + r.impressions as f64 / 10.0,
                payload,
            })
        })
        .collect();
    rank_and_cap(decisions, thresholds.batch_cap)
}
