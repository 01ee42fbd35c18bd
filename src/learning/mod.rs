//! Weekly Learning Loop
//!
//! Evaluates a trailing window of past decisions against the window
//! before it, classifies each target, extracts winning patterns that
//! clear a minimum sample size, and turns them into a strictly capped
//! set of clone decisions. The cap is the structural guard that keeps
//! the feedback loop from amplifying its own output.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use tracing::info;

use crate::audit::RunReport;
use crate::config::{LearningConfig, ScopeConfig};
use crate::decision::{ActionType, Decision};
use crate::signals::{ExistingState, TargetKey};

/// How a target moved between the two evaluation windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Improved,
    Regressed,
    Stable,
    /// Seen in only one of the two windows.
    Incomplete,
}

/// Aggregated performance of one target inside one window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetStats {
    pub impressions: u64,
    pub clicks: u64,
    pub position_sum: f64,
    pub samples: usize,
}

impl TargetStats {
    pub fn ctr(&self) -> f64 {
        if self.impressions == 0 {
            0.0
        } else {
            self.clicks as f64 / self.impressions as f64
        }
    }

    pub fn avg_position(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.position_sum / self.samples as f64
        }
    }
}

/// One target's evaluation across both windows.
#[derive(Debug, Clone)]
pub struct TargetEvaluation {
    pub key: TargetKey,
    pub current: TargetStats,
    pub previous: TargetStats,
    pub verdict: Verdict,
}

impl TargetEvaluation {
    pub fn ctr_delta(&self) -> f64 {
        self.current.ctr() - self.previous.ctr()
    }
}

/// Output of one weekly evaluation pass.
#[derive(Debug, Clone, Default)]
pub struct WeeklyReport {
    pub evaluations: Vec<TargetEvaluation>,
    /// Targets ranked by absolute CTR, best first.
    pub winners: Vec<TargetKey>,
}

impl WeeklyReport {
    pub fn counts(&self) -> (usize, usize, usize) {
        let improved =
            self.evaluations.iter().filter(|e| e.verdict == Verdict::Improved).count();
        let regressed =
            self.evaluations.iter().filter(|e| e.verdict == Verdict::Regressed).count();
        let stable = self.evaluations.iter().filter(|e| e.verdict == Verdict::Stable).count();
        (improved, regressed, stable)
    }
}

/// A generalized, sample-size-qualified description of a winning
/// service. Transient: recomputed every window, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub service: String,
    pub avg_ctr: f64,
    pub avg_position: f64,
    pub sample_size: usize,
    /// Locations the pattern could expand into, before the existing-
    /// state set difference is applied.
    pub expansion_locations: Vec<String>,
}

/// Fold decision metrics out of a window of audit reports, per target.
/// Decisions carry the signal metrics they were made from, so the audit
/// log is the only input the evaluation needs.
fn aggregate(reports: &[RunReport]) -> BTreeMap<TargetKey, TargetStats> {
    let mut stats: BTreeMap<TargetKey, TargetStats> = BTreeMap::new();
    for report in reports {
        for record in &report.decisions {
            let payload = &record.decision.payload;
            let entry = stats.entry(record.decision.target.clone()).or_default();
            entry.impressions += payload["impressions"].as_u64().unwrap_or(0);
            entry.clicks += payload["clicks"].as_u64().unwrap_or(0);
            entry.position_sum += payload["position"].as_f64().unwrap_or(0.0);
            entry.samples += 1;
        }
    }
    stats
}

/// Compare two adjacent windows of audit history.
pub fn evaluate(
    current_window: &[RunReport],
    previous_window: &[RunReport],
    config: &LearningConfig,
) -> WeeklyReport {
    let current = aggregate(current_window);
    let mut previous = aggregate(previous_window);

    let mut evaluations = Vec::new();
    for (key, cur) in current {
        let prev = previous.remove(&key);
        let (verdict, prev_stats) = match prev {
            None => (Verdict::Incomplete, TargetStats::default()),
            Some(prev_stats) => {
                let delta = cur.ctr() - prev_stats.ctr();
                let verdict = if delta >= config.ctr_delta {
                    Verdict::Improved
                } else if delta <= -config.ctr_delta {
                    Verdict::Regressed
                } else {
                    Verdict::Stable
                };
                (verdict, prev_stats)
            }
        };
        evaluations.push(TargetEvaluation { key, current: cur, previous: prev_stats, verdict });
    }
    // Targets that disappeared from the current window.
    for (key, prev_stats) in previous {
        evaluations.push(TargetEvaluation {
            key,
            current: TargetStats::default(),
            previous: prev_stats,
            verdict: Verdict::Incomplete,
        });
    }

    // Winners: improved targets ranked by absolute current CTR.
    let mut winners: Vec<&TargetEvaluation> =
        evaluations.iter().filter(|e| e.verdict == Verdict::Improved).collect();
    winners.sort_by(|a, b| {
        b.current
            .ctr()
            .partial_cmp(&a.current.ctr())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.key.cmp(&b.key))
    });
    let winners = winners.into_iter().map(|e| e.key.clone()).collect();

    WeeklyReport { evaluations, winners }
}

/// Group winners by service and keep only groups big enough to be a
/// real pattern rather than one-off noise.
pub fn extract_patterns(
    report: &WeeklyReport,
    scope: &ScopeConfig,
    config: &LearningConfig,
) -> Vec<Pattern> {
    let mut by_service: BTreeMap<String, Vec<&TargetEvaluation>> = BTreeMap::new();
    let winner_set: HashSet<&TargetKey> = report.winners.iter().collect();
    for evaluation in &report.evaluations {
        if winner_set.contains(&evaluation.key) {
            by_service.entry(evaluation.key.service.clone()).or_default().push(evaluation);
        }
    }

    let mut patterns = Vec::new();
    for (service, evaluations) in by_service {
        if evaluations.len() < config.min_sample_size {
            continue;
        }
        let sample_size = evaluations.len();
        let avg_ctr =
            evaluations.iter().map(|e| e.current.ctr()).sum::<f64>() / sample_size as f64;
        let avg_position = evaluations.iter().map(|e| e.current.avg_position()).sum::<f64>()
            / sample_size as f64;

        let covered: HashSet<&str> =
            evaluations.iter().map(|e| e.key.location.as_str()).collect();
        let expansion_locations: Vec<String> = scope
            .locations
            .iter()
            .map(|l| l.to_lowercase())
            .filter(|l| !covered.contains(l.as_str()))
            .take(config.max_expansion_locations)
            .collect();

        info!(
            "Pattern: '{}' wins in {} locations (avg ctr {:.3})",
            service, sample_size, avg_ctr
        );
        patterns.push(Pattern { service, avg_ctr, avg_position, sample_size, expansion_locations });
    }
    patterns
}

/// Turn patterns into clone decisions for uncovered locations. The
/// weekly cap bounds total output no matter how many patterns qualify;
/// this is the feedback loop's only write path back into future cycles.
pub fn decide_clones(
    patterns: &[Pattern],
    existing: &ExistingState,
    config: &LearningConfig,
) -> Vec<Decision> {
    let mut decisions = Vec::new();
    'outer: for pattern in patterns {
        for location in &pattern.expansion_locations {
            let target = TargetKey::new(&pattern.service, location);
            if existing.contains(&target) {
                continue;
            }
            decisions.push(Decision {
                action: ActionType::Clone,
                target,
                reason: format!(
                    "replicating '{}' pattern (avg ctr {:.3} across {} locations)",
                    pattern.service, pattern.avg_ctr, pattern.sample_size
                ),
                priority: pattern.avg_ctr * 1000.0 + pattern.sample_size as f64,
                payload: json!({
                    "impressions": 0,
                    "clicks": 0,
                    "position": 0.0,
                    "pattern": {
                        "service": pattern.service,
                        "avg_ctr": pattern.avg_ctr,
                        "avg_position": pattern.avg_position,
                        "sample_size": pattern.sample_size,
                    },
                }),
            });
            if decisions.len() >= config.weekly_clone_cap {
                break 'outer;
            }
        }
    }
    decisions
}
