//! Decision Engine
//!
//! Pure, deterministic mapping from ingested signals plus the
//! existing-state snapshot to a prioritized list of typed decisions.
//! No I/O, no clocks, no randomness: identical inputs produce identical
//! output, order included. Each decision family is an independent
//! filter-and-score pass with its own thresholds and batch cap; the
//! freeze family runs first and its targets are withheld from every
//! family that would modify them in the same run.

mod families;

pub use families::{
    create_decisions, expand_decisions, freeze_decisions, propose_decisions, rewrite_decisions,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;

use crate::config::PilotConfig;
use crate::signals::{ExistingState, SignalRecord, TargetKey};

/// Closed set of actions the pipeline knows how to execute. Dispatch is
/// by variant, never by string tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Create,
    Rewrite,
    Expand,
    Freeze,
    Clone,
    Propose,
}

impl ActionType {
    /// Rate-limiter category for this action.
    pub fn category(&self) -> &'static str {
        match self {
            ActionType::Create => "create",
            ActionType::Rewrite => "rewrite",
            ActionType::Expand => "expand",
            ActionType::Freeze => "freeze",
            ActionType::Clone => "clone",
            ActionType::Propose => "propose",
        }
    }

    /// Whether applied decisions of this type need a cooldown pause
    /// between them to avoid bursty external effects.
    pub fn is_high_risk(&self) -> bool {
        matches!(self, ActionType::Propose)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.category())
    }
}

/// A single-use intent to perform one action. Never mutated after
/// creation; the executor records outcomes alongside, not inside.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub action: ActionType,
    pub target: TargetKey,
    pub reason: String,
    pub priority: f64,
    pub payload: Value,
}

/// Map signals and existing state to the run's decisions.
///
/// Sequencing contract: freeze decisions are computed first; their
/// targets, together with targets already frozen in the snapshot, are
/// excluded from the rewrite and expand families. Families appear in
/// output order freeze, create, rewrite, expand, propose, each sorted
/// descending by priority (target key breaks ties).
pub fn decide(
    signals: &[SignalRecord],
    existing: &ExistingState,
    config: &PilotConfig,
    proposals_enabled: bool,
) -> Vec<Decision> {
    let freezes = freeze_decisions(signals, existing, &config.freeze);

    let mut protected: HashSet<TargetKey> =
        freezes.iter().map(|d| d.target.clone()).collect();
    for record in signals {
        let key = record.key();
        if existing.is_frozen(&key) {
            protected.insert(key);
        }
    }

    let mut decisions = freezes;
    decisions.extend(create_decisions(signals, existing, &config.scope, &config.create));
    decisions.extend(rewrite_decisions(signals, existing, &protected, &config.rewrite));
    decisions.extend(expand_decisions(signals, existing, &protected, &config.expand));
    if proposals_enabled {
        decisions.extend(propose_decisions(signals, &config.scope, &config.propose));
    }
    decisions
}

/// Deterministic ordering shared by every family: priority descending,
/// target key ascending on ties, then truncated to the family cap.
pub(crate) fn rank_and_cap(mut decisions: Vec<Decision>, cap: usize) -> Vec<Decision> {
    decisions.sort_by(|a, b| {
        b.priority
            .partial_cmp(&a.priority)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.target.cmp(&b.target))
    });
    decisions.truncate(cap);
    decisions
}
