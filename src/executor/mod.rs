//! Action Executor
//!
//! Dispatches decisions to their handlers in priority order under the
//! rate limiter's hard enforcement. Partial-failure tolerant: one bad
//! decision is recorded and the batch continues. A category that hits
//! its limit is skipped for the rest of the run without aborting the
//! others, and applied high-risk actions are separated by a cooldown.

mod handlers;
mod store;

pub use handlers::{
    ContentBrief, ContentGenerator, HttpContentGenerator, OutboxProposalSender, PageContent,
    PageStore, PageWriteHandler, ProposalSender, ProtectHandler, ProposeHandler,
    TemplateContentGenerator,
};
pub use store::JsonPageStore;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::audit::{DecisionOutcome, DecisionRecord};
use crate::decision::{ActionType, Decision};
use crate::safety::RateLimiter;

/// One handler per action variant, resolved through an explicit map;
/// exhaustiveness lives in the wiring, not in string tags.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn action(&self) -> ActionType;
    async fn handle(&self, decision: &Decision) -> Result<()>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<ActionType, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(handler.action(), handler);
    }

    pub fn get(&self, action: ActionType) -> Option<&Arc<dyn ActionHandler>> {
        self.handlers.get(&action)
    }
}

/// Execute a batch of decisions and report what happened to each.
///
/// Ordering: strictly descending priority across the whole batch, with
/// the target key breaking ties so replays are stable. The limiter is
/// re-checked per decision: the engine's batch caps are soft intents,
/// this is the hard gate. `dry_run` records intents without touching
/// the limiter or any handler.
pub async fn execute(
    decisions: Vec<Decision>,
    registry: &HandlerRegistry,
    limiter: &mut RateLimiter,
    cooldown: Duration,
    dry_run: bool,
) -> Vec<DecisionRecord> {
    let mut ordered = decisions;
    ordered.sort_by(|a, b| {
        b.priority
            .partial_cmp(&a.priority)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.target.cmp(&b.target))
    });

    let mut records = Vec::with_capacity(ordered.len());
    let mut breached: HashMap<String, String> = HashMap::new();
    let mut applied_high_risk: HashSet<String> = HashSet::new();

    for decision in ordered {
        let category = decision.action.category();

        if dry_run {
            info!(
                "[dry-run] would {} {} ({})",
                decision.action, decision.target, decision.reason
            );
            records.push(DecisionRecord {
                decision,
                outcome: DecisionOutcome::Skipped { reason: "dry-run".into() },
            });
            continue;
        }

        if let Some(reason) = breached.get(category) {
            records.push(DecisionRecord {
                decision,
                outcome: DecisionOutcome::Skipped { reason: reason.clone() },
            });
            continue;
        }

        let verdict = match limiter.check(category).await {
            Ok(v) => v,
            Err(e) => {
                warn!("rate limiter check failed for {category}: {e:#}");
                records.push(DecisionRecord {
                    decision,
                    outcome: DecisionOutcome::Failed { error: format!("{e:#}") },
                });
                continue;
            }
        };
        if !verdict.allowed {
            let reason = verdict.reason.unwrap_or_else(|| format!("{category}: rate limited"));
            warn!("Skipping remaining '{category}' actions: {reason}");
            breached.insert(category.to_string(), reason.clone());
            records.push(DecisionRecord {
                decision,
                outcome: DecisionOutcome::Skipped { reason },
            });
            continue;
        }

        let Some(handler) = registry.get(decision.action) else {
            records.push(DecisionRecord {
                decision,
                outcome: DecisionOutcome::Failed { error: "no handler registered".into() },
            });
            continue;
        };

        // Space out consecutive applied actions of a high-risk
        // category to avoid bursty external effects.
        if decision.action.is_high_risk()
            && applied_high_risk.contains(category)
            && !cooldown.is_zero()
        {
            tokio::time::sleep(cooldown).await;
        }

        match handler.handle(&decision).await {
            Ok(()) => {
                if let Err(e) = limiter.record(category).await {
                    warn!("failed to record consumption for {category}: {e:#}");
                }
                if decision.action.is_high_risk() {
                    applied_high_risk.insert(category.to_string());
                }
                info!("Applied {} {}", decision.action, decision.target);
                records.push(DecisionRecord { decision, outcome: DecisionOutcome::Applied });
            }
            Err(e) => {
                warn!("Handler for {} {} failed: {e:#}", decision.action, decision.target);
                records.push(DecisionRecord {
                    decision,
                    outcome: DecisionOutcome::Failed { error: format!("{e:#}") },
                });
            }
        }
    }

    records
}
