//! Pipeline Orchestration
//!
//! The run loop every invocation follows: acquire the mode lock, pass
//! the kill-switch, ingest signals, snapshot existing state, decide,
//! execute under rate limits, append the audit record, release the
//! lock. Each invocation is one sequential pass; concurrency only
//! exists across invocations, which is what the lock is for.

mod lock;

pub use lock::{LockGuard, RunLock};

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditLog, DecisionOutcome, DecisionRecord, RunReport, SignalSummary};
use crate::config::PilotConfig;
use crate::decision::{decide, ActionType, Decision};
use crate::executor::{execute, HandlerRegistry, PageStore};
use crate::learning;
use crate::safety::{check_kill_switch, HealthMetrics, KillSwitchTrip, RateLimiter};
use crate::signals::{ingest, CompetitorSource, SignalSource};

/// Closed set of run profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Decide and record opportunities; execute nothing.
    Observe,
    /// Execute decisions under the full set of guardrails.
    Guarded,
    /// Decide and print; persist nothing.
    Analyze,
    /// Evaluate past outcomes and replicate winning patterns.
    Weekly,
}

impl Mode {
    pub const ALL: [Mode; 4] = [Mode::Observe, Mode::Guarded, Mode::Analyze, Mode::Weekly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Observe => "observe",
            Mode::Guarded => "guarded",
            Mode::Analyze => "analyze",
            Mode::Weekly => "weekly",
        }
    }

    pub fn lock_timeout(&self, config: &crate::config::LockConfig) -> Duration {
        let secs = match self {
            Mode::Observe => config.observe_timeout_secs,
            Mode::Guarded => config.guarded_timeout_secs,
            Mode::Analyze => config.analyze_timeout_secs,
            Mode::Weekly => config.weekly_timeout_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn valid_set() -> String {
        Mode::ALL
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown mode '{input}' (valid modes: {valid})")]
pub struct InvalidMode {
    pub input: String,
    pub valid: String,
}

impl FromStr for Mode {
    type Err = InvalidMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "observe" => Ok(Mode::Observe),
            "guarded" => Ok(Mode::Guarded),
            "analyze" => Ok(Mode::Analyze),
            "weekly" => Ok(Mode::Weekly),
            _ => Err(InvalidMode { input: s.to_string(), valid: Mode::valid_set() }),
        }
    }
}

/// Only the fatal class unwinds out of a run; everything else becomes
/// a structured outcome entry.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("kill-switch tripped: {0}")]
    KillSwitch(#[from] KillSwitchTrip),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// What a run produced, for the human-readable summary.
#[derive(Debug)]
pub struct RunSummary {
    pub mode: Mode,
    pub dry_run: bool,
    pub lock_held: bool,
    pub report: Option<RunReport>,
}

impl RunSummary {
    fn lock_held(mode: Mode) -> Self {
        Self { mode, dry_run: false, lock_held: true, report: None }
    }

    pub fn render(&self) -> String {
        if self.lock_held {
            return format!("[{}] another run holds the lock; nothing to do", self.mode);
        }
        let Some(report) = &self.report else {
            return format!("[{}] run produced no report", self.mode);
        };

        let mut out = String::new();
        out.push_str(&format!(
            "[{}] run {} finished in {}ms{}\n",
            self.mode,
            report.run_id,
            report.duration_ms,
            if self.dry_run { " (dry-run)" } else { "" }
        ));
        out.push_str(&format!(
            "  signals: {} records, {} impressions, {} clicks\n",
            report.signals.records, report.signals.impressions, report.signals.clicks
        ));

        for action in [
            ActionType::Freeze,
            ActionType::Create,
            ActionType::Rewrite,
            ActionType::Expand,
            ActionType::Clone,
            ActionType::Propose,
        ] {
            let count = report.decisions.iter().filter(|r| r.decision.action == action).count();
            if count > 0 {
                out.push_str(&format!("  {action}: {count} decision(s)\n"));
            }
        }

        let (applied, recorded, skipped, failed) = report.outcome_counts();
        out.push_str(&format!(
            "  outcomes: {applied} applied, {recorded} recorded, {skipped} skipped, {failed} failed\n"
        ));
        for record in &report.decisions {
            if let DecisionOutcome::Failed { error } = &record.outcome {
                out.push_str(&format!(
                    "    FAILED {} {}: {}\n",
                    record.decision.action, record.decision.target, error
                ));
            }
        }
        out
    }
}

/// The assembled pipeline: collaborators in, one `run` per invocation.
pub struct Pipeline {
    config: PilotConfig,
    sources: Vec<Arc<dyn SignalSource>>,
    competitors: Vec<Arc<dyn CompetitorSource>>,
    page_store: Arc<dyn PageStore>,
    registry: HandlerRegistry,
    audit: AuditLog,
    limiter: RateLimiter,
    lock: RunLock,
}

impl Pipeline {
    pub fn new(
        config: PilotConfig,
        sources: Vec<Arc<dyn SignalSource>>,
        competitors: Vec<Arc<dyn CompetitorSource>>,
        page_store: Arc<dyn PageStore>,
        registry: HandlerRegistry,
        counters: Arc<dyn crate::safety::CounterStore>,
    ) -> Self {
        let audit = AuditLog::new(&config.storage.audit_dir);
        let limiter = RateLimiter::new(config.limits.clone(), counters)
            .with_durable_quota("propose", config.propose.daily_quota);
        let lock = RunLock::new(&config.storage.lock_dir);
        Self { config, sources, competitors, page_store, registry, audit, limiter, lock }
    }

    /// One full invocation. The lock guard is released on every path
    /// out of here, including the kill-switch abort and a cancelled
    /// future; that is what the guard's drop is for.
    pub async fn run(&mut self, mode: Mode, dry_run: bool) -> Result<RunSummary, PipelineError> {
        let timeout = mode.lock_timeout(&self.config.locks);
        let Some(mut guard) = self.lock.acquire(mode, timeout)? else {
            info!("[{}] lock held by a live run; exiting cleanly", mode);
            return Ok(RunSummary::lock_held(mode));
        };

        let result = self.run_locked(mode, dry_run).await;
        guard.release();
        result
    }

    async fn run_locked(&mut self, mode: Mode, dry_run: bool) -> Result<RunSummary, PipelineError> {
        let started = Instant::now();

        // The kill-switch is the very first gate after the lock.
        let metrics = self.health_metrics().await?;
        check_kill_switch(metrics.as_ref(), &self.config.kill_switch)?;

        let report = match mode {
            Mode::Weekly => self.run_weekly(dry_run, started).await?,
            _ => self.run_daily(mode, dry_run, started).await?,
        };

        if !dry_run && mode != Mode::Analyze {
            self.audit.append(&report).await?;
        }

        Ok(RunSummary { mode, dry_run, lock_held: false, report: Some(report) })
    }

    /// Aggregate the two adjacent comparison windows from the audit log
    /// across the signal-bearing modes.
    async fn health_metrics(&self) -> Result<Option<HealthMetrics>> {
        let days = self.config.kill_switch.comparison_days;
        let today = Utc::now().date_naive();
        let prior_end = today - ChronoDuration::days(days);

        let mut current = Vec::new();
        let mut previous = Vec::new();
        for mode in [Mode::Observe, Mode::Guarded] {
            current.extend(self.audit.load_window(mode, days, today).await?);
            previous.extend(self.audit.load_window(mode, days, prior_end).await?);
        }
        Ok(HealthMetrics::from_reports(&current, &previous))
    }

    async fn run_daily(
        &mut self,
        mode: Mode,
        dry_run: bool,
        started: Instant,
    ) -> Result<RunReport, PipelineError> {
        let timeout = Duration::from_secs(self.config.ingestion.fetch_timeout_secs);
        let signals = ingest(&self.sources, &self.competitors, timeout).await;
        info!("[{}] ingested {} signal records", mode, signals.len());

        let existing = self
            .page_store
            .existing_state()
            .await
            .context("failed to snapshot existing state")?;

        let proposals_enabled = mode == Mode::Guarded;
        let mut decisions = decide(&signals, &existing, &self.config, proposals_enabled);

        if mode == Mode::Guarded {
            let merged = self.merge_observer_decisions(&mut decisions, &existing).await?;
            if merged > 0 {
                info!("[guarded] merged {merged} opportunity decision(s) from today's observer run");
            }
        }

        let records = match mode {
            // The observer records opportunities; execution belongs to
            // the guarded run that reads them back.
            Mode::Observe => decisions
                .into_iter()
                .map(|decision| DecisionRecord { decision, outcome: DecisionOutcome::Recorded })
                .collect(),
            Mode::Analyze => {
                for decision in &decisions {
                    info!(
                        "[analyze] {} {} (priority {:.1}): {}",
                        decision.action, decision.target, decision.priority, decision.reason
                    );
                }
                decisions
                    .into_iter()
                    .map(|decision| DecisionRecord { decision, outcome: DecisionOutcome::Recorded })
                    .collect()
            }
            _ => {
                let cooldown = Duration::from_secs(self.config.propose.cooldown_secs);
                execute(decisions, &self.registry, &mut self.limiter, cooldown, dry_run).await
            }
        };

        Ok(RunReport {
            run_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            mode,
            dry_run,
            signals: SignalSummary::from_signals(&signals),
            decisions: records,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Pull today's observer record and adopt decisions this run did
    /// not independently derive. Targets that gained a page since the
    /// observer ran are dropped.
    async fn merge_observer_decisions(
        &self,
        decisions: &mut Vec<Decision>,
        existing: &crate::signals::ExistingState,
    ) -> Result<usize> {
        let today = Utc::now().date_naive();
        let Some(observer) = self.audit.latest_today(Mode::Observe, today).await? else {
            return Ok(0);
        };

        let seen: HashSet<(ActionType, String)> = decisions
            .iter()
            .map(|d| (d.action, d.target.to_string()))
            .collect();

        let mut merged = 0;
        for record in observer.decisions {
            let decision = record.decision;
            if seen.contains(&(decision.action, decision.target.to_string())) {
                continue;
            }
            if matches!(decision.action, ActionType::Create | ActionType::Clone)
                && existing.contains(&decision.target)
            {
                continue;
            }
            decisions.push(decision);
            merged += 1;
        }
        Ok(merged)
    }

    async fn run_weekly(
        &mut self,
        dry_run: bool,
        started: Instant,
    ) -> Result<RunReport, PipelineError> {
        let window = self.config.learning.window_days;
        let today = Utc::now().date_naive();
        let prior_end = today - ChronoDuration::days(window);

        let mut current = Vec::new();
        let mut previous = Vec::new();
        for mode in [Mode::Observe, Mode::Guarded] {
            current.extend(self.audit.load_window(mode, window, today).await?);
            previous.extend(self.audit.load_window(mode, window, prior_end).await?);
        }

        let report = learning::evaluate(&current, &previous, &self.config.learning);
        let (improved, regressed, stable) = report.counts();
        info!("[weekly] evaluated {} target(s): {improved} improved, {regressed} regressed, {stable} stable",
            report.evaluations.len());

        let patterns =
            learning::extract_patterns(&report, &self.config.scope, &self.config.learning);
        let existing = self
            .page_store
            .existing_state()
            .await
            .context("failed to snapshot existing state")?;
        let clones = learning::decide_clones(&patterns, &existing, &self.config.learning);
        if clones.is_empty() {
            info!("[weekly] no clone decisions this week");
        }

        let cooldown = Duration::from_secs(self.config.propose.cooldown_secs);
        let records = execute(clones, &self.registry, &mut self.limiter, cooldown, dry_run).await;

        if patterns.is_empty() && !current.is_empty() {
            warn!("[weekly] winners present but no pattern cleared the sample-size bar");
        }

        Ok(RunReport {
            run_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            mode: Mode::Weekly,
            dry_run,
            signals: SignalSummary::default(),
            decisions: records,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}
