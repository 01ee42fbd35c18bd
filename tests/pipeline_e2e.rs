//! End-to-end pipeline scenarios with mock collaborators: signal
//! sources, page store and content generator are all in-memory, so the
//! only real I/O is the pipeline's own state (locks, audit, counters).

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

use seo_autopilot::audit::{
    AuditLog, DecisionOutcome, DecisionRecord, RunReport, SignalSummary,
};
use seo_autopilot::config::PilotConfig;
use seo_autopilot::decision::{ActionType, Decision};
use seo_autopilot::executor::{
    ContentGenerator, ContentBrief, HandlerRegistry, PageContent, PageStore, PageWriteHandler,
    ProposeHandler, ProtectHandler, ProposalSender,
};
use seo_autopilot::pipeline::{Mode, Pipeline, PipelineError, RunLock};
use seo_autopilot::safety::MemoryCounterStore;
use seo_autopilot::signals::{
    ExistingState, SignalRecord, SignalSource, TargetKey,
};

// ──────────────────────────────────────────────────────────────────────────────
// MOCK COLLABORATORS
// ──────────────────────────────────────────────────────────────────────────────

struct StaticSignals(Vec<SignalRecord>);

#[async_trait]
impl SignalSource for StaticSignals {
    fn name(&self) -> &str {
        "static-signals"
    }
    async fn fetch(&self) -> Result<Vec<SignalRecord>> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
struct MemoryPageStore {
    pages: Mutex<HashMap<String, PageContent>>,
    frozen: Mutex<HashSet<String>>,
}

#[async_trait]
impl PageStore for MemoryPageStore {
    async fn existing_state(&self) -> Result<ExistingState> {
        let targets = self
            .pages
            .lock()
            .unwrap()
            .keys()
            .map(|k| parse_key(k))
            .collect();
        let frozen = self.frozen.lock().unwrap().iter().map(|k| parse_key(k)).collect();
        Ok(ExistingState::new(targets, frozen))
    }

    async fn upsert_page(&self, target: &TargetKey, content: &PageContent) -> Result<()> {
        self.pages.lock().unwrap().insert(target.to_string(), content.clone());
        Ok(())
    }

    async fn mark_frozen(&self, target: &TargetKey) -> Result<()> {
        self.frozen.lock().unwrap().insert(target.to_string());
        Ok(())
    }
}

fn parse_key(key: &str) -> TargetKey {
    let (service, location) = key.split_once(':').expect("well-formed key");
    TargetKey::new(service, location)
}

struct MockGenerator;

#[async_trait]
impl ContentGenerator for MockGenerator {
    async fn generate(&self, brief: &ContentBrief) -> Result<PageContent> {
        Ok(PageContent {
            title: format!("{} copy", brief.target),
            description: "generated".into(),
            body: "generated".into(),
        })
    }
}

#[derive(Default)]
struct CollectingSender {
    sent: Mutex<Vec<TargetKey>>,
}

#[async_trait]
impl ProposalSender for CollectingSender {
    async fn send(&self, decision: &Decision) -> Result<()> {
        self.sent.lock().unwrap().push(decision.target.clone());
        Ok(())
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// SCENARIO HELPERS
// ──────────────────────────────────────────────────────────────────────────────

fn test_config(dir: &TempDir) -> PilotConfig {
    let mut config = PilotConfig::default();
    config.storage.audit_dir = dir.path().join("audit");
    config.storage.lock_dir = dir.path().join("locks");
    config.storage.counter_db = dir.path().join("counters.db");
    config.storage.page_state = dir.path().join("pages.json");
    config.storage.proposal_outbox = dir.path().join("outbox.jsonl");
    config.storage.log_dir = dir.path().join("logs");
    config.propose.cooldown_secs = 0;
    config
}

fn signal(service: &str, location: &str, impressions: u64, clicks: u64, position: f64) -> SignalRecord {
    SignalRecord {
        service: service.into(),
        location: location.into(),
        impressions,
        clicks,
        position,
        competitor: None,
        fetched_at: Utc::now(),
    }
}

fn pipeline_with(
    config: PilotConfig,
    signals: Vec<SignalRecord>,
    store: Arc<MemoryPageStore>,
    sender: Arc<CollectingSender>,
) -> Pipeline {
    let generator: Arc<dyn ContentGenerator> = Arc::new(MockGenerator);
    let page_store: Arc<dyn PageStore> = store;

    let mut registry = HandlerRegistry::new();
    for action in [ActionType::Create, ActionType::Rewrite, ActionType::Expand, ActionType::Clone] {
        registry.register(Arc::new(PageWriteHandler::new(
            action,
            generator.clone(),
            page_store.clone(),
        )));
    }
    registry.register(Arc::new(ProtectHandler::new(page_store.clone())));
    registry.register(Arc::new(ProposeHandler::new(sender)));

    let sources: Vec<Arc<dyn SignalSource>> = vec![Arc::new(StaticSignals(signals))];
    Pipeline::new(
        config,
        sources,
        Vec::new(),
        page_store,
        registry,
        Arc::new(MemoryCounterStore::new()),
    )
}

fn seeded_report(
    mode: Mode,
    days_ago: i64,
    decisions: Vec<(&str, &str, u64, u64, f64)>,
    clicks: u64,
    impressions: u64,
) -> RunReport {
    RunReport {
        run_id: Uuid::new_v4(),
        timestamp: Utc::now() - ChronoDuration::days(days_ago),
        mode,
        dry_run: false,
        signals: SignalSummary {
            records: decisions.len(),
            impressions,
            clicks,
            avg_position: 10.0,
        },
        decisions: decisions
            .into_iter()
            .map(|(service, location, imp, clk, pos)| DecisionRecord {
                decision: Decision {
                    action: ActionType::Rewrite,
                    target: TargetKey::new(service, location),
                    reason: "seeded".into(),
                    priority: 1.0,
                    payload: serde_json::json!({
                        "impressions": imp,
                        "clicks": clk,
                        "position": pos,
                    }),
                },
                outcome: DecisionOutcome::Applied,
            })
            .collect(),
        duration_ms: 1,
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// SCENARIOS
// ──────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn observer_records_then_guarded_executes() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let store = Arc::new(MemoryPageStore::default());
    let sender = Arc::new(CollectingSender::default());
    let signals = vec![signal("plumbing", "Austin", 150, 5, 12.0)];

    // Observer pass: decision recorded, nothing executed.
    let mut observer = pipeline_with(config.clone(), signals.clone(), store.clone(), sender.clone());
    let summary = observer.run(Mode::Observe, false).await.unwrap();
    let report = summary.report.expect("observer report");
    assert_eq!(report.decisions.len(), 1);
    assert!(matches!(report.decisions[0].outcome, DecisionOutcome::Recorded));
    assert!(store.pages.lock().unwrap().is_empty());

    // Guarded pass with no fresh signals still picks up the observer's
    // opportunity and executes it.
    let mut guarded = pipeline_with(config, Vec::new(), store.clone(), sender);
    let summary = guarded.run(Mode::Guarded, false).await.unwrap();
    let report = summary.report.expect("guarded report");
    assert_eq!(report.decisions.len(), 1);
    assert!(matches!(report.decisions[0].outcome, DecisionOutcome::Applied));
    assert!(store.pages.lock().unwrap().contains_key("plumbing:austin"));
}

#[tokio::test]
async fn create_is_not_repeated_once_page_exists() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let store = Arc::new(MemoryPageStore::default());
    let sender = Arc::new(CollectingSender::default());
    let signals = vec![signal("plumbing", "Austin", 150, 5, 12.0)];

    let mut pipeline = pipeline_with(config.clone(), signals.clone(), store.clone(), sender.clone());
    pipeline.run(Mode::Guarded, false).await.unwrap();
    assert_eq!(store.pages.lock().unwrap().len(), 1);

    // Second run sees the page in the existing-state snapshot.
    let mut pipeline = pipeline_with(config, signals, store.clone(), sender);
    let summary = pipeline.run(Mode::Guarded, false).await.unwrap();
    let report = summary.report.unwrap();
    assert!(report
        .decisions
        .iter()
        .all(|r| r.decision.action != ActionType::Create));
}

#[tokio::test]
async fn dry_run_suppresses_all_persistence() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let audit_dir = config.storage.audit_dir.clone();
    let store = Arc::new(MemoryPageStore::default());
    let sender = Arc::new(CollectingSender::default());
    let signals = vec![signal("plumbing", "Austin", 150, 5, 12.0)];

    let mut pipeline = pipeline_with(config, signals, store.clone(), sender.clone());
    let summary = pipeline.run(Mode::Guarded, true).await.unwrap();
    let report = summary.report.unwrap();

    assert!(matches!(
        &report.decisions[0].outcome,
        DecisionOutcome::Skipped { reason } if reason == "dry-run"
    ));
    assert!(store.pages.lock().unwrap().is_empty());
    assert!(sender.sent.lock().unwrap().is_empty());
    assert!(!audit_dir.exists());
}

#[tokio::test]
async fn kill_switch_aborts_and_releases_lock() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    // Seed audit history: healthy prior window, collapsed current one.
    let audit = AuditLog::new(&config.storage.audit_dir);
    audit
        .append(&seeded_report(Mode::Guarded, 8, vec![("plumbing", "austin", 1000, 100, 8.0)], 100, 1000))
        .await
        .unwrap();
    audit
        .append(&seeded_report(Mode::Guarded, 0, vec![("plumbing", "austin", 1000, 10, 8.0)], 10, 1000))
        .await
        .unwrap();

    let store = Arc::new(MemoryPageStore::default());
    let sender = Arc::new(CollectingSender::default());
    let mut pipeline = pipeline_with(
        config.clone(),
        vec![signal("plumbing", "Austin", 150, 5, 12.0)],
        store.clone(),
        sender,
    );

    let err = pipeline.run(Mode::Guarded, false).await.unwrap_err();
    assert!(matches!(err, PipelineError::KillSwitch(_)));
    // No work happened after the gate.
    assert!(store.pages.lock().unwrap().is_empty());
    // The lock was released on the abort path.
    let lock = RunLock::new(&config.storage.lock_dir);
    assert!(lock.acquire(Mode::Guarded, Duration::from_secs(60)).unwrap().is_some());
}

#[tokio::test]
async fn lock_contention_is_a_clean_noop() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let store = Arc::new(MemoryPageStore::default());
    let sender = Arc::new(CollectingSender::default());

    // Hold the lock as if another invocation were mid-run.
    let lock = RunLock::new(&config.storage.lock_dir);
    let _held = lock.acquire(Mode::Observe, Duration::from_secs(60)).unwrap().unwrap();

    let mut pipeline = pipeline_with(
        config,
        vec![signal("plumbing", "Austin", 150, 5, 12.0)],
        store,
        sender,
    );
    let summary = pipeline.run(Mode::Observe, false).await.unwrap();
    assert!(summary.lock_held);
    assert!(summary.report.is_none());
}

#[tokio::test]
async fn weekly_run_clones_winning_patterns_under_cap() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.scope.locations =
        vec!["austin".into(), "dallas".into(), "waco".into(), "laredo".into(), "elpaso".into()];
    config.learning.min_sample_size = 2;
    config.learning.weekly_clone_cap = 2;

    let audit = AuditLog::new(&config.storage.audit_dir);
    for (days_ago, clicks) in [(8, 10), (0, 50)] {
        // Both plumbing targets improve ctr 0.01 -> 0.05 between windows.
        audit
            .append(&seeded_report(
                Mode::Guarded,
                days_ago,
                vec![
                    ("plumbing", "austin", 1000, clicks, 8.0),
                    ("plumbing", "dallas", 1000, clicks, 8.0),
                ],
                2 * clicks,
                2000,
            ))
            .await
            .unwrap();
    }

    let store = Arc::new(MemoryPageStore::default());
    store
        .upsert_page(
            &TargetKey::new("plumbing", "austin"),
            &PageContent { title: "t".into(), description: "d".into(), body: "b".into() },
        )
        .await
        .unwrap();
    store
        .upsert_page(
            &TargetKey::new("plumbing", "dallas"),
            &PageContent { title: "t".into(), description: "d".into(), body: "b".into() },
        )
        .await
        .unwrap();

    let sender = Arc::new(CollectingSender::default());
    let mut pipeline = pipeline_with(config, Vec::new(), store.clone(), sender);
    let summary = pipeline.run(Mode::Weekly, false).await.unwrap();
    let report = summary.report.unwrap();

    // Clone decisions capped at 2 despite three uncovered locations.
    let clones: Vec<_> = report
        .decisions
        .iter()
        .filter(|r| r.decision.action == ActionType::Clone)
        .collect();
    assert_eq!(clones.len(), 2);
    assert!(clones.iter().all(|r| matches!(r.outcome, DecisionOutcome::Applied)));
    // Only previously uncovered locations were written.
    let pages = store.pages.lock().unwrap();
    assert_eq!(pages.len(), 4);
    assert!(pages.contains_key("plumbing:waco"));
    assert!(pages.contains_key("plumbing:laredo"));
    assert!(!pages.contains_key("plumbing:elpaso"));
}
