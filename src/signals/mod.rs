//! Signal Ingestion
//!
//! Collaborator boundary for performance intelligence: ranking metrics
//! and competitor positions, normalized into `SignalRecord`s keyed by
//! (service, location). Sources are interchangeable, carry their own
//! timeouts, and degrade to an empty set on failure; ingestion is
//! never a run-aborting path.

mod http;

pub use http::{HttpCompetitorSource, HttpMetricsSource};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Canonical identifier for one (service, location) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetKey {
    pub service: String,
    pub location: String,
}

impl TargetKey {
    pub fn new(service: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            service: service.into().to_lowercase(),
            location: location.into().to_lowercase(),
        }
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.location)
    }
}

/// A competitor observed ranking for the same target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompetitorRank {
    pub name: String,
    pub position: f64,
}

/// One measured performance fact about a (service, location) pair.
/// Immutable once ingested.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalRecord {
    pub service: String,
    pub location: String,
    pub impressions: u64,
    pub clicks: u64,
    pub position: f64,
    #[serde(default)]
    pub competitor: Option<CompetitorRank>,
    pub fetched_at: DateTime<Utc>,
}

impl SignalRecord {
    pub fn key(&self) -> TargetKey {
        TargetKey::new(&self.service, &self.location)
    }

    /// Click-through rate; zero when there were no impressions.
    pub fn ctr(&self) -> f64 {
        if self.impressions == 0 {
            0.0
        } else {
            self.clicks as f64 / self.impressions as f64
        }
    }
}

/// Set of targets already handled (a page exists or is frozen).
/// Fetched fresh at the start of each run; read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct ExistingState {
    targets: HashSet<TargetKey>,
    frozen: HashSet<TargetKey>,
}

impl ExistingState {
    pub fn new(targets: HashSet<TargetKey>, frozen: HashSet<TargetKey>) -> Self {
        Self { targets, frozen }
    }

    pub fn contains(&self, key: &TargetKey) -> bool {
        self.targets.contains(key)
    }

    pub fn is_frozen(&self, key: &TargetKey) -> bool {
        self.frozen.contains(key)
    }

    pub fn targets(&self) -> &HashSet<TargetKey> {
        &self.targets
    }
}

/// A source of ranking signals. Implementations must not panic and
/// should return an error rather than hang; the ingestion layer wraps
/// every fetch in its own timeout.
#[async_trait]
pub trait SignalSource: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch(&self) -> Result<Vec<SignalRecord>>;
}

/// A source of competitor positions, merged into signal records by
/// target key after ingestion.
#[async_trait]
pub trait CompetitorSource: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch(&self) -> Result<Vec<CompetitorObservation>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompetitorObservation {
    pub service: String,
    pub location: String,
    pub competitor: CompetitorRank,
}

/// Fetch every signal source concurrently, each under `timeout`.
/// A failed or timed-out source contributes nothing; the run continues
/// with reduced scope.
pub async fn ingest(
    sources: &[Arc<dyn SignalSource>],
    competitors: &[Arc<dyn CompetitorSource>],
    timeout: Duration,
) -> Vec<SignalRecord> {
    let signal_futs = sources.iter().map(|source| async move {
        match tokio::time::timeout(timeout, source.fetch()).await {
            Ok(Ok(records)) => records,
            Ok(Err(e)) => {
                warn!("signal source '{}' failed: {e:#}", source.name());
                Vec::new()
            }
            Err(_) => {
                warn!("signal source '{}' timed out after {timeout:?}", source.name());
                Vec::new()
            }
        }
    });
    let mut records: Vec<SignalRecord> = join_all(signal_futs).await.into_iter().flatten().collect();

    let competitor_futs = competitors.iter().map(|source| async move {
        match tokio::time::timeout(timeout, source.fetch()).await {
            Ok(Ok(observations)) => observations,
            Ok(Err(e)) => {
                warn!("competitor source '{}' failed: {e:#}", source.name());
                Vec::new()
            }
            Err(_) => {
                warn!("competitor source '{}' timed out after {timeout:?}", source.name());
                Vec::new()
            }
        }
    });
    let observations: Vec<CompetitorObservation> =
        join_all(competitor_futs).await.into_iter().flatten().collect();

    merge_competitors(&mut records, observations);
    records
}

/// Attach competitor observations to matching signal records. The
/// closest-ranked competitor wins when a target has several.
fn merge_competitors(records: &mut [SignalRecord], observations: Vec<CompetitorObservation>) {
    if observations.is_empty() {
        return;
    }
    let mut by_key: HashMap<TargetKey, CompetitorRank> = HashMap::new();
    for obs in observations {
        let key = TargetKey::new(&obs.service, &obs.location);
        match by_key.get(&key) {
            Some(existing) if existing.position <= obs.competitor.position => {}
            _ => {
                by_key.insert(key, obs.competitor);
            }
        }
    }
    for record in records.iter_mut() {
        if let Some(rank) = by_key.get(&record.key()) {
            record.competitor = Some(rank.clone());
        }
    }
}
