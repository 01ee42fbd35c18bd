//! Pilot Configuration
//!
//! Every threshold the pipeline consults lives here: decision-family
//! gates, rate-limit maxes, lock timeouts, kill-switch fractions and
//! batch caps. Loaded from a YAML file with per-field defaults, plus
//! environment overrides for paths and endpoints.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for a pilot deployment.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PilotConfig {
    pub storage: StorageConfig,
    pub ingestion: IngestionConfig,
    pub scope: ScopeConfig,
    pub create: CreateThresholds,
    pub rewrite: RewriteThresholds,
    pub expand: ExpandThresholds,
    pub freeze: FreezeThresholds,
    pub propose: ProposeThresholds,
    pub limits: RateLimitConfig,
    pub locks: LockConfig,
    pub kill_switch: KillSwitchConfig,
    pub learning: LearningConfig,
}

/// Where the pipeline keeps its own durable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for per-day audit records (JSONL).
    pub audit_dir: PathBuf,
    /// Directory for per-mode lock files.
    pub lock_dir: PathBuf,
    /// SQLite database for durable daily counters.
    pub counter_db: PathBuf,
    /// Page-state file used by the default page store.
    pub page_state: PathBuf,
    /// JSONL outbox consumed by the (external) proposal transport.
    pub proposal_outbox: PathBuf,
    /// Directory for rolling log files.
    pub log_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            audit_dir: PathBuf::from("data/audit"),
            lock_dir: PathBuf::from("data/locks"),
            counter_db: PathBuf::from("data/counters.db"),
            page_state: PathBuf::from("data/pages.json"),
            proposal_outbox: PathBuf::from("data/outbox.jsonl"),
            log_dir: PathBuf::from("data/logs"),
        }
    }
}

/// Collaborator endpoints for signal ingestion and content generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Ranking-metrics endpoint; empty disables the adapter.
    pub metrics_endpoint: Option<String>,
    /// Competitor-position endpoint; empty disables the adapter.
    pub competitor_endpoint: Option<String>,
    /// Content-generation endpoint; empty falls back to templates.
    pub generator_endpoint: Option<String>,
    /// Per-call timeout for all collaborator I/O.
    pub fetch_timeout_secs: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            metrics_endpoint: None,
            competitor_endpoint: None,
            generator_endpoint: None,
            fetch_timeout_secs: 10,
        }
    }
}

/// Allow-list restricting which (service, location) pairs the pipeline
/// may act on. Empty lists mean "no restriction", useful for local
/// testing, never for production rollout.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ScopeConfig {
    pub services: Vec<String>,
    pub locations: Vec<String>,
}

impl ScopeConfig {
    pub fn allows(&self, service: &str, location: &str) -> bool {
        let service_ok =
            self.services.is_empty() || self.services.iter().any(|s| s.eq_ignore_ascii_case(service));
        let location_ok = self.locations.is_empty()
            || self.locations.iter().any(|l| l.eq_ignore_ascii_case(location));
        service_ok && location_ok
    }
}

/// Gates and scoring for the CREATE family.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateThresholds {
    pub min_impressions: u64,
    /// Inclusive position band a candidate must fall inside.
    pub min_position: f64,
    pub max_position: f64,
    /// Weight applied to (max_position - position) in the score.
    pub position_weight: f64,
    pub batch_cap: usize,
}

impl Default for CreateThresholds {
    fn default() -> Self {
        Self {
            min_impressions: 100,
            min_position: 5.0,
            max_position: 30.0,
            position_weight: 2.0,
            batch_cap: 5,
        }
    }
}

/// Gates for the REWRITE family: pages that rank but fail to convert
/// impressions into clicks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewriteThresholds {
    pub min_impressions: u64,
    /// CTR at or below this fraction qualifies for a rewrite.
    pub max_ctr: f64,
    /// Only rewrite pages still inside striking distance.
    pub max_position: f64,
    pub batch_cap: usize,
}

impl Default for RewriteThresholds {
    fn default() -> Self {
        Self {
            min_impressions: 200,
            max_ctr: 0.01,
            max_position: 20.0,
            batch_cap: 3,
        }
    }
}

/// Gates for the EXPAND family: pages converting well just off page one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpandThresholds {
    pub min_impressions: u64,
    pub min_ctr: f64,
    pub min_position: f64,
    pub max_position: f64,
    pub batch_cap: usize,
}

impl Default for ExpandThresholds {
    fn default() -> Self {
        Self {
            min_impressions: 50,
            min_ctr: 0.03,
            min_position: 8.0,
            max_position: 15.0,
            batch_cap: 3,
        }
    }
}

/// Gates for the FREEZE family: already-winning pages to protect from
/// every other family this run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FreezeThresholds {
    pub min_impressions: u64,
    pub min_ctr: f64,
    /// A page at or above (numerically at or below) this position wins.
    pub max_position: f64,
    pub batch_cap: usize,
}

impl Default for FreezeThresholds {
    fn default() -> Self {
        Self {
            min_impressions: 50,
            min_ctr: 0.05,
            max_position: 5.0,
            batch_cap: 10,
        }
    }
}

/// Gates for the PROPOSE family (guarded mode only): outward outreach
/// where a competitor outranks a converting page of ours.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProposeThresholds {
    pub min_impressions: u64,
    /// Competitor must outrank us by at least this many positions.
    pub min_position_gap: f64,
    pub batch_cap: usize,
    /// Hard daily quota, enforced through the durable counter store.
    pub daily_quota: u32,
    /// Pause between applied proposals.
    pub cooldown_secs: u64,
}

impl Default for ProposeThresholds {
    fn default() -> Self {
        Self {
            min_impressions: 150,
            min_position_gap: 3.0,
            batch_cap: 2,
            daily_quota: 10,
            cooldown_secs: 30,
        }
    }
}

/// Sliding-window maxes per action category.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryLimit {
    pub hourly_max: u32,
    pub daily_max: u32,
}

impl Default for CategoryLimit {
    fn default() -> Self {
        Self {
            hourly_max: 10,
            daily_max: 40,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub create: CategoryLimit,
    pub rewrite: CategoryLimit,
    pub expand: CategoryLimit,
    pub clone_pages: CategoryLimit,
    pub propose: CategoryLimit,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            create: CategoryLimit { hourly_max: 5, daily_max: 20 },
            rewrite: CategoryLimit { hourly_max: 3, daily_max: 10 },
            expand: CategoryLimit { hourly_max: 3, daily_max: 10 },
            clone_pages: CategoryLimit { hourly_max: 5, daily_max: 10 },
            propose: CategoryLimit { hourly_max: 2, daily_max: 10 },
        }
    }
}

impl RateLimitConfig {
    /// Look up the limit for a category; unknown categories are
    /// unlimited, matching the limiter's default-allow behavior.
    pub fn for_category(&self, category: &str) -> Option<&CategoryLimit> {
        match category {
            "create" => Some(&self.create),
            "rewrite" => Some(&self.rewrite),
            "expand" => Some(&self.expand),
            "clone" => Some(&self.clone_pages),
            "propose" => Some(&self.propose),
            _ => None,
        }
    }
}

/// Per-mode stale-lock timeouts: short for frequent runs, long for the
/// weekly pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub observe_timeout_secs: u64,
    pub guarded_timeout_secs: u64,
    pub analyze_timeout_secs: u64,
    pub weekly_timeout_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            observe_timeout_secs: 30 * 60,
            guarded_timeout_secs: 60 * 60,
            analyze_timeout_secs: 30 * 60,
            weekly_timeout_secs: 6 * 60 * 60,
        }
    }
}

/// Abort thresholds for the pre-flight safety gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSwitchConfig {
    /// Abort if clicks dropped by at least this fraction vs. the prior
    /// comparison window.
    pub max_click_drop: f64,
    /// Abort if outward submissions failed at or above this fraction.
    pub max_error_rate: f64,
    /// Abort if impressions rose by this fraction while clicks fell by
    /// `diverging_click_drop` at the same time.
    pub diverging_impression_rise: f64,
    pub diverging_click_drop: f64,
    /// Days per comparison window when aggregating audit history.
    pub comparison_days: i64,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            max_click_drop: 0.4,
            max_error_rate: 0.3,
            diverging_impression_rise: 0.2,
            diverging_click_drop: 0.2,
            comparison_days: 7,
        }
    }
}

/// Weekly evaluation window and pattern-extraction bars.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Days in each of the two adjacent evaluation windows.
    pub window_days: i64,
    /// CTR delta separating improved/regressed from stable.
    pub ctr_delta: f64,
    /// Minimum distinct targets before a pattern counts as real.
    pub min_sample_size: usize,
    /// Hard cap on clone decisions per weekly run.
    pub weekly_clone_cap: usize,
    /// Most expansion locations considered per pattern.
    pub max_expansion_locations: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            window_days: 7,
            ctr_delta: 0.005,
            min_sample_size: 3,
            weekly_clone_cap: 10,
            max_expansion_locations: 5,
        }
    }
}

impl PilotConfig {
    /// Load configuration from a YAML file, or defaults when no path is
    /// given. Environment variables override storage paths and
    /// collaborator endpoints after the file is applied.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read config file {}", p.display()))?;
                serde_yaml::from_str(&raw)
                    .with_context(|| format!("invalid config file {}", p.display()))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("AUTOPILOT_DATA_DIR") {
            let base = PathBuf::from(dir);
            self.storage.audit_dir = base.join("audit");
            self.storage.lock_dir = base.join("locks");
            self.storage.counter_db = base.join("counters.db");
            self.storage.page_state = base.join("pages.json");
            self.storage.proposal_outbox = base.join("outbox.jsonl");
            self.storage.log_dir = base.join("logs");
        }
        if let Ok(url) = std::env::var("AUTOPILOT_METRICS_URL") {
            self.ingestion.metrics_endpoint = Some(url);
        }
        if let Ok(url) = std::env::var("AUTOPILOT_COMPETITOR_URL") {
            self.ingestion.competitor_endpoint = Some(url);
        }
        if let Ok(url) = std::env::var("AUTOPILOT_GENERATOR_URL") {
            self.ingestion.generator_endpoint = Some(url);
        }
    }
}
