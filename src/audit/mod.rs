//! Audit Log
//!
//! Append-only, per-day per-mode JSONL records of every run: the
//! decisions taken, their outcomes and an aggregate signal summary.
//! This is the pipeline's only long-term memory: a later guarded run
//! reads the observer's same-day record, the kill-switch aggregates a
//! trailing window, and the weekly learning pass mines it for patterns.
//!
//! Writes use advisory file locking with bounded retries so overlapping
//! readers and the single writer of a day file cannot corrupt lines.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs as tokio_fs;
use tracing::debug;
use uuid::Uuid;

#[cfg(unix)]
use fs2::FileExt;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use crate::decision::Decision;
use crate::pipeline::Mode;

const MAX_LOCK_RETRIES: usize = 10;
const LOCK_RETRY_SLEEP: Duration = Duration::from_millis(100);

/// Outcome of one decision inside a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DecisionOutcome {
    /// Handler ran and the action was applied.
    Applied,
    /// Recorded as an opportunity without execution (observer mode).
    Recorded,
    /// Not executed; the reason says why (rate limit, dry-run, ...).
    Skipped { reason: String },
    /// Handler failed; the run continued.
    Failed { error: String },
}

/// A decision paired with what happened to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    #[serde(flatten)]
    pub decision: Decision,
    pub outcome: DecisionOutcome,
}

/// Aggregate view of the signals a run ingested, kept small enough to
/// sum cheaply across a trailing window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalSummary {
    pub records: usize,
    pub impressions: u64,
    pub clicks: u64,
    pub avg_position: f64,
}

impl SignalSummary {
    pub fn from_signals(signals: &[crate::signals::SignalRecord]) -> Self {
        let records = signals.len();
        let impressions = signals.iter().map(|s| s.impressions).sum();
        let clicks = signals.iter().map(|s| s.clicks).sum();
        let avg_position = if records == 0 {
            0.0
        } else {
            signals.iter().map(|s| s.position).sum::<f64>() / records as f64
        };
        Self { records, impressions, clicks, avg_position }
    }
}

/// One structured record per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub mode: Mode,
    pub dry_run: bool,
    pub signals: SignalSummary,
    pub decisions: Vec<DecisionRecord>,
    pub duration_ms: u64,
}

impl RunReport {
    /// Count decisions by outcome class: (applied, recorded, skipped, failed).
    pub fn outcome_counts(&self) -> (usize, usize, usize, usize) {
        let mut counts = (0, 0, 0, 0);
        for record in &self.decisions {
            match record.outcome {
                DecisionOutcome::Applied => counts.0 += 1,
                DecisionOutcome::Recorded => counts.1 += 1,
                DecisionOutcome::Skipped { .. } => counts.2 += 1,
                DecisionOutcome::Failed { .. } => counts.3 += 1,
            }
        }
        counts
    }
}

/// Append-only store of run reports, one JSONL file per mode per day.
#[derive(Debug, Clone)]
pub struct AuditLog {
    dir: PathBuf,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn day_file(&self, mode: Mode, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}-{}.jsonl", mode.as_str(), date.format("%Y-%m-%d")))
    }

    /// Append one report to its day file under an exclusive advisory
    /// lock, retrying briefly if another writer holds it.
    pub async fn append(&self, report: &RunReport) -> Result<()> {
        tokio_fs::create_dir_all(&self.dir).await?;

        let path = self.day_file(report.mode, report.timestamp.date_naive());
        let mut line = serde_json::to_string(report).context("failed to serialize run report")?;
        line.push('\n');

        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);
        #[cfg(unix)]
        {
            options.append(true);
            options.mode(0o600);
        }
        let mut file = options.open(&path)?;

        tokio::task::spawn_blocking(move || -> Result<()> {
            for _ in 0..MAX_LOCK_RETRIES {
                #[cfg(unix)]
                match file.try_lock_exclusive() {
                    Ok(()) => {
                        file.seek(SeekFrom::End(0))?;
                        file.write_all(line.as_bytes())?;
                        file.flush()?;
                        let _ = fs2::FileExt::unlock(&file);
                        return Ok(());
                    }
                    Err(_) => {
                        std::thread::sleep(LOCK_RETRY_SLEEP);
                    }
                }
                #[cfg(not(unix))]
                {
                    file.seek(SeekFrom::End(0))?;
                    file.write_all(line.as_bytes())?;
                    file.flush()?;
                    return Ok(());
                }
            }
            anyhow::bail!("could not acquire exclusive lock on audit file")
        })
        .await??;

        debug!("Appended run {} to audit log", report.run_id);
        Ok(())
    }

    /// All reports for one mode on one day, oldest first. A missing day
    /// file is an empty day, not an error.
    pub async fn load_day(&self, mode: Mode, date: NaiveDate) -> Result<Vec<RunReport>> {
        let path = self.day_file(mode, date);
        Self::read_reports(&path).await
    }

    /// Reports for a mode across a trailing window of `days` ending at
    /// `until` (inclusive), oldest first.
    pub async fn load_window(
        &self,
        mode: Mode,
        days: i64,
        until: NaiveDate,
    ) -> Result<Vec<RunReport>> {
        let mut reports = Vec::new();
        for offset in (0..days).rev() {
            let date = until - ChronoDuration::days(offset);
            reports.extend(self.load_day(mode, date).await?);
        }
        Ok(reports)
    }

    /// Most recent same-day report for a mode, if any. This is the
    /// observer-to-guarded handoff read path.
    pub async fn latest_today(&self, mode: Mode, today: NaiveDate) -> Result<Option<RunReport>> {
        Ok(self.load_day(mode, today).await?.into_iter().last())
    }

    async fn read_reports(path: &Path) -> Result<Vec<RunReport>> {
        if !tokio_fs::try_exists(path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let content = tokio_fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read audit file {}", path.display()))?;
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
