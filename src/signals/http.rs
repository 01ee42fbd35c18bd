//! HTTP Signal Adapters
//!
//! Thin reqwest clients for the ranking-metrics and competitor-rank
//! collaborators. Both expect a JSON array body; the wire shape is the
//! collaborator's contract, normalized here into pipeline types.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{CompetitorObservation, CompetitorRank, CompetitorSource, SignalRecord, SignalSource};

/// Wire shape returned by the ranking-metrics collaborator.
#[derive(Debug, Deserialize)]
struct MetricsRow {
    service: String,
    location: String,
    impressions: u64,
    clicks: u64,
    position: f64,
}

/// Ranking metrics over HTTP (e.g. a search-console proxy).
pub struct HttpMetricsSource {
    client: Client,
    endpoint: String,
}

impl HttpMetricsSource {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl SignalSource for HttpMetricsSource {
    fn name(&self) -> &str {
        "ranking-metrics"
    }

    async fn fetch(&self) -> Result<Vec<SignalRecord>> {
        debug!("Fetching ranking metrics from {}", self.endpoint);
        let rows: Vec<MetricsRow> = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .context("metrics request failed")?
            .error_for_status()
            .context("metrics endpoint returned error status")?
            .json()
            .await
            .context("metrics response was not valid JSON")?;

        let fetched_at = Utc::now();
        Ok(rows
            .into_iter()
            .map(|row| SignalRecord {
                service: row.service,
                location: row.location,
                impressions: row.impressions,
                clicks: row.clicks,
                position: row.position,
                competitor: None,
                fetched_at,
            })
            .collect())
    }
}

/// Wire shape returned by the competitor-rank collaborator.
#[derive(Debug, Deserialize)]
struct CompetitorRow {
    service: String,
    location: String,
    competitor: String,
    position: f64,
}

/// Competitor positions over HTTP.
pub struct HttpCompetitorSource {
    client: Client,
    endpoint: String,
}

impl HttpCompetitorSource {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl CompetitorSource for HttpCompetitorSource {
    fn name(&self) -> &str {
        "competitor-ranks"
    }

    async fn fetch(&self) -> Result<Vec<CompetitorObservation>> {
        debug!("Fetching competitor ranks from {}", self.endpoint);
        let rows: Vec<CompetitorRow> = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .context("competitor request failed")?
            .error_for_status()
            .context("competitor endpoint returned error status")?
            .json()
            .await
            .context("competitor response was not valid JSON")?;

        Ok(rows
            .into_iter()
            .map(|row| CompetitorObservation {
                service: row.service,
                location: row.location,
                competitor: CompetitorRank {
                    name: row.competitor,
                    position: row.position,
                },
            })
            .collect())
    }
}
