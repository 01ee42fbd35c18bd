//! Action Handlers
//!
//! One handler per action variant, each a thin bridge to a collaborator
//! boundary: the content generator produces structured page copy, the
//! page store applies it to the underlying site, and proposals go to an
//! outbox for the (out-of-scope) delivery transport. Handlers return
//! errors, never panic outward.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::ActionHandler;
use crate::decision::{ActionType, Decision};
use crate::signals::{ExistingState, TargetKey};

/// Input to the content generator: what to write and why.
#[derive(Debug, Clone, Serialize)]
pub struct ContentBrief {
    pub target: TargetKey,
    pub action: ActionType,
    pub notes: String,
}

/// Structured copy returned by the generator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageContent {
    pub title: String,
    pub description: String,
    pub body: String,
}

/// Opaque content-generation collaborator.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, brief: &ContentBrief) -> Result<PageContent>;
}

/// The underlying page store: serves the existing-state snapshot and
/// applies page writes and freeze markers keyed by target.
#[async_trait]
pub trait PageStore: Send + Sync {
    async fn existing_state(&self) -> Result<ExistingState>;
    async fn upsert_page(&self, target: &TargetKey, content: &PageContent) -> Result<()>;
    async fn mark_frozen(&self, target: &TargetKey) -> Result<()>;
}

/// Outward proposal delivery boundary.
#[async_trait]
pub trait ProposalSender: Send + Sync {
    async fn send(&self, decision: &Decision) -> Result<()>;
}

/// Generate-then-apply handler shared by every page-writing family
/// (create, rewrite, expand, clone); each registration carries its own
/// action variant.
pub struct PageWriteHandler {
    action: ActionType,
    generator: Arc<dyn ContentGenerator>,
    store: Arc<dyn PageStore>,
}

impl PageWriteHandler {
    pub fn new(
        action: ActionType,
        generator: Arc<dyn ContentGenerator>,
        store: Arc<dyn PageStore>,
    ) -> Self {
        Self { action, generator, store }
    }
}

#[async_trait]
impl ActionHandler for PageWriteHandler {
    fn action(&self) -> ActionType {
        self.action
    }

    async fn handle(&self, decision: &Decision) -> Result<()> {
        let brief = ContentBrief {
            target: decision.target.clone(),
            action: decision.action,
            notes: decision.reason.clone(),
        };
        let content = self
            .generator
            .generate(&brief)
            .await
            .with_context(|| format!("content generation failed for {}", decision.target))?;
        self.store
            .upsert_page(&decision.target, &content)
            .await
            .with_context(|| format!("page apply failed for {}", decision.target))
    }
}

/// FREEZE execution: a protection marker on the store, nothing else.
pub struct ProtectHandler {
    store: Arc<dyn PageStore>,
}

impl ProtectHandler {
    pub fn new(store: Arc<dyn PageStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ActionHandler for ProtectHandler {
    fn action(&self) -> ActionType {
        ActionType::Freeze
    }

    async fn handle(&self, decision: &Decision) -> Result<()> {
        self.store.mark_frozen(&decision.target).await
    }
}

/// PROPOSE execution: hand the intent to the delivery boundary.
pub struct ProposeHandler {
    sender: Arc<dyn ProposalSender>,
}

impl ProposeHandler {
    pub fn new(sender: Arc<dyn ProposalSender>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl ActionHandler for ProposeHandler {
    fn action(&self) -> ActionType {
        ActionType::Propose
    }

    async fn handle(&self, decision: &Decision) -> Result<()> {
        self.sender.send(decision).await
    }
}

/// Content generation over HTTP: POST the brief, get structured copy.
pub struct HttpContentGenerator {
    client: Client,
    endpoint: String,
}

impl HttpContentGenerator {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::builder().timeout(timeout).build().unwrap_or_default(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ContentGenerator for HttpContentGenerator {
    async fn generate(&self, brief: &ContentBrief) -> Result<PageContent> {
        debug!("Requesting content for {} from {}", brief.target, self.endpoint);
        self.client
            .post(&self.endpoint)
            .json(brief)
            .send()
            .await
            .context("generator request failed")?
            .error_for_status()
            .context("generator returned error status")?
            .json()
            .await
            .context("generator response was not valid page content")
    }
}

/// Deterministic template fallback used when no generator endpoint is
/// configured. Good enough for dry runs and local rollouts.
#[derive(Default)]
pub struct TemplateContentGenerator;

#[async_trait]
impl ContentGenerator for TemplateContentGenerator {
    async fn generate(&self, brief: &ContentBrief) -> Result<PageContent> {
        let service = &brief.target.service;
        let location = &brief.target.location;
        Ok(PageContent {
            title: format!("{service} in {location}"),
            description: format!("Trusted local {service} serving {location} and nearby areas."),
            body: format!(
                "Looking for {service} in {location}? Our vetted local pros respond fast, \
                 quote up front and guarantee their work."
            ),
        })
    }
}

/// Appends proposal intents to a JSONL outbox for the out-of-scope
/// delivery transport. Single writer per run (the mode lock), so a
/// plain append suffices.
pub struct OutboxProposalSender {
    path: PathBuf,
}

impl OutboxProposalSender {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ProposalSender for OutboxProposalSender {
    async fn send(&self, decision: &Decision) -> Result<()> {
        let entry = json!({
            "queued_at": Utc::now(),
            "target": decision.target,
            "reason": decision.reason,
            "payload": decision.payload,
        });
        let path = self.path.clone();
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(line.as_bytes())?;
            file.flush()?;
            Ok(())
        })
        .await??;
        debug!("Queued proposal for {}", decision.target);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::TempDir;

    fn decision(action: ActionType) -> Decision {
        Decision {
            action,
            target: TargetKey::new("plumbing", "austin"),
            reason: "test".into(),
            priority: 1.0,
            payload: Value::Null,
        }
    }

    #[tokio::test]
    async fn template_generator_is_deterministic() {
        let generator = TemplateContentGenerator;
        let brief = ContentBrief {
            target: TargetKey::new("plumbing", "austin"),
            action: ActionType::Create,
            notes: String::new(),
        };
        let first = generator.generate(&brief).await.unwrap();
        let second = generator.generate(&brief).await.unwrap();
        assert_eq!(first, second);
        assert!(first.title.contains("plumbing"));
        assert!(first.title.contains("austin"));
    }

    #[tokio::test]
    async fn outbox_appends_one_line_per_proposal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("outbox.jsonl");
        let sender = OutboxProposalSender::new(&path);

        sender.send(&decision(ActionType::Propose)).await.unwrap();
        sender.send(&decision(ActionType::Propose)).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        let entry: Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(entry["target"]["service"], "plumbing");
    }
}
