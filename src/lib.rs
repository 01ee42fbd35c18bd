//! Autonomous SEO Growth Pilot
//!
//! A rule-driven decision-and-execution pipeline for local-service
//! landing pages:
//! - Deterministic decision engine (no ML) over ranking signals
//! - Safety kill-switch and per-category rate limiting
//! - Per-mode mutual exclusion with stale-lock recovery
//! - Append-only audit log feeding a weekly learning loop

pub mod audit;
pub mod config;
pub mod decision;
pub mod executor;
pub mod learning;
pub mod pipeline;
pub mod safety;
pub mod signals;

// Re-exports for convenience
pub use config::PilotConfig;
pub use decision::{ActionType, Decision};
pub use pipeline::{Mode, Pipeline};
pub use signals::{SignalRecord, TargetKey};
