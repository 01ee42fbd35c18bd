//! Autonomous SEO Growth Pilot
//!
//! One invocation = one run of the selected mode:
//! - observe: decide and record opportunities, execute nothing
//! - guarded: execute decisions under rate limits and the kill-switch
//! - analyze: decide and print, persist nothing
//! - weekly: evaluate past outcomes and replicate winning patterns
//!
//! Scheduling lives outside this binary (cron or similar); the per-mode
//! lock keeps overlapping ticks from doubling up.

use anyhow::Result;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use seo_autopilot::config::PilotConfig;
use seo_autopilot::decision::ActionType;
use seo_autopilot::executor::{
    ContentGenerator, HandlerRegistry, HttpContentGenerator, JsonPageStore, OutboxProposalSender,
    PageStore, PageWriteHandler, ProposeHandler, ProtectHandler, TemplateContentGenerator,
};
use seo_autopilot::pipeline::{Mode, Pipeline, PipelineError};
use seo_autopilot::safety::{CounterStore, MemoryCounterStore, SqliteCounterStore};
use seo_autopilot::signals::{CompetitorSource, HttpCompetitorSource, HttpMetricsSource, SignalSource};

// ──────────────────────────────────────────────────────────────────────────────
// ARGUMENTS
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct CliArgs {
    mode: Mode,
    dry_run: bool,
    config_path: Option<PathBuf>,
}

fn usage() -> String {
    format!(
        "usage: seo_autopilot <mode> [--dry-run] [--config <path>]\n       modes: {}",
        Mode::valid_set()
    )
}

fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut mode = None;
    let mut dry_run = false;
    let mut config_path = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--dry-run" => dry_run = true,
            "--config" => {
                let value = iter.next().ok_or("--config requires a path")?;
                config_path = Some(PathBuf::from(value));
            }
            "--help" | "-h" => return Err(usage()),
            flag if flag.starts_with("--") => {
                return Err(format!("unknown flag '{flag}'\n{}", usage()));
            }
            value => {
                if mode.is_some() {
                    return Err(format!("unexpected argument '{value}'\n{}", usage()));
                }
                mode = Some(value.parse::<Mode>().map_err(|e| format!("{e}"))?);
            }
        }
    }

    let mode = mode.ok_or_else(usage)?;
    Ok(CliArgs { mode, dry_run, config_path })
}

// ──────────────────────────────────────────────────────────────────────────────
// WIRING
// ──────────────────────────────────────────────────────────────────────────────

async fn build_pipeline(config: PilotConfig, mode: Mode) -> Result<Pipeline> {
    let timeout = Duration::from_secs(config.ingestion.fetch_timeout_secs);

    let mut sources: Vec<Arc<dyn SignalSource>> = Vec::new();
    if let Some(endpoint) = &config.ingestion.metrics_endpoint {
        sources.push(Arc::new(HttpMetricsSource::new(endpoint, timeout)));
    }
    let mut competitors: Vec<Arc<dyn CompetitorSource>> = Vec::new();
    if let Some(endpoint) = &config.ingestion.competitor_endpoint {
        competitors.push(Arc::new(HttpCompetitorSource::new(endpoint, timeout)));
    }

    let generator: Arc<dyn ContentGenerator> = match &config.ingestion.generator_endpoint {
        Some(endpoint) => Arc::new(HttpContentGenerator::new(endpoint, timeout)),
        None => Arc::new(TemplateContentGenerator),
    };
    let page_store: Arc<dyn PageStore> = Arc::new(JsonPageStore::new(&config.storage.page_state));
    let proposal_sender = Arc::new(OutboxProposalSender::new(&config.storage.proposal_outbox));

    let mut registry = HandlerRegistry::new();
    for action in [ActionType::Create, ActionType::Rewrite, ActionType::Expand, ActionType::Clone] {
        registry.register(Arc::new(PageWriteHandler::new(
            action,
            generator.clone(),
            page_store.clone(),
        )));
    }
    registry.register(Arc::new(ProtectHandler::new(page_store.clone())));
    registry.register(Arc::new(ProposeHandler::new(proposal_sender)));

    // Modes with execution rights need quota state that survives a
    // restart; the observer path does not.
    let counters: Arc<dyn CounterStore> = match mode {
        Mode::Guarded | Mode::Weekly => {
            Arc::new(SqliteCounterStore::new(&config.storage.counter_db).await?)
        }
        _ => Arc::new(MemoryCounterStore::new()),
    };

    Ok(Pipeline::new(config, sources, competitors, page_store, registry, counters))
}

// ──────────────────────────────────────────────────────────────────────────────
// MAIN ENTRY POINT
// ──────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    let raw_args: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&raw_args) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::from(2);
        }
    };

    let config = match PilotConfig::load(args.config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(2);
        }
    };

    let _log_guard = init_tracing(&config);
    info!("Starting {} run{}", args.mode, if args.dry_run { " (dry-run)" } else { "" });

    let mut pipeline = match build_pipeline(config, args.mode).await {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("failed to assemble pipeline: {e:#}");
            return ExitCode::from(1);
        }
    };

    // Dropping the run future on a signal releases the lock through
    // its guard before the process exits.
    let outcome = tokio::select! {
        result = pipeline.run(args.mode, args.dry_run) => result,
        _ = tokio::signal::ctrl_c() => {
            error!("interrupted; lock released, exiting");
            return ExitCode::from(1);
        }
    };

    match outcome {
        Ok(summary) => {
            println!("{}", summary.render());
            ExitCode::SUCCESS
        }
        Err(PipelineError::KillSwitch(trip)) => {
            error!("run aborted by kill-switch: {trip}");
            eprintln!("ABORTED: {trip}");
            ExitCode::from(1)
        }
        Err(e) => {
            error!("run failed: {e:#}");
            eprintln!("run failed: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing(config: &PilotConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match std::fs::create_dir_all(&config.storage.log_dir) {
        Ok(()) => {
            let appender =
                tracing_appender::rolling::daily(&config.storage.log_dir, "autopilot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        Err(_) => {
            // Console-only logging is better than refusing to run.
            tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_mode_and_flags() {
        let parsed = parse_args(&args(&["guarded", "--dry-run"])).unwrap();
        assert_eq!(parsed.mode, Mode::Guarded);
        assert!(parsed.dry_run);
    }

    #[test]
    fn rejects_unknown_mode_with_valid_set() {
        let err = parse_args(&args(&["turbo"])).unwrap_err();
        assert!(err.contains("observe"));
        assert!(err.contains("weekly"));
    }

    #[test]
    fn missing_mode_prints_usage() {
        let err = parse_args(&args(&[])).unwrap_err();
        assert!(err.contains("usage:"));
    }

    #[test]
    fn config_flag_requires_value() {
        assert!(parse_args(&args(&["observe", "--config"])).is_err());
    }
}
