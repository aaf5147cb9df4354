//! CLI parser and command dispatch.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;

use crate::broker::{Broker, MemoryBroker, RedisBroker};
use crate::config::Settings;
use crate::models::{Priority, Stage};
use crate::observe;
use crate::pipeline::{self, reconciler, scheduler, worker, PipelineEnv, PipelineError};
use crate::plugins::{Capabilities, OcrEngine};
use crate::state::PipelineStore;

/// Broker backend selection for the `work` command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum BrokerKind {
    /// Redis at REDIS_URL (distributed, the default)
    #[default]
    Redis,
    /// In-process queue (single machine, not persisted)
    Memory,
}

#[derive(Parser)]
#[command(name = "civipipe")]
#[command(about = "Civic meeting document pipeline orchestrator")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Manage registered sites
    Site {
        #[command(subcommand)]
        command: SiteCommands,
    },

    /// Admit one site into the pipeline
    Enqueue {
        /// Site subdomain
        site: String,
        /// Priority band
        #[arg(long, default_value = "normal")]
        priority: String,
    },

    /// One scheduler tick: admit the stalest eligible site
    AdvanceNext,

    /// Queue depths, worker counts, and site snapshots
    Status {
        /// Restrict to one site
        #[arg(long)]
        site: Option<String>,
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Cancel all of a site's jobs and reset its pipeline state
    Purge {
        /// Site subdomain
        site: String,
    },

    /// Run one reconciliation pass
    Reconcile {
        /// Stuck threshold (e.g. 2h, 45m)
        #[arg(long, value_parser = humantime::parse_duration)]
        threshold: Option<Duration>,
    },

    /// Health probe: exit 0 healthy, 1 degraded, 2 unhealthy
    Health,

    /// Run worker pools (and the reconciler timer) until interrupted
    Work {
        /// Stages to run workers for (default: all)
        #[arg(long, value_delimiter = ',')]
        stages: Vec<String>,
        /// Broker backend
        #[arg(long, value_enum, default_value = "redis")]
        broker: BrokerKind,
        /// Skip the periodic reconciler
        #[arg(long)]
        no_reconciler: bool,
    },
}

#[derive(Subcommand)]
enum SiteCommands {
    /// Register a site (idempotent)
    Add {
        /// Site subdomain, e.g. council.example.org
        subdomain: String,
        /// Enable entity/vote extraction for this site
        #[arg(long)]
        extraction: bool,
    },
    /// List registered sites
    List,
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_env();

    match cli.command {
        Commands::Site { command } => run_site(settings, command).await,
        Commands::Enqueue { site, priority } => run_enqueue(settings, site, priority).await,
        Commands::AdvanceNext => run_advance_next(settings).await,
        Commands::Status { site, json } => run_status(settings, site, json).await,
        Commands::Purge { site } => run_purge(settings, site).await,
        Commands::Reconcile { threshold } => run_reconcile(settings, threshold).await,
        Commands::Health => run_health(settings).await,
        Commands::Work {
            stages,
            broker,
            no_reconciler,
        } => run_work(settings, stages, broker, no_reconciler).await,
    }
}

async fn build_env(settings: Settings, broker_kind: BrokerKind) -> anyhow::Result<PipelineEnv> {
    let store = PipelineStore::new(&settings.database_path)
        .with_context(|| format!("open state store {}", settings.database_path.display()))?;
    let broker: Arc<dyn Broker> = match broker_kind {
        BrokerKind::Redis => Arc::new(
            RedisBroker::connect(&settings.redis_url)
                .await
                .with_context(|| format!("connect broker {}", settings.redis_url))?,
        ),
        BrokerKind::Memory => Arc::new(MemoryBroker::new()),
    };
    let caps = Capabilities::standard(&settings).map_err(|e| anyhow::anyhow!(e.to_string()))?;
    Ok(PipelineEnv::new(settings, store, broker, caps))
}

async fn run_site(settings: Settings, command: SiteCommands) -> anyhow::Result<()> {
    let store = PipelineStore::new(&settings.database_path)?;
    match command {
        SiteCommands::Add {
            subdomain,
            extraction,
        } => {
            let extraction = extraction || settings.enable_extraction;
            store.register_site(&subdomain, extraction)?;
            println!(
                "registered {} (extraction {})",
                style(&subdomain).green(),
                if extraction { "on" } else { "off" }
            );
        }
        SiteCommands::List => {
            for site in store.list_sites()? {
                let stage = site
                    .current_stage
                    .map(|s| s.as_str())
                    .unwrap_or("-");
                println!(
                    "{:<40} {:<12} extraction={}",
                    site.subdomain,
                    stage,
                    if site.extraction_enabled { "on" } else { "off" }
                );
            }
        }
    }
    Ok(())
}

async fn run_enqueue(settings: Settings, site: String, priority: String) -> anyhow::Result<()> {
    let priority = Priority::parse(&priority)
        .ok_or_else(|| anyhow::anyhow!("priority must be 'high' or 'normal'"))?;
    let env = build_env(settings, BrokerKind::Redis).await?;
    match scheduler::enqueue_site(&env, &site, priority).await {
        Ok(()) => {
            println!("enqueued {}", style(&site).green());
            Ok(())
        }
        Err(PipelineError::UnknownSite(_)) => {
            eprintln!("{} unknown site: {site}", style("error:").red());
            std::process::exit(2);
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_advance_next(settings: Settings) -> anyhow::Result<()> {
    let env = build_env(settings, BrokerKind::Redis).await?;
    match scheduler::advance_oldest(&env).await? {
        Some(site) => println!("admitted {}", style(&site).green()),
        None => println!("nothing eligible"),
    }
    Ok(())
}

async fn run_status(
    settings: Settings,
    site: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let env = build_env(settings, BrokerKind::Redis).await?;
    let report = observe::status(&env, site.as_deref()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", style("queues").bold());
    for q in &report.queues {
        println!("  {:<14} {}", q.queue, q.depth);
    }
    if !report.workers.is_empty() {
        println!("{}", style("workers").bold());
        let mut stages: Vec<_> = report.workers.iter().collect();
        stages.sort();
        for (stage, count) in stages {
            println!("  {:<14} {}", stage, count);
        }
    }
    println!("{}", style("sites").bold());
    for s in &report.sites {
        let record = &s.record;
        let stage = record
            .current_stage
            .map(|st| st.as_str())
            .unwrap_or("-");
        let counters = record
            .current_stage
            .filter(|st| *st != Stage::Completed)
            .map(|st| {
                let c = record.counters(st);
                format!("{}/{} done, {} failed", c.completed, c.total, c.failed)
            })
            .unwrap_or_default();
        let error = record
            .last_error_message
            .as_deref()
            .map(|m| format!("  last error: {m}"))
            .unwrap_or_default();
        println!(
            "  {:<40} {:<12} {}{}",
            record.subdomain, stage, counters, error
        );
    }
    if !report.recent_failures.is_empty() {
        println!("{}", style("recent failures").bold());
        for f in &report.recent_failures {
            println!(
                "  {} {} [{}] {}",
                f.failed_at.format("%Y-%m-%d %H:%M"),
                f.job.payload.subdomain(),
                f.job.payload.kind(),
                f.error
            );
        }
    }
    let health = &report.health;
    println!(
        "{} {:.0}% ({} active, {} stuck)",
        style("health").bold(),
        health.score * 100.0,
        health.active,
        health.stuck
    );
    Ok(())
}

async fn run_purge(settings: Settings, site: String) -> anyhow::Result<()> {
    let env = build_env(settings, BrokerKind::Redis).await?;
    match pipeline::purge_site(&env, &site).await {
        Ok(cancelled) => {
            println!("purged {} ({cancelled} jobs cancelled)", style(&site).green());
            Ok(())
        }
        Err(PipelineError::UnknownSite(_)) => {
            eprintln!("{} unknown site: {site}", style("error:").red());
            std::process::exit(2);
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_reconcile(settings: Settings, threshold: Option<Duration>) -> anyhow::Result<()> {
    let threshold = threshold.unwrap_or(settings.stuck_threshold);
    let env = build_env(settings, BrokerKind::Redis).await?;
    let report = reconciler::reconcile_once(&env, threshold).await?;
    println!(
        "scanned {} stuck site(s): {} counter rewrites, {} coordinators, {} jobs re-enqueued",
        report.scanned,
        report.rewritten,
        report.coordinators_enqueued,
        report.jobs_reenqueued
    );
    Ok(())
}

async fn run_health(settings: Settings) -> anyhow::Result<()> {
    let env = build_env(settings, BrokerKind::Redis).await?;
    let health = observe::health(&env).await?;
    println!(
        "{:.0}% ({} active, {} stuck)",
        health.score * 100.0,
        health.active,
        health.stuck
    );
    std::process::exit(health.exit_code());
}

async fn run_work(
    settings: Settings,
    stage_names: Vec<String>,
    broker: BrokerKind,
    no_reconciler: bool,
) -> anyhow::Result<()> {
    let stages: Vec<Stage> = if stage_names.is_empty() {
        Stage::COUNTED.to_vec()
    } else {
        stage_names
            .iter()
            .map(|name| {
                Stage::parse(name)
                    .filter(|s| *s != Stage::Completed)
                    .ok_or_else(|| anyhow::anyhow!("unknown stage: {name}"))
            })
            .collect::<anyhow::Result<_>>()?
    };

    let env = Arc::new(build_env(settings, broker).await?);

    // Workers must refuse to start without their tools
    if stages.contains(&Stage::Ocr) && !env.caps.ocr.is_available() {
        anyhow::bail!("{}", env.caps.ocr.availability_hint());
    }
    std::fs::create_dir_all(env.layout.root())
        .with_context(|| format!("create storage dir {}", env.layout.root().display()))?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let reconciler_handle = if no_reconciler {
        None
    } else {
        Some(tokio::spawn(reconciler::run_timer(
            env.clone(),
            shutdown_rx.clone(),
        )))
    };

    let pools = tokio::spawn(worker::run_pools(env.clone(), stages.clone(), shutdown_rx));

    tracing::info!(
        run_id = %env.run_id,
        stages = ?stages.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
        "worker process started"
    );
    tokio::signal::ctrl_c()
        .await
        .context("wait for interrupt")?;
    tracing::info!("interrupt received, shutting down");
    let _ = shutdown_tx.send(true);

    pools.await.ok();
    if let Some(handle) = reconciler_handle {
        handle.await.ok();
    }
    Ok(())
}
