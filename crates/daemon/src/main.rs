#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Fleet daemon: loads a cluster manifest, checkpoints allocation state and
//! tears down applications on request.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use fleet_core::checkpoint::{CheckpointConfig, FileStore};
use fleet_core::memory::ClusterState;
use fleet_core::model::ApplicationName;
use fleet_core::teardown::{TeardownConfig, TeardownError};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod manifest;
mod service;

use crate::manifest::Manifest;
use crate::service::FleetService;

#[derive(Parser, Debug)]
#[command(name = "fleet-daemon", version, about = "Fleet control-plane daemon")]
struct Args {
    /// Cluster manifest (JSON) describing machines and applications.
    #[arg(long)]
    manifest: PathBuf,

    /// Directory for durable checkpoints.
    #[arg(long, default_value = ".fleet/state")]
    state_dir: PathBuf,

    /// Record key for the allocation-state checkpoint.
    #[arg(long, default_value = "cluster-state")]
    checkpoint_key: String,

    /// Checkpoint poll interval in milliseconds.
    #[arg(long, default_value_t = 1_000, value_parser = clap::value_parser!(u64).range(1..))]
    checkpoint_interval_ms: u64,

    /// Time-to-live of checkpoint records in seconds.
    #[arg(long, default_value_t = 86_400)]
    record_ttl_secs: u64,

    /// Default teardown budget in seconds.
    #[arg(long, default_value_t = 300)]
    teardown_timeout_secs: u64,

    /// Simulated per-unit drain time in milliseconds.
    #[arg(long, default_value_t = 0)]
    drain_delay_ms: u64,

    /// Application to tear down after startup. May be repeated.
    #[arg(long = "teardown")]
    teardown: Vec<String>,

    /// Exit after the requested teardowns instead of waiting for Ctrl-C.
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Log level (env-filter syntax).
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&args.log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let manifest = Manifest::load(&args.manifest).await?;
    let state = ClusterState::new();
    manifest.apply(&state).context("applying manifest")?;
    tracing::info!(
        applications = state.applications().len(),
        version = state.version(),
        "cluster state loaded"
    );

    let store = FileStore::new(args.state_dir.join("checkpoints"));
    if let Some(previous) = store.load(&args.checkpoint_key).await? {
        // The manifest is authoritative; the old record only tells us where we left off.
        tracing::info!(
            version = previous.version,
            written_at_ms = previous.written_at_ms,
            "found previous checkpoint"
        );
    }

    let checkpoint_cfg = CheckpointConfig {
        key: args.checkpoint_key.clone(),
        poll_interval: Duration::from_millis(args.checkpoint_interval_ms),
        record_ttl: Duration::from_secs(args.record_ttl_secs),
        ..CheckpointConfig::default()
    };
    let teardown_cfg = TeardownConfig {
        default_timeout: Duration::from_secs(args.teardown_timeout_secs),
    };
    let svc = FleetService::start(
        state,
        store,
        checkpoint_cfg,
        teardown_cfg.clone(),
        Duration::from_millis(args.drain_delay_ms),
    );

    for name in &args.teardown {
        let app = ApplicationName::new(name.as_str());
        match svc.teardown(&app, teardown_cfg.default_timeout).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(application = %app, "application not fully torn down"),
            Err(e @ TeardownError::CyclicDependency { .. }) => {
                tracing::error!(application = %app, error = %e, "fix the declared dependencies and retry");
            }
            Err(e) => return Err(e).with_context(|| format!("tearing down {app}")),
        }
    }
    tracing::info!(
        remaining = ?svc.state().applications(),
        "requested teardowns finished"
    );

    if !args.once {
        tracing::info!("daemon running; Ctrl-C to stop");
        shutdown_signal().await;
    }

    svc.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    tracing::info!("shutdown requested");
}
