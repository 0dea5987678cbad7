//! Sampling agent
//!
//! Attaches a sampler to a running interpreter process and serves its
//! samples until interrupted or until the process exits.

use anyhow::{Context, Result};
use clap::Parser;
use color_eyre::eyre::eyre;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid as NixPid;
use stat_agent::sampler::{ProcessVmReader, RuntimeLayout, Target};
use stat_agent::{Config, RequestInfo, Stat};
use stat_shared::utils::parse_address;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How often to check whether the target is still alive
const LIVENESS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "stat-agent")]
#[command(about = "Out-of-process sampling profiler", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file (INI)
    #[arg(short, long, env = "STAT_CONFIG")]
    config: Option<PathBuf>,

    /// Process ID to sample
    #[arg(short, long)]
    pid: i32,

    /// Address of the heap structure in the target (hex)
    #[arg(long)]
    heap: String,

    /// Address of the current-frame pointer in the target (hex)
    #[arg(long)]
    frame: String,

    /// Runtime layout file (JSON); built-in layout when omitted
    #[arg(long)]
    layout: Option<PathBuf>,

    /// Request path attached to samples
    #[arg(long)]
    path: Option<String>,

    /// Request method attached to samples
    #[arg(long)]
    method: Option<String>,

    /// Request URI attached to samples
    #[arg(long)]
    uri: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    init_tracing(args.verbose)?;

    info!("Starting stat agent");

    run(args).await.map_err(|e| eyre!("{:#}", e))
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load(args.config.as_deref())?;

    let layout = match &args.layout {
        Some(path) => RuntimeLayout::load(path)?,
        None => RuntimeLayout::default(),
    };

    let target = Target {
        pid: args.pid,
        heap: parse_address(&args.heap).context("Invalid heap address")?,
        frame: parse_address(&args.frame).context("Invalid frame address")?,
    };

    let Some(stat) = Stat::startup(&config, layout, Arc::new(ProcessVmReader)).await? else {
        return Ok(());
    };

    if let Some(endpoint) = stat.stream_endpoint() {
        info!("Streaming samples on {}", endpoint);
    }
    if let Some(endpoint) = stat.control_endpoint() {
        info!("Accepting control messages on {}", endpoint);
    }

    let request = RequestInfo {
        path: args.path,
        method: args.method,
        uri: args.uri,
    };

    if let Err(e) = stat.activate(target, &request) {
        stat.shutdown().await?;
        return Err(e);
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for interrupt")?;
            info!("Interrupted");
        }
        _ = wait_for_exit(args.pid) => {
            info!("Process {} exited", args.pid);
        }
    }

    stat.shutdown().await
}

/// Resolves once `pid` no longer exists
async fn wait_for_exit(pid: i32) {
    let mut ticker = tokio::time::interval(LIVENESS_INTERVAL);

    loop {
        ticker.tick().await;
        match kill(NixPid::from_raw(pid), None) {
            Ok(()) | Err(Errno::EPERM) => {}
            Err(Errno::ESRCH) => return,
            Err(e) => {
                warn!("Cannot check process {}: {}", pid, e);
                return;
            }
        }
    }
}

fn init_tracing(verbose: bool) -> color_eyre::Result<()> {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    Ok(())
}
