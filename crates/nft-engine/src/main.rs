//! nftd - ruleset engine daemon
//!
//! Loads a JSON ruleset into a fresh namespace in one transaction, prints
//! the resulting dump and optionally keeps running, logging change events
//! and collecting expired set elements until interrupted.

use anyhow::Context;
use clap::Parser;
use nft_engine::{BroadcastNotifier, EngineConfig, NetBuilder, RecordingHooks, Registry, RulesetSpec};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Transactional packet-filter ruleset engine
#[derive(Parser, Debug)]
#[command(name = "nftd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Engine configuration (JSON)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Ruleset to load (JSON)
    #[arg(short = 'r', long)]
    ruleset: PathBuf,

    /// Keep running and log change events until interrupted
    #[arg(short = 'f', long)]
    follow: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("nftd failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(default: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    EngineConfig::from_json(&text).with_context(|| format!("parsing {}", path.display()))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(args.config.as_ref())?;
    let ruleset = RulesetSpec::from_file(&args.ruleset)?;

    let notifier = Arc::new(BroadcastNotifier::new(config.notify_capacity));
    let mut events = notifier.subscribe();
    let hooks = Arc::new(RecordingHooks::new());

    let net = NetBuilder::new(Arc::new(Registry::with_builtins()))
        .config(config)
        .hooks(hooks.clone())
        .notifier(notifier)
        .build()?;

    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(
                    kind = ?event.kind,
                    family = %event.family,
                    table = %event.table,
                    name = event.name.as_deref().unwrap_or(""),
                    handle = event.handle,
                    "event"
                ),
                Err(RecvError::Lagged(n)) => warn!(missed = n, "event subscriber lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let genid = ruleset
        .load(&net)
        .with_context(|| format!("loading {}", args.ruleset.display()))?;
    info!(genid, hooks = hooks.len(), "ruleset committed");

    let dump = serde_json::to_string_pretty(&net.dump())?;
    println!("{}", dump);

    if args.follow {
        info!("following, press ctrl-c to exit");
        tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        info!("shutting down");
    }

    net.barrier();
    drop(net);
    if let Err(e) = logger.await {
        warn!("event logger ended abnormally: {}", e);
    }
    Ok(())
}
