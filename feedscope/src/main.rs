/*
feedscope - worker binary
Loads configuration, opens the feed store and runs refresh cycles until interrupted.
*/

use anyhow::{Context, Result};
use clap::Parser;
use common::{Config, FeedSource, FileFeedSource, StaticFeedSource};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use feedscope::feed_store::FeedStore;
use feedscope::llm::remote::RemoteLlmProvider;
use feedscope::llm::LlmProvider;
use feedscope::worker::{run_cycle, run_worker};

#[derive(Parser, Debug)]
#[command(name = "feedscope", about = "Feedscope feed ingestion worker")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run a single refresh cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // Resolve config paths
    let default_path = PathBuf::from("config.default.toml");
    let override_path = if let Some(p) = args.config {
        if !p.exists() {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
        }
        Some(p)
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() { Some(p) } else { None }
    };

    let config = Config::load_with_defaults(
        if default_path.exists() { Some(&default_path) } else { None },
        override_path.as_deref(),
    )
    .await
    .context("failed to load configuration")?;
    info!(default = ?default_path, override = ?override_path, "configuration loaded");

    // A configured LLM without its key is fatal; no [llm] section means no summaries.
    let llm: Option<Arc<dyn LlmProvider>> = match config.llm.as_ref() {
        Some(llm_config) => {
            let provider: Arc<dyn LlmProvider> = Arc::new(RemoteLlmProvider::from_config(llm_config)?);
            info!(
                "LLM provider initialized: {}",
                llm_config.model.as_deref().unwrap_or("default model")
            );
            Some(provider)
        }
        None => {
            info!("No [llm] section, items will be stored without summaries");
            None
        }
    };

    let store = Arc::new(FeedStore::from_config(&config, llm)?);

    // The feed list is re-read from the config file each cycle when there is one.
    let feed_source: Arc<dyn FeedSource> = match override_path.clone() {
        Some(path) => Arc::new(FileFeedSource::new(path)),
        None => Arc::new(StaticFeedSource::new(config.feeds.clone())),
    };

    if args.once {
        let report = run_cycle(&store, feed_source.as_ref()).await;
        info!(?report, "single cycle finished");
        return Ok(());
    }

    let shutdown_notify = Arc::new(Notify::new());
    let worker = tokio::spawn(run_worker(
        store.clone(),
        feed_source,
        config.worker_interval(),
        shutdown_notify.clone(),
    ));

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("ctrl-c received, worker stops after the current cycle");
    // notify_one keeps a permit when the worker is mid-cycle
    shutdown_notify.notify_one();

    if let Err(join_err) = worker.await {
        error!(%join_err, "worker task panicked");
    }
    info!("Shutdown complete");
    Ok(())
}
