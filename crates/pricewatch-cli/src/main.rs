use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pricewatch_core::{EngineConfig, Item};
use pricewatch_dedup::DeduplicationEngine;
use pricewatch_history::{HistoryConfig, PriceHistoryTracker};
use pricewatch_storage::{FileStore, PersistentStore};
use tokio::fs;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "pricewatch")]
#[command(about = "Marketplace listing dedup and price-drop tracker")]
struct Cli {
    /// Directory holding the persisted fingerprint map and price histories.
    #[arg(long, env = "PRICEWATCH_STORE_DIR", default_value = "./state")]
    store_dir: PathBuf,

    /// Optional YAML engine config; environment variables apply when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Mark listings from a JSON array as new or seen and emit the new ones.
    Check {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print fingerprint map utilization.
    Stats,
    /// Delete price histories older than the retention window.
    PruneHistory,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::from_yaml_file(path)?,
        None => EngineConfig::from_env(),
    };
    config.validate().context("validating engine config")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    let store = Arc::new(FileStore::new(cli.store_dir.clone()));

    match cli.command {
        Commands::Check { input, output } => {
            let run_id = Uuid::new_v4();
            let text = fs::read_to_string(&input)
                .await
                .with_context(|| format!("reading {}", input.display()))?;
            let mut items: Vec<Item> =
                serde_json::from_str(&text).with_context(|| format!("parsing {}", input.display()))?;

            let mut engine = DeduplicationEngine::new(store, config)?;
            engine.initialize().await.context("initializing dedup engine")?;
            let fresh = engine
                .find_new_listings(&mut items)
                .await
                .context("deduplicating listings")?;

            let drops = items
                .iter()
                .filter(|i| i.price_change().is_some_and(|c| c.has_drop))
                .count();
            let stats = engine.get_stats();
            info!(
                %run_id,
                input = items.len(),
                new = fresh.len(),
                price_drops = drops,
                fingerprints = stats.total_seen_fingerprints,
                utilization_percent = stats.utilization_percent,
                "check complete"
            );

            match output {
                Some(path) => {
                    let body = serde_json::to_vec_pretty(&fresh).context("serializing new listings")?;
                    fs::write(&path, body)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                }
                None => {
                    let body = serde_json::to_string_pretty(&fresh).context("serializing new listings")?;
                    println!("{body}");
                }
            }
        }
        Commands::Stats => {
            let mut engine = DeduplicationEngine::new(store, config)?;
            engine.initialize().await.context("initializing dedup engine")?;
            let stats = serde_json::to_string_pretty(&engine.get_stats()).context("serializing stats")?;
            println!("{stats}");
        }
        Commands::PruneHistory => {
            store.open().await.context("opening store")?;
            let tracker = PriceHistoryTracker::new(store, HistoryConfig::from(&config));
            let report = tracker.cleanup_old_history().await;
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("serializing cleanup report")?
            );
        }
    }

    Ok(())
}
