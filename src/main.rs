//! Binary entrypoint for the roomshard CLI.
//!
//! Commands:
//! - `start` - open the shard store, load assigned spaces and characters, run until Ctrl-C
//! - `init` - write a starter `roomshard.toml`
//! - `status` - print store contents and counters
//! - `check-space <id>` - load a stored space and validate it
//!
//! See the library crate docs for module-level details: `roomshard::`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::sync::Arc;

use roomshard::config::Config;
use roomshard::engine::{
    now_ms, AssetCatalog, DirectoryUpdate, Shard, ShardStore, SpaceSynchronizer,
};
use roomshard::metrics;

#[derive(Parser)]
#[command(name = "roomshard")]
#[command(about = "Authoritative state shard for multiplayer roleplay spaces")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "roomshard.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the shard
    Start {
        /// Directory assignment to apply at startup (overrides the config file)
        #[arg(short, long)]
        assignment: Option<String>,
    },
    /// Write a default configuration file
    Init,
    /// Show store contents and counters
    Status,
    /// Load a stored space and run its consistency checks
    CheckSpace {
        /// Space id
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        init_logging(&None, cli.verbose);
        Config::create_default(&cli.config).await?;
        info!("Configuration file created at {}", cli.config);
        return Ok(());
    }

    let config = Config::load(&cli.config).await?;
    config.validate()?;
    init_logging(&Some(config.clone()), cli.verbose);

    match cli.command {
        Commands::Init => {}
        Commands::Start { assignment } => {
            info!("Starting roomshard v{}", env!("CARGO_PKG_VERSION"));
            let assets = Arc::new(AssetCatalog::load_from_json(&config.shard.assets_file)?);
            info!("Loaded {} asset definitions", assets.len());
            let store = ShardStore::open(config.shard.store_path())?;
            let mut shard = Shard::new(config.shard_settings(), store.clone(), assets);

            let update = match assignment.or_else(|| config.shard.assignment_file.clone()) {
                Some(path) => DirectoryUpdate::load_from_json(&path)?,
                None => DirectoryUpdate {
                    spaces: Some(store.list_space_ids()?),
                    ..Default::default()
                },
            };
            let plan = shard.reconcile(&update, now_ms()).await;
            if plan.is_empty() {
                warn!("No spaces assigned; the shard is idle");
            }
            let registration = serde_json::to_string(&shard.registration())?;
            info!("Registration: {}", registration);
            shard.run().await?;
        }
        Commands::Status => {
            let store = ShardStore::open(config.shard.store_path())?;
            let stats = store.stats()?;
            println!("Shard:       {}", config.shard.id);
            println!("Store:       {}", config.shard.store_path().display());
            println!("Spaces:      {}", stats.spaces);
            println!("Characters:  {}", stats.characters);
            println!("Size:        {} bytes", stats.size_on_disk);
            let snapshot = metrics::snapshot();
            info!("metrics: {:?}", snapshot);
        }
        Commands::CheckSpace { id } => {
            let assets = Arc::new(AssetCatalog::load_from_json(&config.shard.assets_file)?);
            let store = ShardStore::open(config.shard.store_path())?;
            let bundle = store.get_space(&id.as_str().into())?;
            let items = bundle.inventory.len();
            let sync = SpaceSynchronizer::from_bundle(assets, bundle, config.shard_settings().space)
                .map_err(|e| anyhow!("space {} failed validation: {}", id, e))?;
            sync.check_invariants()?;
            println!("Space {} OK ({} items in room inventory)", id, items);
        }
    }

    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity wins over the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|cfg| cfg.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    let file = config.as_ref().and_then(|cfg| cfg.logging.file.clone());
    let security_path = config.as_ref().and_then(|cfg| cfg.logging.security_file.clone());
    let opened = file.and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    });
    if let Some(f) = opened {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Echo to the console only when attached to a terminal
        let is_tty = atty::is(atty::Stream::Stdout);

        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());

            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }

            if record.target() == "security" {
                if let Some(ref sec_path) = security_path {
                    if let Ok(mut sf) = std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(sec_path)
                    {
                        let _ = writeln!(sf, "{}", line);
                    }
                }
            }

            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
