//! Operator tooling for an objfs mount: configuration and content cache upkeep.
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use objfs::cache::{CacheError, ContentCache};
use tokio::sync::Mutex;
use tracing::{error, info};

mod app_config;
mod trc;

use crate::app_config::Config;
use crate::trc::Trc;

#[derive(Parser)]
#[command(version, about = "Read-path tooling for an object-store filesystem.")]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to an objfs config TOML."
    )]
    config_path: Option<PathBuf>,

    #[arg(long, help = "Plain log output without spinners.")]
    plain: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Index the content cache left behind by a previous run.
    RecoverCache,

    /// Print the effective configuration.
    ShowConfig,
}

fn main() {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    let config = Config::load(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });

    if let Err(e) = Trc::default().plain(args.plain).init() {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    }

    match args.command {
        Command::ShowConfig => match config.to_toml() {
            Ok(text) => print!("{text}"),
            Err(e) => {
                error!("Failed to render configuration: {e}");
                std::process::exit(1);
            }
        },
        Command::RecoverCache => {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Failed to start the async runtime: {e}");
                    std::process::exit(1);
                }
            };
            if let Err(e) = runtime.block_on(recover_cache(&config)) {
                error!("Cache recovery failed: {e}");
                std::process::exit(1);
            }
        }
    }
}

async fn recover_cache(config: &Config) -> Result<(), CacheError> {
    if !config.cache.enabled {
        info!("Content cache is disabled, nothing to recover.");
        return Ok(());
    }

    let mut cache = ContentCache::open(&config.cache.path).await?;
    let report = cache.recover_cache().await?;
    info!(
        root = %cache.root().display(),
        recovered = report.recovered,
        skipped = report.skipped,
        discarded = report.discarded,
        bytes = %bytesize::ByteSize::b(report.bytes),
        "Recovered content cache."
    );

    let options = config.read_options(Some(Arc::new(Mutex::new(cache))));
    info!(
        managed = options.wants_manager(),
        read_ahead = options.prefetch.is_some(),
        range_read_cache = config.read.cache_file_for_range_read,
        "Open files will read with these options."
    );
    Ok(())
}
