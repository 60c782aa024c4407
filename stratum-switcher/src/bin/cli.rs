//! Command-line interface for stratum-switcher.
//!
//! Reads and writes coin assignments in the watch store the switchers
//! follow, using the store settings of a switcher configuration file.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use stratum_switcher::config::Config;
use stratum_switcher::error::Error;
use stratum_switcher::watch::{self, WatchManager};

#[derive(Parser, Debug)]
#[command(author, version, about = "Stratum switcher coin assignment tool", long_about = None)]
struct Cli {
    #[arg(
        short = 'c',
        long = "config",
        help = "Switcher configuration file to take store settings from",
        default_value = "./config.json"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the coin a subaccount is assigned to
    GetCoin { subaccount: String },
    /// Assign a subaccount to a coin
    SetCoin { subaccount: String, coin: String },
    /// Create every missing node along a path
    EnsurePath { path: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load_from(&cli.config)?;
    if config.uses_memory_store() {
        bail!("the in-memory store is private to each switcher process");
    }

    let watch = WatchManager::new(watch::connect(&config).await?);

    match cli.command {
        Command::GetCoin { subaccount } => {
            let value = watch.store().get(&config.coin_path(&subaccount)).await?;
            println!("{}", String::from_utf8_lossy(&value));
        }
        Command::SetCoin { subaccount, coin } => {
            if !config.stratum_servers.contains_key(&coin) {
                eprintln!("warning: {} has no stratum server in {}", coin, cli.config.display());
            }
            let path = config.coin_path(&subaccount);
            watch.ensure_path(&config.zk_switcher_watch_dir).await?;
            match watch.store().create(&path, coin.as_bytes()).await {
                Err(Error::NodeExists(_)) => watch.store().set(&path, coin.as_bytes()).await?,
                other => other?,
            }
            println!("{} -> {}", subaccount, coin);
        }
        Command::EnsurePath { path } => {
            watch.ensure_path(&path).await?;
            println!("{}", path);
        }
    }

    Ok(())
}
