//! CLI subcommand definitions and handlers.
//!
//! Operator surface for the out-of-band maintenance actions:
//! - `migrate` -- rewrite persisted callback URLs onto a new base URL
//! - `prune` -- drop records whose platform message no longer exists
//! - `config show|path` -- inspect the resolved configuration
//! - `version` -- print version info

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::config::{self, Config};
use crate::migrate::Migrator;
use crate::platform::HttpPlatformClient;
use crate::storage::Storage;

/// Stateful callback toolkit for webhook-driven chat bots.
#[derive(Parser, Debug)]
#[command(
    name = "carryover",
    version = env!("CARGO_PKG_VERSION"),
    about = "carryover — stateful callback toolkit for webhook-driven chat bots"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Rewrite persisted callback URLs onto a new base URL and re-submit
    /// the affected messages.
    Migrate {
        /// The new public callback base URL, e.g. https://bot.example.com
        #[arg(long)]
        new_base_url: String,
    },

    /// Drop records whose platform message no longer exists.
    Prune,

    /// Read configuration.
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Print version information.
    Version,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the resolved configuration as JSON.
    Show,
    /// Print the config file path.
    Path,
}

fn build_migrator(config: &Config) -> Result<Migrator, Box<dyn std::error::Error>> {
    let storage = Storage::open(&config.storage)?;
    let platform = HttpPlatformClient::with_timeout(
        config.platform.base_url.clone(),
        config.platform.token.clone(),
        Duration::from_secs(config.platform.request_timeout_secs),
    )?;
    Ok(Migrator::new(storage.ui_records, Arc::new(platform)))
}

/// Run the migration batch and print per-record outcomes.
pub async fn handle_migrate(
    config: &Config,
    new_base_url: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let migrator = build_migrator(config)?;
    let summary = migrator.migrate(new_base_url).await?;

    for outcome in &summary.outcomes {
        println!("{}  {}", outcome.message_id, outcome.status);
    }
    println!(
        "migrated {}, skipped {}, failed {}",
        summary.migrated(),
        summary.skipped(),
        summary.failed()
    );
    Ok(())
}

/// Drop dead records and report the count.
pub async fn handle_prune(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let migrator = build_migrator(config)?;
    let removed = migrator.prune_dead_records().await?;
    println!("removed {removed} dead record(s)");
    Ok(())
}

pub fn handle_config_show(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

pub fn handle_config_path() {
    println!("{}", config::config_path().display());
}

pub fn handle_version() {
    println!("carryover {}", env!("CARGO_PKG_VERSION"));
}
