use clap::Parser;

use carryover::cli::{self, Cli, Command, ConfigCommand};
use carryover::config::Config;
use carryover::logging::{init_logging, LogConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LogConfig::development())?;

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Command::Migrate { new_base_url } => cli::handle_migrate(&config, &new_base_url).await,
        Command::Prune => cli::handle_prune(&config).await,
        Command::Config(sub) => {
            match sub {
                ConfigCommand::Show => cli::handle_config_show(&config)?,
                ConfigCommand::Path => cli::handle_config_path(),
            }
            Ok(())
        }
        Command::Version => {
            cli::handle_version();
            Ok(())
        }
    }
}
