mod commands;
mod render;
mod utils;

use std::path::PathBuf;

use anyhow::Result;
use calsync_core::Config;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use commands::repair::RepairArgs;
use commands::sync::SyncArgs;

#[derive(Parser)]
#[command(name = "calsync")]
#[command(about = "Sync provider calendars into Postgres and inspect or repair their sync state")]
struct Cli {
    /// Config file (defaults to <config dir>/calsync/config.toml)
    #[arg(long, global = true, env = "CALSYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init,
    /// Create the sync tables
    Migrate,
    /// Sync a user's calendars into the local mirror
    Sync {
        /// User whose calendars are synced
        #[arg(short, long)]
        user: String,

        /// Provider calendar id (defaults to the primary calendar)
        #[arg(short, long)]
        calendar: Option<String>,

        /// Sync every selected calendar of the account
        #[arg(long, conflicts_with = "calendar")]
        all: bool,

        /// Sync even if the calendar was synced recently
        #[arg(short, long)]
        force: bool,

        /// Provider refresh credential
        #[arg(long, env = "CALSYNC_CREDENTIAL", hide_env_values = true)]
        credential: Option<String>,
    },
    /// Show stored sync state per calendar
    Status {
        /// Only show this calendar (as "<user>:<calendar id>")
        #[arg(short, long)]
        calendar: Option<String>,
    },
    /// Show a calendar's recent sync runs
    Runs {
        /// Calendar key, as "<user>:<calendar id>"
        #[arg(short, long)]
        calendar: String,

        #[arg(short = 'n', long, default_value_t = commands::RUNS_LIMIT)]
        limit: usize,
    },
    /// Force-clear sync state fields. With no flag, clears all of them.
    Repair {
        /// Calendar key, as "<user>:<calendar id>"
        #[arg(short, long)]
        calendar: String,

        #[arg(long)]
        clear_token: bool,

        #[arg(long)]
        clear_reauth: bool,

        #[arg(long)]
        reset_failures: bool,

        #[arg(long)]
        clear_in_progress: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => Config::config_path()?,
    };

    match cli.command {
        Commands::Init => commands::init::run(&config_path),
        Commands::Migrate => commands::migrate::run(&Config::load(&config_path)?).await,
        Commands::Sync {
            user,
            calendar,
            all,
            force,
            credential,
        } => {
            let config = Config::load(&config_path)?;
            let args = SyncArgs {
                user,
                calendar,
                all,
                force,
                credential,
            };
            commands::sync::run(&config, args).await
        }
        Commands::Status { calendar } => {
            commands::status::run(&Config::load(&config_path)?, calendar.as_deref()).await
        }
        Commands::Runs { calendar, limit } => {
            commands::runs::run(&Config::load(&config_path)?, &calendar, limit).await
        }
        Commands::Repair {
            calendar,
            clear_token,
            clear_reauth,
            reset_failures,
            clear_in_progress,
        } => {
            let config = Config::load(&config_path)?;
            let args = RepairArgs {
                calendar,
                clear_token,
                clear_reauth,
                reset_failures,
                clear_in_progress,
            };
            commands::repair::run(&config, args).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_every_command_has_help_text() {
        let cli = Cli::command();
        for command in cli.get_subcommands() {
            assert!(
                command.get_about().is_some(),
                "`{}` has no description",
                command.get_name()
            );
        }
    }
}
