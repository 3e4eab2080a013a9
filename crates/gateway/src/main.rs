use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use tracing::info;

use gateway::config::Config;
use gateway::error::Result;

#[derive(Parser)]
#[command(name = "gateway", about = "Ark Relay settlement gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway service
    Start,
    /// Print session statistics and exit
    Status,
    /// List registered assets and exit
    Assets,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let _log_guard = monitoring::init_logging()
        .map_err(|e| gateway::GatewayError::Internal(e.to_string()))?;

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Start => gateway::gateway::start(config).await,
        Commands::Status => {
            let store =
                store::Store::connect(&config.database_url, config.database_max_connections)
                    .await?;
            let counts = store::sessions::counts_by_status(store.connection()).await?;
            if counts.is_empty() {
                info!("no sessions recorded");
            }
            for (status, count) in counts {
                info!("{status}: {count}");
            }
            Ok(())
        }
        Commands::Assets => {
            let store =
                store::Store::connect(&config.database_url, config.database_max_connections)
                    .await?;
            let assets = store::assets::list(store.connection(), false).await?;
            for asset in assets {
                info!(
                    "{} ({}) supply={} active={}",
                    asset.asset_id, asset.ticker, asset.total_supply, asset.is_active
                );
            }
            Ok(())
        }
    }
}
