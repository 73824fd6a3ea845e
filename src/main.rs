mod api;
mod cli;
mod config;
mod db;
mod error;
mod models;
mod services;
mod utils;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::models::Sport;

#[derive(Parser)]
#[command(name = "linesmith")]
#[command(about = "Elo ratings, game predictions and market edges for NFL, NBA, NHL and college basketball")]
struct Cli {
    /// JSON file overriding per-sport model parameters
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        #[arg(short, long, default_value = "3000")]
        port: u16,
    },
    /// Initialize the database
    InitDb,
    /// Fetch recent scores and schedules, then rate new results
    Fetch {
        #[arg(short, long)]
        sport: Sport,
        #[arg(short, long, default_value = "7")]
        days: i64,
    },
    /// Fetch current bookmaker odds
    Odds {
        #[arg(short, long)]
        sport: Sport,
        /// Ignore the six hour refetch guard
        #[arg(long)]
        force: bool,
    },
    /// Import historical games from a CSV file
    Import {
        #[arg(short, long)]
        sport: Sport,
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Fold newly final games into the ratings
    UpdateRatings {
        #[arg(short, long)]
        sport: Sport,
    },
    /// Rebuild ratings from the full game history
    Recalculate {
        #[arg(short, long)]
        sport: Sport,
    },
    /// Generate predictions for upcoming games
    Predict {
        #[arg(short, long)]
        sport: Sport,
        #[arg(short, long, default_value = "50")]
        limit: i64,
    },
    /// Compare predictions with consensus odds and list plays
    Edges {
        #[arg(short, long)]
        sport: Sport,
        #[arg(short, long, default_value = "50")]
        limit: i64,
    },
    /// Grid-search model parameters against completed games
    Backtest(cli::BacktestArgs),
    /// Query team statistics
    Team {
        #[arg(short, long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("linesmith=info")))
        .init();

    let cli = Cli::parse();
    let session = cli::Session {
        settings: Settings::from_env(),
        config_path: cli.config,
    };

    match cli.command {
        Some(Commands::Serve { port }) => {
            tracing::info!("Starting linesmith API server on port {}", port);
            api::serve(port, &session.settings, session.config_path.clone()).await?;
        }
        Some(Commands::InitDb) => {
            tracing::info!("Initializing database...");
            db::init_database(&session.settings.database_url).await?;
        }
        Some(Commands::Fetch { sport, days }) => cli::fetch_data(&session, sport, days).await?,
        Some(Commands::Odds { sport, force }) => cli::fetch_odds(&session, sport, force).await?,
        Some(Commands::Import { sport, file }) => cli::import_games(&session, sport, &file).await?,
        Some(Commands::UpdateRatings { sport }) => cli::update_ratings(&session, sport).await?,
        Some(Commands::Recalculate { sport }) => cli::recalculate(&session, sport).await?,
        Some(Commands::Predict { sport, limit }) => cli::generate_predictions(&session, sport, limit).await?,
        Some(Commands::Edges { sport, limit }) => cli::show_edges(&session, sport, limit).await?,
        Some(Commands::Backtest(args)) => cli::run_backtest(&session, &args).await?,
        Some(Commands::Team { name }) => cli::query_team(&session, &name).await?,
        None => {
            // Default to serving
            tracing::info!("Starting linesmith API server on port 3000");
            api::serve(3000, &session.settings, session.config_path.clone()).await?;
        }
    }

    Ok(())
}
