//! Tally CLI entrypoint.

use clap::Parser;

mod commands;
mod config;
mod handlers;
mod telemetry;

use commands::{Commands, JobCommands};
use config::TallyConfig;

#[derive(Parser)]
#[command(name = "tally")]
#[command(author, version, about = "Credit ledger and usage metering", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./tally.yaml when present)
    #[arg(short, long, global = true, env = "TALLY_CONFIG")]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = TallyConfig::load(cli.config.as_deref())?;
    telemetry::init(&config.logging)?;

    match cli.command {
        Commands::Serve { migrate } => handlers::serve(config, migrate).await?,
        Commands::Migrate => handlers::migrate(&config).await?,
        Commands::Balance { account_id } => handlers::balance(&config, &account_id).await?,
        Commands::History {
            account_id,
            limit,
            offset,
            tx_type,
        } => handlers::history(&config, &account_id, limit, offset, tx_type.as_deref()).await?,
        Commands::Reconcile { account_id } => handlers::reconcile(&config, account_id.as_deref()).await?,
        Commands::Job { command } => match command {
            JobCommands::Run { name } => handlers::run_job(&config, &name).await?,
            JobCommands::List => handlers::list_jobs(&config),
        },
    }

    Ok(())
}
