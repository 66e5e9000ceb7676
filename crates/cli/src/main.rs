//! `sotto` — the messaging backend binary.

use {
    clap::{Parser, Subcommand},
    tracing_subscriber::EnvFilter,
};

use sotto_config::Config;

#[derive(Parser)]
#[command(name = "sotto", version, about = "End-to-end encrypted messaging backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway (default).
    Serve,
    /// Create the database schema and exit.
    InitDb,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_filter.clone())),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => sotto_gateway::serve(config).await,
        Command::InitDb => {
            sotto_storage::connect(&config.db_path).await?;
            tracing::info!(db = %config.db_path, "schema applied");
            Ok(())
        }
    }
}
