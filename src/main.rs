use clap::Parser;
use tracing_subscriber::EnvFilter;

use takt::cli::{self, Cli, EXIT_FAILURE};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("takt=info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let code = match cli::execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            EXIT_FAILURE
        }
    };
    std::process::exit(code);
}
