//! gatechain CLI entrypoint

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gatechain::cli::Cli;
use gatechain::OrchestratorError;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    // Parse and execute CLI
    let cli = Cli::parse();
    if let Err(e) = cli.execute().await {
        eprintln!("Error: {:#}", e);
        let code = e
            .downcast_ref::<OrchestratorError>()
            .map_or(1, OrchestratorError::exit_code);
        std::process::exit(code);
    }
}
