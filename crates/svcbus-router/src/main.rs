//! svcbus router entry point

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use svcbus_router::{
    app::{router_config, RouterApp},
    cli::Cli,
    error::Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let app = RouterApp::new(router_config(&cli)?)?;
    match app.start() {
        Ok(address) => info!(%address, "Accepting service connections, Ctrl-C to stop"),
        Err(e) => {
            error!(error = %e, "Router did not start");
            std::process::exit(1);
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");

    // Shutdown joins dispatcher threads
    tokio::task::spawn_blocking(move || app.shutdown())
        .await
        .map_err(|e| anyhow::anyhow!("shutdown task failed: {}", e))?;
    Ok(())
}

/// `RUST_LOG` wins; otherwise the router crates log at info, or debug with
/// `--verbose`, and the I/O threads stay quiet
fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { "info" };
        EnvFilter::new(format!(
            "warn,svcbus_router={level},svcbus_runtime::service={level},svcbus_runtime::router={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .init();
}
