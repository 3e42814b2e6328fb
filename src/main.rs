//! smpd server binary
//!
//! Starts an in-memory simplex messaging protocol broker on a TCP port
//! and runs it until interrupted.

use anyhow::Result;
use smpd::broker::cli::BrokerCli;
use smpd::broker::server;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = BrokerCli::parse_args();

    server::run(cli.into_config()).await
}
