//! db-kit command-line entry point.

use clap::Parser;
use db_kit::cli::{self, Cli};
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber. Logs go to stderr so stdout only
/// carries command output.
fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.config.log_level.to_lowercase()));

    let subscriber = tracing_subscriber::registry().with(filter);

    if cli.log_json {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_tracing(&cli);
    debug!(
        database = %cli.config.target(),
        command = cli.command.operation(),
        "Starting db-kit v{}",
        env!("CARGO_PKG_VERSION")
    );

    cli::run(cli).await
}
