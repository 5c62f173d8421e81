//! remux/src/bin/remux.rs
//! Thin CLI shim: parses arguments, builds a Console, and runs it. Exits 0 on
//! clean termination, non-zero on fatal parse/prepare/run errors.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::error;

use remux::cli::Cli;
use remux::console::Console;
use remux::logging;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_logging(cli.log_directive());

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to prepare configuration");
            return ExitCode::from(2);
        }
    };

    let console = match Console::new(config).await {
        Ok(console) => Arc::new(console),
        Err(e) => {
            error!(error = %e, "failed to create console");
            return ExitCode::from(3);
        }
    };

    if let Err(e) = console.run().await {
        error!(error = %e, "console exited with error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
