use std::process::ExitCode;

use clap::Parser;
use gatewire::daemon::{self, RunOptions};

mod cli;
mod config;
mod error;

use cli::Cli;
use config::load_config;
use error::{exit_status, RunResult};

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing based on verbosity
    let filter = if cli.verbose {
        "gatewire=debug,gatewire_cli=debug"
    } else {
        "gatewire=info,gatewire_cli=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    exit_status(run(cli))
}

fn run(cli: Cli) -> RunResult<()> {
    let config = load_config(&cli)?;
    let opts = RunOptions {
        config_path: cli.config.clone(),
        state_file: cli.state_file.clone(),
    };
    daemon::run(config, opts)?;
    Ok(())
}
