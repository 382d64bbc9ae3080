use gatewire::Config;

use crate::cli::Cli;
use crate::error::RunResult;

pub fn load_config(cli: &Cli) -> RunResult<Config> {
    let config = Config::load(cli.config.as_deref())?;
    Ok(merge_config(config, cli))
}

/// Command-line flags win over the config file
fn merge_config(mut config: Config, cli: &Cli) -> Config {
    if let Some(mode) = cli.mode {
        config.run_mode = mode.into();
    }
    if let Some(interface) = &cli.interface {
        config.interface = interface.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    config
}
